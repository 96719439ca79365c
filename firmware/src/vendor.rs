//! Vendor control interface for the DSP parameters.
//!
//! A separate vendor-class interface carries EP0 control transfers that set
//! and read filter recipes, preamp, delays, trims, crossfeed, loudness, and
//! the status block. MSOS descriptors advertise WinUSB compatibility so
//! Windows binds the interface without a driver package.
//!
//! Set requests never touch audio state directly: they validate and clamp
//! at this boundary, update the shared parameter mirror, and stage a
//! [`ControlEvent`] the engine task applies between packets.

use core::mem::MaybeUninit;
use core::sync::atomic::Ordering::Relaxed;

use audio::crossfeed::{CrossfeedConfig, CrossfeedPreset};
use audio::filter::{EqRecipe, FilterKind};
use audio::loudness::LoudnessConfig;
use audio::params::Params;
use audio::{CHANNEL_BAND_COUNTS, NUM_CHANNELS, OUTPUT_CHANNEL_COUNT};
use defmt::trace;
use embassy_usb::control::{InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::msos;
use embassy_usb::types::InterfaceNumber;
use embassy_usb::{Builder, Handler};

use crate::{
    shared_params, with_shared_params, ControlEvent, CONTROL_EVENTS, STATUS,
};

pub const REQ_SET_EQ_PARAM: u8 = 0x42;
pub const REQ_GET_EQ_PARAM: u8 = 0x43;
pub const REQ_SET_PREAMP: u8 = 0x44;
pub const REQ_GET_PREAMP: u8 = 0x45;
pub const REQ_SET_BYPASS: u8 = 0x46;
pub const REQ_GET_BYPASS: u8 = 0x47;
pub const REQ_SET_DELAY: u8 = 0x48;
pub const REQ_GET_DELAY: u8 = 0x49;
pub const REQ_SET_CROSSFEED: u8 = 0x4A;
pub const REQ_GET_CROSSFEED: u8 = 0x4B;
pub const REQ_SET_LOUDNESS: u8 = 0x4C;
pub const REQ_GET_LOUDNESS: u8 = 0x4D;
pub const REQ_SET_GAIN: u8 = 0x4E;
pub const REQ_GET_GAIN: u8 = 0x4F;
pub const REQ_GET_STATUS: u8 = 0x50;
pub const REQ_SAVE_PARAMS: u8 = 0x51;
pub const REQ_FACTORY_RESET: u8 = 0x52;
pub const REQ_SET_MUTE: u8 = 0x53;
pub const REQ_GET_MUTE: u8 = 0x54;

/// Status read-back sub-index selectors.
pub const STATUS_PEAKS_MASTER: u16 = 0;
pub const STATUS_PEAKS_OUT: u16 = 1;
pub const STATUS_PEAK_SUB_AND_LOADS: u16 = 2;
pub const STATUS_SAMPLE_RATE: u16 = 3;
pub const STATUS_SYS_CLK: u16 = 4;
pub const STATUS_COUNTERS: u16 = 5;
pub const STATUS_TEMPERATURE: u16 = 6;
pub const STATUS_SAVE_RESULT: u16 = 7;
pub const STATUS_PACKETS: u16 = 8;

const DEVICE_INTERFACE_GUIDS: &[&str] = &["{88BAE032-5A81-49F0-BC3D-A4FF138216D6}"];

pub struct State {
    control: MaybeUninit<VendorControl>,
}

impl State {
    pub const fn new() -> Self {
        State {
            control: MaybeUninit::uninit(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Adds the vendor interface and its MSOS feature descriptors to the
/// device. Call after `Builder::msos_descriptor` has been configured.
pub fn install<'d, D: embassy_usb::driver::Driver<'d>>(
    builder: &mut Builder<'d, D>,
    state: &'d mut State,
) {
    let mut func = builder.function(0xFF, 0x00, 0x00);
    func.msos_feature(msos::CompatibleIdFeatureDescriptor::new("WINUSB", ""));
    func.msos_feature(msos::RegistryPropertyFeatureDescriptor::new(
        "DeviceInterfaceGUIDs",
        msos::PropertyData::RegMultiSz(DEVICE_INTERFACE_GUIDS),
    ));

    let mut interface = func.interface();
    let interface_number = interface.interface_number();
    let _alt = interface.alt_setting(0xFF, 0x00, 0x00, None);
    drop(func);

    let control = state.control.write(VendorControl {
        interface: interface_number,
    });
    builder.handler(control);
}

struct VendorControl {
    interface: InterfaceNumber,
}

fn stage(event: ControlEvent) -> OutResponse {
    if CONTROL_EVENTS.try_send(event).is_ok() {
        OutResponse::Accepted
    } else {
        // The engine is not draining events; let the host retry.
        OutResponse::Rejected
    }
}

fn f32_at(data: &[u8], at: usize) -> Option<f32> {
    data.get(at..at + 4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn parse_eq_packet(data: &[u8]) -> Option<(u8, u8, EqRecipe)> {
    if data.len() < 16 {
        return None;
    }
    let channel = data[0];
    let band = data[1];
    if channel as usize >= NUM_CHANNELS || band as usize >= CHANNEL_BAND_COUNTS[channel as usize] {
        return None;
    }
    let mut recipe = EqRecipe {
        kind: FilterKind::from_u8(data[2]),
        freq_hz: f32_at(data, 4)?,
        q: f32_at(data, 8)?,
        gain_db: f32_at(data, 12)?,
    };
    recipe.sanitize();
    Some((channel, band, recipe))
}

impl VendorControl {
    fn handle_set(&mut self, req: Request, data: &[u8]) -> OutResponse {
        match req.request {
            REQ_SET_EQ_PARAM => {
                let Some((channel, band, recipe)) = parse_eq_packet(data) else {
                    return OutResponse::Rejected;
                };
                with_shared_params(|p| p.recipes[channel as usize][band as usize] = recipe);
                stage(ControlEvent::EqRecipe {
                    channel,
                    band,
                    recipe,
                })
            }
            REQ_SET_PREAMP => {
                let Some(db) = f32_at(data, 0) else {
                    return OutResponse::Rejected;
                };
                with_shared_params(|p| {
                    p.preamp_db = db;
                    p.sanitize();
                });
                stage(ControlEvent::Preamp(db))
            }
            REQ_SET_BYPASS => {
                let Some(&raw) = data.first() else {
                    return OutResponse::Rejected;
                };
                let bypass = raw != 0;
                with_shared_params(|p| p.bypass_master_eq = bypass);
                stage(ControlEvent::BypassMasterEq(bypass))
            }
            REQ_SET_DELAY => {
                let channel = req.value as u8;
                let Some(ms) = f32_at(data, 0) else {
                    return OutResponse::Rejected;
                };
                if channel as usize >= NUM_CHANNELS {
                    return OutResponse::Rejected;
                }
                with_shared_params(|p| {
                    p.delays_ms[channel as usize] = ms;
                    p.sanitize();
                });
                stage(ControlEvent::Delay { channel, ms })
            }
            REQ_SET_GAIN => {
                let output = req.value as u8;
                let Some(db) = f32_at(data, 0) else {
                    return OutResponse::Rejected;
                };
                if output as usize >= OUTPUT_CHANNEL_COUNT {
                    return OutResponse::Rejected;
                }
                with_shared_params(|p| {
                    p.gains_db[output as usize] = db;
                    p.sanitize();
                });
                stage(ControlEvent::ChannelGain { output, db })
            }
            REQ_SET_MUTE => {
                let output = req.value as u8;
                let Some(&raw) = data.first() else {
                    return OutResponse::Rejected;
                };
                if output as usize >= OUTPUT_CHANNEL_COUNT {
                    return OutResponse::Rejected;
                }
                let mute = raw != 0;
                with_shared_params(|p| p.mutes[output as usize] = mute);
                stage(ControlEvent::ChannelMute { output, mute })
            }
            REQ_SET_CROSSFEED => {
                if data.len() < 12 {
                    return OutResponse::Rejected;
                }
                let mut config = CrossfeedConfig {
                    enabled: data[0] != 0,
                    itd_enabled: data[1] != 0,
                    preset: CrossfeedPreset::from_u8(data[2]),
                    custom_fc_hz: f32_at(data, 4).unwrap_or(700.0),
                    custom_feed_db: f32_at(data, 8).unwrap_or(4.5),
                };
                config.sanitize();
                with_shared_params(|p| p.crossfeed = config);
                stage(ControlEvent::Crossfeed(config))
            }
            REQ_SET_LOUDNESS => {
                if data.len() < 12 {
                    return OutResponse::Rejected;
                }
                let mut config = LoudnessConfig {
                    enabled: data[0] != 0,
                    ref_spl: f32_at(data, 4).unwrap_or(83.0),
                    intensity_pct: f32_at(data, 8).unwrap_or(100.0),
                };
                config.sanitize();
                with_shared_params(|p| p.loudness = config);
                stage(ControlEvent::Loudness(config))
            }
            REQ_SAVE_PARAMS => stage(ControlEvent::SaveParams),
            REQ_FACTORY_RESET => {
                with_shared_params(|p| *p = Params::factory());
                stage(ControlEvent::FactoryReset)
            }
            _ => OutResponse::Rejected,
        }
    }

    fn handle_get<'r>(&mut self, req: Request, buf: &'r mut [u8]) -> InResponse<'r> {
        match req.request {
            REQ_GET_EQ_PARAM => {
                let channel = ((req.value >> 8) & 0xFF) as usize;
                let band = ((req.value >> 4) & 0x0F) as usize;
                let param = (req.value & 0x0F) as usize;
                if channel >= NUM_CHANNELS || band >= CHANNEL_BAND_COUNTS[channel] {
                    return InResponse::Rejected;
                }
                let recipe = shared_params().recipes[channel][band];
                let value: u32 = match param {
                    0 => recipe.kind as u32,
                    1 => recipe.freq_hz.to_bits(),
                    2 => recipe.q.to_bits(),
                    3 => recipe.gain_db.to_bits(),
                    _ => return InResponse::Rejected,
                };
                buf[..4].copy_from_slice(&value.to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            REQ_GET_PREAMP => {
                buf[..4].copy_from_slice(&shared_params().preamp_db.to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            REQ_GET_BYPASS => {
                buf[0] = shared_params().bypass_master_eq as u8;
                InResponse::Accepted(&buf[..1])
            }
            REQ_GET_DELAY => {
                let channel = req.value as usize;
                if channel >= NUM_CHANNELS {
                    return InResponse::Rejected;
                }
                buf[..4].copy_from_slice(&shared_params().delays_ms[channel].to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            REQ_GET_GAIN => {
                let output = req.value as usize;
                if output >= OUTPUT_CHANNEL_COUNT {
                    return InResponse::Rejected;
                }
                buf[..4].copy_from_slice(&shared_params().gains_db[output].to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            REQ_GET_MUTE => {
                let output = req.value as usize;
                if output >= OUTPUT_CHANNEL_COUNT {
                    return InResponse::Rejected;
                }
                buf[0] = shared_params().mutes[output] as u8;
                InResponse::Accepted(&buf[..1])
            }
            REQ_GET_CROSSFEED => {
                let config = shared_params().crossfeed;
                buf[0] = config.enabled as u8;
                buf[1] = config.itd_enabled as u8;
                buf[2] = config.preset as u8;
                buf[3] = 0;
                buf[4..8].copy_from_slice(&config.custom_fc_hz.to_le_bytes());
                buf[8..12].copy_from_slice(&config.custom_feed_db.to_le_bytes());
                InResponse::Accepted(&buf[..12])
            }
            REQ_GET_LOUDNESS => {
                let config = shared_params().loudness;
                buf[0] = config.enabled as u8;
                buf[1] = 0;
                buf[2] = 0;
                buf[3] = 0;
                buf[4..8].copy_from_slice(&config.ref_spl.to_le_bytes());
                buf[8..12].copy_from_slice(&config.intensity_pct.to_le_bytes());
                InResponse::Accepted(&buf[..12])
            }
            REQ_GET_STATUS => self.handle_get_status(req.value, buf),
            _ => InResponse::Rejected,
        }
    }

    fn handle_get_status<'r>(&mut self, selector: u16, buf: &'r mut [u8]) -> InResponse<'r> {
        match selector {
            STATUS_PEAKS_MASTER => {
                let value = (STATUS.peaks[0].load(Relaxed) as u32)
                    | ((STATUS.peaks[1].load(Relaxed) as u32) << 16);
                buf[..4].copy_from_slice(&value.to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            STATUS_PEAKS_OUT => {
                let value = (STATUS.peaks[2].load(Relaxed) as u32)
                    | ((STATUS.peaks[3].load(Relaxed) as u32) << 16);
                buf[..4].copy_from_slice(&value.to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            STATUS_PEAK_SUB_AND_LOADS => {
                let value = (STATUS.peaks[4].load(Relaxed) as u32)
                    | ((STATUS.cpu0_load.load(Relaxed) as u32) << 16)
                    | ((STATUS.cpu1_load.load(Relaxed) as u32) << 24);
                buf[..4].copy_from_slice(&value.to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            STATUS_SAMPLE_RATE => {
                buf[..4].copy_from_slice(&STATUS.sample_rate_hz.load(Relaxed).to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            STATUS_SYS_CLK => {
                buf[..4].copy_from_slice(&STATUS.sys_clk_hz.load(Relaxed).to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            STATUS_COUNTERS => {
                // Six saturating 16-bit counters in one 12-byte response.
                let narrow = |counter: &core::sync::atomic::AtomicU32| -> u16 {
                    counter.load(Relaxed).min(u16::MAX as u32) as u16
                };
                let counters = [
                    narrow(&STATUS.spdif_overruns),
                    narrow(&STATUS.spdif_underruns),
                    narrow(&STATUS.pdm_ring_overruns),
                    narrow(&STATUS.pdm_ring_underruns),
                    narrow(&STATUS.pdm_dma_underruns),
                    narrow(&STATUS.usb_gap_underruns),
                ];
                for (index, counter) in counters.iter().enumerate() {
                    buf[index * 2..index * 2 + 2].copy_from_slice(&counter.to_le_bytes());
                }
                InResponse::Accepted(&buf[..12])
            }
            STATUS_TEMPERATURE => {
                buf[..4].copy_from_slice(&STATUS.temperature_mc.load(Relaxed).to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            STATUS_SAVE_RESULT => {
                buf[0] = STATUS.last_save_result.load(Relaxed);
                InResponse::Accepted(&buf[..1])
            }
            STATUS_PACKETS => {
                buf[..4].copy_from_slice(&STATUS.packets_received.load(Relaxed).to_le_bytes());
                InResponse::Accepted(&buf[..4])
            }
            _ => InResponse::Rejected,
        }
    }
}

impl Handler for VendorControl {
    fn control_out(&mut self, req: Request, data: &[u8]) -> Option<OutResponse> {
        if req.request_type != RequestType::Vendor
            || req.recipient != Recipient::Interface
            || req.index != u8::from(self.interface) as u16
        {
            return None;
        }

        trace!("Vendor set request {:#04x}", req.request);
        Some(self.handle_set(req, data))
    }

    fn control_in<'a>(&'a mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        if req.request_type != RequestType::Vendor
            || req.recipient != Recipient::Interface
            || req.index != u8::from(self.interface) as u16
        {
            return None;
        }

        trace!("Vendor get request {:#04x}", req.request);
        Some(self.handle_get(req, buf))
    }
}
