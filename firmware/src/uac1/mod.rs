//! USB Audio Class 1.0 speaker device.
//!
//! Implements the minimal UAC1 topology for an OUT-only streaming device:
//! Input Terminal (USB streaming) -> Feature Unit (mute + volume) -> Output
//! Terminal (speaker), with one 16-bit stereo streaming endpoint, a list of
//! discrete sample rates, and an explicit-feedback IN endpoint for
//! asynchronous clock recovery.
use class_codes::*;

use core::cell::{Cell, RefCell};
use core::future::poll_fn;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::task::Poll;
use defmt::trace;
use embassy_sync::blocking_mutex::CriticalSectionMutex;
use embassy_sync::waitqueue::WakerRegistration;
use embassy_usb::control::{self, InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::descriptor::{SynchronizationType, UsageType};
use embassy_usb::driver::{Driver, Endpoint, EndpointError, EndpointIn, EndpointOut, EndpointType};
use embassy_usb::types::InterfaceNumber;
use embassy_usb::{Builder, Handler};

mod terminal_type;
pub use terminal_type::TerminalType;

mod channel_config;
pub use channel_config::ChannelConfig;

mod class_codes;

/// Stereo; left front and right front.
pub const AUDIO_CHANNEL_COUNT: usize = 2;

const INPUT_UNIT_ID: u8 = 0x01;
const FEATURE_UNIT_ID: u8 = 0x02;
const OUTPUT_UNIT_ID: u8 = 0x03;

// Volume codes are 8.8 fixed point in dB: -90 dB to 0 dB in 1 dB steps,
// matching the 91-entry gain table in the DSP engine.
const VOLUME_STEPS_PER_DB: i16 = 256;
const MIN_VOLUME_DB: i16 = -90;
const MAX_VOLUME_DB: i16 = 0;

/// Feedback refresh exponent: the host reads the feedback endpoint every
/// `2^n` frames.
const FEEDBACK_REFRESH_EXPONENT: u8 = 1;

/// Internal state for USB Audio.
pub struct State<'a> {
    control: MaybeUninit<Control<'a>>,
    shared: SharedControl,
}

impl<'a> Default for State<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> State<'a> {
    pub fn new() -> Self {
        Self {
            control: MaybeUninit::uninit(),
            shared: SharedControl::default(),
        }
    }
}

pub struct Speaker<'d, D: Driver<'d>> {
    streaming_endpoint: D::EndpointOut,
    feedback_endpoint: D::EndpointIn,
    control: &'d SharedControl,
}

impl<'d, D: Driver<'d>> Speaker<'d, D> {
    /// Creates the class on `builder`, advertising the given discrete
    /// sample rates (up to three) for 16-bit stereo streaming.
    ///
    /// Use `split` afterwards to obtain the stream, feedback and control
    /// handles that the individual tasks own.
    pub fn new(
        builder: &mut Builder<'d, D>,
        state: &'d mut State<'d>,
        max_packet_size: u16,
        sample_rates_hz: &[u32],
    ) -> Self {
        let mut func = builder.function(AUDIO_FUNCTION, FUNCTION_SUBCLASS_UNDEFINED, PROTOCOL_NONE);

        // Audio control interface (mandatory) [UAC 4.3.1]
        let mut interface = func.interface();
        let control_interface = interface.interface_number().into();
        let streaming_interface = u8::from(control_interface) + 1;
        let mut alt = interface.alt_setting(USB_AUDIO_CLASS, USB_AUDIOCONTROL_SUBCLASS, PROTOCOL_NONE, None);

        // Terminal topology:
        // Input terminal (USB stream) -> feature unit (mute and volume) -> output terminal (speaker)

        // Input Terminal Descriptor [UAC 4.3.2.1]
        let terminal_type: u16 = TerminalType::UsbStreaming.into();
        let channel_config_left: u16 = ChannelConfig::LeftFront.into();
        let channel_config_right: u16 = ChannelConfig::RightFront.into();
        let channel_config = channel_config_left | channel_config_right;

        let input_terminal_descriptor = [
            INPUT_TERMINAL, // bDescriptorSubtype.
            INPUT_UNIT_ID,  // bTerminalID.
            terminal_type as u8,
            (terminal_type >> 8) as u8, // wTerminalType.
            0x00,                       // bAssocTerminal (none).
            AUDIO_CHANNEL_COUNT as u8,  // bNrChannels.
            channel_config as u8,
            (channel_config >> 8) as u8, // wChannelConfig.
            0x00,                        // iChannelNames (none).
            0x00,                        // iTerminal (none).
        ];

        // Output Terminal Descriptor [UAC 4.3.2.2]
        let terminal_type: u16 = TerminalType::OutSpeaker.into();
        let output_terminal_descriptor = [
            OUTPUT_TERMINAL, // bDescriptorSubtype.
            OUTPUT_UNIT_ID,  // bTerminalID.
            terminal_type as u8,
            (terminal_type >> 8) as u8, // wTerminalType.
            0x00,                       // bAssocTerminal (none).
            FEATURE_UNIT_ID,            // bSourceID (the feature unit).
            0x00,                       // iTerminal (none).
        ];

        // Feature Unit Descriptor [UAC 4.3.2.5]
        let controls = MUTE_CONTROL | VOLUME_CONTROL;
        let feature_unit_descriptor = [
            FEATURE_UNIT,         // bDescriptorSubtype (Feature Unit).
            FEATURE_UNIT_ID,      // bUnitID.
            INPUT_UNIT_ID,        // bSourceID.
            1,                    // bControlSize (one byte per control).
            FU_CONTROL_UNDEFINED, // Master controls.
            controls,             // Channel 0 controls
            controls,             // Channel 1 controls
            0x00,                 // iFeature (none)
        ];

        // Class-specific AC Interface Descriptor [UAC 4.3.2]
        // wTotalLength spans the class-specific descriptors including their
        // two-byte headers.
        let interface_descriptor_payload_len = 7u16;
        let total_length: u16 = (2 + interface_descriptor_payload_len)
            + (2 + input_terminal_descriptor.len() as u16)
            + (2 + feature_unit_descriptor.len() as u16)
            + (2 + output_terminal_descriptor.len() as u16);

        let interface_descriptor = [
            HEADER_SUBTYPE, // bDescriptorSubtype (Header)
            ADC_VERSION as u8,
            (ADC_VERSION >> 8) as u8, // bcdADC
            total_length as u8,
            (total_length >> 8) as u8, // wTotalLength
            0x01,                      // bInCollection (1 streaming interface)
            streaming_interface,       // baInterfaceNr
        ];

        alt.descriptor(CS_INTERFACE, &interface_descriptor);
        alt.descriptor(CS_INTERFACE, &input_terminal_descriptor);
        alt.descriptor(CS_INTERFACE, &feature_unit_descriptor);
        alt.descriptor(CS_INTERFACE, &output_terminal_descriptor);

        // Audio streaming interface, zero bandwidth [UAC 4.5.1]
        let mut interface = func.interface();
        let alt = interface.alt_setting(USB_AUDIO_CLASS, USB_AUDIOSTREAMING_SUBCLASS, PROTOCOL_NONE, None);
        drop(alt);

        // Audio streaming interface, operational [UAC 4.5.1]
        let mut alt = interface.alt_setting(USB_AUDIO_CLASS, USB_AUDIOSTREAMING_SUBCLASS, PROTOCOL_NONE, None);

        alt.descriptor(
            CS_INTERFACE,
            &[
                AS_GENERAL,    // bDescriptorSubtype.
                INPUT_UNIT_ID, // bTerminalLink.
                0x01,          // bDelay (one frame).
                PCM as u8,
                (PCM >> 8) as u8, // wFormatTag (PCM format).
            ],
        );

        // Format descriptor with the discrete rate list.
        let rate_count = sample_rates_hz.len().min(3);
        let mut format_descriptor = [0u8; 6 + 3 * 3];
        format_descriptor[0] = FORMAT_TYPE; // bDescriptorSubtype.
        format_descriptor[1] = FORMAT_TYPE_I; // bFormatType.
        format_descriptor[2] = AUDIO_CHANNEL_COUNT as u8; // bNrChannels.
        format_descriptor[3] = 2; // bSubframeSize: 16 bit.
        format_descriptor[4] = 16; // bBitResolution.
        format_descriptor[5] = rate_count as u8; // bSamFreqType (discrete).
        for (index, rate) in sample_rates_hz.iter().take(rate_count).enumerate() {
            let at = 6 + index * 3;
            format_descriptor[at] = *rate as u8;
            format_descriptor[at + 1] = (*rate >> 8) as u8;
            format_descriptor[at + 2] = (*rate >> 16) as u8;
        }
        alt.descriptor(CS_INTERFACE, &format_descriptor[..6 + rate_count * 3]);

        let streaming_endpoint = alt.alloc_endpoint_out(EndpointType::Isochronous, max_packet_size, 1);
        let feedback_endpoint = alt.alloc_endpoint_in(
            EndpointType::Isochronous,
            4, // Feedback packets are 3 bytes (10.14 format) in a 4-byte endpoint.
            1,
        );

        // The streaming endpoint descriptor must name the feedback endpoint
        // address, so it is written once that is allocated.
        alt.endpoint_descriptor(
            streaming_endpoint.info(),
            SynchronizationType::Asynchronous,
            UsageType::DataEndpoint,
            &[
                0x00,                                 // bRefresh (0).
                feedback_endpoint.info().addr.into(), // bSynchAddress (the feedback endpoint).
            ],
        );

        alt.descriptor(
            CS_ENDPOINT,
            &[
                AS_GENERAL, // bDescriptorSubtype (General).
                0x01,       // bmAttributes - sampling frequency control supported.
                0x00,       // bLockDelayUnits (undefined).
                0x00, 0x00, // wLockDelay (0).
            ],
        );

        // The feedback endpoint descriptor follows the streaming endpoint
        // descriptor. This ordering is mandatory.
        alt.endpoint_descriptor(
            feedback_endpoint.info(),
            SynchronizationType::NoSynchronization,
            UsageType::FeedbackEndpoint,
            &[
                FEEDBACK_REFRESH_EXPONENT, // bRefresh.
                0x00,                      // bSynchAddress (none).
            ],
        );

        // Free up the builder.
        drop(func);

        state
            .shared
            .sample_rate_hz
            .store(sample_rates_hz.first().copied().unwrap_or(0), Ordering::Relaxed);

        let control = state.control.write(Control {
            shared: &state.shared,
            streaming_endpoint_address: streaming_endpoint.info().addr.into(),
            control_interface,
        });
        builder.handler(control);

        let control = &state.shared;

        Speaker {
            streaming_endpoint,
            feedback_endpoint,
            control,
        }
    }

    /// Splits the class into its independently owned task handles: the
    /// audio stream, the feedback transmitter, and the control monitor.
    pub fn split(self) -> (Stream<'d, D>, Feedback<'d, D>, ControlMonitor<'d>) {
        (
            Stream {
                streaming_endpoint: self.streaming_endpoint,
            },
            Feedback {
                feedback_endpoint: self.feedback_endpoint,
            },
            ControlMonitor { control: self.control },
        )
    }
}

#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct AudioSettings {
    /// Channel mute states.
    pub is_muted: [bool; AUDIO_CHANNEL_COUNT],
    /// Channel volume levels in 8.8 format (in dB).
    pub volume_8q8_db: [i16; AUDIO_CHANNEL_COUNT],
}

impl Default for AudioSettings {
    fn default() -> Self {
        AudioSettings {
            is_muted: [false; AUDIO_CHANNEL_COUNT],
            volume_8q8_db: [0; AUDIO_CHANNEL_COUNT],
        }
    }
}

struct Control<'a> {
    control_interface: InterfaceNumber,
    streaming_endpoint_address: u8,
    shared: &'a SharedControl,
}

/// Shared data between the control handler and the task-facing handles.
struct SharedControl {
    audio_settings: CriticalSectionMutex<Cell<AudioSettings>>,

    /// The most recently requested sample rate in Hz.
    sample_rate_hz: AtomicU32,

    waker: RefCell<WakerRegistration>,
    changed: AtomicBool,
}

impl Default for SharedControl {
    fn default() -> Self {
        SharedControl {
            audio_settings: CriticalSectionMutex::new(Cell::new(AudioSettings::default())),
            sample_rate_hz: AtomicU32::new(0),
            waker: RefCell::new(WakerRegistration::new()),
            changed: AtomicBool::new(false),
        }
    }
}

impl SharedControl {
    async fn changed(&self) {
        poll_fn(|context| {
            if self.changed.load(Ordering::Relaxed) {
                self.changed.store(false, Ordering::Relaxed);
                Poll::Ready(())
            } else {
                self.waker.borrow_mut().register(context.waker());
                Poll::Pending
            }
        })
        .await;
    }
}

/// The isochronous OUT audio stream.
pub struct Stream<'d, D: Driver<'d>> {
    streaming_endpoint: D::EndpointOut,
}

impl<'d, D: Driver<'d>> Stream<'d, D> {
    /// Reads a single packet from the OUT endpoint.
    pub async fn read_packet(&mut self, data: &mut [u8]) -> Result<usize, EndpointError> {
        self.streaming_endpoint.read(data).await
    }

    /// Waits for the USB host to enable this interface.
    pub async fn wait_connection(&mut self) {
        self.streaming_endpoint.wait_enabled().await;
    }

    /// Maximum packet size in bytes for the streaming endpoint.
    pub fn max_packet_size(&self) -> u16 {
        self.streaming_endpoint.info().max_packet_size
    }
}

/// The isochronous IN endpoint carrying 10.14 rate feedback.
pub struct Feedback<'d, D: Driver<'d>> {
    feedback_endpoint: D::EndpointIn,
}

impl<'d, D: Driver<'d>> Feedback<'d, D> {
    /// Writes a single feedback packet.
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        self.feedback_endpoint.write(data).await
    }

    /// Waits for the USB host to enable this interface.
    pub async fn wait_connection(&mut self) {
        self.feedback_endpoint.wait_enabled().await;
    }
}

/// Control status change monitor.
pub struct ControlMonitor<'d> {
    control: &'d SharedControl,
}

impl<'d> ControlMonitor<'d> {
    /// The current audio channel settings.
    pub fn audio_settings(&self) -> AudioSettings {
        self.control.audio_settings.lock(|x| x.get())
    }

    /// The most recently requested streaming sample rate.
    pub fn sample_rate_hz(&self) -> u32 {
        self.control.sample_rate_hz.load(Ordering::Relaxed)
    }

    /// Resolves when any control setting changes.
    pub async fn changed(&self) {
        self.control.changed().await;
    }
}

impl<'a> Control<'a> {
    fn shared(&mut self) -> &'a SharedControl {
        self.shared
    }

    fn changed(&mut self) {
        self.shared().changed.store(true, Ordering::Relaxed);
        self.shared().waker.borrow_mut().wake();
    }

    fn interface_set_mute_state(
        &mut self,
        audio_settings: &mut AudioSettings,
        channel_index: u8,
        data: &[u8],
    ) -> OutResponse {
        if data.is_empty() {
            return OutResponse::Rejected;
        }
        let mute_state = data[0] != 0;

        match channel_index as usize {
            // Channel 0 addresses the master channel.
            0 => audio_settings.is_muted = [mute_state; AUDIO_CHANNEL_COUNT],
            1..=AUDIO_CHANNEL_COUNT => {
                audio_settings.is_muted[channel_index as usize - 1] = mute_state;
            }
            _ => {
                trace!("Failed to set channel {} mute state: {}", channel_index, mute_state);
                return OutResponse::Rejected;
            }
        }

        trace!("Set channel {} mute state: {}", channel_index, mute_state);
        OutResponse::Accepted
    }

    fn interface_set_volume(
        &mut self,
        audio_settings: &mut AudioSettings,
        channel_index: u8,
        data: &[u8],
    ) -> OutResponse {
        if data.len() < 2 {
            return OutResponse::Rejected;
        }
        let volume = i16::from_le_bytes([data[0], data[1]]);

        match channel_index as usize {
            0 => audio_settings.volume_8q8_db = [volume; AUDIO_CHANNEL_COUNT],
            1..=AUDIO_CHANNEL_COUNT => {
                audio_settings.volume_8q8_db[channel_index as usize - 1] = volume;
            }
            _ => {
                trace!("Failed to set channel {} volume: {}", channel_index, volume);
                return OutResponse::Rejected;
            }
        }

        trace!("Set channel {} volume: {}", channel_index, volume);
        OutResponse::Accepted
    }

    fn interface_set_request(&mut self, req: control::Request, data: &[u8]) -> Option<OutResponse> {
        let interface_index = req.index as u8;
        let entity_index = (req.index >> 8) as u8;
        let channel_index = req.value as u8;
        let control_unit = (req.value >> 8) as u8;

        if interface_index != self.control_interface.into() {
            trace!("Unhandled interface set request for interface {}", interface_index);
            return None;
        }

        if entity_index != FEATURE_UNIT_ID {
            trace!("Unsupported interface set request for entity {}", entity_index);
            return Some(OutResponse::Rejected);
        }

        if req.request != SET_CUR {
            return Some(OutResponse::Rejected);
        }

        let mut audio_settings = self.shared().audio_settings.lock(|x| x.get());
        let response = match control_unit {
            MUTE_CONTROL => self.interface_set_mute_state(&mut audio_settings, channel_index, data),
            VOLUME_CONTROL => self.interface_set_volume(&mut audio_settings, channel_index, data),
            _ => OutResponse::Rejected,
        };

        if response == OutResponse::Rejected {
            return Some(response);
        }

        self.shared().audio_settings.lock(|x| x.set(audio_settings));
        self.changed();

        Some(OutResponse::Accepted)
    }

    fn endpoint_set_request(&mut self, req: control::Request, data: &[u8]) -> Option<OutResponse> {
        let control_selector = (req.value >> 8) as u8;
        let endpoint_address = req.index as u8;

        if endpoint_address != self.streaming_endpoint_address {
            trace!(
                "Unhandled endpoint set request for endpoint {} and control {} with data {}",
                endpoint_address,
                control_selector,
                data
            );
            return None;
        }

        if control_selector != SAMPLING_FREQ_CONTROL {
            trace!(
                "Unsupported endpoint set request for control selector {}",
                control_selector
            );
            return Some(OutResponse::Rejected);
        }

        if data.len() < 3 {
            return Some(OutResponse::Rejected);
        }

        let sample_rate_hz: u32 = (data[0] as u32) | (data[1] as u32) << 8 | (data[2] as u32) << 16;
        self.shared().sample_rate_hz.store(sample_rate_hz, Ordering::Relaxed);
        self.changed();
        trace!("Set endpoint {} sample rate to {} Hz", endpoint_address, sample_rate_hz);

        Some(OutResponse::Accepted)
    }

    fn interface_get_request<'r>(&'r mut self, req: Request, buf: &'r mut [u8]) -> Option<InResponse<'r>> {
        let interface_index = req.index as u8;
        let entity_index = (req.index >> 8) as u8;
        let channel_index = req.value as u8;
        let control_unit = (req.value >> 8) as u8;

        if interface_index != self.control_interface.into() {
            trace!("Unhandled interface get request for interface {}.", interface_index);
            return None;
        }

        if entity_index != FEATURE_UNIT_ID {
            // Only the feature unit takes get requests.
            trace!("Unsupported interface get request for entity {}.", entity_index);
            return Some(InResponse::Rejected);
        }

        let audio_settings = self.shared().audio_settings.lock(|x| x.get());
        // Master requests read back the left channel.
        let channel = match channel_index as usize {
            0 | 1 => 0,
            2 => 1,
            _ => return Some(InResponse::Rejected),
        };

        match req.request {
            GET_CUR => match control_unit {
                VOLUME_CONTROL => {
                    let volume = audio_settings.volume_8q8_db[channel];
                    buf[..2].copy_from_slice(&volume.to_le_bytes());
                    Some(InResponse::Accepted(&buf[..2]))
                }
                MUTE_CONTROL => {
                    buf[0] = audio_settings.is_muted[channel].into();
                    Some(InResponse::Accepted(&buf[..1]))
                }
                _ => Some(InResponse::Rejected),
            },
            GET_MIN => match control_unit {
                VOLUME_CONTROL => {
                    let min_volume = MIN_VOLUME_DB * VOLUME_STEPS_PER_DB;
                    buf[..2].copy_from_slice(&min_volume.to_le_bytes());
                    Some(InResponse::Accepted(&buf[..2]))
                }
                _ => Some(InResponse::Rejected),
            },
            GET_MAX => match control_unit {
                VOLUME_CONTROL => {
                    let max_volume = MAX_VOLUME_DB * VOLUME_STEPS_PER_DB;
                    buf[..2].copy_from_slice(&max_volume.to_le_bytes());
                    Some(InResponse::Accepted(&buf[..2]))
                }
                _ => Some(InResponse::Rejected),
            },
            GET_RES => match control_unit {
                VOLUME_CONTROL => {
                    buf[..2].copy_from_slice(&VOLUME_STEPS_PER_DB.to_le_bytes());
                    Some(InResponse::Accepted(&buf[..2]))
                }
                _ => Some(InResponse::Rejected),
            },
            _ => Some(InResponse::Rejected),
        }
    }

    fn endpoint_get_request<'r>(&'r mut self, req: Request, buf: &'r mut [u8]) -> Option<InResponse<'r>> {
        let control_selector = (req.value >> 8) as u8;
        let endpoint_address = req.index as u8;

        if endpoint_address != self.streaming_endpoint_address {
            trace!("Unhandled endpoint get request for endpoint {}.", endpoint_address);
            return None;
        }

        if control_selector != SAMPLING_FREQ_CONTROL {
            trace!(
                "Unsupported endpoint get request for control selector {}.",
                control_selector
            );
            return Some(InResponse::Rejected);
        }

        let sample_rate_hz = self.shared().sample_rate_hz.load(Ordering::Relaxed);

        buf[0] = (sample_rate_hz & 0xFF) as u8;
        buf[1] = ((sample_rate_hz >> 8) & 0xFF) as u8;
        buf[2] = ((sample_rate_hz >> 16) & 0xFF) as u8;

        Some(InResponse::Accepted(&buf[..3]))
    }
}

impl<'d> Handler for Control<'d> {
    fn reset(&mut self) {
        let shared = self.shared();
        shared.audio_settings.lock(|x| x.set(AudioSettings::default()));

        shared.changed.store(true, Ordering::Relaxed);
        shared.waker.borrow_mut().wake();
    }

    // Suspend occurs, for example, when disconnecting the USB cable.
    fn suspended(&mut self, suspended: bool) {
        if suspended {
            self.reset()
        }
    }

    // Handle control set requests.
    fn control_out(&mut self, req: control::Request, data: &[u8]) -> Option<OutResponse> {
        match req.request_type {
            RequestType::Standard => match req.request {
                Request::SET_INTERFACE => Some(OutResponse::Accepted),
                _ => Some(OutResponse::Rejected),
            },
            RequestType::Class => match req.recipient {
                Recipient::Interface => self.interface_set_request(req, data),
                Recipient::Endpoint => self.endpoint_set_request(req, data),
                _ => Some(OutResponse::Rejected),
            },
            _ => None,
        }
    }

    // Handle control get requests.
    fn control_in<'a>(&'a mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        match req.request_type {
            RequestType::Class => match req.recipient {
                Recipient::Interface => self.interface_get_request(req, buf),
                Recipient::Endpoint => self.endpoint_get_request(req, buf),
                _ => None,
            },
            _ => None,
        }
    }
}
