//! The audio engine task: USB packets in, S/PDIF blocks and PDM samples
//! out.
//!
//! This task owns the whole DSP engine. Packets and staged control events
//! arrive through the same select loop, so parameter updates are applied
//! strictly between packets and the per-sample path never observes a
//! half-committed change. All the transcendental work behind an update
//! (filter design, loudness tables, crossfeed coefficients) also runs
//! here, between packets, never inside packet processing.

use core::sync::atomic::Ordering::Relaxed;

use audio::delay::{DelayLines, MAX_DELAY_SAMPLES};
use audio::filter::Coeffs;
use audio::loudness::{LoudnessTables, SHELF_COUNT};
use audio::params::Params;
use audio::pipeline::{coerce_rate, Engine};
use audio::queue::PdmMessage;
use audio::spdif::{channel_status_word, SpdifBlock};
use audio::volume::VOLUME_STEPS;
use defmt::{info, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::zerocopy_channel;
use embassy_time::Instant;

use crate::flash_store::ParamStore;
use crate::{
    bump, clock_manager, with_shared_params, ControlEvent, UsbSampleBlock, CONTROL_EVENTS, DRIFT,
    GAP_RESET_US, GAP_UNDERRUN_US, INPUT_CHANNEL_COUNT, PDM_QUEUE, SAVE_RESULT_ERROR,
    SAVE_RESULT_OK, STATUS,
};

// The delay lines (96 KiB) and loudness tables stay in .bss; they are far
// too large for any stack, and the engine borrows them for 'static.
static mut DELAY_LINES: DelayLines = [[0; MAX_DELAY_SAMPLES]; 3];
static mut LOUDNESS_TABLES: LoudnessTables =
    [[[Coeffs::IDENTITY; SHELF_COUNT]; VOLUME_STEPS]; 2];

/// Hands one subwoofer sample to core 1 and wakes it.
#[inline]
fn push_sub(sample: i32) {
    if PDM_QUEUE.push(PdmMessage {
        sample,
        reset: false,
    }) {
        cortex_m::asm::sev();
    } else {
        bump(&STATUS.pdm_ring_overruns);
    }
}

/// Queues silence ahead of a resuming stream so the transmitter does not
/// immediately underrun.
fn prime_silence(
    sender: &mut zerocopy_channel::Sender<'static, NoopRawMutex, SpdifBlock>,
    status_word: u32,
) {
    for _ in 0..2 {
        if let Some(block) = sender.try_send() {
            block.fill_silence(status_word);
            sender.send_done();
        }
    }
}

fn apply_event(
    engine: &mut Engine<'static>,
    store: &mut ParamStore,
    event: ControlEvent,
) -> Option<u32> {
    match event {
        ControlEvent::EqRecipe {
            channel,
            band,
            recipe,
        } => {
            engine.set_recipe(channel as usize, band as usize, recipe);
        }
        ControlEvent::Preamp(db) => engine.set_preamp_db(db),
        ControlEvent::BypassMasterEq(bypass) => engine.set_bypass_master_eq(bypass),
        ControlEvent::ChannelGain { output, db } => {
            engine.set_channel_gain_db(output as usize, db)
        }
        ControlEvent::ChannelMute { output, mute } => {
            engine.set_channel_mute(output as usize, mute)
        }
        ControlEvent::Delay { channel, ms } => engine.set_delay_ms(channel as usize, ms),
        ControlEvent::Crossfeed(config) => engine.set_crossfeed(&config),
        ControlEvent::Loudness(config) => engine.set_loudness(&config),
        ControlEvent::Volume(code) => engine.set_volume_code(code),
        ControlEvent::Mute(mute) => engine.set_mute(mute),
        ControlEvent::SampleRate(requested_hz) => {
            let rate_hz = coerce_rate(requested_hz);
            if rate_hz != engine.sample_rate_hz() {
                info!("Rate change to {} Hz", rate_hz);
                clock_manager::apply_sample_rate(rate_hz);
                engine.set_sample_rate(rate_hz);
                DRIFT.lock(|d| d.borrow_mut().set_rate(rate_hz));
                STATUS.sample_rate_hz.store(rate_hz, Relaxed);
                return Some(channel_status_word(rate_hz));
            }
        }
        ControlEvent::SaveParams => {
            let result = match store.save(engine.params()) {
                Ok(()) => SAVE_RESULT_OK,
                Err(error) => {
                    warn!("Parameter save failed: {}", error);
                    SAVE_RESULT_ERROR
                }
            };
            STATUS.last_save_result.store(result, Relaxed);
        }
        ControlEvent::FactoryReset => {
            info!("Factory reset");
            engine.apply_params(&Params::factory());
        }
    }
    None
}

#[embassy_executor::task]
pub async fn engine_task(
    mut usb_receiver: zerocopy_channel::Receiver<'static, NoopRawMutex, UsbSampleBlock>,
    mut spdif_sender: zerocopy_channel::Sender<'static, NoopRawMutex, SpdifBlock>,
    mut store: ParamStore,
) {
    let delay_lines = unsafe { &mut *core::ptr::addr_of_mut!(DELAY_LINES) };
    let loudness_tables = unsafe { &mut *core::ptr::addr_of_mut!(LOUDNESS_TABLES) };
    let mut engine = Engine::new(delay_lines, loudness_tables, crate::DEFAULT_SAMPLE_RATE_HZ);

    match store.load() {
        Ok(params) => {
            info!("Loaded saved parameters");
            with_shared_params(|p| *p = params.clone());
            engine.apply_params(&params);
        }
        Err(error) => {
            info!("No saved parameters ({}), using factory defaults", error);
        }
    }

    let mut status_word = channel_status_word(engine.sample_rate_hz());
    let mut last_packet: Option<Instant> = None;

    loop {
        match select(usb_receiver.receive(), CONTROL_EVENTS.receive()).await {
            Either::First(samples) => {
                let start = Instant::now();

                if let Some(last) = last_packet {
                    let gap_us = (start - last).as_micros();
                    if gap_us > GAP_RESET_US {
                        // Stream resumed after a long gap: new drift epoch,
                        // and silence queued ahead of the first packet.
                        DRIFT.lock(|d| d.borrow_mut().reset());
                        prime_silence(&mut spdif_sender, status_word);
                    } else if gap_us > GAP_UNDERRUN_US {
                        bump(&STATUS.usb_gap_underruns);
                    }
                }
                last_packet = Some(start);

                let frames = samples.len() / INPUT_CHANNEL_COUNT;
                DRIFT.lock(|d| {
                    d.borrow_mut()
                        .on_packet(start.as_micros(), frames as u32)
                });
                bump(&STATUS.packets_received);

                if let Some(block) = spdif_sender.try_send() {
                    block.clear();
                    engine.process_packet(samples, |l, r, sub| {
                        block.push_frame(l, r, status_word);
                        push_sub(sub);
                    });
                    spdif_sender.send_done();
                } else {
                    // No free output buffer: the frame is dropped on the
                    // S/PDIF side, but the sub path and the meters still run.
                    bump(&STATUS.spdif_overruns);
                    engine.process_packet(samples, |_l, _r, sub| push_sub(sub));
                }

                let peaks = engine.peaks().as_array();
                for (slot, peak) in STATUS.peaks.iter().zip(peaks) {
                    slot.store(peak, Relaxed);
                }
                let busy_us = start.elapsed().as_micros() as u32;
                STATUS
                    .cpu0_load
                    .store((busy_us / 10).min(u8::MAX as u32) as u8, Relaxed);

                usb_receiver.receive_done();
            }
            Either::Second(event) => {
                if let Some(new_status_word) = apply_event(&mut engine, &mut store, event) {
                    status_word = new_status_word;
                }
            }
        }
    }
}
