#![no_std]

pub mod audio_routing;
pub mod clock_manager;
pub mod flash_store;
pub mod pdm_out;
pub mod spdif_out;
pub mod uac1;
pub mod usb_audio;
pub mod vendor;

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU8, Ordering};

use audio::crossfeed::CrossfeedConfig;
use audio::feedback::DriftTracker;
use audio::filter::EqRecipe;
use audio::loudness::LoudnessConfig;
use audio::params::Params;
use audio::queue::PdmQueue;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

// Stereo USB input -> S/PDIF stereo plus a mono PDM subwoofer.
pub const INPUT_CHANNEL_COUNT: usize = 2;

pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 48_000;
pub const MAX_SAMPLE_RATE_HZ: u32 = 96_000;

pub const SAMPLE_SIZE: usize = 2; // 16-bit PCM

// One millisecond of audio at the highest rate bounds the packet size on
// full-speed USB.
pub const USB_MAX_PACKET_SIZE: usize =
    (MAX_SAMPLE_RATE_HZ as usize / 1000) * INPUT_CHANNEL_COUNT * SAMPLE_SIZE;
pub const USB_MAX_FRAMES: usize = USB_MAX_PACKET_SIZE / (INPUT_CHANNEL_COUNT * SAMPLE_SIZE);

/// S/PDIF pool depth: eight blocks, half of which buffer against DMA.
pub const SPDIF_BLOCK_COUNT: usize = 8;

/// A packet gap above this resets the drift epoch and re-primes the output.
pub const GAP_RESET_US: u64 = 50_000;
/// Gaps between this and the reset threshold count as underruns.
pub const GAP_UNDERRUN_US: u64 = 2_000;

// Full-speed isochronous packets top out at 1023 bytes; the advertised
// maximum must stay under that, and one millisecond at 96 kHz is exactly
// 96 frames.
static_assertions::const_assert!(USB_MAX_PACKET_SIZE <= 1023);
static_assertions::const_assert_eq!(USB_MAX_FRAMES, 96);

// Type definitions
pub type UsbSampleBlock = Vec<i16, { USB_MAX_FRAMES * INPUT_CHANNEL_COUNT }>;

/// Parameter updates staged by USB control handlers and applied by the
/// engine task strictly between audio packets.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum ControlEvent {
    EqRecipe {
        channel: u8,
        band: u8,
        recipe: EqRecipe,
    },
    Preamp(f32),
    BypassMasterEq(bool),
    ChannelGain {
        output: u8,
        db: f32,
    },
    ChannelMute {
        output: u8,
        mute: bool,
    },
    Delay {
        channel: u8,
        ms: f32,
    },
    Crossfeed(CrossfeedConfig),
    Loudness(LoudnessConfig),
    Volume(i16),
    Mute(bool),
    SampleRate(u32),
    SaveParams,
    FactoryReset,
}

pub static CONTROL_EVENTS: Channel<CriticalSectionRawMutex, ControlEvent, 8> = Channel::new();

/// Canonical parameter state, mirrored by the engine. Control handlers
/// read it synchronously for GET requests; the control plane keeps it in
/// step with the staged updates it sends to the engine.
pub static SHARED_PARAMS: Mutex<CriticalSectionRawMutex, RefCell<Params>> =
    Mutex::new(RefCell::new(Params::factory()));

/// Drift epoch shared between the streaming path (writer) and the feedback
/// transmitter (reader).
pub static DRIFT: Mutex<CriticalSectionRawMutex, RefCell<DriftTracker>> =
    Mutex::new(RefCell::new(DriftTracker::new(DEFAULT_SAMPLE_RATE_HZ)));

/// The PCM -> PDM hand-off ring between core 0 and core 1.
pub static PDM_QUEUE: PdmQueue = PdmQueue::new();

/// True while the host has the streaming interface open. Gates the
/// underrun counters so an idle device does not count forever.
pub static USB_IS_STREAMING: AtomicBool = AtomicBool::new(false);

/// Advances once per PCM sample on core 1. The main loop refuses to pet the
/// watchdog when it stops moving, so a hung modulator resets the device
/// instead of silently killing the subwoofer output.
pub static CORE1_HEARTBEAT: AtomicU32 = AtomicU32::new(0);

/// Save results for status read-back.
pub const SAVE_RESULT_NONE: u8 = 0xFF;
pub const SAVE_RESULT_OK: u8 = 0;
pub const SAVE_RESULT_ERROR: u8 = 1;

/// Status block for the vendor read-back interface. All single-writer
/// single-word values.
pub struct Status {
    pub peaks: [AtomicU16; 5],
    pub cpu0_load: AtomicU8,
    pub cpu1_load: AtomicU8,
    pub sample_rate_hz: AtomicU32,
    pub sys_clk_hz: AtomicU32,
    pub temperature_mc: AtomicI32,
    pub packets_received: AtomicU32,
    pub spdif_overruns: AtomicU32,
    pub spdif_underruns: AtomicU32,
    pub usb_gap_underruns: AtomicU32,
    pub pdm_ring_overruns: AtomicU32,
    pub pdm_ring_underruns: AtomicU32,
    pub pdm_dma_underruns: AtomicU32,
    pub last_save_result: AtomicU8,
}

pub static STATUS: Status = Status {
    peaks: [
        AtomicU16::new(0),
        AtomicU16::new(0),
        AtomicU16::new(0),
        AtomicU16::new(0),
        AtomicU16::new(0),
    ],
    cpu0_load: AtomicU8::new(0),
    cpu1_load: AtomicU8::new(0),
    sample_rate_hz: AtomicU32::new(DEFAULT_SAMPLE_RATE_HZ),
    sys_clk_hz: AtomicU32::new(0),
    temperature_mc: AtomicI32::new(0),
    packets_received: AtomicU32::new(0),
    spdif_overruns: AtomicU32::new(0),
    spdif_underruns: AtomicU32::new(0),
    usb_gap_underruns: AtomicU32::new(0),
    pdm_ring_overruns: AtomicU32::new(0),
    pdm_ring_underruns: AtomicU32::new(0),
    pdm_dma_underruns: AtomicU32::new(0),
    last_save_result: AtomicU8::new(SAVE_RESULT_NONE),
};

/// Increment for monotonic counters. The Cortex-M0+ has no atomic
/// read-modify-write, but every counter here has exactly one writer, so a
/// load/store pair is sound.
#[inline(always)]
pub fn bump(counter: &AtomicU32) {
    counter.store(
        counter.load(Ordering::Relaxed).wrapping_add(1),
        Ordering::Relaxed,
    );
}

/// Snapshot of the shared parameter state.
pub fn shared_params() -> Params {
    SHARED_PARAMS.lock(|cell| cell.borrow().clone())
}

/// Mutates the shared parameter state in a short critical section.
pub fn with_shared_params<R>(f: impl FnOnce(&mut Params) -> R) -> R {
    SHARED_PARAMS.lock(|cell| f(&mut cell.borrow_mut()))
}
