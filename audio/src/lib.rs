#![cfg_attr(not(test), no_std)]

//! DSP engine for a USB Audio Class sound card with S/PDIF and PDM
//! subwoofer outputs.
//!
//! Everything in this crate is pure computation: it owns no peripherals and
//! performs no I/O, so the whole engine can be exercised by host-run tests.
//! The firmware crate wires these pieces to USB, PIO and DMA.

pub mod crossfeed;
pub mod delay;
pub mod feedback;
pub mod filter;
pub mod loudness;
pub mod params;
pub mod pdm;
pub mod pipeline;
pub mod queue;
pub mod spdif;
pub mod volume;

/// Logical channel indices, shared with the vendor control protocol.
pub const CH_MASTER_LEFT: usize = 0;
pub const CH_MASTER_RIGHT: usize = 1;
pub const CH_OUT_LEFT: usize = 2;
pub const CH_OUT_RIGHT: usize = 3;
pub const CH_OUT_SUB: usize = 4;

pub const NUM_CHANNELS: usize = 5;
pub const OUTPUT_CHANNEL_COUNT: usize = 3;

/// EQ band slots reserved per channel in parameter storage.
pub const MAX_BANDS: usize = 12;

/// Active band counts: 10 on the master pair, 2 on each output channel.
pub const CHANNEL_BAND_COUNTS: [usize; NUM_CHANNELS] = [10, 10, 2, 2, 2];

pub fn db_to_linear(db: f32) -> f32 {
    libm::powf(10.0, db / 20.0)
}

#[inline]
pub fn clip_s64_to_s32(x: i64) -> i32 {
    if x > i32::MAX as i64 {
        i32::MAX
    } else if x < i32::MIN as i64 {
        i32::MIN
    } else {
        x as i32
    }
}
