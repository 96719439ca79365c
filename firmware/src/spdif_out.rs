//! PIO S/PDIF output driver.
//!
//! A four-instruction state machine clocks biphase-mark transition cells
//! onto the pin: the program has one symmetric half per line level, a `1`
//! cell falls through to the other half (toggling the level), a `0` cell
//! loops. Each cell takes two PIO cycles, so the state machine runs at
//! `sample_rate * 256` and the clock divider is `ceil(sys_clk / rate)` in
//! 16.8 fixed point.
//!
//! Encoded blocks stream to the TX FIFO by DMA, one buffer per transfer;
//! when the pool runs dry the output task substitutes a pre-encoded
//! silence block so the transmitter never starves mid-subframe.

use core::sync::atomic::Ordering::Relaxed;

use audio::spdif::{channel_status_word, SpdifBlock};
use embassy_rp::dma::AnyChannel;
use embassy_rp::peripherals::PIO0;
use embassy_rp::pio::{
    Common, Config, Direction, FifoJoin, Instance, PioPin, ShiftConfig, ShiftDirection,
    StateMachine,
};
use embassy_rp::Peri;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::zerocopy_channel;
use fixed::types::extra::U8;
use fixed::FixedU32;

use crate::{bump, STATUS, USB_IS_STREAMING};

/// 16.8 PIO divider for one S/PDIF sample stream: 128 cells per frame at
/// two cycles each.
pub fn clock_divider(sys_clk_hz: u32, sample_rate_hz: u32) -> FixedU32<U8> {
    FixedU32::from_bits(sys_clk_hz.div_ceil(sample_rate_hz))
}

pub struct SpdifOut<'d, PIO: Instance, const SM: usize> {
    sm: StateMachine<'d, PIO, SM>,
    dma: Peri<'d, AnyChannel>,
}

impl<'d, PIO: Instance, const SM: usize> SpdifOut<'d, PIO, SM> {
    pub fn new(
        common: &mut Common<'d, PIO>,
        mut sm: StateMachine<'d, PIO, SM>,
        dma: Peri<'d, AnyChannel>,
        pin: Peri<'d, impl PioPin>,
        sys_clk_hz: u32,
        sample_rate_hz: u32,
    ) -> Self {
        let program = pio_proc::pio_asm!(
            ".side_set 1",
            ".wrap_target",
            "high:",
            "    out x, 1       side 1",
            "    jmp !x, high   side 1",
            "low:",
            "    out x, 1       side 0",
            "    jmp !x, low    side 0",
            ".wrap",
        );
        let loaded = common.load_program(&program.program);

        let pin = common.make_pio_pin(pin);
        let mut cfg = Config::default();
        cfg.use_program(&loaded, &[&pin]);
        cfg.shift_out = ShiftConfig {
            auto_fill: true,
            threshold: 32,
            direction: ShiftDirection::Right,
        };
        cfg.fifo_join = FifoJoin::TxOnly;
        cfg.clock_divider = clock_divider(sys_clk_hz, sample_rate_hz);
        sm.set_config(&cfg);
        sm.set_pin_dirs(Direction::Out, &[&pin]);

        SpdifOut { sm, dma }
    }

    /// The instance's bit in the PIO `CTRL` enable mask.
    pub fn sm_mask(&self) -> u8 {
        1 << SM
    }

    /// Pushes one encoded buffer to the transmitter.
    pub async fn write(&mut self, words: &[u32]) {
        self.sm
            .tx()
            .dma_push(self.dma.reborrow(), words, false)
            .await;
    }
}

/// Starts a group of S/PDIF state machines on the same cycle.
///
/// All instances of a sync group share one PIO block; a single `CTRL`
/// write restarts their dividers and sets every enable bit at once, so
/// multi-output boards stay sample-aligned.
pub fn enable_in_sync(sm_mask: u8) {
    let pio = embassy_rp::pac::PIO0;
    pio.ctrl().modify(|w| {
        w.set_clkdiv_restart(sm_mask);
        w.set_sm_restart(sm_mask);
        w.set_sm_enable(w.sm_enable() | sm_mask);
    });
}

/// Drains the block pool into the PIO transmitter.
///
/// Buffers are transmitted in pool order. An empty pool while the host is
/// streaming counts as an underrun and plays one silence block.
#[embassy_executor::task]
pub async fn spdif_output_task(
    mut spdif: SpdifOut<'static, PIO0, 0>,
    mut receiver: zerocopy_channel::Receiver<'static, NoopRawMutex, SpdifBlock>,
) {
    let mut silence = SpdifBlock::new();
    let mut silence_rate_hz = 0u32;

    loop {
        if let Some(block) = receiver.try_receive() {
            spdif.write(block.words()).await;
            receiver.receive_done();
        } else {
            let rate_hz = STATUS.sample_rate_hz.load(Relaxed);
            if rate_hz != silence_rate_hz {
                silence.fill_silence(channel_status_word(rate_hz));
                silence_rate_hz = rate_hz;
            }
            if USB_IS_STREAMING.load(Relaxed) {
                bump(&STATUS.spdif_underruns);
            }
            spdif.write(silence.words()).await;
        }
    }
}
