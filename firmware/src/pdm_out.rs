//! PIO PDM output and the core-1 modulator loop.
//!
//! The PIO side is a single `out pins, 1` instruction with 32-bit autopull,
//! clocked at 256x the sample rate; a DMA channel cycles through a 2048-word
//! ring feeding its FIFO. Core 1 runs the sigma-delta modulator forever,
//! keeping its writes a fixed lead ahead of the DMA read pointer.
//!
//! Everything core 1 executes lives in `.data.ram_func`. Flash programming
//! stalls XIP on both cores; a modulator fetching from flash would freeze
//! mid-sample and hold the pin at DC straight into the subwoofer amplifier.

use core::sync::atomic::{AtomicU8, Ordering::Relaxed};

use audio::pdm::{SigmaDelta, WORDS_PER_SAMPLE};
use audio::queue::PdmMessage;
use defmt::info;
use embassy_rp::dma::{AnyChannel, Channel as DmaChannel};
use embassy_rp::pac;
use embassy_rp::pio::{
    Common, Config, Direction, FifoJoin, Instance, PioPin, ShiftConfig, ShiftDirection,
    StateMachine,
};
use embassy_rp::Peri;
use fixed::types::extra::U8;
use fixed::FixedU32;

use crate::{bump, CORE1_HEARTBEAT, PDM_QUEUE, STATUS, USB_IS_STREAMING};

pub const DMA_BUFFER_WORDS: usize = 2048;
const INDEX_MASK: u32 = DMA_BUFFER_WORDS as u32 - 1;

/// DMA address wrap: log2(2048 words * 4 bytes).
const RING_BITS: u8 = 13;

/// Words of lead the writer keeps over the DMA read pointer: 32 samples,
/// about 0.67 ms at 48 kHz.
const TARGET_LEAD: u32 = 256;

/// TREQ for PIO1 state machine 0 TX.
const DREQ_PIO1_TX0: u8 = 8;

/// One PCM sample's worth of PDM bits per TX FIFO word.
const PDM_OVERSAMPLE: u32 = (WORDS_PER_SAMPLE * 32) as u32;

// The DMA ring must be naturally aligned for the address-wrap hardware.
#[repr(C, align(8192))]
struct DmaRing([u32; DMA_BUFFER_WORDS]);

static mut PDM_DMA_RING: DmaRing = DmaRing([0; DMA_BUFFER_WORDS]);

static PDM_DMA_CHANNEL: AtomicU8 = AtomicU8::new(0);

/// 16.8 PIO divider: one output bit per PIO cycle at 256x oversampling.
pub fn clock_divider(sys_clk_hz: u32, sample_rate_hz: u32) -> FixedU32<U8> {
    let bits = ((sys_clk_hz as u64) << 8) / (sample_rate_hz as u64 * PDM_OVERSAMPLE as u64);
    FixedU32::from_bits(bits as u32)
}

pub struct PdmOut<'d, PIO: Instance, const SM: usize> {
    // Held for ownership; the state machine free-runs once enabled.
    #[allow(unused)]
    sm: StateMachine<'d, PIO, SM>,
}

impl<'d, PIO: Instance, const SM: usize> PdmOut<'d, PIO, SM> {
    pub fn new(
        common: &mut Common<'d, PIO>,
        mut sm: StateMachine<'d, PIO, SM>,
        pin: Peri<'d, impl PioPin>,
        sys_clk_hz: u32,
        sample_rate_hz: u32,
    ) -> Self {
        let program = pio_proc::pio_asm!("out pins, 1");
        let loaded = common.load_program(&program.program);

        let pin = common.make_pio_pin(pin);
        let mut cfg = Config::default();
        cfg.use_program(&loaded, &[]);
        cfg.set_out_pins(&[&pin]);
        cfg.shift_out = ShiftConfig {
            auto_fill: true,
            threshold: 32,
            direction: ShiftDirection::Left, // MSB first
        };
        cfg.fifo_join = FifoJoin::TxOnly;
        cfg.clock_divider = clock_divider(sys_clk_hz, sample_rate_hz);
        sm.set_config(&cfg);
        sm.set_pin_dirs(Direction::Out, &[&pin]);
        sm.set_enable(true);

        PdmOut { sm }
    }

    /// Pre-fills the ring with 50 % duty cells and starts the endless DMA
    /// transfer into the TX FIFO. The pin toggles at half rate instead of
    /// sitting at DC from the moment the state machine starts.
    pub fn start_dma(&mut self, dma: Peri<'static, AnyChannel>) {
        let number = dma.number();
        PDM_DMA_CHANNEL.store(number, Relaxed);

        let base = unsafe { core::ptr::addr_of_mut!(PDM_DMA_RING.0) as *mut u32 };
        for index in 0..DMA_BUFFER_WORDS {
            unsafe { base.add(index).write_volatile(0xAAAA_AAAA) };
        }

        let ch = pac::DMA.ch(number as usize);
        ch.write_addr()
            .write_value(pac::PIO1.txf(0).as_ptr() as u32);
        ch.read_addr().write_value(base as u32);
        ch.trans_count().write_value(0xFFFF_FFFF);
        ch.ctrl_trig().write(|w| {
            w.set_incr_read(true);
            w.set_incr_write(false);
            w.set_data_size(pac::dma::vals::DataSize::SIZE_WORD);
            w.set_treq_sel(pac::dma::vals::TreqSel::from_bits(DREQ_PIO1_TX0));
            w.set_ring_sel(false); // wrap the read address
            w.set_ring_size(RING_BITS);
            w.set_chain_to(number);
            w.set_en(true);
        });

        // The channel runs unattended from here on; core 1 re-arms it if
        // the transfer count ever runs out.
        core::mem::forget(dma);

        info!("PDM DMA running on channel {}", number);
    }
}

#[inline(always)]
fn read_index(ch: pac::dma::Channel, base_addr: u32) -> u32 {
    (ch.read_addr().read().wrapping_sub(base_addr) / 4) & INDEX_MASK
}

/// The core-1 entry point: runs the modulator forever.
///
/// Per iteration: observe the DMA lead and recover from underrun, acquire
/// a sample (real, synthesized silence, or a bounded wait), modulate it
/// into eight words, and advance. A heartbeat counter tells core 0 the
/// loop is still alive; core 0 stops petting the watchdog when it stalls.
#[cfg_attr(target_os = "none", link_section = ".data.ram_func")]
#[inline(never)]
pub fn core1_main() -> ! {
    let ch = pac::DMA.ch(PDM_DMA_CHANNEL.load(Relaxed) as usize);
    let base = unsafe { core::ptr::addr_of_mut!(PDM_DMA_RING.0) as *mut u32 };
    let base_addr = base as u32;

    let mut sd = SigmaDelta::new();
    let mut words = [0u32; WORDS_PER_SAMPLE];
    let mut write_index: u32 = 0;
    let mut active_us: u32 = 0;
    let mut load_window: u32 = 0;

    loop {
        // The transfer count is finite (if enormous); re-arm a channel
        // that ran to completion before it parks the pin.
        if !ch.ctrl_trig().read().busy() {
            ch.read_addr().write_value(base_addr);
            ch.trans_count().write_value(0xFFFF_FFFF);
            ch.ctrl_trig().modify(|w| w.set_en(true));
        }

        let mut lead = write_index.wrapping_sub(read_index(ch, base_addr)) & INDEX_MASK;

        // Interpreted as "the writer fell behind the DMA read pointer".
        if lead > (DMA_BUFFER_WORDS / 2) as u32 {
            sd.reset();
            write_index = (read_index(ch, base_addr) + TARGET_LEAD) & INDEX_MASK;
            lead = TARGET_LEAD;
            bump(&STATUS.pdm_dma_underruns);
        }

        let message = match PDM_QUEUE.pop() {
            Some(message) => message,
            None if lead < TARGET_LEAD => {
                // Synthesize silence to keep the cushion.
                if USB_IS_STREAMING.load(Relaxed) {
                    bump(&STATUS.pdm_ring_underruns);
                }
                PdmMessage::default()
            }
            None => {
                // At target lead with nothing to do: wait for a sample or
                // for the DMA to eat into the cushion.
                loop {
                    lead = write_index.wrapping_sub(read_index(ch, base_addr)) & INDEX_MASK;
                    if lead < TARGET_LEAD || lead > (DMA_BUFFER_WORDS / 2) as u32 {
                        break;
                    }
                    if !PDM_QUEUE.is_empty() {
                        break;
                    }
                    if lead > TARGET_LEAD + 128 {
                        cortex_m::asm::wfe();
                    }
                }
                PDM_QUEUE.pop().unwrap_or_default()
            }
        };

        let start = pac::TIMER.timerawl().read();

        if message.reset {
            sd.reset();
        }
        let sample = if message.reset { 0 } else { message.sample };
        sd.modulate(sample, &mut words);

        for word in words {
            unsafe { base.add(write_index as usize).write_volatile(word) };
            write_index = (write_index + 1) & INDEX_MASK;
        }

        CORE1_HEARTBEAT.store(
            CORE1_HEARTBEAT.load(Relaxed).wrapping_add(1),
            Relaxed,
        );

        active_us = active_us.wrapping_add(pac::TIMER.timerawl().read().wrapping_sub(start));
        load_window += 1;
        if load_window >= 48 {
            STATUS
                .cpu1_load
                .store((active_us / 10).min(u8::MAX as u32) as u8, Relaxed);
            active_us = 0;
            load_window = 0;
        }
    }
}
