//! System clock and sample-rate management.
//!
//! S/PDIF bit timing wants the PIO divider `sys_clk / rate` to land close
//! to an integer, and 44.1 kHz and 48 kHz do not share one, so two system
//! PLL configurations are kept:
//!
//! - 48 kHz family (48/96): VCO 1440 MHz / 6 / 1 = 240 MHz
//! - 44.1 kHz:              VCO 1236 MHz / 7 / 1 = 176.571 MHz
//!
//! A rate change runs strictly in the control plane between packets: raise
//! the core voltage (it stays raised; both targets are overclocks), park
//! `clk_sys` on the reference clock, re-lock the PLL, then reprogram both
//! PIO dividers.

use core::sync::atomic::{AtomicU32, Ordering::Relaxed};

use defmt::info;
use embassy_rp::pac;
use embassy_time::Timer;

use crate::{pdm_out, spdif_out, STATUS};

const XOSC_HZ: u32 = 12_000_000;

const SYS_CLK_48K_FAMILY_HZ: u32 = 240_000_000;
const SYS_CLK_44K1_HZ: u32 = 176_571_428;

/// State machines whose dividers track the sample rate.
const SPDIF_SM: usize = 0;
const PDM_SM: usize = 0;

static CURRENT_SYS_CLK_HZ: AtomicU32 = AtomicU32::new(0);

pub fn sys_clk_hz() -> u32 {
    CURRENT_SYS_CLK_HZ.load(Relaxed)
}

/// System clock used for a sample-rate family.
pub fn sys_clk_for_rate(sample_rate_hz: u32) -> u32 {
    match sample_rate_hz {
        44_100 => SYS_CLK_44K1_HZ,
        _ => SYS_CLK_48K_FAMILY_HZ,
    }
}

/// One-time boot setup: raise the regulator for the overclocked system
/// PLL, then bring the clock tree up for the default 48 kHz family.
pub async fn init(default_rate_hz: u32) {
    // 1.15 V, one step above nominal; required for 240 MHz.
    pac::VREG_AND_CHIP_RESET
        .vreg()
        .modify(|w| w.set_vsel(0b1011));
    Timer::after_millis(10).await;

    switch_sys_pll(sys_clk_for_rate(default_rate_hz));
    set_pio_dividers(default_rate_hz);

    info!("System clock at {} Hz", sys_clk_hz());
}

/// Reconfigures clocks for a new (already coerced) sample rate.
pub fn apply_sample_rate(sample_rate_hz: u32) {
    let target = sys_clk_for_rate(sample_rate_hz);
    if target != sys_clk_hz() {
        switch_sys_pll(target);
    }
    set_pio_dividers(sample_rate_hz);
}

/// Reprograms the S/PDIF and PDM state machine dividers for a rate, and
/// restarts both dividers so the phase accumulators line up.
fn set_pio_dividers(sample_rate_hz: u32) {
    let sys = sys_clk_hz();

    let spdif = spdif_out::clock_divider(sys, sample_rate_hz).to_bits();
    pac::PIO0.sm(SPDIF_SM).clkdiv().write(|w| {
        w.set_int((spdif >> 8) as u16);
        w.set_frac((spdif & 0xFF) as u8);
    });
    pac::PIO0
        .ctrl()
        .modify(|w| w.set_clkdiv_restart(1 << SPDIF_SM));

    let pdm = pdm_out::clock_divider(sys, sample_rate_hz).to_bits();
    pac::PIO1.sm(PDM_SM).clkdiv().write(|w| {
        w.set_int((pdm >> 8) as u16);
        w.set_frac((pdm & 0xFF) as u8);
    });
    pac::PIO1
        .ctrl()
        .modify(|w| w.set_clkdiv_restart(1 << PDM_SM));
}

/// Re-locks the system PLL at a new frequency.
///
/// `clk_sys` glitchlessly falls back to the reference clock while the PLL
/// is down, so the core keeps running (slowly) throughout.
fn switch_sys_pll(target_hz: u32) {
    let (vco_hz, postdiv1, postdiv2) = match target_hz {
        SYS_CLK_44K1_HZ => (1_236_000_000u64, 7u8, 1u8),
        _ => (1_440_000_000u64, 6u8, 1u8),
    };
    let fbdiv = (vco_hz / XOSC_HZ as u64) as u16;

    let clocks = pac::CLOCKS;
    let pll = pac::PLL_SYS;

    // Park the system clock on the reference while the PLL re-locks.
    clocks
        .clk_sys_ctrl()
        .modify(|w| w.set_src(pac::clocks::vals::ClkSysCtrlSrc::CLK_REF));
    while clocks.clk_sys_selected().read() != 1 {}

    // Power down, reprogram, re-lock.
    pll.pwr().modify(|w| {
        w.set_pd(true);
        w.set_vcopd(true);
    });
    pll.cs().modify(|w| w.set_refdiv(1));
    pll.fbdiv_int().write(|w| w.set_fbdiv_int(fbdiv));
    pll.pwr().modify(|w| {
        w.set_pd(false);
        w.set_vcopd(false);
    });
    while !pll.cs().read().lock() {}

    pll.prim().write(|w| {
        w.set_postdiv1(postdiv1);
        w.set_postdiv2(postdiv2);
    });
    pll.pwr().modify(|w| w.set_postdivpd(false));

    // Back onto the PLL.
    clocks
        .clk_sys_ctrl()
        .modify(|w| w.set_src(pac::clocks::vals::ClkSysCtrlSrc::CLKSRC_CLK_SYS_AUX));
    while clocks.clk_sys_selected().read() != 2 {}

    let actual = (vco_hz / postdiv1 as u64 / postdiv2 as u64) as u32;
    CURRENT_SYS_CLK_HZ.store(actual, Relaxed);
    STATUS.sys_clk_hz.store(actual, Relaxed);
}
