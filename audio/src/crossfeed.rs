//! Stereo-to-binaural crossfeed for headphone listening.
//!
//! Mixes a filtered portion of each channel into the opposite channel to
//! soften hard stereo separation. The crossfeed path is a single-pole
//! lowpass (head shadow) followed by a first-order all-pass that supplies
//! the interaural time delay; the direct path is the complement
//! `input - lowpass(input)`, which guarantees mono unity at DC:
//!
//! ```text
//! out_L = (in_L - lp_L) + allpass(lp_R)
//! out_R = (in_R - lp_R) + allpass(lp_L)
//! ```

use crate::filter::FILTER_SHIFT;

/// ITD for a 60 degree speaker arc around a 15 cm head: the far-ear path is
/// about 7.5 cm longer, which is 220 us at the speed of sound.
pub const ITD_SEC: f32 = 0.000_220;

pub const FREQ_MIN_HZ: f32 = 500.0;
pub const FREQ_MAX_HZ: f32 = 2000.0;
pub const FEED_MIN_DB: f32 = 0.0;
pub const FEED_MAX_DB: f32 = 15.0;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CrossfeedPreset {
    /// 700 Hz / 4.5 dB. Balanced.
    #[default]
    Default = 0,
    /// 700 Hz / 6.0 dB. Stronger spatial effect.
    ChuMoy = 1,
    /// 650 Hz / 9.5 dB. Subtle.
    Meier = 2,
    /// User-supplied cutoff and feed level.
    Custom = 3,
}

impl CrossfeedPreset {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CrossfeedPreset::ChuMoy,
            2 => CrossfeedPreset::Meier,
            3 => CrossfeedPreset::Custom,
            _ => CrossfeedPreset::Default,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CrossfeedConfig {
    pub enabled: bool,
    pub itd_enabled: bool,
    pub preset: CrossfeedPreset,
    pub custom_fc_hz: f32,
    pub custom_feed_db: f32,
}

impl Default for CrossfeedConfig {
    fn default() -> Self {
        Self::FACTORY
    }
}

impl CrossfeedConfig {
    pub const FACTORY: CrossfeedConfig = CrossfeedConfig {
        enabled: false,
        itd_enabled: true,
        preset: CrossfeedPreset::Default,
        custom_fc_hz: 700.0,
        custom_feed_db: 4.5,
    };

    pub fn sanitize(&mut self) {
        if !self.custom_fc_hz.is_finite() {
            self.custom_fc_hz = 700.0;
        }
        if !self.custom_feed_db.is_finite() {
            self.custom_feed_db = 4.5;
        }
        self.custom_fc_hz = self.custom_fc_hz.clamp(FREQ_MIN_HZ, FREQ_MAX_HZ);
        self.custom_feed_db = self.custom_feed_db.clamp(FEED_MIN_DB, FEED_MAX_DB);
    }

    /// Resolved `{cutoff, feed}` for this configuration.
    fn parameters(&self) -> (f32, f32) {
        match self.preset {
            CrossfeedPreset::Default => (700.0, 4.5),
            CrossfeedPreset::ChuMoy => (700.0, 6.0),
            CrossfeedPreset::Meier => (650.0, 9.5),
            CrossfeedPreset::Custom => (
                self.custom_fc_hz.clamp(FREQ_MIN_HZ, FREQ_MAX_HZ),
                self.custom_feed_db.clamp(FEED_MIN_DB, FEED_MAX_DB),
            ),
        }
    }
}

/// Runtime crossfeed state, Q28.
#[derive(Clone, Copy, Default, Debug)]
pub struct Crossfeed {
    bypassed: bool,
    lp_a0: i32,
    lp_b1: i32,
    ap_a: i32,
    lp_state_l: i32,
    lp_state_r: i32,
    ap_state_l: i32,
    ap_state_r: i32,
}

impl Crossfeed {
    pub fn new() -> Self {
        Crossfeed {
            bypassed: true,
            ..Default::default()
        }
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    fn reset_state(&mut self) {
        self.lp_state_l = 0;
        self.lp_state_r = 0;
        self.ap_state_l = 0;
        self.ap_state_r = 0;
    }

    /// Recomputes coefficients for a configuration and sample rate.
    ///
    /// All transcendental math lives here; the per-sample path is multiplies
    /// and shifts only. The commit order matters: state and coefficients are
    /// written before the `bypassed` fast-path flag.
    pub fn configure(&mut self, config: &CrossfeedConfig, sample_rate_hz: u32) {
        if !config.enabled || sample_rate_hz == 0 {
            self.bypassed = true;
            self.reset_state();
            return;
        }

        let sample_rate = sample_rate_hz as f32;
        let (fc, feed_db) = config.parameters();

        // Feed level is the DC difference between direct and crossfed paths.
        // With the complementary constraint direct + cross = 1:
        //   cross_dc = 1 / (1 + 10^(feed_db / 20))
        let level_ratio = libm::powf(10.0, feed_db / 20.0);
        let g = 1.0 / (1.0 + level_ratio);

        // Single-pole lowpass H(z) = G(1-x) / (1 - x z^-1), x = e^(-2*pi*fc/fs).
        let x = libm::expf(-2.0 * core::f32::consts::PI * fc / sample_rate);
        let lp_a0 = g * (1.0 - x);
        let lp_b1 = x;

        // The lowpass already delays the crossfeed path by x / ((1-x) fs).
        // A first-order all-pass supplies the remainder of the ITD; its DC
        // group delay is (1-a)/(1+a) samples, so a = (1-D)/(1+D).
        let ap_a = if config.itd_enabled {
            let lp_delay_sec = x / ((1.0 - x) * sample_rate);
            let remaining_sec = ITD_SEC - lp_delay_sec;
            if remaining_sec > 0.0 {
                let d = remaining_sec * sample_rate;
                (1.0 - d) / (1.0 + d)
            } else {
                1.0
            }
        } else {
            1.0
        };

        let scale = (1i64 << FILTER_SHIFT) as f32;
        self.lp_a0 = (lp_a0 * scale) as i32;
        self.lp_b1 = (lp_b1 * scale) as i32;
        self.ap_a = (ap_a * scale) as i32;

        self.reset_state();
        self.bypassed = false;
    }

    /// Processes one stereo frame in place (Q28).
    #[inline]
    pub fn process(&mut self, left: &mut i32, right: &mut i32) {
        if self.bypassed {
            return;
        }

        let in_l = *left;
        let in_r = *right;

        let lp_l =
            (((self.lp_a0 as i64 * in_l as i64) + (self.lp_b1 as i64 * self.lp_state_l as i64))
                >> FILTER_SHIFT) as i32;
        let lp_r =
            (((self.lp_a0 as i64 * in_r as i64) + (self.lp_b1 as i64 * self.lp_state_r as i64))
                >> FILTER_SHIFT) as i32;
        self.lp_state_l = lp_l;
        self.lp_state_r = lp_r;

        // First-order all-pass, transposed direct form II.
        let ap_l = ((self.ap_a as i64 * lp_l as i64) >> FILTER_SHIFT) as i32 + self.ap_state_l;
        self.ap_state_l = lp_l - ((self.ap_a as i64 * ap_l as i64) >> FILTER_SHIFT) as i32;
        let ap_r = ((self.ap_a as i64 * lp_r as i64) >> FILTER_SHIFT) as i32 + self.ap_state_r;
        self.ap_state_r = lp_r - ((self.ap_a as i64 * ap_r as i64) >> FILTER_SHIFT) as i32;

        *left = (in_l - lp_l) + ap_r;
        *right = (in_r - lp_r) + ap_l;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Q28_ONE;

    fn enabled_config(preset: CrossfeedPreset) -> CrossfeedConfig {
        CrossfeedConfig {
            enabled: true,
            preset,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_crossfeed_is_transparent() {
        let mut xf = Crossfeed::new();
        xf.configure(&CrossfeedConfig::default(), 48_000);
        let (mut l, mut r) = (123_456, -654_321);
        xf.process(&mut l, &mut r);
        assert_eq!((l, r), (123_456, -654_321));
    }

    #[test]
    fn mono_input_passes_at_unity_at_dc() {
        let mut xf = Crossfeed::new();
        xf.configure(&enabled_config(CrossfeedPreset::Default), 48_000);

        // Drive a DC mono signal until the filters settle.
        let x = Q28_ONE / 4;
        let (mut l, mut r) = (0, 0);
        for _ in 0..48_000 {
            l = x;
            r = x;
            xf.process(&mut l, &mut r);
        }

        // Complementary property: direct + crossfeed sum back to the input,
        // up to Q28 quantization of the coefficients.
        let tolerance = Q28_ONE / 1000;
        assert!((l - x).abs() < tolerance, "left settled at {l}, wanted {x}");
        assert!((r - x).abs() < tolerance, "right settled at {r}, wanted {x}");
    }

    #[test]
    fn crossfeed_actually_leaks_into_the_opposite_channel() {
        let mut xf = Crossfeed::new();
        xf.configure(&enabled_config(CrossfeedPreset::ChuMoy), 48_000);

        // Hard-panned DC on the left only.
        let x = Q28_ONE / 4;
        let (mut l, mut r) = (0, 0);
        for _ in 0..48_000 {
            l = x;
            r = 0;
            xf.process(&mut l, &mut r);
        }

        assert!(r > x / 10, "no crossfeed on the right: {r}");
        assert!(l < x, "left keeps less than the full signal: {l}");
        // Feed level: 6 dB means direct sits about 6 dB above the crossfeed.
        let ratio = l as f32 / r as f32;
        let db = 20.0 * ratio.log10();
        assert!((db - 6.0).abs() < 0.5, "feed level {db} dB, wanted 6 dB");
    }

    #[test]
    fn custom_parameters_are_clamped() {
        let mut config = CrossfeedConfig {
            enabled: true,
            preset: CrossfeedPreset::Custom,
            custom_fc_hz: 10_000.0,
            custom_feed_db: -3.0,
            ..Default::default()
        };
        config.sanitize();
        assert_eq!(config.custom_fc_hz, FREQ_MAX_HZ);
        assert_eq!(config.custom_feed_db, FEED_MIN_DB);
    }
}
