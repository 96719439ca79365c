//! The per-packet DSP pipeline.
//!
//! [`Engine`] owns every piece of compiled audio state: preamp, loudness
//! shelves, master and output EQ chains, crossfeed, per-channel trims,
//! master volume and the delay lines. The streaming task calls
//! [`Engine::process_packet`] once per isochronous packet; parameter
//! changes are applied through the `set_*` methods strictly between
//! packets, so a packet never observes a half-applied update. All
//! transcendental math happens inside those setters, never in the
//! per-sample path.
//!
//! Per-sample signal order: preamp, loudness, master EQ, crossfeed, sub
//! split, output EQ, channel gain/mute, master volume, delay, output
//! conversion.

use crate::crossfeed::{Crossfeed, CrossfeedConfig};
use crate::delay::{DelayBank, DelayLines};
use crate::filter::{design, Coeffs, EqRecipe, FilterChain, Q28_ONE};
use crate::loudness::{Loudness, LoudnessConfig, LoudnessTables};
use crate::params::Params;
use crate::volume::{volume_index, volume_multiplier};
use crate::{
    clip_s64_to_s32, db_to_linear, CHANNEL_BAND_COUNTS, CH_MASTER_LEFT, CH_MASTER_RIGHT,
    CH_OUT_LEFT, CH_OUT_RIGHT, CH_OUT_SUB, NUM_CHANNELS, OUTPUT_CHANNEL_COUNT,
};

pub const SUPPORTED_RATES_HZ: [u32; 3] = [44_100, 48_000, 96_000];
pub const DEFAULT_RATE_HZ: u32 = 48_000;

/// Unsupported rate requests silently coerce to 44.1 kHz.
pub fn coerce_rate(rate_hz: u32) -> u32 {
    if SUPPORTED_RATES_HZ.contains(&rate_hz) {
        rate_hz
    } else {
        44_100
    }
}

/// Peak observation points, in s16 units.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Peaks {
    pub master_l: u16,
    pub master_r: u16,
    pub out_l: u16,
    pub out_r: u16,
    pub out_sub: u16,
}

impl Peaks {
    pub fn as_array(&self) -> [u16; 5] {
        [
            self.master_l,
            self.master_r,
            self.out_l,
            self.out_r,
            self.out_sub,
        ]
    }
}

pub struct Engine<'d> {
    sample_rate_hz: u32,
    params: Params,
    preamp_mul: i32,
    filters: [FilterChain; NUM_CHANNELS],
    loudness: Loudness<'d>,
    crossfeed: Crossfeed,
    delay: DelayBank<'d>,
    gain_mul: [i32; OUTPUT_CHANNEL_COUNT],
    vol_mul: i32,
    volume_index: usize,
    volume_code: i16,
    mute: bool,
    peaks: Peaks,
}

impl<'d> Engine<'d> {
    /// The delay lines and loudness tables are too large for any stack, so
    /// callers pass in statically allocated storage.
    pub fn new(
        delay_lines: &'d mut DelayLines,
        loudness_tables: &'d mut LoudnessTables,
        sample_rate_hz: u32,
    ) -> Self {
        let mut filters = [FilterChain::new(0); NUM_CHANNELS];
        for (ch, chain) in filters.iter_mut().enumerate() {
            *chain = FilterChain::new(CHANNEL_BAND_COUNTS[ch]);
        }

        let mut engine = Engine {
            sample_rate_hz: coerce_rate(sample_rate_hz),
            params: Params::default(),
            preamp_mul: Q28_ONE,
            filters,
            loudness: Loudness::new(loudness_tables),
            crossfeed: Crossfeed::new(),
            delay: DelayBank::new(delay_lines),
            gain_mul: [Q28_ONE; OUTPUT_CHANNEL_COUNT],
            vol_mul: 0x7fff,
            volume_index: crate::volume::VOLUME_STEPS - 1,
            volume_code: 0,
            mute: false,
            peaks: Peaks::default(),
        };
        let defaults = Params::default();
        engine.apply_params(&defaults);
        engine
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn peaks(&self) -> Peaks {
        self.peaks
    }

    pub fn volume_code(&self) -> i16 {
        self.volume_code
    }

    /// Compiled coefficients of one band, for diagnostics and tests.
    pub fn filter_coeffs(&self, channel: usize, band: usize) -> Option<Coeffs> {
        self.filters
            .get(channel)
            .and_then(|chain| chain.band(band))
            .map(|bq| bq.coeffs())
    }

    pub fn delay_offsets(&self) -> [u32; OUTPUT_CHANNEL_COUNT] {
        self.delay.offsets()
    }

    /// Replaces the whole parameter set and recompiles all derived state.
    /// Used at boot, after a flash load, and on factory reset.
    pub fn apply_params(&mut self, params: &Params) {
        let mut params = params.clone();
        params.sanitize();
        self.params = params;
        self.rebuild();
    }

    /// Switches the sample rate and recompiles every rate-dependent piece:
    /// biquad coefficients, loudness tables, crossfeed, delay counts.
    pub fn set_sample_rate(&mut self, rate_hz: u32) -> u32 {
        self.sample_rate_hz = coerce_rate(rate_hz);
        self.rebuild();
        self.sample_rate_hz
    }

    /// Updates one EQ band. Returns `false` for an invalid channel/band.
    pub fn set_recipe(&mut self, channel: usize, band: usize, recipe: EqRecipe) -> bool {
        if channel >= NUM_CHANNELS || band >= CHANNEL_BAND_COUNTS[channel] {
            return false;
        }
        let mut recipe = recipe;
        recipe.sanitize();
        self.params.recipes[channel][band] = recipe;
        self.filters[channel].set_band(band, design(&recipe, self.sample_rate_hz));
        true
    }

    pub fn set_preamp_db(&mut self, db: f32) {
        self.params.preamp_db = db;
        self.params.sanitize();
        self.preamp_mul = q28_gain(self.params.preamp_db);
    }

    pub fn set_bypass_master_eq(&mut self, bypass: bool) {
        self.params.bypass_master_eq = bypass;
    }

    pub fn set_channel_gain_db(&mut self, output: usize, db: f32) {
        if output < OUTPUT_CHANNEL_COUNT {
            self.params.gains_db[output] = db;
            self.params.sanitize();
            self.gain_mul[output] = q28_gain(self.params.gains_db[output]);
        }
    }

    pub fn set_channel_mute(&mut self, output: usize, mute: bool) {
        if output < OUTPUT_CHANNEL_COUNT {
            self.params.mutes[output] = mute;
        }
    }

    /// Sets the delay of one logical channel in milliseconds.
    pub fn set_delay_ms(&mut self, channel: usize, ms: f32) {
        if channel < NUM_CHANNELS {
            self.params.delays_ms[channel] = ms;
            self.params.sanitize();
            self.delay
                .set_delays(&self.params.delays_ms, self.sample_rate_hz);
        }
    }

    pub fn set_crossfeed(&mut self, config: &CrossfeedConfig) {
        self.params.crossfeed = *config;
        self.params.crossfeed.sanitize();
        self.crossfeed
            .configure(&self.params.crossfeed, self.sample_rate_hz);
    }

    pub fn set_loudness(&mut self, config: &LoudnessConfig) {
        self.params.loudness = *config;
        self.params.loudness.sanitize();
        self.loudness
            .configure(&self.params.loudness, self.sample_rate_hz);
    }

    /// Master volume from the USB feature unit, as an 8.8 dB code.
    pub fn set_volume_code(&mut self, code_8q8: i16) {
        self.volume_code = code_8q8;
        self.volume_index = volume_index(code_8q8);
        self.vol_mul = volume_multiplier(code_8q8);
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    pub fn is_muted(&self) -> bool {
        self.mute
    }

    fn rebuild(&mut self) {
        let rate = self.sample_rate_hz;

        self.preamp_mul = q28_gain(self.params.preamp_db);
        for ch in 0..NUM_CHANNELS {
            for band in 0..CHANNEL_BAND_COUNTS[ch] {
                self.filters[ch].set_band(band, design(&self.params.recipes[ch][band], rate));
            }
        }
        for output in 0..OUTPUT_CHANNEL_COUNT {
            self.gain_mul[output] = q28_gain(self.params.gains_db[output]);
        }
        self.crossfeed.configure(&self.params.crossfeed, rate);
        self.loudness.configure(&self.params.loudness, rate);
        self.delay.set_delays(&self.params.delays_ms, rate);
    }

    /// Transforms one packet of interleaved stereo s16 samples.
    ///
    /// `sink` receives, per frame, the delayed left/right samples ready for
    /// S/PDIF and the delayed subwoofer sample at Q28 scale for the PDM
    /// queue. Parameters are latched for the whole packet: in particular,
    /// the loudness volume step is read once here, so a table flip or
    /// volume change never lands mid-packet.
    pub fn process_packet(&mut self, interleaved: &[i16], mut sink: impl FnMut(i16, i16, i32)) {
        let vol_idx = self.volume_index;
        let loudness_on = self.loudness.is_enabled();
        let bypass_master = self.params.bypass_master_eq;
        let preamp = self.preamp_mul as i64;
        let vol_mul = if self.mute { 0 } else { self.vol_mul as i64 };
        let mutes = self.params.mutes;

        let mut peak = [0i32; 5];

        for frame in interleaved.chunks_exact(2) {
            let mut l = (frame[0] as i32) << 14;
            let mut r = (frame[1] as i32) << 14;

            l = clip_s64_to_s32((l as i64 * preamp) >> 28);
            r = clip_s64_to_s32((r as i64 * preamp) >> 28);

            if loudness_on {
                l = self.loudness.process(0, vol_idx, l);
                r = self.loudness.process(1, vol_idx, r);
            }

            if !bypass_master {
                l = self.filters[CH_MASTER_LEFT].run(l);
                r = self.filters[CH_MASTER_RIGHT].run(r);
            }

            peak[0] = peak[0].max(l.saturating_abs());
            peak[1] = peak[1].max(r.saturating_abs());

            self.crossfeed.process(&mut l, &mut r);

            let sub_in = ((l as i64 + r as i64) >> 1) as i32;

            let mut out_l = self.filters[CH_OUT_LEFT].run(l);
            let mut out_r = self.filters[CH_OUT_RIGHT].run(r);
            let mut out_sub = self.filters[CH_OUT_SUB].run(sub_in);

            peak[2] = peak[2].max(out_l.saturating_abs());
            peak[3] = peak[3].max(out_r.saturating_abs());
            peak[4] = peak[4].max(out_sub.saturating_abs());

            out_l = if mutes[0] {
                0
            } else {
                clip_s64_to_s32((out_l as i64 * self.gain_mul[0] as i64) >> 28)
            };
            out_r = if mutes[1] {
                0
            } else {
                clip_s64_to_s32((out_r as i64 * self.gain_mul[1] as i64) >> 28)
            };
            out_sub = if mutes[2] {
                0
            } else {
                clip_s64_to_s32((out_sub as i64 * self.gain_mul[2] as i64) >> 28)
            };

            out_l = clip_s64_to_s32((out_l as i64 * vol_mul) >> 15);
            out_r = clip_s64_to_s32((out_r as i64 * vol_mul) >> 15);
            out_sub = clip_s64_to_s32((out_sub as i64 * vol_mul) >> 15);

            let (delayed_l, delayed_r, delayed_sub) = self.delay.tick(out_l, out_r, out_sub);

            sink(to_s16(delayed_l), to_s16(delayed_r), delayed_sub);
        }

        self.peaks = Peaks {
            master_l: (peak[0] >> 14) as u16,
            master_r: (peak[1] >> 14) as u16,
            out_l: (peak[2] >> 14) as u16,
            out_r: (peak[3] >> 14) as u16,
            out_sub: (peak[4] >> 14) as u16,
        };
    }
}

fn q28_gain(db: f32) -> i32 {
    clip_s64_to_s32((db_to_linear(db) * Q28_ONE as f32) as i64)
}

/// Q28 back to s16 with rounding; saturates instead of wrapping so
/// overdriven content clips at full scale.
#[inline]
fn to_s16(q28: i32) -> i16 {
    let rounded = clip_s64_to_s32(q28 as i64 + (1 << 13)) >> 14;
    rounded.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::MAX_DELAY_SAMPLES;
    use crate::filter::FilterKind;
    use crate::loudness::SHELF_COUNT;
    use crate::volume::VOLUME_STEPS;

    fn engine(rate: u32) -> Engine<'static> {
        let delay: &'static mut DelayLines = Box::leak(Box::new([[0; MAX_DELAY_SAMPLES]; 3]));
        let tables: &'static mut LoudnessTables =
            Box::leak(Box::new([[[Coeffs::IDENTITY; SHELF_COUNT]; VOLUME_STEPS]; 2]));
        Engine::new(delay, tables, rate)
    }

    /// An engine with no crossover filters, for identity-path checks.
    fn flat_engine(rate: u32) -> Engine<'static> {
        let mut engine = engine(rate);
        let mut params = Params::default();
        params.recipes = [[EqRecipe::default(); crate::MAX_BANDS]; NUM_CHANNELS];
        engine.apply_params(&params);
        engine
    }

    fn sine_packet(frames: usize, freq_hz: f32, rate_hz: f32, phase0: usize) -> Vec<i16> {
        let mut packet = Vec::with_capacity(frames * 2);
        for k in 0..frames {
            let t = (phase0 + k) as f32 / rate_hz;
            let x = (2.0 * std::f32::consts::PI * freq_hz * t).sin();
            let s = (x * 32767.0) as i16;
            packet.push(s);
            packet.push(s);
        }
        packet
    }

    fn rms(samples: &[i16]) -> f64 {
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    #[test]
    fn silence_stays_silent_through_the_whole_pipeline() {
        let mut engine = engine(48_000);
        let zeros = vec![0i16; 48 * 2];
        for _ in 0..1000 {
            engine.process_packet(&zeros, |l, r, sub| {
                assert_eq!(l, 0);
                assert_eq!(r, 0);
                assert_eq!(sub, 0);
            });
        }
        assert_eq!(engine.peaks(), Peaks::default());
    }

    #[test]
    fn full_scale_sine_passes_with_unity_rms() {
        let mut engine = flat_engine(48_000);

        let mut input = Vec::new();
        let mut output = Vec::new();
        for packet_index in 0..200 {
            let packet = sine_packet(48, 1000.0, 48_000.0, packet_index * 48);
            input.extend(packet.iter().step_by(2).copied());
            engine.process_packet(&packet, |l, _r, _sub| output.push(l));
        }

        // Drop the first packets so delay-line zeros do not bias the RMS.
        let input_rms = rms(&input[4800..]);
        let output_rms = rms(&output[4800..]);
        let error = (output_rms - input_rms).abs() / input_rms;
        assert!(error < 0.005, "RMS error {error}");

        let peaks = engine.peaks();
        assert!(peaks.master_l >= 32700, "master L peak {}", peaks.master_l);
        assert!(peaks.master_r >= 32700);
    }

    #[test]
    fn overdrive_saturates_at_full_scale_instead_of_wrapping() {
        let mut engine = flat_engine(48_000);
        engine.set_preamp_db(12.0);

        let packet = vec![i16::MAX; 48 * 2];
        let mut min = i16::MAX;
        let mut max = i16::MIN;
        for _ in 0..10 {
            engine.process_packet(&packet, |l, _r, _sub| {
                min = min.min(l);
                max = max.max(l);
            });
        }
        assert_eq!(max, i16::MAX);
        // A wrap would have produced large negative samples.
        assert!(min >= 0, "wrapped to {min}");
    }

    #[test]
    fn peaking_band_boosts_its_center_frequency() {
        let mut engine = flat_engine(48_000);
        assert!(engine.set_recipe(
            CH_MASTER_LEFT,
            0,
            EqRecipe {
                kind: FilterKind::Peaking,
                freq_hz: 12_000.0,
                q: 4.0,
                gain_db: 6.0,
            },
        ));
        // Headroom so the boost itself cannot clip.
        engine.set_preamp_db(-12.0);

        let mut l_out = Vec::new();
        let mut r_out = Vec::new();
        for packet_index in 0..200 {
            let packet = sine_packet(48, 12_000.0, 48_000.0, packet_index * 48);
            engine.process_packet(&packet, |l, r, _sub| {
                l_out.push(l);
                r_out.push(r);
            });
        }

        let gain_db = 20.0 * (rms(&l_out[4800..]) / rms(&r_out[4800..])).log10();
        assert!((gain_db - 6.0).abs() < 0.5, "boost measured {gain_db} dB");
    }

    #[test]
    fn sub_channel_is_the_lowpassed_mono_sum() {
        let mut engine = engine(48_000); // default 80 Hz crossover
        engine.set_delay_ms(CH_OUT_SUB, 0.0);

        // 60 Hz passes the sub lowpass, 8 kHz must not.
        for freq in [60.0f32, 8000.0] {
            let mut sub_out = Vec::new();
            for packet_index in 0..400 {
                let packet = sine_packet(48, freq, 48_000.0, packet_index * 48);
                engine.process_packet(&packet, |_l, _r, sub| sub_out.push((sub >> 14) as i16));
            }
            let level = rms(&sub_out[9600..]);
            if freq < 100.0 {
                assert!(level > 15_000.0, "60 Hz sub level {level}");
            } else {
                assert!(level < 500.0, "8 kHz sub level {level}");
            }
        }
    }

    #[test]
    fn master_volume_attenuates_by_the_coded_decibels() {
        let mut engine = flat_engine(48_000);
        engine.set_volume_code(-20 * 256);

        let mut output = Vec::new();
        for packet_index in 0..100 {
            let packet = sine_packet(48, 1000.0, 48_000.0, packet_index * 48);
            engine.process_packet(&packet, |l, _r, _sub| output.push(l));
        }
        let measured = rms(&output[2400..]) / (32767.0 / std::f64::consts::SQRT_2);
        let db = 20.0 * measured.log10();
        assert!((db + 20.0).abs() < 0.2, "attenuation measured {db} dB");
    }

    #[test]
    fn mute_flags_silence_their_channels() {
        let mut engine = flat_engine(48_000);
        engine.set_channel_mute(1, true);
        let packet = sine_packet(48, 1000.0, 48_000.0, 0);
        engine.process_packet(&packet, |l, r, _sub| {
            assert_eq!(r, 0);
            let _ = l;
        });

        engine.set_mute(true);
        let packet = sine_packet(48, 1000.0, 48_000.0, 48);
        engine.process_packet(&packet, |l, r, sub| {
            assert_eq!((l, r, sub), (0, 0, 0));
        });
    }

    #[test]
    fn rate_round_trip_restores_derived_state() {
        let mut engine = engine(48_000);
        engine.set_delay_ms(CH_OUT_LEFT, 5.0);
        engine.set_recipe(
            CH_MASTER_LEFT,
            2,
            EqRecipe {
                kind: FilterKind::Peaking,
                freq_hz: 1500.0,
                q: 1.2,
                gain_db: 3.0,
            },
        );

        let coeffs_before: Vec<_> = (0..NUM_CHANNELS)
            .map(|ch| engine.filter_coeffs(ch, 0).unwrap())
            .collect();
        let offsets_before = engine.delay_offsets();

        assert_eq!(engine.set_sample_rate(96_000), 96_000);
        assert_ne!(engine.filter_coeffs(CH_MASTER_LEFT, 2), None);
        assert_eq!(engine.set_sample_rate(48_000), 48_000);

        let coeffs_after: Vec<_> = (0..NUM_CHANNELS)
            .map(|ch| engine.filter_coeffs(ch, 0).unwrap())
            .collect();
        assert_eq!(coeffs_before, coeffs_after);
        assert_eq!(offsets_before, engine.delay_offsets());
    }

    #[test]
    fn unsupported_rates_coerce_to_44100() {
        let mut engine = engine(48_000);
        assert_eq!(engine.set_sample_rate(22_050), 44_100);
        assert_eq!(engine.sample_rate_hz(), 44_100);
    }

    #[test]
    fn recipe_indices_are_validated() {
        let mut engine = engine(48_000);
        let recipe = EqRecipe::default();
        assert!(!engine.set_recipe(NUM_CHANNELS, 0, recipe));
        // Output channels only expose two bands.
        assert!(!engine.set_recipe(CH_OUT_SUB, 5, recipe));
        assert!(engine.set_recipe(CH_OUT_SUB, 1, recipe));
    }

    #[test]
    fn loudness_engages_only_below_reference_volume() {
        let mut engine = flat_engine(48_000);
        engine.set_loudness(&LoudnessConfig {
            enabled: true,
            ref_spl: 83.0,
            intensity_pct: 100.0,
        });
        // Generous headroom: the bass shelf boost at low volume is large
        // and must not clip inside the measurement.
        engine.set_preamp_db(-24.0);

        // At 0 dB volume the tables are identity: a sine passes unchanged.
        let mut reference = Vec::new();
        for packet_index in 0..100 {
            let packet = sine_packet(48, 60.0, 48_000.0, packet_index * 48);
            engine.process_packet(&packet, |l, _r, _sub| reference.push(l));
        }

        // At -30 dB the bass shelf boosts 60 Hz beyond the plain volume cut.
        engine.set_volume_code(-30 * 256);
        let mut attenuated = Vec::new();
        for packet_index in 100..300 {
            let packet = sine_packet(48, 60.0, 48_000.0, packet_index * 48);
            engine.process_packet(&packet, |l, _r, _sub| attenuated.push(l));
        }

        let flat_cut = db_to_linear(-30.0) as f64;
        let measured = rms(&attenuated[4800..]) / rms(&reference[2400..]);
        let boost_db = 20.0 * (measured / flat_cut).log10();
        assert!(
            boost_db > 3.0,
            "loudness bass boost only {boost_db} dB above the volume cut"
        );
    }
}
