//! Equal-loudness compensation.
//!
//! At low listening volume the ear loses bass and treble sensitivity.
//! Compensation follows the ISO 226:2003 equal-loudness contours, sampled
//! at 50 Hz and 10 kHz, and is applied as a pair of shelving biquads whose
//! gains depend on the current master-volume step.
//!
//! Coefficients for all 91 volume steps are precomputed into one of two
//! table buffers; the audio path only ever indexes the active buffer.
//! Recomputation fills the inactive buffer and then commits by rewriting
//! the active index in one store, so a running packet never observes a
//! half-written table.

use crate::filter::{design, BiquadState, Coeffs, EqRecipe, FilterKind};
use crate::volume::VOLUME_STEPS;

pub const SHELF_COUNT: usize = 2;

const LOW_SHELF_HZ: f32 = 200.0;
const HIGH_SHELF_HZ: f32 = 6000.0;
const SHELF_Q: f32 = 0.707;

/// ISO 226:2003 Table 1 constants at the two evaluation frequencies:
/// threshold of hearing Tf, exponent alpha_f, and transfer level Lu.
const ISO_50_TF: f32 = 44.0;
const ISO_50_AF: f32 = 0.432;
const ISO_50_LU: f32 = 80.4;

const ISO_10K_TF: f32 = 13.9;
const ISO_10K_AF: f32 = 0.301;
const ISO_10K_LU: f32 = 17.8;

pub const REF_SPL_MIN: f32 = 40.0;
pub const REF_SPL_MAX: f32 = 100.0;

/// Coefficient sets for every volume step and both shelves, double buffered.
pub type LoudnessTables = [[[Coeffs; SHELF_COUNT]; VOLUME_STEPS]; 2];

#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LoudnessConfig {
    pub enabled: bool,
    /// SPL the listener hears at 0 dB master volume.
    pub ref_spl: f32,
    /// Compensation strength, 0-100 %.
    pub intensity_pct: f32,
}

impl Default for LoudnessConfig {
    fn default() -> Self {
        Self::FACTORY
    }
}

impl LoudnessConfig {
    pub const FACTORY: LoudnessConfig = LoudnessConfig {
        enabled: false,
        ref_spl: 83.0,
        intensity_pct: 100.0,
    };

    pub fn sanitize(&mut self) {
        if !self.ref_spl.is_finite() {
            self.ref_spl = 83.0;
        }
        if !self.intensity_pct.is_finite() {
            self.intensity_pct = 100.0;
        }
        self.ref_spl = self.ref_spl.clamp(REF_SPL_MIN, REF_SPL_MAX);
        self.intensity_pct = self.intensity_pct.clamp(0.0, 100.0);
    }
}

/// ISO 226:2003 equations 1-2: sound pressure level at one frequency that is
/// perceived as loud as `phon` at 1 kHz.
fn iso226_spl(tf: f32, af: f32, lu: f32, phon: f32) -> f32 {
    let b = 0.4 * libm::powf(10.0, (tf + lu) / 10.0 - 9.0);
    let threshold = libm::powf(b, af);

    let mut a_f = 4.47e-3 * (libm::powf(10.0, 0.025 * phon) - 1.15) + threshold;
    if a_f < 1e-10 {
        a_f = 1e-10;
    }

    (10.0 / af) * libm::log10f(a_f) - lu + 94.0
}

/// How much boost (dB) a frequency needs at a reduced listening level so it
/// keeps its perceived loudness relative to the 1 kHz reference.
fn compensation_db(
    tf: f32,
    af: f32,
    lu: f32,
    ref_spl: f32,
    effective_phon: f32,
    intensity_pct: f32,
) -> f32 {
    if effective_phon >= ref_spl {
        return 0.0;
    }

    let spl_ref = iso226_spl(tf, af, lu, ref_spl);
    let spl_eff = iso226_spl(tf, af, lu, effective_phon);

    // The contour difference minus the flat attenuation already applied by
    // the volume control; positive means this frequency needs a boost.
    let flat_change = effective_phon - ref_spl;
    let freq_change = spl_eff - spl_ref;
    let compensation = freq_change - flat_change;

    compensation * (intensity_pct / 100.0)
}

pub struct Loudness<'d> {
    config: LoudnessConfig,
    tables: &'d mut LoudnessTables,
    active: usize,
    /// Shelf states per input channel (left, right) per shelf.
    state: [[BiquadState; SHELF_COUNT]; 2],
}

impl<'d> Loudness<'d> {
    pub fn new(tables: &'d mut LoudnessTables) -> Self {
        let mut loudness = Loudness {
            config: LoudnessConfig::default(),
            tables,
            active: 0,
            state: Default::default(),
        };
        // Both buffers start as identity so the audio path is valid even
        // before the first recompute.
        for table in loudness.tables.iter_mut() {
            for step in table.iter_mut() {
                *step = [Coeffs::IDENTITY; SHELF_COUNT];
            }
        }
        loudness
    }

    pub fn config(&self) -> LoudnessConfig {
        self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Recomputes the full table set for a new configuration or sample rate.
    ///
    /// Fills the inactive buffer, then flips `active` in one write.
    pub fn configure(&mut self, config: &LoudnessConfig, sample_rate_hz: u32) {
        let mut config = *config;
        config.sanitize();
        self.config = config;

        let write = 1 - self.active;
        let ref_spl = config.ref_spl;

        for vol_idx in 0..VOLUME_STEPS {
            // Index 0 is -90 dB of master attenuation, index 90 is 0 dB.
            let vol_db = vol_idx as f32 - 90.0;
            let effective_phon = (ref_spl + vol_db).clamp(20.0, ref_spl);

            let low_gain_db = compensation_db(
                ISO_50_TF,
                ISO_50_AF,
                ISO_50_LU,
                ref_spl,
                effective_phon,
                config.intensity_pct,
            );
            let high_gain_db = compensation_db(
                ISO_10K_TF,
                ISO_10K_AF,
                ISO_10K_LU,
                ref_spl,
                effective_phon,
                config.intensity_pct,
            );

            self.tables[write][vol_idx] = [
                design(
                    &EqRecipe {
                        kind: FilterKind::LowShelf,
                        freq_hz: LOW_SHELF_HZ,
                        q: SHELF_Q,
                        gain_db: low_gain_db,
                    },
                    sample_rate_hz,
                ),
                design(
                    &EqRecipe {
                        kind: FilterKind::HighShelf,
                        freq_hz: HIGH_SHELF_HZ,
                        q: SHELF_Q,
                        gain_db: high_gain_db,
                    },
                    sample_rate_hz,
                ),
            ];
        }

        self.active = write;
        for channel in &mut self.state {
            for shelf in channel {
                shelf.reset();
            }
        }
    }

    /// Shelf coefficients for one volume step in the active table.
    pub fn coeffs_at(&self, vol_idx: usize) -> [Coeffs; SHELF_COUNT] {
        self.tables[self.active][vol_idx.min(VOLUME_STEPS - 1)]
    }

    /// Runs one sample of one input channel (0 = left, 1 = right) through
    /// both shelves at the given volume step.
    #[inline]
    pub fn process(&mut self, channel: usize, vol_idx: usize, mut sample: i32) -> i32 {
        let coeffs = self.tables[self.active][vol_idx];
        for (shelf, c) in coeffs.iter().enumerate() {
            if !c.is_identity() {
                sample = c.run(&mut self.state[channel][shelf], sample);
            }
        }
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Q28_ONE;

    fn loudness() -> Loudness<'static> {
        let tables: &'static mut LoudnessTables =
            Box::leak(Box::new([[[Coeffs::IDENTITY; SHELF_COUNT]; VOLUME_STEPS]; 2]));
        Loudness::new(tables)
    }

    #[test]
    fn no_compensation_at_reference_level() {
        let mut loudness = loudness();
        loudness.configure(
            &LoudnessConfig {
                enabled: true,
                ref_spl: 83.0,
                intensity_pct: 100.0,
            },
            48_000,
        );

        // At 0 dB master volume the effective phon equals the reference, so
        // both shelves must be exact identity.
        let coeffs = loudness.coeffs_at(VOLUME_STEPS - 1);
        assert!(coeffs[0].is_identity());
        assert!(coeffs[1].is_identity());
    }

    #[test]
    fn reduced_volume_boosts_bass_more_than_treble() {
        let mut loudness = loudness();
        loudness.configure(
            &LoudnessConfig {
                enabled: true,
                ref_spl: 83.0,
                intensity_pct: 100.0,
            },
            48_000,
        );

        // -30 dB listening level: the 50 Hz contour rises much faster than
        // the 10 kHz one, so the low shelf must carry real gain.
        let coeffs = loudness.coeffs_at(90 - 30);
        assert!(!coeffs[0].is_identity(), "low shelf should not be flat");

        // DC gain of the low shelf is b(1)/a(1); it should be a boost.
        let c = coeffs[0];
        let num = (c.b0 as i64 + c.b1 as i64 + c.b2 as i64) as f32;
        let den = (Q28_ONE as i64 + c.a1 as i64 + c.a2 as i64) as f32;
        let dc_gain_db = 20.0 * (num / den).log10();
        assert!(
            dc_gain_db > 3.0 && dc_gain_db < 35.0,
            "low shelf DC gain {dc_gain_db} dB"
        );
    }

    #[test]
    fn intensity_scales_the_correction() {
        let full = compensation_db(ISO_50_TF, ISO_50_AF, ISO_50_LU, 83.0, 53.0, 100.0);
        let half = compensation_db(ISO_50_TF, ISO_50_AF, ISO_50_LU, 83.0, 53.0, 50.0);
        assert!(full > 0.0);
        assert!((half - full / 2.0).abs() < 1e-3);
    }

    #[test]
    fn recompute_flips_the_active_buffer() {
        let mut loudness = loudness();
        let config = LoudnessConfig {
            enabled: true,
            ref_spl: 83.0,
            intensity_pct: 100.0,
        };
        loudness.configure(&config, 48_000);
        let first = loudness.active;
        loudness.configure(&config, 44_100);
        assert_ne!(first, loudness.active);
    }

    #[test]
    fn config_sanitize_clamps_reference_spl() {
        let mut config = LoudnessConfig {
            enabled: true,
            ref_spl: 300.0,
            intensity_pct: -20.0,
        };
        config.sanitize();
        assert_eq!(config.ref_spl, REF_SPL_MAX);
        assert_eq!(config.intensity_pct, 0.0);
    }
}
