//! Q28 fixed-point biquad filters and the EQ recipes they are compiled from.
//!
//! Recipes are the intent (type, frequency, Q, gain); biquads are the
//! compiled state. Coefficients are designed in `f32` with the RBJ cookbook
//! equations from the `biquad` crate, then quantized to Q28. The signal path
//! itself never touches floating point: the RP2040 has no FPU, and the
//! transposed direct form II kernel below runs entirely in 64-bit
//! multiply-accumulate.

use biquad::{Coefficients, ToHertz, Type};

use crate::clip_s64_to_s32;

/// Fractional bits of the fixed-point representation, both for coefficients
/// and for samples inside the pipeline (s16 input is shifted left by 14,
/// which puts full scale at `32767 << 14`).
pub const FILTER_SHIFT: u32 = 28;

/// 1.0 in Q28.
pub const Q28_ONE: i32 = 1 << FILTER_SHIFT;

/// Peaking/shelf gains below this magnitude compile to the identity filter.
const FLAT_GAIN_DB: f32 = 0.01;

/// Quantized biquad coefficients, normalized by a0.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Coeffs {
    pub b0: i32,
    pub b1: i32,
    pub b2: i32,
    pub a1: i32,
    pub a2: i32,
}

impl Coeffs {
    pub const IDENTITY: Coeffs = Coeffs {
        b0: Q28_ONE,
        b1: 0,
        b2: 0,
        a1: 0,
        a2: 0,
    };

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    fn from_f32(c: Coefficients<f32>) -> Self {
        let scale = (1i64 << FILTER_SHIFT) as f32;
        Coeffs {
            b0: (c.b0 * scale) as i32,
            b1: (c.b1 * scale) as i32,
            b2: (c.b2 * scale) as i32,
            a1: (c.a1 * scale) as i32,
            a2: (c.a2 * scale) as i32,
        }
    }

    /// Transposed direct form II step. The state accumulators stay at the
    /// full Q56 product scale so that cascaded stages do not build up a
    /// noise floor from repeated truncation.
    #[inline]
    pub fn run(&self, state: &mut BiquadState, x: i32) -> i32 {
        let x = x as i64;
        let y = clip_s64_to_s32((self.b0 as i64 * x + state.s1) >> FILTER_SHIFT);
        let y64 = y as i64;
        state.s1 = self.b1 as i64 * x - self.a1 as i64 * y64 + state.s2;
        state.s2 = self.b2 as i64 * x - self.a2 as i64 * y64;
        y
    }
}

/// Biquad state accumulators, kept separate from coefficients so that
/// coefficient tables (loudness) can be shared between channels.
#[derive(Clone, Copy, Default, Debug)]
pub struct BiquadState {
    pub s1: i64,
    pub s2: i64,
}

impl BiquadState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A compiled filter stage: coefficients, state, and a bypass flag that is
/// kept consistent with the coefficients (set exactly when they are the
/// identity).
#[derive(Clone, Copy, Default, Debug)]
pub struct Biquad {
    coeffs: Coeffs,
    state: BiquadState,
    bypass: bool,
}

impl Biquad {
    pub fn set_coeffs(&mut self, coeffs: Coeffs) {
        self.coeffs = coeffs;
        self.bypass = coeffs.is_identity();
        self.state.reset();
    }

    pub fn coeffs(&self) -> Coeffs {
        self.coeffs
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    #[inline]
    pub fn run(&mut self, x: i32) -> i32 {
        if self.bypass {
            return x;
        }
        self.coeffs.run(&mut self.state, x)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FilterKind {
    #[default]
    Flat = 0,
    Peaking = 1,
    LowShelf = 2,
    HighShelf = 3,
    LowPass = 4,
    HighPass = 5,
}

impl FilterKind {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FilterKind::Peaking,
            2 => FilterKind::LowShelf,
            3 => FilterKind::HighShelf,
            4 => FilterKind::LowPass,
            5 => FilterKind::HighPass,
            _ => FilterKind::Flat,
        }
    }
}

/// One EQ band's design parameters.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EqRecipe {
    pub kind: FilterKind,
    pub freq_hz: f32,
    pub q: f32,
    pub gain_db: f32,
}

impl Default for EqRecipe {
    fn default() -> Self {
        Self::FLAT
    }
}

impl EqRecipe {
    pub const FLAT: EqRecipe = EqRecipe {
        kind: FilterKind::Flat,
        freq_hz: 1000.0,
        q: 0.707,
        gain_db: 0.0,
    };

    pub const FREQ_MIN_HZ: f32 = 10.0;
    pub const FREQ_MAX_HZ: f32 = 20_000.0;
    pub const Q_MIN: f32 = 0.1;
    pub const Q_MAX: f32 = 16.0;
    pub const GAIN_MIN_DB: f32 = -24.0;
    pub const GAIN_MAX_DB: f32 = 24.0;

    /// Clamps all parameters into their valid ranges. Called at the intake
    /// boundary; the audio loop never sees an out-of-range recipe.
    pub fn sanitize(&mut self) {
        if !self.freq_hz.is_finite() {
            self.freq_hz = 1000.0;
        }
        if !self.q.is_finite() || self.q <= 0.0 {
            self.q = 0.707;
        }
        if !self.gain_db.is_finite() {
            self.gain_db = 0.0;
        }
        self.freq_hz = self.freq_hz.clamp(Self::FREQ_MIN_HZ, Self::FREQ_MAX_HZ);
        self.q = self.q.clamp(Self::Q_MIN, Self::Q_MAX);
        self.gain_db = self.gain_db.clamp(Self::GAIN_MIN_DB, Self::GAIN_MAX_DB);
    }
}

/// Compiles a recipe into Q28 coefficients for the given sample rate.
///
/// Flat recipes, and peaking/shelf recipes whose gain is inaudibly small,
/// compile to the identity so the chain can skip them entirely.
pub fn design(recipe: &EqRecipe, sample_rate_hz: u32) -> Coeffs {
    if sample_rate_hz == 0 || recipe.freq_hz <= 0.0 {
        return Coeffs::IDENTITY;
    }

    let shelf_like = matches!(
        recipe.kind,
        FilterKind::Peaking | FilterKind::LowShelf | FilterKind::HighShelf
    );
    if recipe.kind == FilterKind::Flat || (shelf_like && libm::fabsf(recipe.gain_db) < FLAT_GAIN_DB) {
        return Coeffs::IDENTITY;
    }

    let fs = sample_rate_hz as f32;
    // Keep the corner comfortably below Nyquist; recipes persist across rate
    // changes, so a 20 kHz band must still compile at 44.1 kHz.
    let f0 = recipe.freq_hz.min(0.45 * fs);

    let kind = match recipe.kind {
        FilterKind::Peaking => Type::PeakingEQ(recipe.gain_db),
        FilterKind::LowShelf => Type::LowShelf(recipe.gain_db),
        FilterKind::HighShelf => Type::HighShelf(recipe.gain_db),
        FilterKind::LowPass => Type::LowPass,
        FilterKind::HighPass => Type::HighPass,
        FilterKind::Flat => return Coeffs::IDENTITY,
    };

    match Coefficients::<f32>::from_params(kind, fs.hz(), f0.hz(), recipe.q) {
        Ok(c) => Coeffs::from_f32(c),
        Err(_) => Coeffs::IDENTITY,
    }
}

/// The biquad cascade for one logical channel.
#[derive(Clone, Copy, Debug)]
pub struct FilterChain {
    biquads: [Biquad; crate::MAX_BANDS],
    band_count: usize,
    all_bypassed: bool,
}

impl FilterChain {
    pub fn new(band_count: usize) -> Self {
        FilterChain {
            biquads: [Biquad::default(); crate::MAX_BANDS],
            band_count: band_count.min(crate::MAX_BANDS),
            all_bypassed: true,
        }
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn set_band(&mut self, band: usize, coeffs: Coeffs) {
        if band < self.band_count {
            self.biquads[band].set_coeffs(coeffs);
            self.all_bypassed = self.biquads[..self.band_count].iter().all(Biquad::is_bypassed);
        }
    }

    pub fn band(&self, band: usize) -> Option<&Biquad> {
        self.biquads[..self.band_count].get(band)
    }

    pub fn reset_state(&mut self) {
        for bq in &mut self.biquads[..self.band_count] {
            let coeffs = bq.coeffs();
            bq.set_coeffs(coeffs);
        }
    }

    #[inline]
    pub fn run(&mut self, mut sample: i32) -> i32 {
        if self.all_bypassed {
            return sample;
        }
        for bq in &mut self.biquads[..self.band_count] {
            sample = bq.run(sample);
        }
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q28(x: f32) -> i32 {
        (x * (1u32 << FILTER_SHIFT) as f32) as i32
    }

    #[test]
    fn identity_coeffs_pass_samples_through() {
        let mut bq = Biquad::default();
        bq.set_coeffs(Coeffs::IDENTITY);
        for x in [0, 1, -1, q28(0.5), q28(-0.99), i32::MAX >> 2] {
            assert_eq!(bq.run(x), x);
        }
    }

    #[test]
    fn bypass_flag_matches_identity_coefficients() {
        let mut bq = Biquad::default();

        bq.set_coeffs(Coeffs::IDENTITY);
        assert!(bq.is_bypassed());

        let peaking = design(
            &EqRecipe {
                kind: FilterKind::Peaking,
                freq_hz: 1000.0,
                q: 1.0,
                gain_db: 3.0,
            },
            48_000,
        );
        bq.set_coeffs(peaking);
        assert!(!bq.is_bypassed());
        assert!(!peaking.is_identity());
    }

    #[test]
    fn flat_and_tiny_gain_recipes_compile_to_identity() {
        let flat = design(&EqRecipe::default(), 48_000);
        assert!(flat.is_identity());

        let tiny = design(
            &EqRecipe {
                kind: FilterKind::Peaking,
                freq_hz: 1000.0,
                q: 1.0,
                gain_db: 0.005,
            },
            48_000,
        );
        assert!(tiny.is_identity());

        // A zero-gain lowpass is still a filter.
        let lp = design(
            &EqRecipe {
                kind: FilterKind::LowPass,
                freq_hz: 1000.0,
                q: 0.707,
                gain_db: 0.0,
            },
            48_000,
        );
        assert!(!lp.is_identity());
    }

    #[test]
    fn sanitize_clamps_out_of_range_parameters() {
        let mut recipe = EqRecipe {
            kind: FilterKind::Peaking,
            freq_hz: 1.0e9,
            q: -3.0,
            gain_db: f32::NAN,
        };
        recipe.sanitize();
        assert_eq!(recipe.freq_hz, EqRecipe::FREQ_MAX_HZ);
        assert_eq!(recipe.q, 0.707);
        assert_eq!(recipe.gain_db, 0.0);
    }

    /// Single-bin DFT power, normalized so it does not scale with N.
    fn dft_power(signal: &[f32], fs: f32, f_hz: f32) -> f32 {
        let n = signal.len();
        let w = -2.0 * std::f32::consts::PI * f_hz / fs;
        let mut re = 0.0f32;
        let mut im = 0.0f32;
        for (k, &x) in signal.iter().enumerate() {
            let t = w * (k as f32);
            re += x * t.cos();
            im += x * t.sin();
        }
        (re * re + im * im) / (n as f32 * n as f32)
    }

    fn measure_gain_db(coeffs: Coeffs, fs: f32, f_hz: f32) -> f32 {
        let mut state = BiquadState::default();
        let n = 16_384;
        let amplitude = 0.25f32;
        let mut output = vec![0.0f32; n];
        let mut input = vec![0.0f32; n];
        for k in 0..n {
            let x = amplitude * (2.0 * std::f32::consts::PI * f_hz * k as f32 / fs).sin();
            input[k] = x;
            let x_q28 = (x * Q28_ONE as f32) as i32;
            output[k] = coeffs.run(&mut state, x_q28) as f32 / Q28_ONE as f32;
        }
        // Skip the transient at the start.
        let settled = n / 4;
        let p_in = dft_power(&input[settled..], fs, f_hz);
        let p_out = dft_power(&output[settled..], fs, f_hz);
        10.0 * (p_out / p_in).log10()
    }

    #[test]
    fn high_q_peaking_filter_hits_its_design_gain() {
        let coeffs = design(
            &EqRecipe {
                kind: FilterKind::Peaking,
                freq_hz: 12_000.0,
                q: 4.0,
                gain_db: 6.0,
            },
            48_000,
        );

        let gain = measure_gain_db(coeffs, 48_000.0, 12_000.0);
        assert!((gain - 6.0).abs() < 0.5, "peak gain {gain} dB, wanted 6 dB");

        // Away from the peak the response returns to unity.
        let skirt = measure_gain_db(coeffs, 48_000.0, 3_000.0);
        assert!(skirt.abs() < 0.5, "skirt gain {skirt} dB, wanted 0 dB");
    }

    #[test]
    fn lowpass_attenuates_above_the_corner() {
        let coeffs = design(
            &EqRecipe {
                kind: FilterKind::LowPass,
                freq_hz: 1_000.0,
                q: 0.707,
                gain_db: 0.0,
            },
            48_000,
        );

        let passband = measure_gain_db(coeffs, 48_000.0, 100.0);
        let stopband = measure_gain_db(coeffs, 48_000.0, 8_000.0);
        assert!(passband.abs() < 0.5);
        assert!(stopband < -30.0, "stopband only {stopband} dB down");
    }

    #[test]
    fn chain_tracks_whole_chain_bypass() {
        let mut chain = FilterChain::new(10);
        assert!(chain.run(12345) == 12345);

        let coeffs = design(
            &EqRecipe {
                kind: FilterKind::HighPass,
                freq_hz: 80.0,
                q: 0.707,
                gain_db: 0.0,
            },
            48_000,
        );
        chain.set_band(0, coeffs);
        // DC is rejected by the highpass.
        let mut y = 0;
        for _ in 0..48_000 {
            y = chain.run(q28(0.5));
        }
        assert!(y.abs() < q28(0.01));

        chain.set_band(0, Coeffs::IDENTITY);
        assert_eq!(chain.run(4242), 4242);
    }

    #[test]
    fn out_of_range_band_writes_are_ignored() {
        let mut chain = FilterChain::new(2);
        chain.set_band(5, Coeffs { b0: 0, b1: 0, b2: 0, a1: 0, a2: 0 });
        assert_eq!(chain.run(777), 777);
    }
}
