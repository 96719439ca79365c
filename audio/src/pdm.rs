//! Second-order sigma-delta modulator for the 1-bit PDM subwoofer output.
//!
//! One Q28 PCM sample becomes 256 output bits (eight 32-bit words, MSB
//! first). Feedback subtracts from both integrators, giving a
//! `(1 - z^-1)^2` noise transfer function; the binary feedback levels
//! {0, 65535} sit symmetrically around the offset input midpoint 32768.
//!
//! Everything in this module runs on core 1 and must execute from RAM:
//! flash programming stalls XIP on both cores, and a modulator frozen
//! mid-sample would park the output pin at DC straight into the subwoofer
//! amplifier. The firmware's linker script maps `.data.ram_func` into RAM.

/// Oversampling ratio: PDM bit clock = sample rate * 256.
pub const OVERSAMPLE: usize = 256;

/// Words produced per PCM sample.
pub const WORDS_PER_SAMPLE: usize = OVERSAMPLE / 32;

/// Input limiter, about 90 % of full scale in s16 units. A second-order
/// loop goes unstable above roughly 95 % modulation depth; this limit is
/// load-bearing, not a tuning knob.
pub const CLIP_THRESH: i32 = 29491;

/// Dither amplitude mask. Two masked draws are summed, so the dither is
/// triangular with peaks of +/-511 comparator units.
pub const DITHER_MASK: u32 = 0x1FF;

/// Integrator leakage shift, applied once per PCM sample. At 48 kHz a
/// shift of 16 gives a time constant around 1.4 s, enough to bleed off DC
/// drift without touching the bass band.
pub const LEAKAGE_SHIFT: u32 = 16;

const FEEDBACK_HIGH: i32 = 65535;
const INPUT_MIDPOINT: i32 = 32768;

/// xorshift32 PRNG for dither. Not audio-grade randomness, but white enough
/// to break up idle tones, and only a handful of cycles per draw.
#[derive(Clone, Copy, Debug)]
pub struct XorShift32 {
    state: u32,
}

impl XorShift32 {
    pub const fn new(seed: u32) -> Self {
        XorShift32 {
            state: if seed == 0 { 123_456_789 } else { seed },
        }
    }

    #[cfg_attr(target_os = "none", link_section = ".data.ram_func")]
    #[inline(never)]
    pub fn next(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}

/// Modulator state: two leaky integrators plus the dither PRNG.
#[derive(Clone, Copy, Debug)]
pub struct SigmaDelta {
    err1: i32,
    err2: i32,
    rng: XorShift32,
}

impl SigmaDelta {
    pub const fn new() -> Self {
        SigmaDelta {
            err1: 0,
            err2: 0,
            rng: XorShift32::new(123_456_789),
        }
    }

    /// Zeroes the integrators. Used on reset messages and underrun recovery.
    #[cfg_attr(target_os = "none", link_section = ".data.ram_func")]
    #[inline(never)]
    pub fn reset(&mut self) {
        self.err1 = 0;
        self.err2 = 0;
    }

    /// Integrator magnitudes, for stability checks.
    pub fn integrators(&self) -> (i32, i32) {
        (self.err1, self.err2)
    }

    /// Modulates one Q28 PCM sample into eight packed 32-bit words.
    #[cfg_attr(target_os = "none", link_section = ".data.ram_func")]
    #[inline(never)]
    pub fn modulate(&mut self, sample_q28: i32, words: &mut [u32; WORDS_PER_SAMPLE]) {
        // Back to s16 scale, then hard-limit for loop stability.
        let pcm = (sample_q28 >> 14).clamp(-CLIP_THRESH, CLIP_THRESH);

        // Offset to unsigned so the feedback levels straddle the input.
        let target = pcm + INPUT_MIDPOINT;

        for word in words.iter_mut() {
            // TPDF dither, one value per 32-bit chunk.
            let r1 = (self.rng.next() & DITHER_MASK) as i32;
            let r2 = (self.rng.next() & DITHER_MASK) as i32;
            let dither = r1 - r2;

            let mut packed = 0u32;
            for bit in 0..32 {
                let one = self.err2 + dither >= 0;
                let fb = if one { FEEDBACK_HIGH } else { 0 };
                if one {
                    packed |= 1 << (31 - bit);
                }

                self.err1 += target - fb;
                self.err2 += self.err1 - fb;
            }
            *word = packed;
        }

        // Leaky integration: any accumulated DC or numeric error decays
        // instead of latching the modulator.
        self.err1 -= self.err1 >> LEAKAGE_SHIFT;
        self.err2 -= self.err2 >> LEAKAGE_SHIFT;
    }
}

impl Default for SigmaDelta {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones_density(words: &[u32]) -> f64 {
        let ones: u32 = words.iter().map(|w| w.count_ones()).sum();
        ones as f64 / (words.len() as f64 * 32.0)
    }

    #[test]
    fn silence_produces_a_balanced_stream() {
        let mut sd = SigmaDelta::new();
        let mut words = [0u32; WORDS_PER_SAMPLE];
        let mut all = Vec::new();
        for _ in 0..1000 {
            sd.modulate(0, &mut words);
            all.extend_from_slice(&words);
        }

        let density = ones_density(&all);
        assert!(
            (density - 0.5).abs() < 0.01,
            "silence density {density}, wanted 0.5"
        );

        // Not latched: both bit values occur in every sample's worth of output.
        for chunk in all.chunks(WORDS_PER_SAMPLE) {
            let ones: u32 = chunk.iter().map(|w| w.count_ones()).sum();
            assert!(ones > 0 && ones < 256, "latched output: {ones}/256 ones");
        }
    }

    #[test]
    fn average_density_tracks_the_input_level() {
        // Quarter scale positive input: expected density is
        // (pcm + 32768) / 65535.
        let pcm_s16 = 8192i32;
        let mut sd = SigmaDelta::new();
        let mut words = [0u32; WORDS_PER_SAMPLE];
        let mut all = Vec::new();
        for _ in 0..2000 {
            sd.modulate(pcm_s16 << 14, &mut words);
            all.extend_from_slice(&words);
        }

        let expected = (pcm_s16 + INPUT_MIDPOINT) as f64 / 65535.0;
        let density = ones_density(&all);
        assert!(
            (density - expected).abs() < 0.005,
            "density {density}, wanted {expected}"
        );
    }

    #[test]
    fn integrators_stay_bounded_at_the_clip_threshold() {
        let mut sd = SigmaDelta::new();
        let mut words = [0u32; WORDS_PER_SAMPLE];
        // One second at 48 kHz, input pinned at the limiter ceiling.
        for _ in 0..48_000 {
            sd.modulate(CLIP_THRESH << 14, &mut words);
            let (e1, e2) = sd.integrators();
            assert!(e1.abs() < 1 << 24, "err1 diverged: {e1}");
            assert!(e2.abs() < 1 << 24, "err2 diverged: {e2}");
        }
    }

    #[test]
    fn limiter_clamps_beyond_full_scale_inputs() {
        let mut sd_clipped = SigmaDelta::new();
        let mut sd_limit = SigmaDelta::new();
        let mut a = [0u32; WORDS_PER_SAMPLE];
        let mut b = [0u32; WORDS_PER_SAMPLE];

        // Far beyond full scale behaves exactly like the threshold itself.
        for _ in 0..100 {
            sd_clipped.modulate(i32::MAX, &mut a);
            sd_limit.modulate(CLIP_THRESH << 14, &mut b);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn reset_zeroes_the_integrators() {
        let mut sd = SigmaDelta::new();
        let mut words = [0u32; WORDS_PER_SAMPLE];
        sd.modulate(10_000 << 14, &mut words);
        sd.reset();
        assert_eq!(sd.integrators(), (0, 0));
    }

    #[test]
    fn prng_is_deterministic_and_nonzero() {
        let mut a = XorShift32::new(0);
        let mut b = XorShift32::new(0);
        for _ in 0..1000 {
            let v = a.next();
            assert_eq!(v, b.next());
            assert_ne!(v, 0);
        }
    }
}
