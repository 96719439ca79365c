//! Master volume handling.
//!
//! The USB feature unit reports volume as a signed 8.8 dB code between
//! -90 dB and 0 dB in 1 dB steps. A 91-entry lookup maps integer dB steps to
//! Q15 linear multipliers; the same step index selects the loudness
//! compensation curve.

pub const VOLUME_STEPS: usize = 91;

/// dB step (in 8.8 code units) between adjacent table entries.
pub const VOLUME_RESOLUTION_8Q8: i16 = 256;
pub const MIN_VOLUME_8Q8: i16 = -((VOLUME_STEPS as i16 - 1) * 256);
pub const MAX_VOLUME_8Q8: i16 = 0;

/// Q15 linear gain for each integer dB step, index 0 = -90 dB, 90 = 0 dB.
#[rustfmt::skip]
pub const DB_TO_VOL: [u16; VOLUME_STEPS] = [
    0x0001, 0x0001, 0x0001, 0x0001, 0x0001, 0x0001, 0x0002, 0x0002, 0x0002, 0x0002,
    0x0003, 0x0003, 0x0004, 0x0004, 0x0005, 0x0005, 0x0006, 0x0007, 0x0008, 0x0009,
    0x000a, 0x000b, 0x000d, 0x000e, 0x0010, 0x0012, 0x0014, 0x0017, 0x001a, 0x001d,
    0x0020, 0x0024, 0x0029, 0x002e, 0x0033, 0x003a, 0x0041, 0x0049, 0x0052, 0x005c,
    0x0067, 0x0074, 0x0082, 0x0092, 0x00a4, 0x00b8, 0x00ce, 0x00e7, 0x0104, 0x0124,
    0x0147, 0x016f, 0x019c, 0x01ce, 0x0207, 0x0246, 0x028d, 0x02dd, 0x0337, 0x039b,
    0x040c, 0x048a, 0x0518, 0x05b7, 0x066a, 0x0732, 0x0813, 0x090f, 0x0a2a, 0x0b68,
    0x0ccc, 0x0e5c, 0x101d, 0x1214, 0x1449, 0x16c3, 0x198a, 0x1ca7, 0x2026, 0x2413,
    0x287a, 0x2d6a, 0x32f5, 0x392c, 0x4026, 0x47fa, 0x50c3, 0x5a9d, 0x65ac, 0x7214,
    0x7fff,
];

/// Maps an 8.8 dB volume code to its table index, clamped into range.
/// Code 0 (0 dB) lands on the last entry; -90 dB and below land on the
/// first.
pub fn volume_index(code_8q8: i16) -> usize {
    let max = (VOLUME_STEPS as i32 - 1) * 256;
    let shifted = (code_8q8 as i32 + max).clamp(0, max);
    (shifted >> 8) as usize
}

/// Q15 linear multiplier for an 8.8 dB volume code.
pub fn volume_multiplier(code_8q8: i16) -> i32 {
    DB_TO_VOL[volume_index(code_8q8)] as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_db_maps_to_full_scale() {
        assert_eq!(volume_index(0), VOLUME_STEPS - 1);
        assert_eq!(volume_multiplier(0), 0x7fff);
    }

    #[test]
    fn integer_decibel_codes_map_exactly() {
        assert_eq!(volume_index(-1 * 256), VOLUME_STEPS - 2);
        assert_eq!(volume_index(-20 * 256), 70);
        assert_eq!(volume_index(-90 * 256), 0);
        // A -20 dB code yields a -20 dB multiplier.
        let gain = volume_multiplier(-20 * 256) as f32 / 32768.0;
        let db = 20.0 * gain.log10();
        assert!((db + 20.0).abs() < 0.05, "mapped to {db} dB");
    }

    #[test]
    fn codes_clamp_at_both_ends() {
        assert_eq!(volume_index(i16::MIN), 0);
        assert_eq!(volume_index(MIN_VOLUME_8Q8), 0);
        assert_eq!(volume_index(i16::MAX), VOLUME_STEPS - 1);
    }

    #[test]
    fn table_is_monotonic() {
        for pair in DB_TO_VOL.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn each_step_is_about_one_decibel() {
        // Quantization makes the very quiet end coarse; check the upper half.
        for i in 50..VOLUME_STEPS - 1 {
            let ratio = DB_TO_VOL[i + 1] as f32 / DB_TO_VOL[i] as f32;
            let db = 20.0 * ratio.log10();
            assert!((db - 1.0).abs() < 0.1, "step {i}: {db} dB");
        }
    }
}
