//! The persisted parameter set and its flash record framing.
//!
//! A single flash sector holds one versioned record: magic, version,
//! CRC-32 over the parameter block, then the block itself. Any
//! verification failure on load means "no saved state" and the device
//! boots with factory defaults. Recipes persist; compiled biquads never
//! do — they are recomputed from the recipes at the current sample rate.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::crossfeed::{CrossfeedConfig, CrossfeedPreset};
use crate::filter::{EqRecipe, FilterKind};
use crate::loudness::LoudnessConfig;
use crate::{CH_OUT_LEFT, CH_OUT_RIGHT, CH_OUT_SUB, MAX_BANDS, NUM_CHANNELS, OUTPUT_CHANNEL_COUNT};

/// "DSP1".
pub const MAGIC: u32 = 0x4453_5031;
pub const VERSION: u16 = 1;

const HEADER_LEN: usize = 12;
const RECIPE_LEN: usize = 16;
const PAYLOAD_LEN: usize =
    NUM_CHANNELS * MAX_BANDS * RECIPE_LEN + 4 + 4 + NUM_CHANNELS * 4 + OUTPUT_CHANNEL_COUNT * 4 + 4 + 12 + 12;

/// Total encoded record size.
pub const RECORD_LEN: usize = HEADER_LEN + PAYLOAD_LEN;

/// Maximum per-channel delay accepted at the intake boundary. The 8192
/// sample ring holds just over 85 ms at 96 kHz.
pub const DELAY_MAX_MS: f32 = 85.0;

// Gain ceilings keep the Q28 multipliers representable (+12 dB is 4.0).
pub const PREAMP_MIN_DB: f32 = -60.0;
pub const PREAMP_MAX_DB: f32 = 12.0;
pub const CHANNEL_GAIN_MIN_DB: f32 = -60.0;
pub const CHANNEL_GAIN_MAX_DB: f32 = 12.0;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoadError {
    Truncated,
    BadMagic,
    BadVersion,
    BadCrc,
}

/// Everything the user can configure, in design units (dB, ms, Hz).
#[derive(Clone, PartialEq, Debug)]
pub struct Params {
    pub recipes: [[EqRecipe; MAX_BANDS]; NUM_CHANNELS],
    pub preamp_db: f32,
    pub bypass_master_eq: bool,
    pub delays_ms: [f32; NUM_CHANNELS],
    /// Linear output trims for OutL / OutR / Sub.
    pub gains_db: [f32; OUTPUT_CHANNEL_COUNT],
    pub mutes: [bool; OUTPUT_CHANNEL_COUNT],
    pub crossfeed: CrossfeedConfig,
    pub loudness: LoudnessConfig,
}

impl Default for Params {
    fn default() -> Self {
        Self::factory()
    }
}

impl Params {
    /// The factory default parameter set: flat master EQ plus an 80 Hz 2.1
    /// crossover on the output channels. `const` so statics can start from
    /// it before the flash record has been consulted.
    pub const fn factory() -> Self {
        let mut recipes = [[EqRecipe::FLAT; MAX_BANDS]; NUM_CHANNELS];

        let highpass = EqRecipe {
            kind: FilterKind::HighPass,
            freq_hz: 80.0,
            q: 0.707,
            gain_db: 0.0,
        };
        let lowpass = EqRecipe {
            kind: FilterKind::LowPass,
            freq_hz: 80.0,
            q: 0.707,
            gain_db: 0.0,
        };
        recipes[CH_OUT_LEFT][0] = highpass;
        recipes[CH_OUT_RIGHT][0] = highpass;
        recipes[CH_OUT_SUB][0] = lowpass;

        Params {
            recipes,
            preamp_db: 0.0,
            bypass_master_eq: false,
            delays_ms: [0.0; NUM_CHANNELS],
            gains_db: [0.0; OUTPUT_CHANNEL_COUNT],
            mutes: [false; OUTPUT_CHANNEL_COUNT],
            crossfeed: CrossfeedConfig::FACTORY,
            loudness: LoudnessConfig::FACTORY,
        }
    }

    /// Clamps every field into its valid range. Applied at every intake
    /// boundary (USB control requests and flash load), so the audio loop
    /// never sees an invalid value.
    pub fn sanitize(&mut self) {
        for channel in &mut self.recipes {
            for recipe in channel {
                recipe.sanitize();
            }
        }
        if !self.preamp_db.is_finite() {
            self.preamp_db = 0.0;
        }
        self.preamp_db = self.preamp_db.clamp(PREAMP_MIN_DB, PREAMP_MAX_DB);
        for delay in &mut self.delays_ms {
            if !delay.is_finite() {
                *delay = 0.0;
            }
            *delay = delay.clamp(0.0, DELAY_MAX_MS);
        }
        for gain in &mut self.gains_db {
            if !gain.is_finite() {
                *gain = 0.0;
            }
            *gain = gain.clamp(CHANNEL_GAIN_MIN_DB, CHANNEL_GAIN_MAX_DB);
        }
        self.crossfeed.sanitize();
        self.loudness.sanitize();
    }

    /// Serializes the record. `out` must hold [`RECORD_LEN`] bytes; returns
    /// the number written.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        let mut w = Writer { buf: out, at: 0 };

        w.put_u32(MAGIC);
        w.put_u16(VERSION);
        w.put_u16(0);
        let crc_at = w.at;
        w.put_u32(0);

        let payload_at = w.at;
        for (ch, channel) in self.recipes.iter().enumerate() {
            for (band, recipe) in channel.iter().enumerate() {
                w.put_u8(ch as u8);
                w.put_u8(band as u8);
                w.put_u8(recipe.kind as u8);
                w.put_u8(0);
                w.put_f32(recipe.freq_hz);
                w.put_f32(recipe.q);
                w.put_f32(recipe.gain_db);
            }
        }
        w.put_f32(self.preamp_db);
        w.put_u8(self.bypass_master_eq as u8);
        w.pad(3);
        for &delay in &self.delays_ms {
            w.put_f32(delay);
        }
        for &gain in &self.gains_db {
            w.put_f32(gain);
        }
        for &mute in &self.mutes {
            w.put_u8(mute as u8);
        }
        w.pad(1);
        w.put_u8(self.crossfeed.enabled as u8);
        w.put_u8(self.crossfeed.itd_enabled as u8);
        w.put_u8(self.crossfeed.preset as u8);
        w.pad(1);
        w.put_f32(self.crossfeed.custom_fc_hz);
        w.put_f32(self.crossfeed.custom_feed_db);
        w.put_u8(self.loudness.enabled as u8);
        w.pad(3);
        w.put_f32(self.loudness.ref_spl);
        w.put_f32(self.loudness.intensity_pct);

        let len = w.at;
        let crc = CRC32.checksum(&out[payload_at..len]);
        out[crc_at..crc_at + 4].copy_from_slice(&crc.to_le_bytes());
        len
    }

    /// Parses and verifies a record. The decoded parameters are sanitized,
    /// so a record written by a newer build with wider ranges still loads
    /// safely.
    pub fn decode(bytes: &[u8]) -> Result<Params, LoadError> {
        if bytes.len() < RECORD_LEN {
            return Err(LoadError::Truncated);
        }

        let mut r = Reader { buf: bytes, at: 0 };
        if r.get_u32() != MAGIC {
            return Err(LoadError::BadMagic);
        }
        if r.get_u16() > VERSION {
            return Err(LoadError::BadVersion);
        }
        let _reserved = r.get_u16();
        let stored_crc = r.get_u32();

        let payload = &bytes[HEADER_LEN..RECORD_LEN];
        if CRC32.checksum(payload) != stored_crc {
            return Err(LoadError::BadCrc);
        }

        let mut params = Params::default();
        for ch in 0..NUM_CHANNELS {
            for band in 0..MAX_BANDS {
                let _ch = r.get_u8();
                let _band = r.get_u8();
                let kind = FilterKind::from_u8(r.get_u8());
                let _reserved = r.get_u8();
                let freq_hz = r.get_f32();
                let q = r.get_f32();
                let gain_db = r.get_f32();
                params.recipes[ch][band] = EqRecipe {
                    kind,
                    freq_hz,
                    q,
                    gain_db,
                };
            }
        }
        params.preamp_db = r.get_f32();
        params.bypass_master_eq = r.get_u8() != 0;
        r.skip(3);
        for delay in &mut params.delays_ms {
            *delay = r.get_f32();
        }
        for gain in &mut params.gains_db {
            *gain = r.get_f32();
        }
        for mute in &mut params.mutes {
            *mute = r.get_u8() != 0;
        }
        r.skip(1);
        params.crossfeed.enabled = r.get_u8() != 0;
        params.crossfeed.itd_enabled = r.get_u8() != 0;
        params.crossfeed.preset = CrossfeedPreset::from_u8(r.get_u8());
        r.skip(1);
        params.crossfeed.custom_fc_hz = r.get_f32();
        params.crossfeed.custom_feed_db = r.get_f32();
        params.loudness.enabled = r.get_u8() != 0;
        r.skip(3);
        params.loudness.ref_spl = r.get_f32();
        params.loudness.intensity_pct = r.get_f32();

        params.sanitize();
        Ok(params)
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl Writer<'_> {
    fn put_u8(&mut self, v: u8) {
        self.buf[self.at] = v;
        self.at += 1;
    }

    fn put_u16(&mut self, v: u16) {
        self.buf[self.at..self.at + 2].copy_from_slice(&v.to_le_bytes());
        self.at += 2;
    }

    fn put_u32(&mut self, v: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }

    fn put_f32(&mut self, v: f32) {
        self.put_u32(v.to_bits());
    }

    fn pad(&mut self, count: usize) {
        for _ in 0..count {
            self.put_u8(0);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn get_u8(&mut self) -> u8 {
        let v = self.buf[self.at];
        self.at += 1;
        v
    }

    fn get_u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.at..self.at + 2].try_into().unwrap());
        self.at += 2;
        v
    }

    fn get_u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.at..self.at + 4].try_into().unwrap());
        self.at += 4;
        v
    }

    fn get_f32(&mut self) -> f32 {
        f32::from_bits(self.get_u32())
    }

    fn skip(&mut self, count: usize) {
        self.at += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CH_MASTER_LEFT;

    fn custom_params() -> Params {
        let mut params = Params::default();
        params.recipes[0][3] = EqRecipe {
            kind: FilterKind::Peaking,
            freq_hz: 2500.0,
            q: 2.0,
            gain_db: -4.5,
        };
        params.preamp_db = -6.0;
        params.bypass_master_eq = true;
        params.delays_ms[CH_OUT_SUB] = 12.5;
        params.gains_db = [-1.0, -1.0, 3.0];
        params.mutes = [false, true, false];
        params.crossfeed.enabled = true;
        params.crossfeed.preset = CrossfeedPreset::Meier;
        params.loudness.enabled = true;
        params.loudness.ref_spl = 77.0;
        params
    }

    #[test]
    fn record_round_trips_byte_identical() {
        let params = custom_params();
        let mut first = [0u8; RECORD_LEN];
        let written = params.encode(&mut first);
        assert_eq!(written, RECORD_LEN);

        let decoded = Params::decode(&first).unwrap();
        assert_eq!(decoded, params);

        // Re-encoding the decoded set reproduces the record exactly.
        let mut second = [0u8; RECORD_LEN];
        decoded.encode(&mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn corrupted_payload_fails_the_crc() {
        let mut record = [0u8; RECORD_LEN];
        custom_params().encode(&mut record);
        record[HEADER_LEN + 100] ^= 0x01;
        assert_eq!(Params::decode(&record), Err(LoadError::BadCrc));
    }

    #[test]
    fn wrong_magic_and_version_are_rejected() {
        let mut record = [0u8; RECORD_LEN];
        custom_params().encode(&mut record);

        let mut bad_magic = record;
        bad_magic[0] ^= 0xFF;
        assert_eq!(Params::decode(&bad_magic), Err(LoadError::BadMagic));

        let mut future_version = record;
        future_version[4] = 0xFF;
        assert_eq!(Params::decode(&future_version), Err(LoadError::BadVersion));

        assert_eq!(Params::decode(&record[..10]), Err(LoadError::Truncated));
    }

    #[test]
    fn erased_flash_reads_as_no_data() {
        let blank = [0xFFu8; RECORD_LEN];
        assert_eq!(Params::decode(&blank), Err(LoadError::BadMagic));
    }

    #[test]
    fn decoded_parameters_are_sanitized() {
        let mut params = custom_params();
        params.preamp_db = 100.0;
        params.delays_ms[CH_OUT_LEFT] = 1.0e6;

        let mut record = [0u8; RECORD_LEN];
        params.encode(&mut record);
        let decoded = Params::decode(&record).unwrap();
        assert_eq!(decoded.preamp_db, PREAMP_MAX_DB);
        assert_eq!(decoded.delays_ms[CH_OUT_LEFT], DELAY_MAX_MS);
    }

    #[test]
    fn defaults_ship_the_two_way_crossover() {
        let params = Params::default();
        assert_eq!(params.recipes[CH_OUT_LEFT][0].kind, FilterKind::HighPass);
        assert_eq!(params.recipes[CH_OUT_SUB][0].kind, FilterKind::LowPass);
        assert_eq!(params.recipes[CH_MASTER_LEFT][0].kind, FilterKind::Flat);
    }
}
