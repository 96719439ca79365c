//! Explicit isochronous feedback: a 10.14 fixed-point samples-per-frame
//! estimate the host uses to adjust its packet cadence.
//!
//! The device tracks a drift epoch (microsecond timestamp plus sample
//! count). Once at least one second of audio has arrived, the difference
//! between samples received and samples expected from the wall clock feeds
//! a clamped proportional correction. Positive drift (host running fast)
//! asks for fewer samples.

/// Feedback is 10.14 fixed point on full-speed USB.
pub const FEEDBACK_SHIFT: u32 = 14;

/// Proportional gain, as a ratio. Hand-tuned: locks within a second on
/// common hosts without oscillating.
const GAIN_NUM: i64 = 50;
const GAIN_DEN: i64 = 1000;

/// Correction ceiling: half a sample per frame in 10.14 units.
const CORRECTION_CAP: i64 = 1 << (FEEDBACK_SHIFT - 1);

#[derive(Clone, Copy, Debug, Default)]
pub struct DriftTracker {
    started: bool,
    epoch_us: u64,
    samples_produced: u64,
    rate_hz: u32,
}

impl DriftTracker {
    pub const fn new(rate_hz: u32) -> Self {
        DriftTracker {
            started: false,
            epoch_us: 0,
            samples_produced: 0,
            rate_hz,
        }
    }

    /// Clears the epoch; the next packet re-anchors it. Called on stream
    /// gaps and rate changes.
    pub fn reset(&mut self) {
        self.started = false;
        self.samples_produced = 0;
        self.epoch_us = 0;
    }

    pub fn set_rate(&mut self, rate_hz: u32) {
        self.rate_hz = rate_hz;
        self.reset();
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    /// Accounts for one received packet. The first packet after a reset
    /// establishes the epoch.
    pub fn on_packet(&mut self, now_us: u64, sample_count: u32) {
        if !self.started {
            self.epoch_us = now_us;
            self.samples_produced = 0;
            self.started = true;
        }
        self.samples_produced += sample_count as u64;
    }

    /// Samples the host is ahead of (positive) or behind (negative) the
    /// device clock. Only meaningful after [`Self::is_locked`].
    pub fn drift_samples(&self, now_us: u64) -> i32 {
        let elapsed_us = now_us.saturating_sub(self.epoch_us);
        let expected = elapsed_us * self.rate_hz as u64 / 1_000_000;
        self.samples_produced.wrapping_sub(expected) as i64 as i32
    }

    /// The drift estimate is valid once a full second of audio has been
    /// accounted against the epoch.
    pub fn is_locked(&self) -> bool {
        self.started && self.samples_produced > self.rate_hz as u64
    }

    /// The 10.14 samples-per-frame value to transmit right now.
    pub fn feedback_value(&self, now_us: u64) -> u32 {
        let nominal = ((self.rate_hz as u64) << FEEDBACK_SHIFT) / 1000;
        if !self.is_locked() {
            return nominal as u32;
        }

        let drift = self.drift_samples(now_us) as i64;
        let correction = (drift * GAIN_NUM / GAIN_DEN).clamp(-CORRECTION_CAP, CORRECTION_CAP);

        (nominal as i64 - correction) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const US_PER_SEC: u64 = 1_000_000;

    #[test]
    fn nominal_values_match_the_rate_list() {
        assert_eq!(DriftTracker::new(44_100).feedback_value(0), 722_534);
        assert_eq!(DriftTracker::new(48_000).feedback_value(0), 786_432);
        assert_eq!(DriftTracker::new(96_000).feedback_value(0), 1_572_864);
    }

    #[test]
    fn feedback_stays_nominal_until_a_second_of_audio() {
        let mut tracker = DriftTracker::new(48_000);
        let mut now = 0;
        // Half a second of packets, each 1 ms / 48 samples, host slightly fast.
        for _ in 0..500 {
            tracker.on_packet(now, 49);
            now += 1000;
        }
        assert!(!tracker.is_locked());
        assert_eq!(tracker.feedback_value(now), 786_432);
    }

    #[test]
    fn fast_host_is_asked_for_fewer_samples() {
        let mut tracker = DriftTracker::new(48_000);
        let mut now = 0;
        // Two seconds of packets delivering 1 extra sample each millisecond.
        for _ in 0..2000 {
            tracker.on_packet(now, 49);
            now += 1000;
        }
        assert!(tracker.is_locked());
        assert!(tracker.drift_samples(now) > 1900);
        let feedback = tracker.feedback_value(now);
        assert!(feedback < 786_432);
        // The correction never exceeds half a sample per frame.
        assert!(feedback >= 786_432 - (1 << 13));
    }

    #[test]
    fn slow_host_is_asked_for_more_samples() {
        let mut tracker = DriftTracker::new(48_000);
        let mut now = 0;
        for _ in 0..2000 {
            tracker.on_packet(now, 47);
            now += 1000;
        }
        let feedback = tracker.feedback_value(now);
        assert!(feedback > 786_432);
        assert!(feedback <= 786_432 + (1 << 13));
    }

    #[test]
    fn on_time_host_converges_to_nominal() {
        let mut tracker = DriftTracker::new(44_100);
        let mut now = 0;
        // 44.1 kHz alternates 44- and 45-sample packets; 10 ms of packets
        // carries exactly 441 samples.
        for i in 0..3000u64 {
            let n = if i % 10 == 9 { 45 } else { 44 };
            tracker.on_packet(now, n);
            now += 1000;
        }
        let feedback = tracker.feedback_value(now);
        let nominal = 722_534;
        assert!(
            (feedback as i64 - nominal).abs() <= 2,
            "feedback {feedback} vs nominal {nominal}"
        );
    }

    #[test]
    fn reset_reanchors_the_epoch() {
        let mut tracker = DriftTracker::new(48_000);
        tracker.on_packet(0, 48_001 * 2);
        assert!(tracker.is_locked());

        tracker.reset();
        assert!(!tracker.is_locked());

        // Epoch restarts at the next packet, far in the future.
        tracker.on_packet(10 * US_PER_SEC, 48);
        assert_eq!(tracker.drift_samples(10 * US_PER_SEC), 48);
    }

    #[test]
    fn rate_change_resets_and_retargets() {
        let mut tracker = DriftTracker::new(48_000);
        tracker.on_packet(0, 100_000);
        tracker.set_rate(44_100);
        assert!(!tracker.is_locked());
        assert_eq!(tracker.feedback_value(0), 722_534);
    }
}
