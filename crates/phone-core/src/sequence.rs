use tracing::{debug, warn};

use crate::envelope::EventEnvelope;

/// Absolute sequence drop beyond which a regression is treated as a reboot
/// even when the new value is not small relative to the prior maximum.
const REBOOT_DROP_THRESHOLD: u64 = 100;

/// Outcome of admitting one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Sequence advanced; process the envelope.
    Accepted,
    /// Duplicate or stale envelope; drop it, bookkeeping only.
    Stale,
    /// Sequence regressed far enough to infer a device reboot. The envelope
    /// itself is processed after reboot handling.
    RebootDetected,
}

/// Sequence bookkeeping for one device connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SequenceTracker {
    /// Highest (or post-reboot reset) sequence number seen this epoch.
    pub last_seq: u64,
    /// Whether a reboot was inferred this epoch.
    pub reboot_detected: bool,
    /// Receiver wall-clock time of the last inferred reboot.
    pub last_reboot_ts: Option<f64>,
}

/// Validates monotonicity of incoming event sequence numbers and flags
/// reboots.
///
/// A regression to at most half the prior maximum, or an absolute drop of
/// more than [`REBOOT_DROP_THRESHOLD`], reads as a device reboot; any other
/// non-advancing sequence is a stale duplicate.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    tracker: SequenceTracker,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    /// Reset tracking for a fresh connection epoch (deliberate reconnect).
    ///
    /// The device restarts its sequence per connection, so the first frame of
    /// a new epoch must not read as a reboot.
    pub fn reset_epoch(&mut self) {
        debug!(last_seq = self.tracker.last_seq, "resetting sequence tracking");
        self.tracker.last_seq = 0;
        self.tracker.reboot_detected = false;
    }

    /// Record a sequence number observed out-of-band (polled snapshot).
    pub fn observe_polled_seq(&mut self, seq: u64) {
        if seq > self.tracker.last_seq {
            self.tracker.last_seq = seq;
        }
    }

    /// Admit one envelope, updating `last_seq` unconditionally for every
    /// admitted (accepted or reboot-flagged) envelope.
    pub fn admit(&mut self, envelope: &EventEnvelope) -> Admission {
        let seq = envelope.seq;
        let last = self.tracker.last_seq;

        if last == 0 || seq > last {
            self.tracker.last_seq = seq;
            return Admission::Accepted;
        }

        if seq == last {
            debug!(seq, "duplicate event sequence; dropping");
            return Admission::Stale;
        }

        let drop = last - seq;
        if seq.saturating_mul(2) <= last || drop > REBOOT_DROP_THRESHOLD {
            warn!(
                from = last,
                to = seq,
                drop,
                "sequence regression; inferring device reboot"
            );
            self.tracker.last_seq = seq;
            self.tracker.reboot_detected = true;
            self.tracker.last_reboot_ts = Some(envelope.received_at);
            return Admission::RebootDetected;
        }

        debug!(from = last, to = seq, "minor sequence regression; dropping as stale");
        Admission::Stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(seq: u64) -> EventEnvelope {
        serde_json::from_value(serde_json::json!({
            "schemaVersion": 3,
            "seq": seq,
            "ts": 0,
            "category": "system",
            "event": "status",
        }))
        .expect("envelope must parse")
    }

    #[test]
    fn accepts_monotonically_increasing_sequences() {
        let mut guard = SequenceGuard::new();
        for seq in 1..=5 {
            assert_eq!(guard.admit(&envelope(seq)), Admission::Accepted);
        }
        assert_eq!(guard.tracker().last_seq, 5);
        assert!(!guard.tracker().reboot_detected);
    }

    #[test]
    fn drops_duplicate_as_stale_without_state_change() {
        let mut guard = SequenceGuard::new();
        guard.admit(&envelope(7));
        assert_eq!(guard.admit(&envelope(7)), Admission::Stale);
        assert_eq!(guard.tracker().last_seq, 7);
        assert!(!guard.tracker().reboot_detected);
    }

    #[test]
    fn minor_regression_is_stale() {
        let mut guard = SequenceGuard::new();
        guard.admit(&envelope(10));
        assert_eq!(guard.admit(&envelope(8)), Admission::Stale);
        assert_eq!(guard.tracker().last_seq, 10);
    }

    #[test]
    fn deep_regression_reads_as_reboot_and_resets_last_seq() {
        let mut guard = SequenceGuard::new();
        guard.admit(&envelope(1000));
        assert_eq!(guard.admit(&envelope(3)), Admission::RebootDetected);
        assert_eq!(guard.tracker().last_seq, 3);
        assert!(guard.tracker().reboot_detected);
    }

    #[test]
    fn large_absolute_drop_reads_as_reboot() {
        let mut guard = SequenceGuard::new();
        guard.admit(&envelope(100_000));
        assert_eq!(guard.admit(&envelope(99_000)), Admission::RebootDetected);
        assert_eq!(guard.tracker().last_seq, 99_000);
    }

    #[test]
    fn reference_scenario_one_two_three_one_four() {
        let mut guard = SequenceGuard::new();
        let mut reboots = 0;
        for seq in [1u64, 2, 3, 1, 4] {
            if guard.admit(&envelope(seq)) == Admission::RebootDetected {
                reboots += 1;
            }
        }
        assert_eq!(reboots, 1, "exactly one reboot detection");
        assert_eq!(guard.tracker().last_seq, 4);
    }

    #[test]
    fn epoch_reset_accepts_fresh_low_sequence() {
        let mut guard = SequenceGuard::new();
        guard.admit(&envelope(500));
        guard.reset_epoch();
        assert_eq!(guard.admit(&envelope(1)), Admission::Accepted);
        assert!(!guard.tracker().reboot_detected);
    }

    #[test]
    fn polled_seq_only_advances() {
        let mut guard = SequenceGuard::new();
        guard.admit(&envelope(50));
        guard.observe_polled_seq(40);
        assert_eq!(guard.tracker().last_seq, 50);
        guard.observe_polled_seq(60);
        assert_eq!(guard.tracker().last_seq, 60);
    }
}
