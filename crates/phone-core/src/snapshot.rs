use serde::{Deserialize, Serialize};

use crate::types::{
    AppState, AudioConfig, BlockedNumberEntry, DeviceStats, DndConfig, PhoneState, QuickDialEntry,
    WebhookEntry,
};

/// Serializable projection of derived state for restart recovery.
///
/// Written on a debounce interval and on clean shutdown; read once at
/// startup to seed state before the first live event arrives, after which it
/// is overwritten. Call history is deliberately excluded — it is exported
/// and persisted separately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub device_id: String,
    pub app_state: AppState,
    pub dnd_active: bool,
    pub maintenance_mode: bool,
    pub ring_pattern: String,
    pub default_dialing_code: String,
    pub audio: AudioConfig,
    pub dnd: DndConfig,
    pub stats: DeviceStats,
    pub quick_dials: Vec<QuickDialEntry>,
    pub blocked_numbers: Vec<BlockedNumberEntry>,
    pub webhooks: Vec<WebhookEntry>,
    pub last_seq: u64,
    /// Receiver wall-clock time (seconds since Unix epoch) of the write.
    pub saved_at: f64,
}

impl Snapshot {
    /// Project the current derived state into a snapshot.
    pub fn capture(device_id: &str, state: &PhoneState, saved_at: f64) -> Self {
        Self {
            device_id: device_id.to_owned(),
            app_state: state.app_state,
            dnd_active: state.dnd_active,
            maintenance_mode: state.maintenance_mode,
            ring_pattern: state.ring_pattern.clone(),
            default_dialing_code: state.default_dialing_code.clone(),
            audio: state.audio.clone(),
            dnd: state.dnd.clone(),
            stats: state.stats.clone(),
            quick_dials: state.quick_dials.clone(),
            blocked_numbers: state.blocked_numbers.clone(),
            webhooks: state.webhooks.clone(),
            last_seq: state.last_seq,
            saved_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::CallMachine;

    #[test]
    fn capture_excludes_transient_call_state() {
        let mut state = PhoneState::default();
        state.ring_pattern = "300,300x2".to_owned();
        state.last_seq = 77;
        state.current_call_number = Some("should-not-survive".to_owned());

        let snapshot = Snapshot::capture("device-1", &state, 123.0);
        assert_eq!(snapshot.device_id, "device-1");
        assert_eq!(snapshot.ring_pattern, "300,300x2");
        assert_eq!(snapshot.last_seq, 77);
        assert_eq!(snapshot.saved_at, 123.0);

        let json = serde_json::to_string(&snapshot).expect("snapshot serializes");
        assert!(!json.contains("should-not-survive"));
    }

    #[test]
    fn serde_roundtrip_preserves_snapshot() {
        let snapshot = Snapshot::capture("device-2", &PhoneState::default(), 1.5);
        let json = serde_json::to_string(&snapshot).expect("serialize");
        let restored: Snapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn machine_restore_seeds_config_but_not_call_state() {
        let mut state = PhoneState::default();
        state.dnd_active = true;
        state.audio.speaker_volume = 7;
        state.last_seq = 12;
        let snapshot = Snapshot::capture("device-3", &state, 9.0);

        let mut machine = CallMachine::new();
        machine.restore(&snapshot);
        assert!(machine.state().dnd_active);
        assert_eq!(machine.state().audio.speaker_volume, 7);
        assert_eq!(machine.state().last_seq, 12);
        assert!(!machine.call_open());
        assert_eq!(machine.state().current_call_number, None);
    }
}
