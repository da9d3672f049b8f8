use serde::{Deserialize, Serialize};

/// Firmware application state as reported on the wire.
///
/// Values match the device firmware's state enum; unknown wire values are
/// rejected by [`AppState::from_wire_value`] rather than mapped to a default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppState {
    /// Device is booting.
    Startup,
    /// Hardware self-check in progress.
    CheckHardware,
    /// Line check in progress.
    CheckLine,
    /// Device is idle and ready.
    Idle,
    /// User dialed an invalid number.
    InvalidNumber,
    /// An incoming call is pending (pre-ring).
    IncomingCall,
    /// An incoming call is actively ringing.
    IncomingCallRing,
    /// A call is in progress.
    InCall,
    /// User is dialing an outgoing number.
    Dialing,
}

impl AppState {
    /// Parse a firmware state integer.
    pub fn from_wire_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Startup),
            1 => Some(Self::CheckHardware),
            2 => Some(Self::CheckLine),
            3 => Some(Self::Idle),
            4 => Some(Self::InvalidNumber),
            5 => Some(Self::IncomingCall),
            6 => Some(Self::IncomingCallRing),
            7 => Some(Self::InCall),
            8 => Some(Self::Dialing),
            _ => None,
        }
    }

    /// Parse a firmware state name (as sent in `stateName` fields).
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "startup" => Some(Self::Startup),
            "check_hardware" | "checkhardware" => Some(Self::CheckHardware),
            "check_line" | "checkline" => Some(Self::CheckLine),
            "idle" => Some(Self::Idle),
            "invalid_number" | "invalidnumber" => Some(Self::InvalidNumber),
            "incoming_call" | "incomingcall" => Some(Self::IncomingCall),
            "incoming_call_ring" | "incomingcallring" => Some(Self::IncomingCallRing),
            "in_call" | "incall" => Some(Self::InCall),
            "dialing" => Some(Self::Dialing),
            _ => None,
        }
    }
}

/// Connection lifecycle of the push event stream, owned by the supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and no connect attempt in flight.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Live event stream established.
    Connected,
    /// Push stream unavailable; periodic polling substitutes for it.
    Degraded,
}

/// Outcome classification of a finalized call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallKind {
    /// Incoming call that was answered.
    Incoming,
    /// Outgoing call.
    Outgoing,
    /// Incoming call rejected by the device's block list.
    Blocked,
    /// Incoming call that rang but was never answered.
    Missed,
}

/// A finalized call history entry. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    /// Device-reported timestamp of the call.
    pub ts_device: i64,
    /// Receiver wall-clock time (seconds since Unix epoch) when the
    /// originating event arrived.
    pub received_ts: f64,
    /// Sequence number of the originating event.
    pub seq: u64,
    /// Outcome classification.
    pub kind: CallKind,
    /// Remote party number; may be empty when the device never reported one.
    pub number: String,
    /// Call duration in seconds, when the call connected.
    pub duration_s: Option<u64>,
    /// Extra outcome detail, e.g. `unanswered` or a watchdog note.
    pub reason: Option<String>,
    /// True when the start side of the record was synthesized because the
    /// device never emitted a matching start event.
    pub synthetic: bool,
}

/// Device counters reported by `system/stats` and `system/status` events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStats {
    pub calls_total: u64,
    pub calls_incoming: u64,
    pub calls_outgoing: u64,
    pub calls_blocked: u64,
    pub talk_time_seconds: u64,
    pub uptime_seconds: u64,
    pub free_heap_bytes: u64,
    pub rssi_dbm: i64,
}

/// Audio levels. The firmware accepts levels in `1..=7`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioConfig {
    pub earpiece_volume: u8,
    pub earpiece_gain: u8,
    pub speaker_volume: u8,
    pub speaker_gain: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            earpiece_volume: 4,
            earpiece_gain: 4,
            speaker_volume: 4,
            speaker_gain: 4,
        }
    }
}

/// Do-not-disturb configuration mirrored from the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DndConfig {
    /// DND forced on regardless of schedule.
    pub force: bool,
    /// Scheduled DND window enabled.
    pub scheduled: bool,
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
}

impl Default for DndConfig {
    fn default() -> Self {
        Self {
            force: false,
            scheduled: false,
            start_hour: 22,
            start_minute: 0,
            end_hour: 7,
            end_minute: 0,
        }
    }
}

/// Quick dial entry mirrored from the device config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuickDialEntry {
    pub code: String,
    pub number: String,
    pub name: String,
}

/// Blocked number entry mirrored from the device config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedNumberEntry {
    pub number: String,
    pub reason: String,
}

/// Webhook action mapping mirrored from the device config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookEntry {
    pub code: String,
    pub webhook_id: String,
    pub action_name: String,
}

/// Derived aggregate state of the phone, owned by the call lifecycle machine.
///
/// Readers receive immutable clones of this struct; only the machine mutates
/// it. `current_call_number` is populated only while `app_state` is
/// [`AppState::InCall`], and `call_start_ts` only while a call is open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoneState {
    pub app_state: AppState,
    pub previous_app_state: AppState,
    pub ringing: bool,
    pub dnd_active: bool,
    pub maintenance_mode: bool,
    /// Remote party of the in-progress call.
    pub current_call_number: Option<String>,
    /// Direction of the open call, when one is open.
    pub current_call_is_incoming: bool,
    /// Digits dialed so far while in the dialing state.
    pub dialing_number: Option<String>,
    /// Device timestamp at which the open call started.
    pub call_start_ts: Option<i64>,
    /// Call waiting availability. Device-reported only; `None` means the
    /// firmware has not said either way.
    pub call_waiting_available: Option<bool>,
    pub stats: DeviceStats,
    pub audio: AudioConfig,
    pub dnd: DndConfig,
    /// Custom ring pattern string; empty means device default.
    pub ring_pattern: String,
    /// Default dialing code used for number normalization.
    pub default_dialing_code: String,
    pub quick_dials: Vec<QuickDialEntry>,
    pub blocked_numbers: Vec<BlockedNumberEntry>,
    pub webhooks: Vec<WebhookEntry>,
    /// Highest event sequence number applied to this state.
    pub last_seq: u64,
    /// Whether the push stream currently considers the device reachable.
    pub connected: bool,
}

impl Default for PhoneState {
    fn default() -> Self {
        Self {
            app_state: AppState::Startup,
            previous_app_state: AppState::Startup,
            ringing: false,
            dnd_active: false,
            maintenance_mode: false,
            current_call_number: None,
            current_call_is_incoming: false,
            dialing_number: None,
            call_start_ts: None,
            call_waiting_available: None,
            stats: DeviceStats::default(),
            audio: AudioConfig::default(),
            dnd: DndConfig::default(),
            ring_pattern: String::new(),
            default_dialing_code: String::new(),
            quick_dials: Vec::new(),
            blocked_numbers: Vec::new(),
            webhooks: Vec::new(),
            last_seq: 0,
            connected: false,
        }
    }
}

/// Partial do-not-disturb update. Only provided fields are sent to the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DndUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_hour: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_minute: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_hour: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_minute: Option<u8>,
}

/// Partial audio update. Only provided fields are sent to the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AudioUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earpiece_volume: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earpiece_gain: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_volume: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_gain: Option<u8>,
}

/// Ring command options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RingRequest {
    /// Ring pattern override; `None` uses the device default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Ring even while DND is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

/// Aggregate counters and recent raw envelopes exposed for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiagnosticsReport {
    pub connection: ConnectionState,
    pub last_seq: u64,
    pub reboot_detected: bool,
    pub events_accepted: u64,
    pub events_dropped: u64,
    pub unknown_events: u64,
    pub history_len: usize,
    pub recent_events: Vec<crate::envelope::EventEnvelope>,
}

/// Host-facing event stream emitted by the runtime and adapter layers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum ClientEvent {
    /// Push-stream connection lifecycle transition.
    ConnectionChanged { state: ConnectionState },
    /// Derived phone state changed; carries the full immutable snapshot.
    PhoneStateChanged { state: Box<PhoneState> },
    /// A call opened (incoming ring, outgoing dial, or direct start).
    CallStarted { number: String, is_incoming: bool },
    /// A call record was finalized (ended, missed, or blocked).
    CallFinalized { record: CallRecord },
    /// One-second duration tick for the open call.
    DurationTick { seconds: u64 },
    /// A device config key changed.
    ConfigApplied { key: String },
    /// Periodic system status report.
    SystemStatus {
        free_heap_bytes: u64,
        rssi_dbm: i64,
        uptime_seconds: u64,
    },
    /// Device-reported error event.
    SystemError { error: String },
    /// Device announced it is shutting down.
    DeviceShutdown { reason: String },
    /// Composite diagnostic snapshot pushed by the device.
    DiagnosticSnapshot { payload: serde_json::Value },
    /// A device reboot was inferred from a sequence regression.
    RebootDetected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_wire_state_values() {
        for value in 0..=8 {
            assert!(
                AppState::from_wire_value(value).is_some(),
                "state {value} must parse"
            );
        }
        assert_eq!(AppState::from_wire_value(9), None);
        assert_eq!(AppState::from_wire_value(-1), None);
    }

    #[test]
    fn parses_state_names_case_insensitively() {
        assert_eq!(
            AppState::from_wire_name("INCOMING_CALL_RING"),
            Some(AppState::IncomingCallRing)
        );
        assert_eq!(AppState::from_wire_name("idle"), Some(AppState::Idle));
        assert_eq!(AppState::from_wire_name("nonsense"), None);
    }

    #[test]
    fn partial_updates_serialize_only_provided_fields() {
        let update = DndUpdate {
            force: Some(true),
            ..DndUpdate::default()
        };
        let json = serde_json::to_value(&update).expect("serialize");
        assert_eq!(json, serde_json::json!({"force": true}));

        let audio = AudioUpdate {
            speaker_volume: Some(6),
            ..AudioUpdate::default()
        };
        let json = serde_json::to_value(&audio).expect("serialize");
        assert_eq!(json, serde_json::json!({"speakerVolume": 6}));
    }

    #[test]
    fn default_phone_state_has_no_open_call() {
        let state = PhoneState::default();
        assert_eq!(state.current_call_number, None);
        assert_eq!(state.call_start_ts, None);
        assert_eq!(state.call_waiting_available, None);
    }
}
