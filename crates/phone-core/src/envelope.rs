use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::types::AppState;

/// Event schema version this client was built against.
pub const EVENT_SCHEMA_VERSION: u32 = 3;

/// One wire message from the device event stream.
///
/// Field names are bit-exact with the firmware JSON; payload fields specific
/// to a `(category, event)` pair travel flattened alongside the header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub schema_version: u32,
    /// Monotonic per device boot.
    pub seq: u64,
    /// Device timestamp.
    pub ts: i64,
    #[serde(default)]
    pub integration: String,
    pub category: String,
    pub event: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    /// Receiver wall-clock arrival time (seconds since Unix epoch). Not part
    /// of the wire format; stamped by the transport on receipt.
    #[serde(skip)]
    pub received_at: f64,
}

impl EventEnvelope {
    fn str_field(&self, key: &str) -> Option<String> {
        match self.payload.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    fn i64_field(&self, key: &str) -> Option<i64> {
        match self.payload.get(key) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn u64_field(&self, key: &str) -> Option<u64> {
        self.i64_field(key).and_then(|v| u64::try_from(v).ok())
    }

    /// Normalize firmware boolean-ish payload values (`true`, `1`, `"on"`...).
    fn bool_field(&self, key: &str) -> Option<bool> {
        match self.payload.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_f64().is_some_and(|v| v != 0.0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" | "y" => Some(true),
                "false" | "0" | "no" | "off" | "n" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Typed state delta produced from one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Call(CallDelta),
    PhoneState(PhoneStateDelta),
    System(SystemDelta),
    Config(ConfigChange),
    Diagnostic(Value),
    /// Unrecognized `(category, event)` pair. Logged once, never fatal.
    Unknown,
}

/// Call lifecycle deltas.
#[derive(Debug, Clone, PartialEq)]
pub enum CallDelta {
    Start {
        number: String,
        is_incoming: bool,
        call_start_ts: i64,
    },
    End {
        number: Option<String>,
        is_incoming: Option<bool>,
        call_start_ts: Option<i64>,
        duration_ms: Option<u64>,
    },
    Blocked {
        number: String,
    },
}

/// Phone state deltas.
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneStateDelta {
    State {
        state: Option<AppState>,
        previous_state: Option<AppState>,
        current_call_number: Option<String>,
        current_dialing_number: Option<String>,
        is_incoming_call: Option<bool>,
        is_ringing: Option<bool>,
        dnd_active: Option<bool>,
        maintenance_mode: Option<bool>,
        call_waiting_available: Option<bool>,
    },
    Dialing {
        number: String,
    },
    Ring {
        is_ringing: bool,
    },
    Dnd {
        active: bool,
    },
}

/// System deltas.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemDelta {
    Stats {
        calls_total: Option<u64>,
        calls_incoming: Option<u64>,
        calls_outgoing: Option<u64>,
        calls_blocked: Option<u64>,
        talk_time_seconds: Option<u64>,
    },
    Status {
        free_heap_bytes: Option<u64>,
        rssi_dbm: Option<i64>,
        uptime_seconds: Option<u64>,
    },
    Error {
        error: String,
    },
    Shutdown {
        reason: String,
    },
}

/// One device config key change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    pub key: String,
    pub new_value: Value,
    pub old_value: Option<Value>,
}

/// Translates raw envelopes into typed deltas.
///
/// Unrecognized pairs and schema drift degrade to logging; translation never
/// fails the pipeline. Warn-once bookkeeping is per connection epoch for the
/// schema version and per distinct value for everything else.
#[derive(Debug, Default)]
pub struct EventTranslator {
    schema_warned: bool,
    unknown_pairs: HashSet<(String, String)>,
    invalid_app_states: HashSet<String>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-epoch bookkeeping after a reconnect.
    pub fn reset_epoch(&mut self) {
        self.schema_warned = false;
    }

    /// Translate one envelope into a typed delta.
    pub fn translate(&mut self, envelope: &EventEnvelope) -> Delta {
        if envelope.schema_version != EVENT_SCHEMA_VERSION && !self.schema_warned {
            self.schema_warned = true;
            warn!(
                expected = EVENT_SCHEMA_VERSION,
                got = envelope.schema_version,
                "event schema version mismatch; continuing with best-effort parse"
            );
        }

        match (envelope.category.as_str(), envelope.event.as_str()) {
            ("call", "start") => Delta::Call(CallDelta::Start {
                number: envelope.str_field("number").unwrap_or_default(),
                is_incoming: envelope.bool_field("isIncoming").unwrap_or(false),
                call_start_ts: envelope.i64_field("callStartTs").unwrap_or(envelope.ts),
            }),
            ("call", "end") => Delta::Call(CallDelta::End {
                number: envelope.str_field("number"),
                is_incoming: envelope.bool_field("isIncoming"),
                call_start_ts: envelope.i64_field("callStartTs"),
                duration_ms: envelope.u64_field("durationMs"),
            }),
            ("call", "blocked") => Delta::Call(CallDelta::Blocked {
                number: envelope.str_field("number").unwrap_or_default(),
            }),
            ("phone_state", "state") => Delta::PhoneState(PhoneStateDelta::State {
                state: self.app_state_field(envelope, "state", "stateName"),
                previous_state: self.app_state_field(
                    envelope,
                    "previousState",
                    "previousStateName",
                ),
                current_call_number: envelope.str_field("currentCallNumber"),
                current_dialing_number: envelope.str_field("currentDialingNumber"),
                is_incoming_call: envelope.bool_field("isIncomingCall"),
                is_ringing: envelope.bool_field("isRinging"),
                dnd_active: envelope.bool_field("dndActive"),
                maintenance_mode: envelope.bool_field("isMaintenanceMode"),
                call_waiting_available: envelope.bool_field("callWaitingAvailable"),
            }),
            ("phone_state", "dialing") => Delta::PhoneState(PhoneStateDelta::Dialing {
                number: envelope.str_field("currentDialingNumber").unwrap_or_default(),
            }),
            ("phone_state", "ring") => match envelope.bool_field("isRinging") {
                Some(is_ringing) => Delta::PhoneState(PhoneStateDelta::Ring { is_ringing }),
                None => self.unknown(envelope),
            },
            ("phone_state", "dnd") => match envelope.bool_field("dndActive") {
                Some(active) => Delta::PhoneState(PhoneStateDelta::Dnd { active }),
                None => self.unknown(envelope),
            },
            ("system", "stats") => Delta::System(SystemDelta::Stats {
                calls_total: envelope.u64_field("callsTotal"),
                calls_incoming: envelope.u64_field("callsIncoming"),
                calls_outgoing: envelope.u64_field("callsOutgoing"),
                calls_blocked: envelope.u64_field("callsBlocked"),
                talk_time_seconds: envelope.u64_field("talkTimeSeconds"),
            }),
            ("system", "status") => Delta::System(SystemDelta::Status {
                free_heap_bytes: envelope.u64_field("freeHeap"),
                rssi_dbm: envelope.i64_field("rssi"),
                uptime_seconds: envelope.u64_field("uptime"),
            }),
            ("system", "error") => Delta::System(SystemDelta::Error {
                error: envelope.str_field("error").unwrap_or_default(),
            }),
            ("system", "shutdown") => Delta::System(SystemDelta::Shutdown {
                reason: envelope.str_field("reason").unwrap_or_default(),
            }),
            ("config", "config_delta") => match envelope.str_field("key") {
                Some(key) => Delta::Config(ConfigChange {
                    key,
                    new_value: envelope.payload.get("newValue").cloned().unwrap_or(Value::Null),
                    old_value: envelope.payload.get("oldValue").cloned(),
                }),
                None => self.unknown(envelope),
            },
            ("diagnostic", "snapshot") => {
                Delta::Diagnostic(Value::Object(envelope.payload.clone()))
            }
            _ => self.unknown(envelope),
        }
    }

    fn unknown(&mut self, envelope: &EventEnvelope) -> Delta {
        let pair = (envelope.category.clone(), envelope.event.clone());
        if self.unknown_pairs.insert(pair) {
            debug!(
                category = %envelope.category,
                event = %envelope.event,
                "unrecognized event pair; ignoring this and further occurrences"
            );
        }
        Delta::Unknown
    }

    fn app_state_field(
        &mut self,
        envelope: &EventEnvelope,
        value_key: &str,
        name_key: &str,
    ) -> Option<AppState> {
        if let Some(value) = envelope.i64_field(value_key) {
            match AppState::from_wire_value(value) {
                Some(state) => return Some(state),
                None => self.log_invalid_app_state(&value.to_string()),
            }
        }
        if let Some(name) = envelope.str_field(name_key) {
            match AppState::from_wire_name(&name) {
                Some(state) => return Some(state),
                None => self.log_invalid_app_state(&name),
            }
        }
        None
    }

    fn log_invalid_app_state(&mut self, raw: &str) {
        if self.invalid_app_states.insert(raw.to_owned()) {
            warn!(value = %raw, "device reported unknown app state value");
        }
    }
}
