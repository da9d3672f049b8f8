use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::{CallDelta, ConfigChange, EventEnvelope, PhoneStateDelta, SystemDelta};
use crate::normalize::{numbers_equivalent, sanitize_dialing_code};
use crate::snapshot::Snapshot;
use crate::types::{
    AppState, AudioConfig, BlockedNumberEntry, CallKind, CallRecord, DndConfig, PhoneState,
    QuickDialEntry, WebhookEntry,
};

/// Force-finalize any call that stays open longer than this (seconds).
pub const CALL_WATCHDOG_SECS: f64 = 8.0 * 3600.0;

/// Window during which a blocked number is not also recorded as missed.
const RECENT_BLOCK_WINDOW_SECS: f64 = 30.0;

/// Derived call phase, distinct from the firmware-reported [`AppState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Ringing,
    Dialing,
    InCall,
}

/// Per-event context threaded through the machine.
#[derive(Debug, Clone, Copy)]
pub struct EventMeta {
    pub seq: u64,
    pub ts: i64,
    pub received_at: f64,
}

impl EventMeta {
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            seq: envelope.seq,
            ts: envelope.ts,
            received_at: envelope.received_at,
        }
    }
}

/// A call history entry opened at ring/dial/start time, not yet finalized.
#[derive(Debug, Clone)]
struct ProvisionalCall {
    kind: CallKind,
    number: String,
    ts_device: i64,
    received_ts: f64,
    seq: u64,
    call_start_ts: i64,
    /// Receiver arrival time of the in-call transition; basis for the
    /// duration fallback and the watchdog.
    started_received_ts: Option<f64>,
    synthetic: bool,
}

impl ProvisionalCall {
    fn open(kind: CallKind, number: String, meta: &EventMeta, synthetic: bool) -> Self {
        Self {
            kind,
            number,
            ts_device: meta.ts,
            received_ts: meta.received_at,
            seq: meta.seq,
            call_start_ts: meta.ts,
            started_received_ts: None,
            synthetic,
        }
    }

    fn finalize(self, kind: CallKind, duration_s: Option<u64>, reason: Option<String>) -> CallRecord {
        CallRecord {
            ts_device: self.ts_device,
            received_ts: self.received_ts,
            seq: self.seq,
            kind,
            number: self.number,
            duration_s,
            reason,
            synthetic: self.synthetic,
        }
    }
}

/// Owns the derived [`PhoneState`] and the single open provisional call,
/// translating typed deltas into state mutations and finalized
/// [`CallRecord`]s.
///
/// Exactly one of these exists per device; all mutation goes through it.
#[derive(Debug)]
pub struct CallMachine {
    state: PhoneState,
    phase: CallPhase,
    open_call: Option<ProvisionalCall>,
    recent_blocked: Vec<(String, f64)>,
}

impl Default for CallMachine {
    fn default() -> Self {
        Self {
            state: PhoneState::default(),
            phase: CallPhase::Idle,
            open_call: None,
            recent_blocked: Vec::new(),
        }
    }
}

impl CallMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current derived state. Readers clone; only the machine mutates.
    pub fn state(&self) -> &PhoneState {
        &self.state
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    /// True while a provisional call is open (drives the duration ticker).
    pub fn call_open(&self) -> bool {
        self.phase == CallPhase::InCall && self.open_call.is_some()
    }

    /// Seconds the open call has been connected, if one is connected.
    pub fn call_duration_seconds(&self, now_ts: f64) -> Option<u64> {
        let started = self.open_call.as_ref()?.started_received_ts?;
        Some((now_ts - started).max(0.0) as u64)
    }

    /// Mirror connectivity into the derived state. Returns true on change.
    pub fn set_connected(&mut self, connected: bool) -> bool {
        if self.state.connected == connected {
            return false;
        }
        self.state.connected = connected;
        true
    }

    /// Mirror the sequence tracker's position into the derived state.
    pub fn note_seq(&mut self, seq: u64) {
        self.state.last_seq = seq;
    }

    /// Apply a call delta, returning any finalized records.
    pub fn apply_call(&mut self, delta: &CallDelta, meta: &EventMeta) -> Vec<CallRecord> {
        match delta {
            CallDelta::Start {
                number,
                is_incoming,
                call_start_ts,
            } => {
                self.enter_in_call(number, *is_incoming, *call_start_ts, meta);
                Vec::new()
            }
            CallDelta::End {
                number,
                is_incoming,
                call_start_ts,
                duration_ms,
            } => {
                let record = self.finalize_ended(
                    number.as_deref(),
                    *is_incoming,
                    *call_start_ts,
                    *duration_ms,
                    meta,
                );
                self.reset_transient();
                vec![record]
            }
            CallDelta::Blocked { number } => {
                self.register_recent_blocked(number, meta.received_at);
                self.state.stats.calls_blocked += 1;
                vec![CallRecord {
                    ts_device: meta.ts,
                    received_ts: meta.received_at,
                    seq: meta.seq,
                    kind: CallKind::Blocked,
                    number: number.clone(),
                    duration_s: None,
                    reason: None,
                    synthetic: false,
                }]
            }
        }
    }

    /// Apply a phone-state delta, returning any finalized records.
    pub fn apply_phone_state(
        &mut self,
        delta: &PhoneStateDelta,
        meta: &EventMeta,
    ) -> Vec<CallRecord> {
        match delta {
            PhoneStateDelta::State {
                state,
                previous_state,
                current_call_number,
                current_dialing_number,
                is_incoming_call,
                is_ringing,
                dnd_active,
                maintenance_mode,
                call_waiting_available,
            } => {
                if let Some(active) = dnd_active {
                    self.state.dnd_active = *active;
                }
                if let Some(maintenance) = maintenance_mode {
                    self.state.maintenance_mode = *maintenance;
                }
                if let Some(available) = call_waiting_available {
                    self.state.call_waiting_available = Some(*available);
                }
                if let Some(number) = current_dialing_number {
                    self.state.dialing_number =
                        (!number.is_empty()).then(|| number.clone());
                }
                let number_hint = current_call_number
                    .clone()
                    .filter(|number| !number.is_empty());
                self.stash_number_hint(number_hint.as_deref());
                if let Some(incoming) = is_incoming_call {
                    self.state.current_call_is_incoming = *incoming;
                }

                let mut records = Vec::new();
                if let Some(new_state) = state {
                    records = self.transition_app_state(*new_state, *previous_state, meta);
                }
                // The transition may have just opened the provisional record
                // the hint belongs to.
                self.stash_number_hint(number_hint.as_deref());

                match is_ringing {
                    Some(true) => self.enter_ringing(meta),
                    Some(false) => self.state.ringing = false,
                    None => {
                        if state.is_some() {
                            self.state.ringing =
                                self.state.app_state == AppState::IncomingCallRing;
                        }
                    }
                }

                records
            }
            PhoneStateDelta::Dialing { number } => {
                self.enter_dialing(meta);
                self.state.dialing_number = (!number.is_empty()).then(|| number.clone());
                if let Some(open) = self.open_call.as_mut()
                    && open.number.is_empty()
                {
                    open.number = number.clone();
                }
                Vec::new()
            }
            PhoneStateDelta::Ring { is_ringing } => {
                if *is_ringing {
                    self.enter_ringing(meta);
                } else {
                    self.state.ringing = false;
                }
                Vec::new()
            }
            PhoneStateDelta::Dnd { active } => {
                self.state.dnd_active = *active;
                Vec::new()
            }
        }
    }

    /// Apply a system delta to the stats aggregate.
    pub fn apply_system(&mut self, delta: &SystemDelta) {
        match delta {
            SystemDelta::Stats {
                calls_total,
                calls_incoming,
                calls_outgoing,
                calls_blocked,
                talk_time_seconds,
            } => {
                let stats = &mut self.state.stats;
                if let Some(v) = calls_total {
                    stats.calls_total = *v;
                }
                if let Some(v) = calls_incoming {
                    stats.calls_incoming = *v;
                }
                if let Some(v) = calls_outgoing {
                    stats.calls_outgoing = *v;
                }
                if let Some(v) = calls_blocked {
                    stats.calls_blocked = *v;
                }
                if let Some(v) = talk_time_seconds {
                    stats.talk_time_seconds = *v;
                }
            }
            SystemDelta::Status {
                free_heap_bytes,
                rssi_dbm,
                uptime_seconds,
            } => {
                let stats = &mut self.state.stats;
                if let Some(v) = free_heap_bytes {
                    stats.free_heap_bytes = *v;
                }
                if let Some(v) = rssi_dbm {
                    stats.rssi_dbm = *v;
                }
                if let Some(v) = uptime_seconds {
                    stats.uptime_seconds = *v;
                }
            }
            SystemDelta::Error { .. } | SystemDelta::Shutdown { .. } => {}
        }
    }

    /// Apply one config key change. Returns true when the key was recognized.
    pub fn apply_config(&mut self, change: &ConfigChange) -> bool {
        let value = &change.new_value;
        match change.key.as_str() {
            "ring_pattern" => {
                self.state.ring_pattern = value.as_str().unwrap_or_default().to_owned();
            }
            "maintenance_mode" => {
                self.state.maintenance_mode = value.as_bool().unwrap_or(false);
            }
            "dialing.default_code" => {
                self.state.default_dialing_code =
                    sanitize_dialing_code(value.as_str().unwrap_or_default());
            }
            "dnd.force" => self.state.dnd.force = value.as_bool().unwrap_or(false),
            "dnd.scheduled" => self.state.dnd.scheduled = value.as_bool().unwrap_or(false),
            "dnd.start_hour" => self.state.dnd.start_hour = value_u8(value, 0),
            "dnd.start_minute" => self.state.dnd.start_minute = value_u8(value, 0),
            "dnd.end_hour" => self.state.dnd.end_hour = value_u8(value, 0),
            "dnd.end_minute" => self.state.dnd.end_minute = value_u8(value, 0),
            "audio.earpiece_volume" => self.state.audio.earpiece_volume = value_u8(value, 4),
            "audio.earpiece_gain" => self.state.audio.earpiece_gain = value_u8(value, 4),
            "audio.speaker_volume" => self.state.audio.speaker_volume = value_u8(value, 4),
            "audio.speaker_gain" => self.state.audio.speaker_gain = value_u8(value, 4),
            other => {
                debug!(key = %other, "unhandled config delta key");
                return false;
            }
        }
        true
    }

    /// Discard any open call after reboot detection. The open record is left
    /// unfinalized: never converted to missed or ended.
    pub fn on_reboot(&mut self) {
        if self.open_call.is_some() {
            warn!("device rebooted mid-call; discarding open call record");
        }
        self.open_call = None;
        self.reset_transient();
        // Maintenance mode does not survive a firmware restart.
        self.state.maintenance_mode = false;
    }

    /// Force-finalize a call that outlived the watchdog bound.
    pub fn watchdog_sweep(&mut self, now_ts: f64) -> Option<CallRecord> {
        let open = self.open_call.as_ref()?;
        let started = open.started_received_ts?;
        let elapsed = now_ts - started;
        if self.phase != CallPhase::InCall || elapsed <= CALL_WATCHDOG_SECS {
            return None;
        }

        warn!(
            elapsed_s = elapsed as u64,
            "call exceeded watchdog bound; force-finalizing"
        );
        let open = self.open_call.take()?;
        let kind = open.kind;
        let record = open.finalize(
            kind,
            Some(elapsed.max(0.0) as u64),
            Some("watchdog".to_owned()),
        );
        self.reset_transient();
        Some(record)
    }

    /// Seed derived state from a persisted snapshot before the first live
    /// event. Live updates overwrite everything seeded here.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.state.app_state = snapshot.app_state;
        self.state.dnd_active = snapshot.dnd_active;
        self.state.maintenance_mode = snapshot.maintenance_mode;
        self.state.ring_pattern = snapshot.ring_pattern.clone();
        self.state.default_dialing_code = snapshot.default_dialing_code.clone();
        self.state.audio = snapshot.audio.clone();
        self.state.dnd = snapshot.dnd.clone();
        self.state.stats = snapshot.stats.clone();
        self.state.quick_dials = snapshot.quick_dials.clone();
        self.state.blocked_numbers = snapshot.blocked_numbers.clone();
        self.state.webhooks = snapshot.webhooks.clone();
        self.state.last_seq = snapshot.last_seq;
    }

    /// Reconcile state from a polled device snapshot (degraded mode).
    ///
    /// Polling never synthesizes call lifecycle transitions; it refreshes
    /// app state, flags, config, and lists. Returns the snapshot's sequence
    /// number when the device reported one.
    pub fn apply_polled_snapshot(&mut self, data: &Value) -> Option<u64> {
        if let Some(phone) = data.get("phone") {
            if let Some(state) = phone
                .get("state")
                .and_then(Value::as_i64)
                .and_then(AppState::from_wire_value)
            {
                self.state.app_state = state;
            }
            if let Some(dnd) = phone.get("dndActive").and_then(Value::as_bool) {
                self.state.dnd_active = dnd;
            }
            if let Some(maintenance) = phone.get("isMaintenanceMode").and_then(Value::as_bool) {
                self.state.maintenance_mode = maintenance;
            }
        }

        if let Some(config) = data.get("config") {
            if let Some(pattern) = config.get("ringPattern").and_then(Value::as_str) {
                self.state.ring_pattern = pattern.to_owned();
            }
            if let Some(code) = config
                .get("dialing")
                .and_then(|d| d.get("defaultCode"))
                .and_then(Value::as_str)
            {
                self.state.default_dialing_code = sanitize_dialing_code(code);
            }
            if let Some(audio) = config.get("audio") {
                let current = self.state.audio.clone();
                self.state.audio = AudioConfig {
                    earpiece_volume: field_u8(audio, "earpieceVolume", current.earpiece_volume),
                    earpiece_gain: field_u8(audio, "earpieceGain", current.earpiece_gain),
                    speaker_volume: field_u8(audio, "speakerVolume", current.speaker_volume),
                    speaker_gain: field_u8(audio, "speakerGain", current.speaker_gain),
                };
            }
            if let Some(dnd) = config.get("dnd") {
                let current = self.state.dnd.clone();
                self.state.dnd = DndConfig {
                    force: dnd.get("force").and_then(Value::as_bool).unwrap_or(current.force),
                    scheduled: dnd
                        .get("scheduled")
                        .and_then(Value::as_bool)
                        .unwrap_or(current.scheduled),
                    start_hour: field_u8(dnd, "startHour", current.start_hour),
                    start_minute: field_u8(dnd, "startMinute", current.start_minute),
                    end_hour: field_u8(dnd, "endHour", current.end_hour),
                    end_minute: field_u8(dnd, "endMinute", current.end_minute),
                };
            }
            if let Some(entries) = config.get("quickDial").and_then(Value::as_array) {
                self.state.quick_dials = entries
                    .iter()
                    .filter_map(|entry| {
                        Some(QuickDialEntry {
                            code: entry.get("code")?.as_str()?.to_owned(),
                            number: entry.get("number")?.as_str()?.to_owned(),
                            name: entry
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                        })
                    })
                    .collect();
            }
            if let Some(entries) = config.get("blocked").and_then(Value::as_array) {
                self.state.blocked_numbers = entries
                    .iter()
                    .filter_map(|entry| {
                        Some(BlockedNumberEntry {
                            number: entry.get("number")?.as_str()?.to_owned(),
                            reason: entry
                                .get("reason")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                        })
                    })
                    .collect();
            }
            if let Some(entries) = config.get("webhooks").and_then(Value::as_array) {
                self.state.webhooks = entries
                    .iter()
                    .filter_map(|entry| {
                        Some(WebhookEntry {
                            code: entry.get("code")?.as_str()?.to_owned(),
                            webhook_id: entry.get("id")?.as_str()?.to_owned(),
                            action_name: entry
                                .get("actionName")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                        })
                    })
                    .collect();
            }
        }

        data.get("seq").and_then(Value::as_u64)
    }

    fn transition_app_state(
        &mut self,
        new_state: AppState,
        previous_state: Option<AppState>,
        meta: &EventMeta,
    ) -> Vec<CallRecord> {
        let mut records = Vec::new();

        match new_state {
            AppState::IncomingCall | AppState::IncomingCallRing => self.enter_ringing(meta),
            AppState::Dialing => self.enter_dialing(meta),
            AppState::InCall => {
                if self.phase != CallPhase::InCall {
                    self.phase = CallPhase::InCall;
                    if let Some(open) = self.open_call.as_mut()
                        && open.started_received_ts.is_none()
                    {
                        open.started_received_ts = Some(meta.received_at);
                    }
                    self.state.call_start_ts.get_or_insert(meta.ts);
                }
            }
            AppState::Idle => {
                records.extend(self.settle_to_idle(meta));
            }
            _ => {
                // Startup/check/invalid-number states abandon any open call
                // without classifying it.
                if self.open_call.is_some() {
                    debug!(?new_state, "abandoning open call on device state change");
                }
                self.reset_transient();
            }
        }

        self.state.previous_app_state = previous_state.unwrap_or(self.state.app_state);
        self.state.app_state = new_state;
        records
    }

    /// Ringing/Dialing that lands on Idle without an in-call phase finalizes
    /// as missed / unanswered; an in-call phase without an end event is
    /// discarded (the device always emits `call/end` before going idle).
    fn settle_to_idle(&mut self, meta: &EventMeta) -> Vec<CallRecord> {
        let mut records = Vec::new();
        match self.phase {
            CallPhase::Ringing => {
                if let Some(record) = self.finalize_missed(meta) {
                    records.push(record);
                }
            }
            CallPhase::Dialing => {
                if let Some(record) = self.finalize_unanswered(meta) {
                    records.push(record);
                }
            }
            CallPhase::InCall => {
                if self.open_call.is_some() {
                    debug!("device went idle without a call end event; discarding open call");
                }
            }
            CallPhase::Idle => {}
        }
        self.reset_transient();
        records
    }

    fn enter_ringing(&mut self, meta: &EventMeta) {
        self.state.ringing = true;
        if self.phase == CallPhase::InCall {
            // Ring flutter during an open call (e.g. call waiting) does not
            // reopen the lifecycle.
            return;
        }
        self.phase = CallPhase::Ringing;
        self.state.current_call_is_incoming = true;
        self.state.call_start_ts.get_or_insert(meta.ts);
        if self.open_call.is_none() {
            self.open_call = Some(ProvisionalCall::open(
                CallKind::Incoming,
                String::new(),
                meta,
                false,
            ));
        }
    }

    fn enter_dialing(&mut self, meta: &EventMeta) {
        if self.phase == CallPhase::InCall {
            return;
        }
        self.phase = CallPhase::Dialing;
        self.state.current_call_is_incoming = false;
        self.state.call_start_ts.get_or_insert(meta.ts);
        match self.open_call.as_mut() {
            Some(open) => open.kind = CallKind::Outgoing,
            None => {
                self.open_call = Some(ProvisionalCall::open(
                    CallKind::Outgoing,
                    String::new(),
                    meta,
                    false,
                ));
            }
        }
    }

    fn enter_in_call(
        &mut self,
        number: &str,
        is_incoming: bool,
        call_start_ts: i64,
        meta: &EventMeta,
    ) {
        let mut open = self.open_call.take().unwrap_or_else(|| {
            // Start delta with no preceding ring/dial: synthesize so the
            // call start is never dropped for want of a record.
            debug!("synthesizing provisional record for start-only call");
            let kind = if is_incoming {
                CallKind::Incoming
            } else {
                CallKind::Outgoing
            };
            ProvisionalCall::open(kind, String::new(), meta, true)
        });

        open.kind = if is_incoming {
            CallKind::Incoming
        } else {
            CallKind::Outgoing
        };
        if open.number.is_empty() && !number.is_empty() {
            open.number = number.to_owned();
        }
        open.call_start_ts = call_start_ts;
        open.started_received_ts = Some(meta.received_at);

        self.phase = CallPhase::InCall;
        self.state.previous_app_state = self.state.app_state;
        self.state.app_state = AppState::InCall;
        self.state.ringing = false;
        self.state.dialing_number = None;
        self.state.current_call_number = Some(open.number.clone());
        self.state.current_call_is_incoming = is_incoming;
        self.state.call_start_ts = Some(call_start_ts);
        self.open_call = Some(open);
    }

    fn finalize_ended(
        &mut self,
        number: Option<&str>,
        is_incoming: Option<bool>,
        call_start_ts: Option<i64>,
        duration_ms: Option<u64>,
        meta: &EventMeta,
    ) -> CallRecord {
        match self.open_call.take() {
            Some(mut open) => {
                if open.number.is_empty()
                    && let Some(number) = number
                {
                    open.number = number.to_owned();
                }
                let duration_s = duration_ms.map(|ms| ms / 1000).or_else(|| {
                    open.started_received_ts
                        .map(|started| (meta.received_at - started).max(0.0) as u64)
                });
                let kind = open.kind;
                open.finalize(kind, duration_s, None)
            }
            None => {
                // End with no provisional record: synthesize a complete one.
                debug!("synthesizing call record for end-only event");
                let incoming = is_incoming.unwrap_or(false);
                CallRecord {
                    ts_device: call_start_ts.unwrap_or(meta.ts),
                    received_ts: meta.received_at,
                    seq: meta.seq,
                    kind: if incoming {
                        CallKind::Incoming
                    } else {
                        CallKind::Outgoing
                    },
                    number: number.unwrap_or_default().to_owned(),
                    duration_s: duration_ms.map(|ms| ms / 1000),
                    reason: None,
                    synthetic: true,
                }
            }
        }
    }

    fn finalize_missed(&mut self, meta: &EventMeta) -> Option<CallRecord> {
        let open = self
            .open_call
            .take()
            .unwrap_or_else(|| ProvisionalCall::open(CallKind::Incoming, String::new(), meta, true));

        if !open.number.is_empty() && self.recently_blocked(&open.number, meta.received_at) {
            debug!(number = %open.number, "ring ended for a just-blocked number; not missed");
            return None;
        }

        Some(open.finalize(CallKind::Missed, None, None))
    }

    fn finalize_unanswered(&mut self, meta: &EventMeta) -> Option<CallRecord> {
        let open = self.open_call.take();
        let number = open
            .as_ref()
            .map(|open| open.number.clone())
            .filter(|number| !number.is_empty())
            .or_else(|| self.state.dialing_number.clone())?;

        Some(CallRecord {
            ts_device: meta.ts,
            received_ts: meta.received_at,
            seq: meta.seq,
            kind: CallKind::Outgoing,
            number,
            duration_s: None,
            reason: Some("unanswered".to_owned()),
            synthetic: true,
        })
    }

    /// Fill the open provisional record (and, while in-call, the state) with
    /// a device-provided caller number.
    fn stash_number_hint(&mut self, hint: Option<&str>) {
        let Some(number) = hint else {
            return;
        };
        if let Some(open) = self.open_call.as_mut()
            && open.number.is_empty()
        {
            open.number = number.to_owned();
        }
        if self.phase == CallPhase::InCall && self.state.current_call_number.is_none() {
            self.state.current_call_number = Some(number.to_owned());
        }
    }

    fn reset_transient(&mut self) {
        self.phase = CallPhase::Idle;
        self.open_call = None;
        self.state.ringing = false;
        self.state.dialing_number = None;
        self.state.current_call_number = None;
        self.state.current_call_is_incoming = false;
        self.state.call_start_ts = None;
    }

    fn register_recent_blocked(&mut self, number: &str, now_ts: f64) {
        if number.is_empty() {
            return;
        }
        self.prune_recent_blocked(now_ts);
        self.recent_blocked.push((number.to_owned(), now_ts));
    }

    fn recently_blocked(&mut self, number: &str, now_ts: f64) -> bool {
        self.prune_recent_blocked(now_ts);
        let code = self.state.default_dialing_code.clone();
        self.recent_blocked
            .iter()
            .any(|(blocked, _)| numbers_equivalent(blocked, number, &code))
    }

    fn prune_recent_blocked(&mut self, now_ts: f64) {
        self.recent_blocked
            .retain(|(_, at)| now_ts - at <= RECENT_BLOCK_WINDOW_SECS);
    }
}

fn value_u8(value: &Value, default: u8) -> u8 {
    value
        .as_u64()
        .and_then(|v| u8::try_from(v).ok())
        .unwrap_or(default)
}

fn field_u8(value: &Value, key: &str, default: u8) -> u8 {
    value
        .get(key)
        .map(|v| value_u8(v, default))
        .unwrap_or(default)
}
