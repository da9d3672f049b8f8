//! Core contract of the dialink device client.
//!
//! This crate defines the wire envelope and its translation into typed
//! deltas, the sequence guard, the call lifecycle machine, the bounded call
//! history ledger, retry/backoff and channel plumbing, and the snapshot
//! projection used for restart recovery.

/// Engine input/event channel primitives.
pub mod channel;
/// Wire envelope and event-to-delta translation.
pub mod envelope;
/// Stable error types and firmware error-code mapping.
pub mod error;
/// Bounded call history ledger.
pub mod history;
/// Call lifecycle machine deriving phone state and call records.
pub mod lifecycle;
/// Phone number normalization helpers.
pub mod normalize;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Sequence monotonicity guard with reboot inference.
pub mod sequence;
/// Restart-recovery snapshot projection.
pub mod snapshot;
/// Protocol and derived-state types.
pub mod types;

pub use channel::{ChannelError, ClientChannels, EngineInput, EventStream};
pub use envelope::{
    CallDelta, ConfigChange, Delta, EVENT_SCHEMA_VERSION, EventEnvelope, EventTranslator,
    PhoneStateDelta, SystemDelta,
};
pub use error::{DeviceError, ErrorCategory, classify_http_status, map_firmware_error_code};
pub use history::{DEFAULT_HISTORY_CAPACITY, HistoryFilter, HistoryLedger};
pub use lifecycle::{CALL_WATCHDOG_SECS, CallMachine, CallPhase, EventMeta};
pub use retry::RetryPolicy;
pub use sequence::{Admission, SequenceGuard, SequenceTracker};
pub use snapshot::Snapshot;
pub use types::{
    AppState, AudioConfig, AudioUpdate, BlockedNumberEntry, CallKind, CallRecord, ClientEvent,
    ConnectionState, DeviceStats, DiagnosticsReport, DndConfig, DndUpdate, PhoneState,
    QuickDialEntry, RingRequest, WebhookEntry,
};
