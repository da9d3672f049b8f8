use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for retry behavior and host-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection-level fault. Always retried with backoff, never fatal.
    Transport,
    /// Malformed or unexpected frame. Logged, dropped, pipeline continues.
    Protocol,
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// A device command was rejected or could not be delivered.
    Command,
    /// Snapshot/persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload crossing the runtime boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct DeviceError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl DeviceError {
    /// Construct a new error.
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// The device rejected a command argument.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Command, "invalid_input", message)
    }

    /// The device is not in a state that allows the command.
    pub fn device_busy(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Command, "device_busy", message)
    }

    /// The referenced entry or call does not exist on the device.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Command, "not_found", message)
    }

    /// The device could not be reached at the transport level.
    pub fn device_unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transport, "device_unreachable", message)
    }

    /// True when retrying the operation may succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category, ErrorCategory::Transport)
    }
}

/// Map an HTTP status from the device's command API to an error category.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        408 | 429 => ErrorCategory::Transport,
        400..=499 => ErrorCategory::Command,
        500..=599 => ErrorCategory::Transport,
        _ => ErrorCategory::Internal,
    }
}

/// Map a firmware error code (as sent in command responses) to a stable
/// client-side error.
pub fn map_firmware_error_code(code: &str, message: impl Into<String>) -> DeviceError {
    let message = message.into();
    match code {
        "PHONE_NOT_READY" | "CALL_WAITING_NOT_AVAILABLE" | "WEB_SERVICE_UNAVAILABLE" => {
            DeviceError::device_busy(message)
        }
        "NO_INCOMING_CALL" | "NO_ACTIVE_CALL" => DeviceError::not_found(message),
        code if code.starts_with("WEB_") => DeviceError::invalid_input(message),
        "INVALID_PATTERN" => DeviceError::invalid_input(message),
        _ => DeviceError::new(ErrorCategory::Command, "device_error", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(408), ErrorCategory::Transport);
        assert_eq!(classify_http_status(404), ErrorCategory::Command);
        assert_eq!(classify_http_status(503), ErrorCategory::Transport);
        assert_eq!(classify_http_status(200), ErrorCategory::Internal);
    }

    #[test]
    fn maps_firmware_codes_to_stable_client_codes() {
        assert_eq!(
            map_firmware_error_code("PHONE_NOT_READY", "busy").code,
            "device_busy"
        );
        assert_eq!(
            map_firmware_error_code("NO_ACTIVE_CALL", "nothing to hang up").code,
            "not_found"
        );
        assert_eq!(
            map_firmware_error_code("WEB_INVALID_NUMBER", "bad number").code,
            "invalid_input"
        );
        assert_eq!(
            map_firmware_error_code("SOMETHING_ELSE", "odd").code,
            "device_error"
        );
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = DeviceError::device_unreachable("down")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
        assert!(err.is_recoverable());
    }

    #[test]
    fn command_errors_are_not_recoverable() {
        assert!(!DeviceError::invalid_input("bad digit").is_recoverable());
        assert!(!DeviceError::not_found("no call").is_recoverable());
    }
}
