//! Engine error taxonomy
//!
//! Every layer maps lower-level failures to the nearest tag here before the
//! error crosses the IPC boundary. Only `Io`, `SubprocessFailed`, and
//! `Corrupted` carry raw detail.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::journal::JournalRecord;
use crate::model::ProtectionReason;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineError {
    /// Operation refused before any side effect.
    #[error("operation blocked by preflight: {}", blockers.join(", "))]
    PreflightBlocked { blockers: Vec<String> },

    /// No verdict recorded for the request key.
    #[error("a preflight check is required before this operation")]
    PreflightRequired,

    /// A verdict exists but its key or age no longer matches.
    #[error("the preflight verdict is stale; re-run preflight")]
    PreflightStale,

    /// Another operation holds the serial lock.
    #[error("engine busy with {operation}")]
    Busy { operation: String },

    /// Target is in the system protection set.
    #[error("target is protected: {reason}")]
    Protected { reason: ProtectionReason },

    /// A required external binary is absent.
    #[error("required sidecar not found: {name}")]
    MissingSidecar { name: String },

    /// A label, size, or uuid rule was violated.
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    /// Target disappeared between preflight and execution.
    #[error("device no longer present: {identifier}")]
    DeviceGone { identifier: String },

    /// Low-level read/write failure.
    #[error("i/o error during {op}: {detail}")]
    Io { op: String, detail: String },

    /// A sidecar exited non-zero.
    #[error("{binary} failed with exit {}", exit.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    SubprocessFailed {
        binary: String,
        exit: Option<i32>,
        stderr_tail: String,
    },

    /// Post-write hash mismatch.
    #[error("verification failed: expected {expected}, got {actual}")]
    VerificationFailed { expected: String, actual: String },

    /// Cooperative stop.
    #[error("operation cancelled")]
    Cancelled,

    /// Unrecoverable partial state; the caller must run the repair path.
    /// Carries the journal record when one describes the interrupted copy.
    #[error("on-disk state may be corrupted; repair required")]
    Corrupted { journal: Option<JournalRecord> },

    /// Feature intentionally not provided.
    #[error("unsupported: {reason}")]
    Unsupported { reason: String },
}

impl EngineError {
    /// Tag an `std::io::Error` with the operation it interrupted.
    pub fn io(op: impl Into<String>, err: std::io::Error) -> Self {
        EngineError::Io {
            op: op.into(),
            detail: err.to_string(),
        }
    }
}

/// The success envelope of every engine command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpReport {
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OpReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_details(details: serde_json::Value) -> Self {
        Self {
            warnings: Vec::new(),
            details: Some(details),
        }
    }

    pub fn warn(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let err = EngineError::InvalidInput {
            field: "label".into(),
            reason: "fat32 \u{2264} 11 chars uppercase".into(),
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["kind"], "invalid_input");
        assert_eq!(v["field"], "label");

        let back: EngineError = serde_json::from_value(v).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_display_is_stable() {
        let err = EngineError::Busy {
            operation: "flash".into(),
        };
        assert_eq!(err.to_string(), "engine busy with flash");
    }
}
