//! Progress and log events streamed to the UI

use serde::{Deserialize, Serialize};

/// Phase of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpPhase {
    Validating,
    Preparing,
    Copying,
    Verifying,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

/// One progress tick. `bytes` is monotonically non-decreasing per
/// operation; rates and ETAs are computed by consumers, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Completion percentage, 0..=100
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<OpPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(rename = "totalBytes", skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

impl ProgressEvent {
    pub fn percent(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
            phase: None,
            message: None,
            bytes: None,
            total_bytes: None,
        }
    }

    pub fn phase(mut self, phase: OpPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn bytes(mut self, bytes: u64, total: u64) -> Self {
        self.bytes = Some(bytes);
        self.total_bytes = Some(total);
        self
    }
}

/// One line of sidecar or engine output. The UI keeps a bounded tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Producer tag (sidecar name or engine component)
    pub source: String,
    pub line: String,
}

/// Everything the bus fans out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum EngineEvent {
    #[serde(rename = "partition-operation-progress")]
    Progress(ProgressEvent),
    #[serde(rename = "partition-operation-log")]
    Log(LogEvent),
}
