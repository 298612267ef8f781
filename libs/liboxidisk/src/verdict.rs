//! Preflight verdicts and their freshness keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::units::FsKind;

/// Every operation the dispatcher accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Wipe,
    CreateTable,
    Create,
    Delete,
    Format,
    LabelUuid,
    Check,
    Resize,
    Move,
    Copy,
    Flash,
    Backup,
    WindowsInstall,
    Mount,
    Unmount,
    Eject,
    ApfsAdd,
    ApfsDelete,
}

impl OperationKind {
    /// Destructive operations require a fresh preflight verdict and the
    /// dispatcher's serial lock. Mount-state changes and checks serialize
    /// but do not gate on a verdict.
    pub fn is_destructive(&self) -> bool {
        !matches!(
            self,
            OperationKind::Check
                | OperationKind::Mount
                | OperationKind::Unmount
                | OperationKind::Eject
        )
    }

    /// Operations that rewrite extents of a live filesystem; preflight
    /// treats a failed consistency check as a blocker for these.
    pub fn needs_fs_sanity(&self) -> bool {
        matches!(self, OperationKind::Resize | OperationKind::Move)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Wipe => "wipe",
            OperationKind::CreateTable => "create_table",
            OperationKind::Create => "create",
            OperationKind::Delete => "delete",
            OperationKind::Format => "format",
            OperationKind::LabelUuid => "label_uuid",
            OperationKind::Check => "check",
            OperationKind::Resize => "resize",
            OperationKind::Move => "move",
            OperationKind::Copy => "copy",
            OperationKind::Flash => "flash",
            OperationKind::Backup => "backup",
            OperationKind::WindowsInstall => "windows_install",
            OperationKind::Mount => "mount",
            OperationKind::Unmount => "unmount",
            OperationKind::Eject => "eject",
            OperationKind::ApfsAdd => "apfs_add",
            OperationKind::ApfsDelete => "apfs_delete",
        }
    }
}

/// What a verdict is bound to. Only a fresh verdict with a matching key
/// unlocks execution; changing any field invalidates it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerdictKey {
    pub operation: OperationKind,
    /// Target device or partition identifier
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_size: Option<u64>,
}

/// A process holding the target filesystem open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusyProcess {
    pub pid: u32,
    pub command: String,
}

/// Host power state at preflight time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatterySnapshot {
    pub is_laptop: bool,
    pub on_ac: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

/// One sidecar's resolution state, for the status screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarStatus {
    pub name: String,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Result of the read-only filesystem consistency check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsCheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// The pass/warn/block verdict for one requested operation.
///
/// Invariant: `ok` exactly when `blockers` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightVerdict {
    pub ok: bool,
    pub operation: OperationKind,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_size: Option<u64>,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
    pub busy_processes: Vec<BusyProcess>,
    pub battery: BatterySnapshot,
    pub sidecars: Vec<SidecarStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_check: Option<FsCheckResult>,
    pub issued_at: DateTime<Utc>,
}

impl PreflightVerdict {
    pub fn key(&self) -> VerdictKey {
        VerdictKey {
            operation: self.operation,
            target: self.target.clone(),
            fs: self.fs,
            new_size: self.new_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destructive_classification() {
        assert!(OperationKind::Wipe.is_destructive());
        assert!(OperationKind::Move.is_destructive());
        assert!(!OperationKind::Check.is_destructive());
        assert!(!OperationKind::Mount.is_destructive());
    }

    #[test]
    fn test_key_mismatch_on_fs_change() {
        let a = VerdictKey {
            operation: OperationKind::Format,
            target: "sda2".into(),
            fs: Some(FsKind::Exfat),
            new_size: None,
        };
        let b = VerdictKey {
            fs: Some(FsKind::Fat32),
            ..a.clone()
        };
        assert_ne!(a, b);
    }
}
