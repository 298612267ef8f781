//! The single-slot operation journal record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Byte-copy operations that journal their progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyKind {
    Move,
    Copy,
    Flash,
    Backup,
}

impl CopyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyKind::Move => "move",
            CopyKind::Copy => "copy",
            CopyKind::Flash => "flash",
            CopyKind::Backup => "backup",
        }
    }
}

/// Description of an in-flight byte copy, persisted before the first
/// destructive block write. Its presence at engine startup means an
/// operation was interrupted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub operation: CopyKind,
    /// Target device or partition identifier
    pub device: String,
    /// Containing (parent) device identifier
    pub disk: String,
    /// Source offset in bytes, for in-place moves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_offset: Option<u64>,
    /// Destination offset in bytes
    pub dst_offset: u64,
    /// Total bytes to copy
    pub size: u64,
    /// Copy block size in bytes
    pub block_size: u64,
    /// Bytes flushed at the last checkpoint
    pub last_copied: u64,
    pub updated_at: DateTime<Utc>,
}

impl JournalRecord {
    /// Whether an interrupted copy can be re-driven from `last_copied`
    /// instead of falling back to a filesystem repair.
    ///
    /// A forward copy (destination below source, or disjoint ranges) only
    /// ever overwrites bytes it has already read, so the tail past
    /// `last_copied` is still intact. A reverse copy destroys its own
    /// source as it runs, so a restart cannot trust the checkpoint.
    pub fn resumable(&self) -> bool {
        match self.src_offset {
            Some(src) => {
                let dst = self.dst_offset;
                dst < src || src + self.size <= dst
            }
            // Flash/backup/copy read and write distinct objects.
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(src_offset: Option<u64>, dst_offset: u64, size: u64) -> JournalRecord {
        JournalRecord {
            operation: CopyKind::Move,
            device: "sdb2".into(),
            disk: "sdb".into(),
            src_offset,
            dst_offset,
            size,
            block_size: 512,
            last_copied: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_move_left_is_resumable() {
        assert!(record(Some(100), 50, 80).resumable());
    }

    #[test]
    fn test_disjoint_move_right_is_resumable() {
        assert!(record(Some(100), 250, 80).resumable());
    }

    #[test]
    fn test_overlapping_move_right_is_not() {
        // The reverse copy destroys its own source as it runs.
        assert!(!record(Some(100), 150, 80).resumable());
    }

    #[test]
    fn test_cross_object_copies_are_resumable() {
        assert!(record(None, 0, 80).resumable());
    }
}
