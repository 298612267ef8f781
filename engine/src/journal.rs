//! Single-slot persistent journal for in-flight byte copies
//!
//! Exactly one record may exist. `begin` is written atomically before any
//! destructive block write; `checkpoint` keeps `last_copied` current at a
//! bounded rate; `commit`/`abort` clear the slot. A record found at startup
//! means an operation was interrupted.

use anyhow::{Context, Result};
use chrono::Utc;
use liboxidisk::{EngineError, JournalRecord};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Checkpoints are dropped unless this many bytes were copied since the
/// last write...
const CHECKPOINT_BYTES: u64 = 1024 * 1024;
/// ...or this much time passed.
const CHECKPOINT_INTERVAL: Duration = Duration::from_millis(250);

pub struct JournalStore {
    path: PathBuf,
    /// Write-rate state for the active record
    last_write: Option<(Instant, u64)>,
}

impl JournalStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating journal directory {:?}", parent))?;
        }
        Ok(Self {
            path,
            last_write: None,
        })
    }

    /// The persisted record, if one exists.
    pub fn peek(&self) -> Result<Option<JournalRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("reading journal {:?}", self.path))?;
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // An unreadable slot is treated as interrupted-with-unknown
                // progress; surface nothing rather than a half-parsed record.
                warn!("journal slot unreadable, ignoring: {}", e);
                Ok(None)
            }
        }
    }

    /// Persist a new record. Refuses to overwrite an existing slot.
    pub fn begin(&mut self, record: &JournalRecord) -> Result<(), EngineError> {
        if self.path.exists() {
            if let Ok(Some(existing)) = self.peek() {
                return Err(EngineError::Corrupted {
                    journal: Some(existing),
                });
            }
        }
        self.write_atomic(record)?;
        self.last_write = Some((Instant::now(), record.last_copied));
        debug!(device = %record.device, op = record.operation.as_str(), "journal opened");
        Ok(())
    }

    /// Update `last_copied`. Rate-limited; returns whether a write happened.
    pub fn checkpoint(
        &mut self,
        record: &mut JournalRecord,
        last_copied: u64,
    ) -> Result<bool, EngineError> {
        // last_copied is monotone by construction of the copy loops.
        record.last_copied = record.last_copied.max(last_copied);

        let due = match self.last_write {
            Some((at, bytes)) => {
                record.last_copied - bytes >= CHECKPOINT_BYTES
                    || at.elapsed() >= CHECKPOINT_INTERVAL
            }
            None => true,
        };
        if !due {
            return Ok(false);
        }

        record.updated_at = Utc::now();
        self.write_atomic(record)?;
        self.last_write = Some((Instant::now(), record.last_copied));
        Ok(true)
    }

    /// Final checkpoint regardless of rate limiting.
    pub fn flush(&mut self, record: &JournalRecord) -> Result<(), EngineError> {
        self.write_atomic(record)?;
        self.last_write = Some((Instant::now(), record.last_copied));
        Ok(())
    }

    /// Clear the slot after a successful operation.
    pub fn commit(&mut self) -> Result<(), EngineError> {
        self.clear()
    }

    /// Clear the slot for an operation that never started writing, or whose
    /// record the user chose to ignore.
    pub fn abort(&mut self) -> Result<(), EngineError> {
        self.clear()
    }

    /// Idempotent: clearing an empty slot is a no-op.
    pub fn clear(&mut self) -> Result<(), EngineError> {
        self.last_write = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io("journal clear", e)),
        }
    }

    fn write_atomic(&self, record: &JournalRecord) -> Result<(), EngineError> {
        let io = |e: std::io::Error| EngineError::io("journal write", e);

        let dir = self.path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io)?;

        let content = serde_json::to_string_pretty(record).map_err(|e| EngineError::Io {
            op: "journal encode".into(),
            detail: e.to_string(),
        })?;
        tmp.write_all(content.as_bytes()).map_err(io)?;
        tmp.as_file().sync_all().map_err(io)?;

        let mut perms = tmp.as_file().metadata().map_err(io)?.permissions();
        perms.set_mode(0o600);
        tmp.as_file().set_permissions(perms).map_err(io)?;

        tmp.persist(&self.path).map_err(|e| io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liboxidisk::CopyKind;

    fn record() -> JournalRecord {
        JournalRecord {
            operation: CopyKind::Move,
            device: "sda2".into(),
            disk: "sda".into(),
            src_offset: Some(1024 * 1024),
            dst_offset: 2 * 1024 * 1024,
            size: 10 * 1024 * 1024,
            block_size: 512,
            last_copied: 0,
            updated_at: Utc::now(),
        }
    }

    fn store() -> (tempfile::TempDir, JournalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path().join("journal.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_begin_peek_roundtrip() {
        let (_dir, mut store) = store();
        let rec = record();
        store.begin(&rec).unwrap();
        assert_eq!(store.peek().unwrap().unwrap(), rec);
    }

    #[test]
    fn test_begin_refuses_occupied_slot() {
        let (_dir, mut store) = store();
        store.begin(&record()).unwrap();
        let err = store.begin(&record()).unwrap_err();
        assert!(matches!(err, EngineError::Corrupted { .. }));
    }

    #[test]
    fn test_checkpoint_monotone() {
        let (_dir, mut store) = store();
        let mut rec = record();
        store.begin(&rec).unwrap();

        store.checkpoint(&mut rec, 4 * 1024 * 1024).unwrap();
        // A stale, smaller value must not move the counter backwards.
        store.checkpoint(&mut rec, 1024).unwrap();
        assert_eq!(rec.last_copied, 4 * 1024 * 1024);

        store.flush(&rec).unwrap();
        let observed = store.peek().unwrap().unwrap();
        assert_eq!(observed.last_copied, 4 * 1024 * 1024);
    }

    #[test]
    fn test_checkpoint_rate_limited() {
        let (_dir, mut store) = store();
        let mut rec = record();
        store.begin(&rec).unwrap();

        // Well under a MiB and well under the interval: dropped.
        let wrote = store.checkpoint(&mut rec, 1024).unwrap();
        assert!(!wrote);
        // A MiB of progress forces a write.
        let wrote = store.checkpoint(&mut rec, 2 * 1024 * 1024).unwrap();
        assert!(wrote);
    }

    #[test]
    fn test_clear_idempotent() {
        let (_dir, mut store) = store();
        store.clear().unwrap();
        store.begin(&record()).unwrap();
        store.commit().unwrap();
        assert!(store.peek().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_permissions() {
        let (_dir, mut store) = store();
        store.begin(&record()).unwrap();
        let mode = fs::metadata(&store.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
