//! Operation dispatcher
//!
//! The single gatekeeper in front of every operation: serializes
//! destructive work, enforces preflight freshness for the exact request
//! key, owns the journal handle while an operation runs, and surfaces the
//! interrupted-operation record at startup.

use anyhow::Result;
use liboxidisk::{
    CopyKind, EngineError, EngineResult, FsKind, JournalRecord, OpPhase, OpReport, OperationKind,
    PreflightVerdict, VerdictKey,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::bus::Bus;
use crate::config::EngineConfig;
use crate::inspect::Inspector;
use crate::journal::JournalStore;
use crate::ops::{self, OpContext};
use crate::preflight::{PreflightChecker, PreflightRequest};
use crate::sidecar::SidecarRegistry;

struct VerdictEntry {
    issued: Instant,
    blockers: Vec<String>,
}

pub struct Dispatcher {
    registry: Arc<SidecarRegistry>,
    config: Arc<EngineConfig>,
    inspector: Inspector,
    checker: PreflightChecker,
    bus: Bus,
    journal: Mutex<JournalStore>,
    verdicts: Mutex<HashMap<VerdictKey, VerdictEntry>>,
    active: Mutex<Option<OperationKind>>,
}

/// Clears the active-operation marker when an operation ends.
struct OpGuard<'a> {
    dispatcher: &'a Dispatcher,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        *self.dispatcher.active.lock().unwrap() = None;
    }
}

impl std::fmt::Debug for OpGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpGuard").finish()
    }
}

impl Dispatcher {
    pub fn new(config: Arc<EngineConfig>) -> Result<Self> {
        let registry = Arc::new(SidecarRegistry::new());
        let inspector = Inspector::new(registry.clone(), config.clone());
        let checker = PreflightChecker::new(registry.clone(), config.clone());
        let journal = JournalStore::open(config.paths.journal.clone())?;

        Ok(Self {
            registry,
            config,
            inspector,
            checker,
            bus: Bus::new(),
            journal: Mutex::new(journal),
            verdicts: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn inspector(&self) -> &Inspector {
        &self.inspector
    }

    pub fn sidecar_status(&self) -> Vec<liboxidisk::SidecarStatus> {
        self.registry.status_all()
    }

    /// Run the safety checks and record the verdict for later execution.
    pub fn preflight(&self, req: &PreflightRequest) -> EngineResult<PreflightVerdict> {
        let verdict = self.checker.run(&self.inspector, req)?;
        self.verdicts.lock().unwrap().insert(
            verdict.key(),
            VerdictEntry {
                issued: Instant::now(),
                blockers: verdict.blockers.clone(),
            },
        );
        Ok(verdict)
    }

    /// Called once at engine start: surface an interrupted operation.
    pub fn startup(&self) -> Option<JournalRecord> {
        let record = self.journal.lock().unwrap().peek().ok().flatten()?;
        let present = self.target_present(&record.device);
        warn!(
            device = %record.device,
            op = record.operation.as_str(),
            last_copied = record.last_copied,
            present,
            "interrupted operation found in journal"
        );
        Some(record)
    }

    pub fn journal_record(&self) -> EngineResult<Option<JournalRecord>> {
        self.journal
            .lock()
            .unwrap()
            .peek()
            .map_err(|e| EngineError::Io {
                op: "journal read".into(),
                detail: e.to_string(),
            })
    }

    /// The *Ignore* choice: drop the record without touching the device.
    pub fn clear_journal(&self) -> EngineResult<OpReport> {
        self.journal.lock().unwrap().abort()?;
        Ok(OpReport::ok())
    }

    /// The *Repair* choice: re-drive a resumable move from its checkpoint,
    /// otherwise repair the filesystem and clear the slot.
    pub fn repair_journal(&self) -> EngineResult<OpReport> {
        let Some(record) = self.journal_record()? else {
            return Ok(OpReport::ok());
        };
        let _guard = self.acquire(OperationKind::Check)?;

        if !self.target_present(&record.device) {
            self.journal.lock().unwrap().abort()?;
            return Ok(OpReport::ok().warn("journaled device is gone; record cleared"));
        }

        if record.operation == CopyKind::Move && record.resumable() {
            info!(device = %record.device, "resuming interrupted move");
            return self.with_ctx(|ctx| ops::resize::resume_interrupted_move(ctx, &record));
        }

        self.with_ctx(|ctx| {
            let report = match ctx.inspector.find_partition(&record.device) {
                Ok((_, part)) if part.fs_type.is_some() => {
                    ops::partition::check_partition(ctx, &record.device, true)?
                }
                _ => OpReport::ok(),
            };
            ctx.journal.clear()?;
            Ok(report)
        })
    }

    pub fn cancel(&self) {
        info!("cancel requested");
        self.bus.request_cancel();
    }

    /// Run one operation under the full contract: fresh verdict for the
    /// exact key, serial lock, presence re-check, journal ownership,
    /// terminal progress, unified error mapping.
    pub fn execute<F>(
        &self,
        op: OperationKind,
        target: &str,
        fs: Option<FsKind>,
        new_size: Option<u64>,
        f: F,
    ) -> EngineResult<OpReport>
    where
        F: FnOnce(&mut OpContext) -> EngineResult<OpReport>,
    {
        let guard;
        if op.is_destructive() {
            self.consume_verdict(&VerdictKey {
                operation: op,
                target: target.to_string(),
                fs,
                new_size,
            })?;
            guard = Some(self.acquire(op)?);
        } else {
            guard = None;
        }
        let _guard = guard;

        // Container references are invisible to the block-device lister;
        // the container operations re-resolve them themselves.
        let skip_presence = matches!(op, OperationKind::ApfsAdd | OperationKind::ApfsDelete);
        if !skip_presence && !self.target_present(target) {
            return Err(EngineError::DeviceGone {
                identifier: target.to_string(),
            });
        }

        info!(op = op.as_str(), target, "dispatching");
        self.with_ctx(f)
    }

    /// Operations that mutate mount state or run a repair: serialized, but
    /// not gated on a preflight verdict.
    pub fn execute_locked<F>(
        &self,
        op: OperationKind,
        target: &str,
        f: F,
    ) -> EngineResult<OpReport>
    where
        F: FnOnce(&mut OpContext) -> EngineResult<OpReport>,
    {
        let _guard = self.acquire(op)?;
        if !self.target_present(target) {
            return Err(EngineError::DeviceGone {
                identifier: target.to_string(),
            });
        }
        info!(op = op.as_str(), target, "dispatching");
        self.with_ctx(f)
    }

    /// Image-source operations whose target is a path, not a device.
    pub fn execute_readonly<F>(&self, f: F) -> EngineResult<OpReport>
    where
        F: FnOnce(&mut OpContext) -> EngineResult<OpReport>,
    {
        self.with_ctx(f)
    }

    fn with_ctx<F>(&self, f: F) -> EngineResult<OpReport>
    where
        F: FnOnce(&mut OpContext) -> EngineResult<OpReport>,
    {
        self.bus.begin_operation();
        let mut journal = self.journal.lock().unwrap();
        let mut ctx = OpContext {
            registry: &self.registry,
            inspector: &self.inspector,
            bus: &self.bus,
            journal: &mut journal,
            config: &self.config,
        };

        let result = f(&mut ctx);
        match &result {
            Ok(_) => self.bus.finish(OpPhase::Completed, "operation complete"),
            Err(EngineError::Cancelled) => {
                self.bus.finish(OpPhase::Cancelled, "operation cancelled")
            }
            Err(e) => self.bus.finish(OpPhase::Failed, e.to_string()),
        }
        result
    }

    fn acquire(&self, op: OperationKind) -> EngineResult<OpGuard<'_>> {
        let mut active = self.active.lock().unwrap();
        if let Some(running) = *active {
            return Err(EngineError::Busy {
                operation: running.as_str().to_string(),
            });
        }
        *active = Some(op);
        Ok(OpGuard { dispatcher: self })
    }

    fn consume_verdict(&self, key: &VerdictKey) -> EngineResult<()> {
        let ttl = Duration::from_secs(self.config.engine.preflight_ttl_secs);
        let mut verdicts = self.verdicts.lock().unwrap();

        match verdicts.remove(key) {
            Some(entry) if entry.issued.elapsed() <= ttl => {
                if entry.blockers.is_empty() {
                    Ok(())
                } else {
                    Err(EngineError::PreflightBlocked {
                        blockers: entry.blockers,
                    })
                }
            }
            Some(_) => Err(EngineError::PreflightStale),
            None => {
                // A verdict for the same operation and target with other
                // parameters means the request drifted, not that preflight
                // never ran.
                let drifted = verdicts
                    .keys()
                    .any(|k| k.operation == key.operation && k.target == key.target);
                if drifted {
                    Err(EngineError::PreflightStale)
                } else {
                    Err(EngineError::PreflightRequired)
                }
            }
        }
    }

    fn target_present(&self, identifier: &str) -> bool {
        match self.inspector.list_devices(true) {
            Ok(devices) => devices.iter().any(|d| {
                d.identifier == identifier || d.partition(identifier).is_some()
            }),
            Err(_) => false,
        }
    }

    #[cfg(test)]
    fn record_verdict(&self, key: VerdictKey, blockers: Vec<String>) {
        self.verdicts.lock().unwrap().insert(
            key,
            VerdictEntry {
                issued: Instant::now(),
                blockers,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.paths.journal = dir.path().join("journal.json");
        config.paths.mount_root = dir.path().join("mnt");
        let dispatcher = Dispatcher::new(Arc::new(config)).unwrap();
        (dir, dispatcher)
    }

    fn key(fs: Option<FsKind>) -> VerdictKey {
        VerdictKey {
            operation: OperationKind::Format,
            target: "sdz1".into(),
            fs,
            new_size: None,
        }
    }

    #[test]
    fn test_missing_verdict_is_required() {
        let (_dir, d) = dispatcher();
        let err = d.consume_verdict(&key(Some(FsKind::Exfat))).unwrap_err();
        assert_eq!(err, EngineError::PreflightRequired);
    }

    #[test]
    fn test_drifted_key_is_stale() {
        let (_dir, d) = dispatcher();
        d.record_verdict(key(Some(FsKind::Exfat)), Vec::new());
        // Same operation and target, different filesystem.
        let err = d.consume_verdict(&key(Some(FsKind::Fat32))).unwrap_err();
        assert_eq!(err, EngineError::PreflightStale);
    }

    #[test]
    fn test_blocked_verdict_refuses_execution() {
        let (_dir, d) = dispatcher();
        d.record_verdict(key(None), vec!["protected:system".into()]);
        let err = d.consume_verdict(&key(None)).unwrap_err();
        assert_eq!(
            err,
            EngineError::PreflightBlocked {
                blockers: vec!["protected:system".into()]
            }
        );
    }

    #[test]
    fn test_verdict_consumed_on_use() {
        let (_dir, d) = dispatcher();
        d.record_verdict(key(None), Vec::new());
        assert!(d.consume_verdict(&key(None)).is_ok());
        // Second execution needs a fresh preflight.
        let err = d.consume_verdict(&key(None)).unwrap_err();
        assert_eq!(err, EngineError::PreflightRequired);
    }

    #[test]
    fn test_serial_gate() {
        let (_dir, d) = dispatcher();
        let guard = d.acquire(OperationKind::Flash).unwrap();
        let err = d.acquire(OperationKind::Wipe).unwrap_err();
        assert_eq!(
            err,
            EngineError::Busy {
                operation: "flash".into()
            }
        );
        drop(guard);
        assert!(d.acquire(OperationKind::Wipe).is_ok());
    }

    #[test]
    fn test_clear_journal_idempotent() {
        let (_dir, d) = dispatcher();
        assert!(d.journal_record().unwrap().is_none());
        d.clear_journal().unwrap();
        d.clear_journal().unwrap();
    }
}
