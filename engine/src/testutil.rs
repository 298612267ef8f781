//! Shared fixtures for engine unit tests

use std::sync::Arc;

use crate::bus::Bus;
use crate::config::EngineConfig;
use crate::inspect::Inspector;
use crate::journal::JournalStore;
use crate::ops::OpContext;
use crate::sidecar::SidecarRegistry;

/// Owns everything an [`OpContext`] borrows.
pub struct TestHarness {
    pub registry: SidecarRegistry,
    pub inspector: Inspector,
    pub bus: Bus,
    pub journal: JournalStore,
    pub config: Arc<EngineConfig>,
    _dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let config = Arc::new(EngineConfig::default());
        let registry = SidecarRegistry::new();
        let inspector = Inspector::new(Arc::new(SidecarRegistry::new()), config.clone());
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalStore::open(dir.path().join("journal.json")).unwrap();
        Self {
            registry,
            inspector,
            bus: Bus::new(),
            journal,
            config,
            _dir: dir,
        }
    }

    pub fn ctx(&mut self) -> OpContext<'_> {
        OpContext {
            registry: &self.registry,
            inspector: &self.inspector,
            bus: &self.bus,
            journal: &mut self.journal,
            config: &self.config,
        }
    }
}
