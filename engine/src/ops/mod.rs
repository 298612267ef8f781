//! Operation implementations
//!
//! Every operation is a synchronous function taking an [`OpContext`]; task
//! scheduling is the hosting runtime's concern. The dispatcher owns the
//! context for the duration of one operation.

pub mod apfs;
pub mod image;
pub mod iso;
pub mod partition;
pub mod resize;

use liboxidisk::{EngineError, EngineResult};

use crate::bus::Bus;
use crate::config::EngineConfig;
use crate::inspect::Inspector;
use crate::journal::JournalStore;
use crate::sidecar::SidecarRegistry;

/// Everything an operation needs. The journal handle is exclusively owned
/// here while the operation executes; component code never touches the
/// file directly.
pub struct OpContext<'a> {
    pub registry: &'a SidecarRegistry,
    pub inspector: &'a Inspector,
    pub bus: &'a Bus,
    pub journal: &'a mut JournalStore,
    pub config: &'a EngineConfig,
}

impl OpContext<'_> {
    /// Cooperative cancellation point, checked at block and line
    /// boundaries.
    pub fn check_cancel(&self) -> EngineResult<()> {
        if self.bus.cancel_requested() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
