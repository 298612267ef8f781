//! Shared types for the Oxidisk Disk Operations Engine.
//!
//! Everything that crosses the engine's IPC boundary lives here: the device
//! topology snapshot, preflight verdicts, the operation journal record,
//! progress/log events, the error taxonomy, and the size/label validation
//! rules both sides agree on.

pub mod error;
pub mod events;
pub mod journal;
pub mod model;
pub mod units;
pub mod verdict;

pub use error::{EngineError, EngineResult, OpReport};
pub use events::{EngineEvent, LogEvent, OpPhase, ProgressEvent};
pub use journal::{CopyKind, JournalRecord};
pub use model::{
    ApfsContainer, ApfsVolume, Device, DeviceContent, Partition, PartitionBounds,
    ProtectionReason, UnallocatedSegment, VolumeRole,
};
pub use units::FsKind;
pub use verdict::{
    BatterySnapshot, BusyProcess, FsCheckResult, OperationKind, PreflightVerdict, SidecarStatus,
    VerdictKey,
};
