//! Device topology snapshot types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::units::FsKind;

/// Why a device or partition is off limits to destructive operations.
///
/// Reasons are enumerated, never free text; the UI renders them and the
/// preflight checker turns them into `protected:<reason>` blocker strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionReason {
    /// Holds the currently running system (mounted at `/`).
    System,
    /// Boot partition (`/boot` or a BIOS-boot partition).
    Boot,
    /// EFI system partition.
    EfiSystem,
    /// Recovery partition or volume.
    Recovery,
    /// Preboot volume of a container.
    Preboot,
    /// Active swap / VM volume.
    VirtualMemory,
}

impl ProtectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionReason::System => "system",
            ProtectionReason::Boot => "boot",
            ProtectionReason::EfiSystem => "efi_system",
            ProtectionReason::Recovery => "recovery",
            ProtectionReason::Preboot => "preboot",
            ProtectionReason::VirtualMemory => "virtual_memory",
        }
    }
}

impl fmt::Display for ProtectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a device carries at the whole-device level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceContent {
    /// GUID partition table
    Gpt,
    /// DOS/MBR partition table
    Mbr,
    /// Copy-on-write container spanning the device
    ApfsContainer,
    /// No recognizable partition table
    Empty,
    #[serde(other)]
    Unknown,
}

/// A physical or virtual block device with its partitions.
///
/// Snapshots are immutable values: every topology scan produces fresh ones,
/// nothing is mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier (kernel name, e.g. `sda`, `nvme0n1`)
    pub identifier: String,
    /// Device node path (e.g. `/dev/sda`)
    pub node: PathBuf,
    /// Total size in bytes
    pub size: u64,
    /// Logical block size in bytes
    pub block_size: u64,
    /// Internal (non-removable) device
    pub internal: bool,
    /// Hardware model string, if the transport reports one
    pub model: Option<String>,
    /// Whole-device content descriptor
    pub content: DeviceContent,
    /// Identifier of the containing device, for contained devices
    pub parent_device: Option<String>,
    /// Set when the device is in the system protection set
    pub protection: Option<ProtectionReason>,
    /// Partitions, sorted by offset
    pub partitions: Vec<Partition>,
    /// Gaps between partitions, at least 1 MiB each
    pub unallocated: Vec<UnallocatedSegment>,
}

impl Device {
    pub fn is_protected(&self) -> bool {
        self.protection.is_some()
    }

    /// Find a partition of this device by identifier.
    pub fn partition(&self, identifier: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.identifier == identifier)
    }

    /// The largest unallocated segment, if any.
    pub fn largest_gap(&self) -> Option<&UnallocatedSegment> {
        self.unallocated.iter().max_by_key(|g| g.size)
    }
}

/// One partition within a device snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    /// Stable identifier (kernel name, e.g. `sda3`, `nvme0n1p2`)
    pub identifier: String,
    /// Device node path (e.g. `/dev/sda3`)
    pub node: PathBuf,
    /// Human label, empty when the filesystem carries none
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Offset in bytes from the start of the containing device
    pub offset: Option<u64>,
    /// Scheme-level type tag (partition type GUID or MBR type)
    pub content: String,
    /// Resolved filesystem family
    pub fs_type: Option<FsKind>,
    /// Where the filesystem is mounted, if it is
    pub mount_point: Option<PathBuf>,
    /// Set when the partition is in the system protection set
    pub protection: Option<ProtectionReason>,
}

impl Partition {
    pub fn is_protected(&self) -> bool {
        self.protection.is_some()
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_point.is_some()
    }
}

/// A gap between partitions, reported so the UI can offer it for allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnallocatedSegment {
    /// Synthetic key, unique within the device snapshot
    pub key: String,
    /// Offset in bytes from the start of the device
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
}

/// Legal move range for a partition, derived from surrounding gaps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartitionBounds {
    /// Lowest legal start offset in bytes
    pub min_start: u64,
    /// Highest legal start offset in bytes
    pub max_start: u64,
    /// Current start offset in bytes
    pub offset: u64,
    /// Partition size in bytes
    pub size: u64,
    /// Logical block size of the containing device
    pub block_size: u64,
}

/// Role tags a container volume may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeRole {
    System,
    Data,
    Preboot,
    Recovery,
    Vm,
    None,
}

impl VolumeRole {
    /// Roles that make a volume read-only to the engine.
    pub fn is_protected(&self) -> bool {
        matches!(
            self,
            VolumeRole::System | VolumeRole::Preboot | VolumeRole::Recovery | VolumeRole::Vm
        )
    }

    /// The protection reason a role implies, if any.
    pub fn protection_reason(&self) -> Option<ProtectionReason> {
        match self {
            VolumeRole::System => Some(ProtectionReason::System),
            VolumeRole::Preboot => Some(ProtectionReason::Preboot),
            VolumeRole::Recovery => Some(ProtectionReason::Recovery),
            VolumeRole::Vm => Some(ProtectionReason::VirtualMemory),
            VolumeRole::Data | VolumeRole::None => None,
        }
    }

    pub fn parse(s: &str) -> VolumeRole {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => VolumeRole::System,
            "data" => VolumeRole::Data,
            "preboot" => VolumeRole::Preboot,
            "recovery" => VolumeRole::Recovery,
            "vm" => VolumeRole::Vm,
            _ => VolumeRole::None,
        }
    }
}

/// A copy-on-write container layered over one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApfsContainer {
    /// Container reference (e.g. `disk3`)
    pub identifier: String,
    /// Capacity in bytes
    pub capacity: u64,
    /// Free bytes
    pub free: u64,
    /// Child volumes
    pub volumes: Vec<ApfsVolume>,
}

/// One volume inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApfsVolume {
    /// Volume identifier (e.g. `disk3s1`)
    pub identifier: String,
    /// Volume name
    pub name: String,
    /// Role tags
    pub roles: Vec<VolumeRole>,
    /// Allocated size in bytes
    pub size: u64,
    /// Used bytes
    pub used: u64,
    /// Mount point, if mounted
    pub mount_point: Option<PathBuf>,
}

impl ApfsVolume {
    /// Volumes whose roles intersect the protected set are read-only.
    pub fn is_protected(&self) -> bool {
        self.roles.iter().any(|r| r.is_protected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_role_parse() {
        assert_eq!(VolumeRole::parse("System"), VolumeRole::System);
        assert_eq!(VolumeRole::parse("VM"), VolumeRole::Vm);
        assert_eq!(VolumeRole::parse("(no specific role)"), VolumeRole::None);
    }

    #[test]
    fn test_protected_roles() {
        let vol = ApfsVolume {
            identifier: "disk3s1".into(),
            name: "Macintosh HD".into(),
            roles: vec![VolumeRole::System],
            size: 0,
            used: 0,
            mount_point: None,
        };
        assert!(vol.is_protected());

        let data = ApfsVolume {
            roles: vec![VolumeRole::Data],
            ..vol.clone()
        };
        assert!(!data.is_protected());
    }

    #[test]
    fn test_protection_reason_str() {
        assert_eq!(ProtectionReason::System.as_str(), "system");
        assert_eq!(ProtectionReason::EfiSystem.as_str(), "efi_system");
    }
}
