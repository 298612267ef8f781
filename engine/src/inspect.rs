//! Device topology discovery
//!
//! Shells `lsblk -J -b -O` and normalizes the JSON tree into the snapshot
//! model: byte offsets, filesystem families, protection classification, and
//! synthetic unallocated segments. The inspector never blocks an operation;
//! it only reports.

use liboxidisk::units::{align_down, align_up, MIB};
use liboxidisk::{
    Device, DeviceContent, EngineError, EngineResult, FsKind, Partition, PartitionBounds,
    ProtectionReason, UnallocatedSegment,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::EngineConfig;
use crate::sidecar::SidecarRegistry;

/// `lsblk` reports partition starts in 512-byte sectors regardless of the
/// device's logical block size.
const LSBLK_SECTOR: u64 = 512;

/// Partitioning convention: the first usable byte on a fresh table.
pub const TABLE_HEADER: u64 = MIB;

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

/// One node of the lsblk tree. Fields absent on older util-linux stay
/// `None` and are tolerated.
#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    path: Option<String>,
    #[serde(rename = "type")]
    devtype: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "log-sec")]
    log_sec: Option<u64>,
    rm: Option<bool>,
    model: Option<String>,
    pttype: Option<String>,
    parttype: Option<String>,
    partlabel: Option<String>,
    label: Option<String>,
    fstype: Option<String>,
    mountpoint: Option<String>,
    start: Option<u64>,
    children: Option<Vec<LsblkDevice>>,
}

impl LsblkDevice {
    fn node(&self) -> PathBuf {
        self.path
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/dev/{}", self.name)))
    }
}

pub struct Inspector {
    registry: Arc<SidecarRegistry>,
    config: Arc<EngineConfig>,
}

impl Inspector {
    pub fn new(registry: Arc<SidecarRegistry>, config: Arc<EngineConfig>) -> Self {
        Self { registry, config }
    }

    /// Enumerate block devices with embedded partitions. With
    /// `include_system = false`, devices in the protection set are omitted.
    pub fn list_devices(&self, include_system: bool) -> EngineResult<Vec<Device>> {
        let timeout = Duration::from_secs(self.config.timeouts.disk_listing_secs);
        let stdout = self
            .registry
            .invoke("lsblk")?
            .args(["-J", "-b", "-O"])
            .capture_ok(timeout)?;
        let devices = self.parse_listing(&stdout)?;
        Ok(devices
            .into_iter()
            .filter(|d| include_system || !d.is_protected())
            .collect())
    }

    /// All partitions of one device.
    pub fn partitions_of(&self, device: &str) -> EngineResult<Vec<Partition>> {
        let dev = self.device(device)?;
        Ok(dev.partitions)
    }

    /// Find a device snapshot by identifier.
    pub fn device(&self, identifier: &str) -> EngineResult<Device> {
        self.list_devices(true)?
            .into_iter()
            .find(|d| d.identifier == identifier)
            .ok_or_else(|| EngineError::DeviceGone {
                identifier: identifier.to_string(),
            })
    }

    /// Find the device that contains a partition, together with the
    /// partition snapshot.
    pub fn find_partition(&self, identifier: &str) -> EngineResult<(Device, Partition)> {
        for device in self.list_devices(true)? {
            if let Some(part) = device.partition(identifier) {
                let part = part.clone();
                return Ok((device, part));
            }
        }
        Err(EngineError::DeviceGone {
            identifier: identifier.to_string(),
        })
    }

    /// The legal move range for a partition.
    pub fn partition_bounds(&self, identifier: &str) -> EngineResult<PartitionBounds> {
        let (device, partition) = self.find_partition(identifier)?;
        let offset = partition.offset.ok_or_else(|| EngineError::Io {
            op: "partition bounds".into(),
            detail: format!("{} reports no start offset", identifier),
        })?;

        let mut extents: Vec<(u64, u64)> = device
            .partitions
            .iter()
            .filter_map(|p| p.offset.map(|o| (o, p.size)))
            .collect();
        extents.sort_unstable_by_key(|&(o, _)| o);
        let index = extents
            .iter()
            .position(|&(o, _)| o == offset)
            .ok_or_else(|| EngineError::DeviceGone {
                identifier: identifier.to_string(),
            })?;

        Ok(bounds_for(device.size, device.block_size, &extents, index))
    }

    fn parse_listing(&self, json: &str) -> EngineResult<Vec<Device>> {
        let output: LsblkOutput = serde_json::from_str(json).map_err(|e| EngineError::Io {
            op: "parsing lsblk output".into(),
            detail: e.to_string(),
        })?;

        let mut devices = Vec::new();
        for raw in &output.blockdevices {
            if raw.devtype != "disk" {
                continue;
            }
            devices.push(self.normalize_device(raw, None));
            // Contained devices (a container published as its own disk)
            for child in raw.children.iter().flatten() {
                if child.devtype == "disk" {
                    devices.push(self.normalize_device(child, Some(raw.name.clone())));
                }
            }
        }
        debug!(count = devices.len(), "topology scan");
        Ok(devices)
    }

    fn normalize_device(&self, raw: &LsblkDevice, parent: Option<String>) -> Device {
        let block_size = raw.log_sec.unwrap_or(LSBLK_SECTOR);

        let mut partitions: Vec<Partition> = raw
            .children
            .iter()
            .flatten()
            .filter(|c| c.devtype == "part")
            .map(|c| self.normalize_partition(c))
            .collect();
        partitions.sort_by_key(|p| p.offset.unwrap_or(u64::MAX));

        let content = match raw.pttype.as_deref() {
            Some("gpt") => DeviceContent::Gpt,
            Some("dos") => DeviceContent::Mbr,
            Some(_) => DeviceContent::Unknown,
            None => match raw.fstype.as_deref() {
                Some("apfs") => DeviceContent::ApfsContainer,
                Some(_) => DeviceContent::Unknown,
                None => DeviceContent::Empty,
            },
        };

        let protection = partitions
            .iter()
            .find_map(|p| p.protection)
            .map(|reason| match reason {
                // A disk is protected as a whole because of what it hosts.
                ProtectionReason::EfiSystem | ProtectionReason::Boot => ProtectionReason::Boot,
                other => other,
            });

        let extents: Vec<(u64, u64)> = partitions
            .iter()
            .filter_map(|p| p.offset.map(|o| (o, p.size)))
            .collect();
        let unallocated = compute_unallocated(&raw.name, raw.size, &extents);

        Device {
            identifier: raw.name.clone(),
            node: raw.node(),
            size: raw.size,
            block_size,
            internal: !raw.rm.unwrap_or(false),
            model: raw
                .model
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from),
            content,
            parent_device: parent,
            protection,
            partitions,
            unallocated,
        }
    }

    fn normalize_partition(&self, raw: &LsblkDevice) -> Partition {
        let fs_type = raw.fstype.as_deref().and_then(FsKind::from_probe);
        let mount_point = raw
            .mountpoint
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(PathBuf::from);

        let protection = self.classify(raw, fs_type, mount_point.as_deref());

        Partition {
            identifier: raw.name.clone(),
            node: raw.node(),
            name: raw
                .label
                .clone()
                .or_else(|| raw.partlabel.clone())
                .unwrap_or_default(),
            size: raw.size,
            offset: raw.start.map(|s| s * LSBLK_SECTOR),
            content: raw
                .parttype
                .clone()
                .unwrap_or_default()
                .to_ascii_lowercase(),
            fs_type,
            mount_point,
            protection,
        }
    }

    /// Membership in the system protection set, by reason.
    fn classify(
        &self,
        raw: &LsblkDevice,
        fs_type: Option<FsKind>,
        mount_point: Option<&std::path::Path>,
    ) -> Option<ProtectionReason> {
        let protection = &self.config.protection;

        if let Some(parttype) = raw.parttype.as_deref() {
            let parttype = parttype.to_ascii_lowercase();
            if protection.parttype_guids.iter().any(|g| g == &parttype) {
                return Some(match parttype.as_str() {
                    "c12a7328-f81f-11d2-ba4b-00a0c93ec93b" => ProtectionReason::EfiSystem,
                    "de94bba4-06d1-4d40-a16a-bfd50179d6ac" => ProtectionReason::Recovery,
                    _ => ProtectionReason::Boot,
                });
            }
        }

        if let Some(mp) = mount_point {
            if mp.as_os_str() == "[SWAP]" {
                return Some(ProtectionReason::VirtualMemory);
            }
            if protection.mount_points.iter().any(|p| p.as_path() == mp) {
                return Some(if mp.as_os_str() == "/" {
                    ProtectionReason::System
                } else {
                    ProtectionReason::Boot
                });
            }
        }

        // Swap that is not mounted anywhere is fair game, but an active
        // swap device without a mountpoint entry still backs the VM.
        if fs_type == Some(FsKind::Swap) && crate::preflight::swap_is_active(&raw.name) {
            return Some(ProtectionReason::VirtualMemory);
        }

        None
    }
}

/// Gaps of at least 1 MiB between partition extents, and before/after them.
pub fn compute_unallocated(
    device: &str,
    device_size: u64,
    extents: &[(u64, u64)],
) -> Vec<UnallocatedSegment> {
    let mut extents: Vec<(u64, u64)> = extents.to_vec();
    extents.sort_unstable_by_key(|&(o, _)| o);

    let usable_end = device_size.saturating_sub(TABLE_HEADER);
    let mut segments = Vec::new();
    let mut cursor = TABLE_HEADER;

    for &(offset, size) in &extents {
        if offset > cursor && offset - cursor >= MIB {
            segments.push(UnallocatedSegment {
                key: format!("{}:free@{}", device, cursor),
                offset: cursor,
                size: offset - cursor,
            });
        }
        cursor = cursor.max(offset + size);
    }

    if usable_end > cursor && usable_end - cursor >= MIB {
        segments.push(UnallocatedSegment {
            key: format!("{}:free@{}", device, cursor),
            offset: cursor,
            size: usable_end - cursor,
        });
    }
    segments
}

/// Legal move range for the extent at `index`, from its neighbors.
pub fn bounds_for(
    device_size: u64,
    block_size: u64,
    extents: &[(u64, u64)],
    index: usize,
) -> PartitionBounds {
    let (offset, size) = extents[index];

    let prev_end = if index == 0 {
        TABLE_HEADER
    } else {
        let (o, s) = extents[index - 1];
        o + s
    };
    let next_start = extents
        .get(index + 1)
        .map(|&(o, _)| o)
        .unwrap_or_else(|| device_size.saturating_sub(TABLE_HEADER));

    let min_start = align_up(prev_end, MIB);
    let max_start = align_down(next_start.saturating_sub(size), MIB);

    PartitionBounds {
        min_start,
        max_start: max_start.max(min_start),
        offset,
        size,
        block_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    const GIB: u64 = 1024 * MIB;

    fn inspector() -> Inspector {
        Inspector::new(
            Arc::new(SidecarRegistry::new()),
            Arc::new(EngineConfig::default()),
        )
    }

    /// A 64 GiB disk: ESP, root, a data partition, and a trailing gap.
    fn fixture() -> String {
        format!(
            r#"{{
  "blockdevices": [
    {{
      "name": "sda", "path": "/dev/sda", "type": "disk",
      "size": {disk_size}, "log-sec": 512, "rm": false,
      "model": "Samsung SSD 870", "pttype": "gpt",
      "parttype": null, "partlabel": null, "label": null,
      "fstype": null, "mountpoint": null, "start": null,
      "children": [
        {{
          "name": "sda1", "path": "/dev/sda1", "type": "part",
          "size": {esp_size}, "log-sec": 512, "rm": false, "model": null,
          "pttype": "gpt", "parttype": "c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
          "partlabel": "EFI system partition", "label": null,
          "fstype": "vfat", "mountpoint": "/boot/efi",
          "start": 2048, "children": null
        }},
        {{
          "name": "sda2", "path": "/dev/sda2", "type": "part",
          "size": {root_size}, "log-sec": 512, "rm": false, "model": null,
          "pttype": "gpt", "parttype": "0fc63daf-8483-4772-8e79-3d69d8477de4",
          "partlabel": null, "label": null,
          "fstype": "ext4", "mountpoint": "/",
          "start": {root_start}, "children": null
        }},
        {{
          "name": "sda3", "path": "/dev/sda3", "type": "part",
          "size": {data_size}, "log-sec": 512, "rm": false, "model": null,
          "pttype": "gpt", "parttype": "0fc63daf-8483-4772-8e79-3d69d8477de4",
          "partlabel": null, "label": "scratch",
          "fstype": "ext4", "mountpoint": null,
          "start": {data_start}, "children": null
        }}
      ]
    }}
  ]
}}"#,
            disk_size = 64 * GIB,
            esp_size = 512 * MIB,
            root_size = 32 * GIB,
            root_start = (MIB + 512 * MIB) / 512,
            data_size = 8 * GIB,
            // 1 GiB gap after root
            data_start = (MIB + 512 * MIB + 32 * GIB + GIB) / 512,
        )
    }

    #[test]
    fn test_parse_and_classify() {
        let devices = inspector().parse_listing(&fixture()).unwrap();
        assert_eq!(devices.len(), 1);
        let disk = &devices[0];

        assert_eq!(disk.identifier, "sda");
        assert_eq!(disk.content, DeviceContent::Gpt);
        assert_eq!(disk.partitions.len(), 3);
        // Hosts the running system: protected.
        assert!(disk.is_protected());

        let esp = disk.partition("sda1").unwrap();
        assert_eq!(esp.protection, Some(ProtectionReason::EfiSystem));
        assert_eq!(esp.fs_type, Some(FsKind::Fat32));

        let root = disk.partition("sda2").unwrap();
        assert_eq!(root.protection, Some(ProtectionReason::System));
        assert_eq!(root.offset, Some(MIB + 512 * MIB));

        let data = disk.partition("sda3").unwrap();
        assert_eq!(data.protection, None);
        assert_eq!(data.name, "scratch");
    }

    #[test]
    fn test_partitions_non_overlapping_and_accounted() {
        let devices = inspector().parse_listing(&fixture()).unwrap();
        let disk = &devices[0];

        let mut end = 0;
        for p in &disk.partitions {
            let offset = p.offset.unwrap();
            assert!(offset >= end, "partitions overlap");
            end = offset + p.size;
        }

        // Partitions + gaps account for the device within one alignment
        // block at each edge.
        let total: u64 = disk.partitions.iter().map(|p| p.size).sum::<u64>()
            + disk.unallocated.iter().map(|g| g.size).sum::<u64>();
        assert!(disk.size - total <= 3 * MIB);
    }

    #[test]
    fn test_unallocated_segments() {
        let devices = inspector().parse_listing(&fixture()).unwrap();
        let disk = &devices[0];

        // One 1 GiB gap between sda2 and sda3, one trailing gap.
        assert_eq!(disk.unallocated.len(), 2);
        assert_eq!(disk.unallocated[0].size, GIB);
        assert_eq!(
            disk.unallocated[0].offset,
            MIB + 512 * MIB + 32 * GIB
        );
        assert!(disk.unallocated[1].size > 20 * GIB);
    }

    #[test]
    fn test_bounds_between_neighbors() {
        let extents = [
            (MIB, 512 * MIB),
            (MIB + 512 * MIB, GIB),
            (10 * GIB, GIB),
        ];
        let b = bounds_for(64 * GIB, 512, &extents, 1);
        // Squeezed: cannot move left past the ESP, can move right up to
        // the third partition minus its own size.
        assert_eq!(b.min_start, MIB + 512 * MIB);
        assert_eq!(b.max_start, 9 * GIB);
        assert_eq!(b.offset, MIB + 512 * MIB);
    }

    #[test]
    fn test_bounds_last_partition() {
        let extents = [(MIB, GIB)];
        let b = bounds_for(16 * GIB, 512, &extents, 0);
        assert_eq!(b.min_start, MIB);
        // Device end minus the table trailer, minus the partition size,
        // aligned down.
        assert_eq!(b.max_start, align_down(16 * GIB - MIB - GIB, MIB));
    }

    #[test]
    fn test_empty_disk_single_gap() {
        let gaps = compute_unallocated("sdb", 8 * GIB, &[]);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].offset, MIB);
        assert_eq!(gaps[0].size, 8 * GIB - 2 * MIB);
    }
}
