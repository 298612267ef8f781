//! Container volume management
//!
//! Drives `diskutil apfs` on hosts that ship it and parses its plain-text
//! listing behind the parser seam. Elsewhere the registry reports the
//! sidecar missing and these operations refuse up front.

use liboxidisk::{
    ApfsContainer, ApfsVolume, EngineError, EngineResult, OpReport, VolumeRole,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use super::OpContext;

static CONTAINER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"APFS Container Reference:\s+(\S+)").unwrap());
static CAPACITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Size \(Capacity Ceiling\):\s+(\d+) B").unwrap());
static FREE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Capacity Not Allocated:\s+(\d+) B").unwrap());
static VOLUME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Volume (\S+)\s+[0-9A-Fa-f-]{36}").unwrap());
static ROLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(Role\):\s+\S+\s+\(([^)]*)\)").unwrap());
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Name:\s+(.+?)\s*(?:\(Case|$)").unwrap());
static MOUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Mount Point:\s+(.+)").unwrap());
static USED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Capacity Consumed:\s+(\d+) B").unwrap());
static QUOTA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Capacity Quota:\s+(\d+) B").unwrap());

/// Parse the human-readable `diskutil apfs list` output.
///
/// The format is indentation-structured; each `Volume diskXsY` header opens
/// a block whose attribute lines apply to that volume until the next header.
pub fn parse_container_listing(output: &str) -> Vec<ApfsContainer> {
    let mut containers: Vec<ApfsContainer> = Vec::new();

    for line in output.lines() {
        if let Some(caps) = CONTAINER_RE.captures(line) {
            containers.push(ApfsContainer {
                identifier: caps[1].to_string(),
                capacity: 0,
                free: 0,
                volumes: Vec::new(),
            });
            continue;
        }
        let Some(container) = containers.last_mut() else {
            continue;
        };

        if let Some(caps) = CAPACITY_RE.captures(line) {
            container.capacity = caps[1].parse().unwrap_or(0);
        } else if let Some(caps) = FREE_RE.captures(line) {
            container.free = caps[1].parse().unwrap_or(0);
        } else if let Some(caps) = VOLUME_RE.captures(line) {
            container.volumes.push(ApfsVolume {
                identifier: caps[1].to_string(),
                name: String::new(),
                roles: Vec::new(),
                size: 0,
                used: 0,
                mount_point: None,
            });
        } else if let Some(volume) = container.volumes.last_mut() {
            if let Some(caps) = ROLE_RE.captures(line) {
                volume.roles = caps[1]
                    .split(',')
                    .map(VolumeRole::parse)
                    .filter(|r| *r != VolumeRole::None)
                    .collect();
                if volume.roles.is_empty() {
                    volume.roles.push(VolumeRole::None);
                }
            } else if let Some(caps) = NAME_RE.captures(line) {
                if volume.name.is_empty() {
                    volume.name = caps[1].trim().to_string();
                }
            } else if let Some(caps) = MOUNT_RE.captures(line) {
                let mp = caps[1].trim();
                if mp != "Not Mounted" {
                    volume.mount_point = Some(PathBuf::from(mp));
                }
            } else if let Some(caps) = USED_RE.captures(line) {
                volume.used = caps[1].parse().unwrap_or(0);
            } else if let Some(caps) = QUOTA_RE.captures(line) {
                volume.size = caps[1].parse().unwrap_or(0);
            }
        }
    }

    // A volume without a quota can grow to the container ceiling.
    for container in &mut containers {
        for volume in &mut container.volumes {
            if volume.size == 0 {
                volume.size = container.capacity;
            }
        }
    }
    containers
}

fn list_all(ctx: &OpContext) -> EngineResult<Vec<ApfsContainer>> {
    let timeout = Duration::from_secs(ctx.config.timeouts.disk_listing_secs);
    let output = ctx
        .registry
        .invoke("diskutil")?
        .args(["apfs", "list"])
        .capture_ok(timeout)?;
    Ok(parse_container_listing(&output))
}

/// Volumes of one container.
pub fn list_volumes(ctx: &OpContext, container_id: &str) -> EngineResult<ApfsContainer> {
    list_all(ctx)?
        .into_iter()
        .find(|c| c.identifier == container_id)
        .ok_or_else(|| EngineError::DeviceGone {
            identifier: container_id.to_string(),
        })
}

/// Add a volume to a container. Only `data` and `none` roles can be
/// created from here; the rest belong to the platform.
pub fn add_volume(
    ctx: &mut OpContext,
    container_id: &str,
    name: &str,
    role: VolumeRole,
) -> EngineResult<OpReport> {
    liboxidisk::units::validate_label(liboxidisk::FsKind::Apfs, name)?;
    if role.is_protected() {
        return Err(EngineError::Unsupported {
            reason: format!("cannot create a volume with the {:?} role", role),
        });
    }
    // Container must exist before we mutate it.
    list_volumes(ctx, container_id)?;

    ctx.registry
        .invoke("diskutil")?
        .args(["apfs", "addVolume", container_id, "APFS", name])
        .run(ctx.bus, None)?;
    info!(container = container_id, name, "volume added");

    let container = list_volumes(ctx, container_id)?;
    let created = container.volumes.iter().find(|v| v.name == name);
    Ok(OpReport::with_details(json!({
        "identifier": created.map(|v| v.identifier.clone()),
    })))
}

/// Delete a volume. Refuses any volume carrying a protected role.
pub fn delete_volume(ctx: &mut OpContext, volume_id: &str) -> EngineResult<OpReport> {
    let containers = list_all(ctx)?;
    let volume = containers
        .iter()
        .flat_map(|c| c.volumes.iter())
        .find(|v| v.identifier == volume_id)
        .ok_or_else(|| EngineError::DeviceGone {
            identifier: volume_id.to_string(),
        })?;

    if let Some(reason) = volume.roles.iter().find_map(|r| r.protection_reason()) {
        return Err(EngineError::Protected { reason });
    }

    ctx.registry
        .invoke("diskutil")?
        .args(["apfs", "deleteVolume", volume_id])
        .run(ctx.bus, None)?;
    info!(volume = volume_id, "volume deleted");
    Ok(OpReport::ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"APFS Containers (2 found)
|
+-- Container disk3 0FEAB4A2-39D2-4A27-855E-D2FDB37B8D32
    ====================================================
    APFS Container Reference:     disk3
    Size (Capacity Ceiling):      494384795648 B (494.4 GB)
    Capacity In Use By Volumes:   193043411968 B (193.0 GB)
    Capacity Not Allocated:       301341383680 B (301.3 GB)
    |
    +-< Physical Store disk0s2 11111111-2222-3333-4444-555555555555
    |
    +-> Volume disk3s1 66666666-7777-8888-9999-AAAAAAAAAAAA
    |   ---------------------------------------------------
    |   APFS Volume Disk (Role):   disk3s1 (System)
    |   Name:                      Macintosh HD (Case-insensitive)
    |   Mount Point:               /
    |   Capacity Consumed:         15210352640 B (15.2 GB)
    |
    +-> Volume disk3s5 BBBBBBBB-CCCC-DDDD-EEEE-FFFFFFFFFFFF
    |   ---------------------------------------------------
    |   APFS Volume Disk (Role):   disk3s5 (Data)
    |   Name:                      Macintosh HD - Data (Case-insensitive)
    |   Mount Point:               /System/Volumes/Data
    |   Capacity Consumed:         170034823168 B (170.0 GB)
    |
    +-> Volume disk3s6 12121212-3434-5656-7878-909090909090
        ---------------------------------------------------
        APFS Volume Disk (Role):   disk3s6 (VM)
        Name:                      VM (Case-insensitive)
        Mount Point:               Not Mounted
        Capacity Consumed:         1073741824 B (1.1 GB)
"#;

    #[test]
    fn test_parse_listing() {
        let containers = parse_container_listing(LISTING);
        assert_eq!(containers.len(), 1);
        let c = &containers[0];
        assert_eq!(c.identifier, "disk3");
        assert_eq!(c.capacity, 494384795648);
        assert_eq!(c.free, 301341383680);
        assert_eq!(c.volumes.len(), 3);

        let system = &c.volumes[0];
        assert_eq!(system.identifier, "disk3s1");
        assert_eq!(system.name, "Macintosh HD");
        assert_eq!(system.roles, vec![VolumeRole::System]);
        assert_eq!(system.mount_point.as_deref(), Some(std::path::Path::new("/")));
        assert!(system.is_protected());

        let data = &c.volumes[1];
        assert_eq!(data.roles, vec![VolumeRole::Data]);
        assert!(!data.is_protected());
        assert_eq!(data.used, 170034823168);

        let vm = &c.volumes[2];
        assert_eq!(vm.roles, vec![VolumeRole::Vm]);
        assert_eq!(vm.mount_point, None);
        // No quota: grows to the ceiling.
        assert_eq!(vm.size, c.capacity);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_container_listing("No APFS Containers found\n").is_empty());
    }
}
