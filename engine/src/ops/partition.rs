//! Partition lifecycle operations
//!
//! Table creation, allocation, deletion, formatting, labels, checks, and
//! mount management. Table edits go through `sfdisk` scripts; filesystem
//! work goes through the per-family maker/checker/labeler sidecars.

use liboxidisk::units::{parse_size, validate_label, validate_uuid, MIB};
use liboxidisk::{
    Device, EngineError, EngineResult, FsKind, OpReport, Partition, ProgressEvent,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::OpContext;
use crate::preflight::busy_processes;
use crate::sidecar::{self, PercentParser};

/// Partition table schemes the engine writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Gpt,
    Mbr,
}

impl TableKind {
    fn sfdisk_label(&self) -> &'static str {
        match self {
            TableKind::Gpt => "gpt",
            TableKind::Mbr => "dos",
        }
    }
}

/// Scheme-level type tag for a new partition.
fn scheme_type(table: TableKind, fs: FsKind) -> EngineResult<&'static str> {
    let tag = match (table, fs) {
        (TableKind::Gpt, FsKind::Ext4) => "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
        (TableKind::Gpt, FsKind::Fat32 | FsKind::Exfat | FsKind::Ntfs) => {
            "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7"
        }
        (TableKind::Gpt, FsKind::Swap) => "0657FD6D-A3AA-40C3-8721-4F9D65B28AEE",
        (TableKind::Mbr, FsKind::Ext4) => "83",
        (TableKind::Mbr, FsKind::Fat32) => "0c",
        (TableKind::Mbr, FsKind::Exfat | FsKind::Ntfs) => "7",
        (TableKind::Mbr, FsKind::Swap) => "82",
        (_, fs) => {
            return Err(EngineError::InvalidInput {
                field: "fs".into(),
                reason: format!("{} cannot be allocated here", fs),
            })
        }
    };
    Ok(tag)
}

/// Trailing partition number of an identifier (`sda3` → 3, `nvme0n1p2` → 2).
pub fn partition_number(identifier: &str) -> EngineResult<u32> {
    let digits: String = identifier
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits
        .parse()
        .map_err(|_| EngineError::InvalidInput {
            field: "partition".into(),
            reason: format!("{} has no partition number", identifier),
        })
}

/// Ask the kernel to re-read the partition table after an edit.
fn reread_table(ctx: &OpContext, device_node: &Path) -> EngineResult<()> {
    let node = device_node.display().to_string();
    ctx.registry
        .invoke("blockdev")?
        .args(["--rereadpt", node.as_str()])
        .run(ctx.bus, None)?;
    Ok(())
}

/// Managed mount point for a partition.
fn managed_mount_point(ctx: &OpContext, identifier: &str) -> PathBuf {
    ctx.config.paths.mount_root.join(identifier)
}

pub fn mount_partition(ctx: &mut OpContext, identifier: &str) -> EngineResult<OpReport> {
    let (_, part) = ctx.inspector.find_partition(identifier)?;
    if let Some(mp) = &part.mount_point {
        return Ok(OpReport::with_details(json!({ "mountPoint": mp })));
    }

    let target = managed_mount_point(ctx, identifier);
    std::fs::create_dir_all(&target).map_err(|e| EngineError::io("creating mount point", e))?;
    ctx.registry
        .invoke("mount")?
        .args([
            part.node.display().to_string(),
            target.display().to_string(),
        ])
        .run(ctx.bus, None)?;
    info!(partition = identifier, "mounted");
    Ok(OpReport::with_details(json!({ "mountPoint": target })))
}

pub fn unmount_partition(ctx: &mut OpContext, identifier: &str) -> EngineResult<OpReport> {
    let (_, part) = ctx.inspector.find_partition(identifier)?;
    let Some(mount_point) = part.mount_point else {
        return Ok(OpReport::ok());
    };
    ctx.registry
        .invoke("umount")?
        .arg(mount_point.display().to_string())
        .run(ctx.bus, None)?;
    info!(partition = identifier, "unmounted");
    Ok(OpReport::ok())
}

/// Unmount every mounted partition of a device.
pub fn unmount_all(ctx: &mut OpContext, device: &Device) -> EngineResult<()> {
    for part in &device.partitions {
        if part.is_mounted() {
            unmount_partition(ctx, &part.identifier)?;
        }
    }
    Ok(())
}

/// Terminate the processes holding a filesystem open, then unmount.
///
/// SIGTERM first, a short grace period, SIGKILL for survivors, one retry.
pub fn force_unmount_partition(ctx: &mut OpContext, identifier: &str) -> EngineResult<OpReport> {
    let (_, part) = ctx.inspector.find_partition(identifier)?;
    let Some(mount_point) = part.mount_point.clone() else {
        return Ok(OpReport::ok());
    };

    let (busy, _) = busy_processes(&part.node, Some(&mount_point), Duration::from_secs(5));
    let mut report = OpReport::ok();
    for proc in &busy {
        ctx.bus.log(
            "engine",
            format!("terminating {} (pid {})", proc.command, proc.pid),
        );
        let _ = kill(Pid::from_raw(proc.pid as i32), Signal::SIGTERM);
    }
    if !busy.is_empty() {
        std::thread::sleep(Duration::from_secs(2));
        for proc in &busy {
            if Path::new(&format!("/proc/{}", proc.pid)).exists() {
                warn!(pid = proc.pid, "survived SIGTERM, killing");
                let _ = kill(Pid::from_raw(proc.pid as i32), Signal::SIGKILL);
                report = report.warn(format!("killed {} (pid {})", proc.command, proc.pid));
            }
        }
    }

    let umount = |ctx: &OpContext| -> EngineResult<()> {
        ctx.registry
            .invoke("umount")?
            .arg(mount_point.display().to_string())
            .run(ctx.bus, None)?;
        Ok(())
    };
    if let Err(first) = umount(ctx) {
        warn!(partition = identifier, "unmount failed once: {}", first);
        std::thread::sleep(Duration::from_millis(500));
        umount(ctx)?;
    }
    Ok(report)
}

/// Destroy all contents of a device and write a fresh partition scheme.
pub fn create_partition_table(
    ctx: &mut OpContext,
    device_id: &str,
    table: TableKind,
) -> EngineResult<OpReport> {
    let device = ctx.inspector.device(device_id)?;
    if let Some(reason) = device.protection {
        return Err(EngineError::Protected { reason });
    }
    unmount_all(ctx, &device)?;

    let node = device.node.display().to_string();
    ctx.registry
        .invoke("sfdisk")?
        .args(["--force", node.as_str()])
        .stdin(format!("label: {}\n", table.sfdisk_label()))
        .run(ctx.bus, None)?;
    reread_table(ctx, &device.node)?;
    info!(device = device_id, table = table.sfdisk_label(), "table created");
    Ok(OpReport::ok())
}

/// Fresh table, one spanning partition, formatted, optionally mounted.
pub fn wipe_device(
    ctx: &mut OpContext,
    device_id: &str,
    table: TableKind,
    fs: FsKind,
    label: &str,
    mount_after: bool,
) -> EngineResult<OpReport> {
    validate_label(fs, label)?;
    let type_tag = scheme_type(table, fs)?;

    let device = ctx.inspector.device(device_id)?;
    if let Some(reason) = device.protection {
        return Err(EngineError::Protected { reason });
    }
    unmount_all(ctx, &device)?;

    ctx.bus
        .progress(ProgressEvent::percent(5).message("writing partition table"));
    let node = device.node.display().to_string();
    ctx.registry
        .invoke("sfdisk")?
        .args(["--force", node.as_str()])
        .stdin(format!(
            "label: {}\n,,{}\n",
            table.sfdisk_label(),
            type_tag
        ))
        .run(ctx.bus, None)?;
    reread_table(ctx, &device.node)?;

    ctx.bus
        .progress(ProgressEvent::percent(40).message("formatting"));
    let fresh = ctx.inspector.device(device_id)?;
    let part = fresh
        .partitions
        .first()
        .ok_or_else(|| EngineError::Io {
            op: "wipe".into(),
            detail: "no partition after table write".into(),
        })?
        .clone();
    run_maker(ctx, &part, fs, label, None)?;

    let mut report = OpReport::ok();
    if mount_after && fs.natively_mountable() {
        ctx.bus.progress(ProgressEvent::percent(90).message("mounting"));
        report = mount_partition(ctx, &part.identifier)?;
    }
    info!(device = device_id, fs = %fs, "wiped");
    Ok(report)
}

/// Allocate a partition from the largest free gap.
pub fn create_partition(
    ctx: &mut OpContext,
    device_id: &str,
    fs: FsKind,
    label: &str,
    size: &str,
) -> EngineResult<OpReport> {
    validate_label(fs, label)?;
    let size = parse_size(size)?;
    if size == 0 {
        return Err(EngineError::InvalidInput {
            field: "size".into(),
            reason: "size is below one alignment block".into(),
        });
    }

    let device = ctx.inspector.device(device_id)?;
    if let Some(reason) = device.protection {
        return Err(EngineError::Protected { reason });
    }
    let table = match device.content {
        liboxidisk::DeviceContent::Gpt => TableKind::Gpt,
        liboxidisk::DeviceContent::Mbr => TableKind::Mbr,
        _ => {
            return Err(EngineError::InvalidInput {
                field: "device".into(),
                reason: "device has no partition table".into(),
            })
        }
    };
    let type_tag = scheme_type(table, fs)?;

    let gap = device.largest_gap().ok_or_else(|| EngineError::InvalidInput {
        field: "size".into(),
        reason: "no free space on device".into(),
    })?;
    if size > gap.size {
        return Err(EngineError::InvalidInput {
            field: "size".into(),
            reason: format!("{} bytes requested, {} free", size, gap.size),
        });
    }
    let start = liboxidisk::units::align_up(gap.offset, MIB);

    let node = device.node.display().to_string();
    ctx.registry
        .invoke("sfdisk")?
        .args(["--force", "--append", node.as_str()])
        .stdin(format!(
            "start={}MiB,size={}MiB,type={}\n",
            start / MIB,
            size / MIB,
            type_tag
        ))
        .run(ctx.bus, None)?;
    reread_table(ctx, &device.node)?;

    let fresh = ctx.inspector.device(device_id)?;
    let part = fresh
        .partitions
        .iter()
        .find(|p| p.offset == Some(start))
        .ok_or_else(|| EngineError::Io {
            op: "create".into(),
            detail: "new partition missing after table write".into(),
        })?
        .clone();

    run_maker(ctx, &part, fs, label, None)?;
    info!(device = device_id, partition = %part.identifier, "created");
    Ok(OpReport::with_details(json!({
        "identifier": part.identifier,
        "offset": start,
        "size": size,
    })))
}

/// Remove a partition from its table. Warns when peers stay mounted.
pub fn delete_partition(ctx: &mut OpContext, identifier: &str) -> EngineResult<OpReport> {
    let (device, part) = ctx.inspector.find_partition(identifier)?;
    if let Some(reason) = part.protection {
        return Err(EngineError::Protected { reason });
    }
    if part.is_mounted() {
        unmount_partition(ctx, identifier)?;
    }

    let mut report = OpReport::ok();
    for peer in &device.partitions {
        if peer.identifier != identifier && peer.is_mounted() {
            report = report.warn(format!(
                "{} remains mounted at {}",
                peer.identifier,
                peer.mount_point.as_deref().unwrap_or(Path::new("?")).display()
            ));
        }
    }

    let number = partition_number(identifier)?.to_string();
    let node = device.node.display().to_string();
    ctx.registry
        .invoke("sfdisk")?
        .args(["--force", "--delete", node.as_str(), number.as_str()])
        .run(ctx.bus, None)?;
    reread_table(ctx, &device.node)?;
    info!(partition = identifier, "deleted");
    Ok(report)
}

/// Unmount, run the platform-appropriate maker, remount when mountable.
pub fn format_partition(
    ctx: &mut OpContext,
    identifier: &str,
    fs: FsKind,
    label: &str,
) -> EngineResult<OpReport> {
    validate_label(fs, label)?;
    let (_, part) = ctx.inspector.find_partition(identifier)?;
    if let Some(reason) = part.protection {
        return Err(EngineError::Protected { reason });
    }
    if part.is_mounted() {
        unmount_partition(ctx, identifier)?;
    }

    run_maker(ctx, &part, fs, label, None)?;

    if fs.natively_mountable() {
        mount_partition(ctx, identifier)?;
    }
    info!(partition = identifier, fs = %fs, "formatted");
    Ok(OpReport::ok())
}

fn run_maker(
    ctx: &mut OpContext,
    part: &Partition,
    fs: FsKind,
    label: &str,
    uuid: Option<&str>,
) -> EngineResult<()> {
    let maker = sidecar::maker_for(fs).ok_or(EngineError::Unsupported {
        reason: format!("cannot create {}", fs),
    })?;
    let node = part.node.display().to_string();

    let invocation = ctx.registry.invoke(maker)?;
    let invocation = match fs {
        FsKind::Fat32 => {
            let inv = invocation.args(["-F", "32"]);
            if label.is_empty() {
                inv.arg(node)
            } else {
                inv.args(["-n", label]).arg(node)
            }
        }
        FsKind::Exfat => {
            if label.is_empty() {
                invocation.arg(node)
            } else {
                invocation.args(["-L", label]).arg(node)
            }
        }
        FsKind::Ntfs => {
            let inv = invocation.arg("--fast");
            if label.is_empty() {
                inv.arg(node)
            } else {
                inv.args(["-L", label]).arg(node)
            }
        }
        FsKind::Ext4 => {
            let mut inv = invocation.arg("-F");
            if !label.is_empty() {
                inv = inv.args(["-L", label]);
            }
            if let Some(uuid) = uuid {
                inv = inv.args(["-U", uuid]);
            }
            inv.arg(node)
        }
        FsKind::Swap => invocation.arg(node),
        FsKind::Apfs | FsKind::Other => unreachable!("maker_for returned None"),
    };

    let mut parser = PercentParser::new();
    invocation.run(ctx.bus, Some(&mut parser))?;
    Ok(())
}

/// Set a label and/or UUID according to the per-filesystem policy.
pub fn set_label_uuid(
    ctx: &mut OpContext,
    identifier: &str,
    label: Option<&str>,
    uuid: Option<&str>,
) -> EngineResult<OpReport> {
    let (_, part) = ctx.inspector.find_partition(identifier)?;
    if let Some(reason) = part.protection {
        return Err(EngineError::Protected { reason });
    }
    let fs = part.fs_type.ok_or(EngineError::InvalidInput {
        field: "partition".into(),
        reason: "no filesystem to label".into(),
    })?;

    if let Some(label) = label {
        validate_label(fs, label)?;
    }
    if let Some(uuid) = uuid {
        validate_uuid(fs, uuid)?;
    }
    let node = part.node.display().to_string();

    if let Some(label) = label {
        match fs {
            FsKind::Fat32 | FsKind::Exfat | FsKind::Ntfs => {
                let labeler = sidecar::labeler_for(fs).ok_or(EngineError::Unsupported {
                    reason: format!("cannot label {}", fs),
                })?;
                ctx.registry
                    .invoke(labeler)?
                    .args([node.clone(), label.to_string()])
                    .run(ctx.bus, None)?;
            }
            FsKind::Ext4 => {
                ctx.registry
                    .invoke("tune2fs")?
                    .args(["-L", label, node.as_str()])
                    .run(ctx.bus, None)?;
            }
            FsKind::Apfs => {
                ctx.registry
                    .invoke("diskutil")?
                    .args(["rename", identifier, label])
                    .run(ctx.bus, None)?;
            }
            FsKind::Swap | FsKind::Other => {
                return Err(EngineError::Unsupported {
                    reason: format!("cannot label {}", fs),
                })
            }
        }
    }

    if let Some(uuid) = uuid {
        match fs {
            FsKind::Ext4 => {
                ctx.registry
                    .invoke("tune2fs")?
                    .args(["-U", uuid, node.as_str()])
                    .run(ctx.bus, None)?;
            }
            _ => {
                return Err(EngineError::Unsupported {
                    reason: format!("cannot rewrite the uuid of {}", fs),
                })
            }
        }
    }
    info!(partition = identifier, "label/uuid updated");
    Ok(OpReport::ok())
}

/// Run the family checker; repair mode is opt-in.
pub fn check_partition(
    ctx: &mut OpContext,
    identifier: &str,
    repair: bool,
) -> EngineResult<OpReport> {
    let (_, part) = ctx.inspector.find_partition(identifier)?;
    let fs = part.fs_type.ok_or(EngineError::InvalidInput {
        field: "partition".into(),
        reason: "no filesystem to check".into(),
    })?;
    let checker = sidecar::checker_for(fs).ok_or(EngineError::Unsupported {
        reason: format!("no checker for {}", fs),
    })?;
    if part.is_mounted() {
        unmount_partition(ctx, identifier)?;
    }
    let node = part.node.display().to_string();

    let invocation = ctx.registry.invoke(checker)?;
    let invocation = match (fs, repair) {
        (FsKind::Ext4, true) => invocation.args(["-f", "-p", node.as_str()]),
        (FsKind::Ext4, false) => invocation.args(["-f", "-n", node.as_str()]),
        (FsKind::Fat32, true) => invocation.args(["-a", node.as_str()]),
        (FsKind::Fat32, false) => invocation.args(["-n", node.as_str()]),
        (FsKind::Exfat, true) => invocation.args(["-p", node.as_str()]),
        (FsKind::Exfat, false) => invocation.args(["-n", node.as_str()]),
        (FsKind::Ntfs, true) => invocation.arg(node.clone()),
        (FsKind::Ntfs, false) => invocation.args(["--no-action", node.as_str()]),
        _ => {
            return Err(EngineError::Unsupported {
                reason: format!("no checker for {}", fs),
            })
        }
    };

    let outcome = invocation.stream(ctx.bus, None)?;
    // fsck exit 1 means problems were corrected, which is success for a
    // repair run.
    let ok = match outcome.exit {
        Some(0) => true,
        Some(1) if repair => true,
        _ => false,
    };
    info!(partition = identifier, repair, ok, "filesystem check");
    Ok(OpReport::with_details(json!({
        "ok": ok,
        "exit": outcome.exit,
    })))
}

/// Unmount all partitions, then eject the media.
pub fn eject_disk(ctx: &mut OpContext, device_id: &str) -> EngineResult<OpReport> {
    let device = ctx.inspector.device(device_id)?;
    if let Some(reason) = device.protection {
        return Err(EngineError::Protected { reason });
    }
    unmount_all(ctx, &device)?;
    ctx.registry
        .invoke("eject")?
        .arg(device.node.display().to_string())
        .run(ctx.bus, None)?;
    info!(device = device_id, "ejected");
    Ok(OpReport::ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_number() {
        assert_eq!(partition_number("sda3").unwrap(), 3);
        assert_eq!(partition_number("nvme0n1p12").unwrap(), 12);
        assert!(partition_number("sda").is_err());
    }

    #[test]
    fn test_scheme_type() {
        assert_eq!(
            scheme_type(TableKind::Gpt, FsKind::Ext4).unwrap(),
            "0FC63DAF-8483-4772-8E79-3D69D8477DE4"
        );
        assert_eq!(scheme_type(TableKind::Mbr, FsKind::Fat32).unwrap(), "0c");
        assert!(scheme_type(TableKind::Gpt, FsKind::Apfs).is_err());
    }

    #[test]
    fn test_table_kind_labels() {
        assert_eq!(TableKind::Gpt.sfdisk_label(), "gpt");
        assert_eq!(TableKind::Mbr.sfdisk_label(), "dos");
    }
}
