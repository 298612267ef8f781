//! Resize, move, and byte-level partition copy
//!
//! The move path is the crash-safety centerpiece: a journaled block copy
//! inside the containing device, with the partition table rewritten only
//! after the last block has been flushed.

use chrono::Utc;
use liboxidisk::units::{align_up, parse_size, MIB};
use liboxidisk::{
    CopyKind, Device, EngineError, EngineResult, FsKind, JournalRecord, OpPhase, OpReport,
    Partition, ProgressEvent,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::time::Duration;
use tracing::{info, warn};

use super::partition::{partition_number, unmount_partition};
use super::OpContext;
use crate::inspect::bounds_for;

/// In-place range copy over one file descriptor, in `block`-sized chunks.
///
/// Direction is chosen so overlapping ranges never read bytes they already
/// overwrote: forward when the destination is below the source or the
/// ranges are disjoint, reverse otherwise. `on_block` observes the running
/// byte count after every flushed block; returning an error stops the copy
/// with everything so far durable.
pub fn copy_range<F>(
    file: &mut File,
    src: u64,
    dst: u64,
    size: u64,
    block: u64,
    start_at: u64,
    mut on_block: F,
) -> EngineResult<()>
where
    F: FnMut(u64) -> EngineResult<()>,
{
    if src == dst || size == 0 {
        return Ok(());
    }
    let io = |op: &str, e: std::io::Error| EngineError::io(op.to_string(), e);
    let forward = dst < src || src + size <= dst;
    let mut buf = vec![0u8; block as usize];

    if forward {
        let mut pos = start_at;
        while pos < size {
            let n = block.min(size - pos) as usize;
            file.read_exact_at(&mut buf[..n], src + pos)
                .map_err(|e| io("block read", e))?;
            file.write_all_at(&buf[..n], dst + pos)
                .map_err(|e| io("block write", e))?;
            file.sync_data().map_err(|e| io("block flush", e))?;
            pos += n as u64;
            on_block(pos)?;
        }
    } else {
        // Reverse copies cannot resume from a checkpoint.
        let mut end = size;
        let mut copied = 0;
        while end > 0 {
            let n = block.min(end) as usize;
            let start = end - n as u64;
            file.read_exact_at(&mut buf[..n], src + start)
                .map_err(|e| io("block read", e))?;
            file.write_all_at(&buf[..n], dst + start)
                .map_err(|e| io("block write", e))?;
            file.sync_data().map_err(|e| io("block flush", e))?;
            copied += n as u64;
            end = start;
            on_block(copied)?;
        }
    }
    Ok(())
}

/// Rewrite one table entry's start/size. Offsets must be KiB-aligned,
/// which everything this engine allocates is.
fn write_table_entry(
    ctx: &mut OpContext,
    device: &Device,
    number: u32,
    start: u64,
    size: u64,
) -> EngineResult<()> {
    if start % 1024 != 0 || size % 1024 != 0 {
        return Err(EngineError::InvalidInput {
            field: "partition".into(),
            reason: "partition geometry is not KiB-aligned".into(),
        });
    }
    let number = number.to_string();
    let node = device.node.display().to_string();
    ctx.registry
        .invoke("sfdisk")?
        .args(["--force", "-N", number.as_str(), node.as_str()])
        .stdin(format!("start={}KiB,size={}KiB\n", start / 1024, size / 1024))
        .run(ctx.bus, None)?;
    ctx.registry
        .invoke("blockdev")?
        .args(["--rereadpt", node.as_str()])
        .run(ctx.bus, None)?;
    Ok(())
}

static EXT_MIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"minimum size of the filesystem:\s+(\d+)").unwrap());
static EXT_BLOCK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Block size:\s+(\d+)").unwrap());
static NTFS_MIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"resize at (\d+) bytes").unwrap());

/// Smallest size the filesystem inside a partition can shrink to.
fn fs_min_bytes(ctx: &OpContext, part: &Partition, fs: FsKind) -> EngineResult<u64> {
    let node = part.node.display().to_string();
    let timeout = Duration::from_secs(ctx.config.timeouts.fs_check_secs);

    match fs {
        FsKind::Ext4 => {
            let probe = ctx
                .registry
                .invoke("resize2fs")?
                .args(["-P", node.as_str()])
                .capture_ok(timeout)?;
            let blocks: u64 = EXT_MIN_RE
                .captures(&probe)
                .and_then(|c| c[1].parse().ok())
                .ok_or_else(|| parse_failure("resize2fs", &probe))?;

            let tune = ctx
                .registry
                .invoke("tune2fs")?
                .args(["-l", node.as_str()])
                .capture_ok(timeout)?;
            let block_size: u64 = EXT_BLOCK_RE
                .captures(&tune)
                .and_then(|c| c[1].parse().ok())
                .ok_or_else(|| parse_failure("tune2fs", &tune))?;
            Ok(blocks * block_size)
        }
        FsKind::Ntfs => {
            let probe = ctx
                .registry
                .invoke("ntfsresize")?
                .args(["--info", "--force", "--no-action", node.as_str()])
                .capture_ok(timeout)?;
            NTFS_MIN_RE
                .captures(&probe)
                .and_then(|c| c[1].parse().ok())
                .ok_or_else(|| parse_failure("ntfsresize", &probe))
        }
        other => Err(EngineError::Unsupported {
            reason: format!("cannot resize {}", other),
        }),
    }
}

fn parse_failure(binary: &str, output: &str) -> EngineError {
    EngineError::SubprocessFailed {
        binary: binary.to_string(),
        exit: Some(0),
        stderr_tail: output.lines().rev().take(4).collect::<Vec<_>>().join("\n"),
    }
}

fn shrink_filesystem(ctx: &mut OpContext, part: &Partition, fs: FsKind, bytes: u64) -> EngineResult<()> {
    let node = part.node.display().to_string();
    match fs {
        FsKind::Ext4 => {
            // resize2fs refuses without a fresh check pass.
            ctx.registry
                .invoke("e2fsck")?
                .args(["-f", "-y", node.as_str()])
                .run(ctx.bus, None)?;
            ctx.registry
                .invoke("resize2fs")?
                .args([node, format!("{}M", bytes / MIB)])
                .run(ctx.bus, None)?;
        }
        FsKind::Ntfs => {
            let mut parser = crate::sidecar::PercentParser::new();
            let size = bytes.to_string();
            ctx.registry
                .invoke("ntfsresize")?
                .args(["--force", "--size", size.as_str(), node.as_str()])
                .run(ctx.bus, Some(&mut parser))?;
        }
        other => {
            return Err(EngineError::Unsupported {
                reason: format!("cannot resize {}", other),
            })
        }
    }
    Ok(())
}

fn grow_filesystem(ctx: &mut OpContext, part: &Partition, fs: FsKind) -> EngineResult<()> {
    let node = part.node.display().to_string();
    match fs {
        FsKind::Ext4 => {
            ctx.registry
                .invoke("e2fsck")?
                .args(["-f", "-y", node.as_str()])
                .run(ctx.bus, None)?;
            // Without an explicit size resize2fs fills the partition.
            ctx.registry
                .invoke("resize2fs")?
                .arg(node)
                .run(ctx.bus, None)?;
        }
        FsKind::Ntfs => {
            let mut parser = crate::sidecar::PercentParser::new();
            ctx.registry
                .invoke("ntfsresize")?
                .args(["--force", node.as_str()])
                .run(ctx.bus, Some(&mut parser))?;
        }
        other => {
            return Err(EngineError::Unsupported {
                reason: format!("cannot resize {}", other),
            })
        }
    }
    Ok(())
}

/// Resize a partition and the filesystem inside it.
///
/// Shrink order: filesystem first, then the table entry. Grow order: table
/// entry first, then the filesystem. A failure after the first sub-step
/// restores the prior entry where that is safe.
pub fn resize_partition(
    ctx: &mut OpContext,
    identifier: &str,
    new_size: &str,
) -> EngineResult<OpReport> {
    let new_size = parse_size(new_size)?;
    let (device, part) = ctx.inspector.find_partition(identifier)?;
    if let Some(reason) = part.protection {
        return Err(EngineError::Protected { reason });
    }
    let fs = part.fs_type.ok_or(EngineError::InvalidInput {
        field: "partition".into(),
        reason: "no filesystem to resize".into(),
    })?;
    let offset = part.offset.ok_or_else(|| EngineError::Io {
        op: "resize".into(),
        detail: format!("{} reports no start offset", identifier),
    })?;

    if part.is_mounted() {
        unmount_partition(ctx, identifier)?;
    }

    ctx.bus.progress(
        ProgressEvent::percent(5)
            .phase(OpPhase::Validating)
            .message("probing filesystem limits"),
    );
    let min = fs_min_bytes(ctx, &part, fs)?;
    let free_after = device
        .unallocated
        .iter()
        .find(|g| g.offset == offset + part.size)
        .map(|g| g.size)
        .unwrap_or(0);
    let max = part.size + free_after;

    if new_size < min || new_size > max {
        return Err(EngineError::InvalidInput {
            field: "size".into(),
            reason: format!(
                "size must lie within [{}, {}] bytes",
                min, max
            ),
        });
    }
    if new_size == part.size {
        return Ok(OpReport::ok());
    }

    let number = partition_number(identifier)?;
    if new_size < part.size {
        ctx.bus.progress(
            ProgressEvent::percent(20)
                .phase(OpPhase::Copying)
                .message("shrinking filesystem"),
        );
        shrink_filesystem(ctx, &part, fs, new_size)?;

        ctx.bus.progress(
            ProgressEvent::percent(80)
                .phase(OpPhase::Finalizing)
                .message("updating partition table"),
        );
        // The filesystem already fits the smaller extent, so a failed
        // table write leaves a safe (merely oversized) partition.
        write_table_entry(ctx, &device, number, offset, new_size)?;
    } else {
        ctx.bus.progress(
            ProgressEvent::percent(20)
                .phase(OpPhase::Preparing)
                .message("growing partition table entry"),
        );
        write_table_entry(ctx, &device, number, offset, new_size)?;

        ctx.bus.progress(
            ProgressEvent::percent(50)
                .phase(OpPhase::Copying)
                .message("growing filesystem"),
        );
        if let Err(grow_err) = grow_filesystem(ctx, &part, fs) {
            warn!(partition = identifier, "filesystem grow failed, restoring entry");
            if let Err(restore_err) =
                write_table_entry(ctx, &device, number, offset, part.size)
            {
                warn!(partition = identifier, "restore failed: {}", restore_err);
                return Err(EngineError::Corrupted { journal: None });
            }
            return Err(grow_err);
        }
    }

    info!(partition = identifier, new_size, "resized");
    Ok(OpReport::with_details(json!({ "size": new_size })))
}

/// Move a partition to a new start offset via a journaled block copy.
pub fn move_partition(
    ctx: &mut OpContext,
    identifier: &str,
    new_start: &str,
) -> EngineResult<OpReport> {
    let new_start = parse_size(new_start)?;
    let (device, part) = ctx.inspector.find_partition(identifier)?;
    if let Some(reason) = part.protection {
        return Err(EngineError::Protected { reason });
    }
    let offset = part.offset.ok_or_else(|| EngineError::Io {
        op: "move".into(),
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
    let bounds = bounds_for(device.size, device.block_size, &extents, index);

    if new_start < bounds.min_start || new_start > bounds.max_start {
        return Err(EngineError::InvalidInput {
            field: "new_start".into(),
            reason: format!(
                "start must lie within [{}, {}] bytes",
                bounds.min_start, bounds.max_start
            ),
        });
    }
    if new_start == offset {
        return Ok(OpReport::ok());
    }
    // The table rewrite after the copy must be expressible; refuse before
    // the first block, not after the last.
    if part.size % 1024 != 0 {
        return Err(EngineError::InvalidInput {
            field: "partition".into(),
            reason: "partition size is not KiB-aligned".into(),
        });
    }

    if part.is_mounted() {
        unmount_partition(ctx, identifier)?;
    }

    let block = align_up(ctx.config.engine.copy_block_bytes, device.block_size);
    let mut record = JournalRecord {
        operation: CopyKind::Move,
        device: identifier.to_string(),
        disk: device.identifier.clone(),
        src_offset: Some(offset),
        dst_offset: new_start,
        size: part.size,
        block_size: device.block_size,
        last_copied: 0,
        updated_at: Utc::now(),
    };
    ctx.journal.begin(&record)?;

    let result = drive_move(ctx, &device, &part, &mut record, block, 0);
    match result {
        Ok(report) => Ok(report),
        Err(EngineError::Cancelled) if record.resumable() && record.last_copied == 0 => {
            // Nothing destructive happened yet.
            ctx.journal.abort()?;
            Err(EngineError::Cancelled)
        }
        Err(EngineError::Cancelled) if record.resumable() => {
            // Source is intact; the copy can be re-driven or ignored.
            ctx.journal.flush(&record)?;
            Err(EngineError::Cancelled)
        }
        Err(e) => {
            // Keep the journal: the repair path decides what to do.
            let _ = ctx.journal.flush(&record);
            Err(e)
        }
    }
}

fn drive_move(
    ctx: &mut OpContext,
    device: &Device,
    part: &Partition,
    record: &mut JournalRecord,
    block: u64,
    start_at: u64,
) -> EngineResult<OpReport> {
    let src = record.src_offset.unwrap_or(0);
    let dst = record.dst_offset;
    let total = record.size;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device.node)
        .map_err(|e| EngineError::io("opening device", e))?;

    ctx.bus.progress(
        ProgressEvent::percent(0)
            .phase(OpPhase::Copying)
            .bytes(start_at, total),
    );

    {
        let journal = &mut *ctx.journal;
        let bus = ctx.bus;
        copy_range(&mut file, src, dst, total, block, start_at, |copied| {
            if bus.cancel_requested() {
                return Err(EngineError::Cancelled);
            }
            journal.checkpoint(record, copied)?;
            let percent = ((copied as u128 * 95) / total.max(1) as u128) as u8;
            bus.progress(
                ProgressEvent::percent(percent)
                    .phase(OpPhase::Copying)
                    .bytes(copied, total),
            );
            Ok(())
        })?;
    }
    drop(file);
    ctx.journal.flush(record)?;

    // Point the table at the new location, then retire the journal. From
    // here on cancellation is a no-op: the operation is committed.
    ctx.bus.progress(
        ProgressEvent::percent(97)
            .phase(OpPhase::Finalizing)
            .message("updating partition table"),
    );
    let number = partition_number(&record.device)?;
    write_table_entry(ctx, device, number, dst, part.size)?;
    ctx.journal.commit()?;

    info!(partition = %record.device, dst, "moved");
    Ok(OpReport::with_details(json!({ "offset": dst })))
}

/// Re-drive an interrupted move from its checkpoint. Only called for
/// records whose copy direction preserves the uncopied tail.
pub fn resume_interrupted_move(ctx: &mut OpContext, record: &JournalRecord) -> EngineResult<OpReport> {
    let (device, part) = ctx.inspector.find_partition(&record.device)?;
    if part.is_mounted() {
        unmount_partition(ctx, &record.device)?;
    }
    let block = align_up(ctx.config.engine.copy_block_bytes, record.block_size.max(1));
    let mut record = record.clone();
    // Resume from the last durable block boundary.
    let start_at = record.last_copied - record.last_copied % block.max(1);
    record.last_copied = start_at;
    drive_move(ctx, &device, &part, &mut record, block, start_at)
}

/// Byte-level copy of one partition onto another at least as large.
pub fn copy_partition(
    ctx: &mut OpContext,
    source_id: &str,
    target_id: &str,
) -> EngineResult<OpReport> {
    let (_, source) = ctx.inspector.find_partition(source_id)?;
    let (target_device, target) = ctx.inspector.find_partition(target_id)?;
    if let Some(reason) = target.protection {
        return Err(EngineError::Protected { reason });
    }
    if target.size < source.size {
        return Err(EngineError::InvalidInput {
            field: "target".into(),
            reason: format!(
                "target is {} bytes, source needs {}",
                target.size, source.size
            ),
        });
    }
    if source_id == target_id {
        return Err(EngineError::InvalidInput {
            field: "target".into(),
            reason: "source and target are the same partition".into(),
        });
    }

    if source.is_mounted() {
        unmount_partition(ctx, source_id)?;
    }
    if target.is_mounted() {
        unmount_partition(ctx, target_id)?;
    }

    let block = align_up(
        ctx.config.engine.copy_block_bytes,
        target_device.block_size,
    );
    let mut record = JournalRecord {
        operation: CopyKind::Copy,
        device: target_id.to_string(),
        disk: target_device.identifier.clone(),
        src_offset: None,
        dst_offset: 0,
        size: source.size,
        block_size: target_device.block_size,
        last_copied: 0,
        updated_at: Utc::now(),
    };
    ctx.journal.begin(&record)?;

    let result = (|| -> EngineResult<()> {
        let mut reader = File::open(&source.node)
            .map_err(|e| EngineError::io("opening source partition", e))?;
        let mut writer = OpenOptions::new()
            .write(true)
            .open(&target.node)
            .map_err(|e| EngineError::io("opening target partition", e))?;

        let total = source.size;
        let mut buf = vec![0u8; block as usize];
        let mut copied = 0u64;
        while copied < total {
            ctx.check_cancel()?;
            let want = block.min(total - copied) as usize;
            let n = reader
                .read(&mut buf[..want])
                .map_err(|e| EngineError::io("partition read", e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .map_err(|e| EngineError::io("partition write", e))?;
            writer
                .sync_data()
                .map_err(|e| EngineError::io("partition flush", e))?;
            copied += n as u64;
            ctx.journal.checkpoint(&mut record, copied)?;
            let percent = ((copied as u128 * 100) / total.max(1) as u128) as u8;
            ctx.bus
                .progress(ProgressEvent::percent(percent).phase(OpPhase::Copying).bytes(copied, total));
        }
        writer
            .sync_all()
            .map_err(|e| EngineError::io("partition flush", e))?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            ctx.journal.commit()?;
            info!(source = source_id, target = target_id, "partition copied");
            Ok(OpReport::with_details(json!({ "bytes": source.size })))
        }
        Err(EngineError::Cancelled) if record.last_copied == 0 => {
            ctx.journal.abort()?;
            Err(EngineError::Cancelled)
        }
        Err(e) => {
            let _ = ctx.journal.flush(&record);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn scratch_file(size: usize) -> (tempfile::TempDir, File, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.img");
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        (dir, file, data)
    }

    fn read_back(file: &mut File, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_forward_copy_disjoint() {
        let (_dir, mut file, data) = scratch_file(64 * 1024);
        copy_range(&mut file, 0, 32 * 1024, 16 * 1024, 4 * 1024, 0, |_| Ok(())).unwrap();

        let result = read_back(&mut file, 64 * 1024);
        assert_eq!(&result[32 * 1024..48 * 1024], &data[..16 * 1024]);
        // Source untouched.
        assert_eq!(&result[..16 * 1024], &data[..16 * 1024]);
    }

    #[test]
    fn test_overlapping_move_left() {
        // dst < src with overlap: forward order is safe.
        let (_dir, mut file, data) = scratch_file(64 * 1024);
        copy_range(&mut file, 8 * 1024, 4 * 1024, 16 * 1024, 4 * 1024, 0, |_| Ok(())).unwrap();

        let result = read_back(&mut file, 64 * 1024);
        assert_eq!(&result[4 * 1024..20 * 1024], &data[8 * 1024..24 * 1024]);
    }

    #[test]
    fn test_overlapping_move_right_uses_reverse() {
        // dst > src with overlap: only a reverse copy preserves the data.
        let (_dir, mut file, data) = scratch_file(64 * 1024);
        copy_range(&mut file, 4 * 1024, 8 * 1024, 16 * 1024, 4 * 1024, 0, |_| Ok(())).unwrap();

        let result = read_back(&mut file, 64 * 1024);
        assert_eq!(&result[8 * 1024..24 * 1024], &data[4 * 1024..20 * 1024]);
    }

    #[test]
    fn test_copy_reports_monotone_progress() {
        let (_dir, mut file, _) = scratch_file(64 * 1024);
        let mut seen = Vec::new();
        copy_range(&mut file, 0, 32 * 1024, 16 * 1024, 4 * 1024, 0, |copied| {
            seen.push(copied);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![4 * 1024, 8 * 1024, 12 * 1024, 16 * 1024]);
    }

    #[test]
    fn test_copy_resume_from_checkpoint() {
        let (_dir, mut file, data) = scratch_file(64 * 1024);

        // First attempt dies after two blocks.
        let mut blocks = 0;
        let result = copy_range(&mut file, 0, 32 * 1024, 16 * 1024, 4 * 1024, 0, |_| {
            blocks += 1;
            if blocks == 2 {
                Err(EngineError::Cancelled)
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(EngineError::Cancelled)));

        // Resume from the durable prefix.
        copy_range(&mut file, 0, 32 * 1024, 16 * 1024, 4 * 1024, 8 * 1024, |_| Ok(())).unwrap();
        let result = read_back(&mut file, 64 * 1024);
        assert_eq!(&result[32 * 1024..48 * 1024], &data[..16 * 1024]);
    }

    #[test]
    fn test_copy_partial_tail_block() {
        let (_dir, mut file, data) = scratch_file(64 * 1024);
        // 10 KiB is not a multiple of the 4 KiB block.
        copy_range(&mut file, 0, 40 * 1024, 10 * 1024, 4 * 1024, 0, |_| Ok(())).unwrap();
        let result = read_back(&mut file, 64 * 1024);
        assert_eq!(&result[40 * 1024..50 * 1024], &data[..10 * 1024]);
    }

    #[test]
    fn test_min_size_regexes() {
        let caps = EXT_MIN_RE
            .captures("Estimated minimum size of the filesystem: 131072")
            .unwrap();
        assert_eq!(&caps[1], "131072");

        let caps = EXT_BLOCK_RE.captures("Block size:               4096").unwrap();
        assert_eq!(&caps[1], "4096");

        let caps = NTFS_MIN_RE
            .captures("You might resize at 2097152 bytes or 2 MB (freeing 8 MB).")
            .unwrap();
        assert_eq!(&caps[1], "2097152");
    }
}
