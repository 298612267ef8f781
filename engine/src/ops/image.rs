//! Image flashing, device backup, and Windows-installer staging

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use liboxidisk::units::{align_up, validate_label};
use liboxidisk::{
    CopyKind, EngineError, EngineResult, FsKind, JournalRecord, OpPhase, OpReport, ProgressEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use super::iso::inspect_image;
use super::partition::{self, TableKind};
use super::OpContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashArgs {
    pub source: PathBuf,
    pub device: String,
    #[serde(default)]
    pub verify: bool,
    /// A detected Windows installer ISO is refused unless this is set;
    /// staging it is `windows_install`'s job.
    #[serde(default)]
    pub allow_windows: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArgs {
    pub device: String,
    pub target: PathBuf,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowsInstallArgs {
    pub source: PathBuf,
    pub device: String,
    pub label: String,
    #[serde(default)]
    pub tpm_bypass: bool,
    #[serde(default)]
    pub local_account: bool,
    #[serde(default)]
    pub privacy_defaults: bool,
    /// Partition layout override; only the default exFAT layout exists.
    #[serde(default)]
    pub layout: Option<String>,
}

/// Streaming SHA-256 of a file with progress against its known size.
pub fn hash_image(ctx: &mut OpContext, path: &Path) -> EngineResult<OpReport> {
    let mut file = File::open(path).map_err(|e| EngineError::io("opening image", e))?;
    let total = file
        .metadata()
        .map_err(|e| EngineError::io("reading image metadata", e))?
        .len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; ctx.config.engine.copy_block_bytes as usize];
    let mut read = 0u64;
    loop {
        ctx.check_cancel()?;
        let n = file
            .read(&mut buf)
            .map_err(|e| EngineError::io("reading image", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read += n as u64;
        let percent = ((read as u128 * 100) / total.max(1) as u128) as u8;
        ctx.bus
            .progress(ProgressEvent::percent(percent).bytes(read, total));
    }

    let sha256 = hex::encode(hasher.finalize());
    Ok(OpReport::with_details(json!({
        "sha256": sha256,
        "size": read,
    })))
}

/// Write an image onto a device, journaled, with optional verification.
pub fn flash_image(ctx: &mut OpContext, args: &FlashArgs) -> EngineResult<OpReport> {
    let inspection = inspect_image(&args.source)?;
    if inspection.is_windows && !args.allow_windows {
        return Err(EngineError::InvalidInput {
            field: "mode".into(),
            reason: "windows-iso detected".into(),
        });
    }

    let device = ctx.inspector.device(&args.device)?;
    if let Some(reason) = device.protection {
        return Err(EngineError::Protected { reason });
    }

    let source_len = std::fs::metadata(&args.source)
        .map_err(|e| EngineError::io("reading image metadata", e))?
        .len();
    if source_len > device.size {
        return Err(EngineError::InvalidInput {
            field: "source".into(),
            reason: format!(
                "image is {} bytes, device holds {}",
                source_len, device.size
            ),
        });
    }

    partition::unmount_all(ctx, &device)?;

    let block = align_up(ctx.config.engine.copy_block_bytes, device.block_size);
    let mut record = JournalRecord {
        operation: CopyKind::Flash,
        device: device.identifier.clone(),
        disk: device.identifier.clone(),
        src_offset: None,
        dst_offset: 0,
        size: source_len,
        block_size: device.block_size,
        last_copied: 0,
        updated_at: Utc::now(),
    };
    ctx.journal.begin(&record)?;

    let result = (|| -> EngineResult<String> {
        let mut source = File::open(&args.source)
            .map_err(|e| EngineError::io("opening image", e))?;
        let mut target = OpenOptions::new()
            .write(true)
            .open(&device.node)
            .map_err(|e| EngineError::io("opening device", e))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; block as usize];
        let mut written = 0u64;
        ctx.bus.progress(
            ProgressEvent::percent(0)
                .phase(OpPhase::Copying)
                .bytes(0, source_len),
        );
        loop {
            ctx.check_cancel()?;
            let n = source
                .read(&mut buf)
                .map_err(|e| EngineError::io("reading image", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            target
                .write_all(&buf[..n])
                .map_err(|e| EngineError::io("writing device", e))?;
            target
                .sync_data()
                .map_err(|e| EngineError::io("flushing device", e))?;
            written += n as u64;
            ctx.journal.checkpoint(&mut record, written)?;
            let percent = ((written as u128 * 95) / source_len.max(1) as u128) as u8;
            ctx.bus.progress(
                ProgressEvent::percent(percent)
                    .phase(OpPhase::Copying)
                    .bytes(written, source_len),
            );
        }
        target
            .sync_all()
            .map_err(|e| EngineError::io("flushing device", e))?;
        Ok(hex::encode(hasher.finalize()))
    })();

    let source_hash = match result {
        Ok(hash) => hash,
        Err(EngineError::Cancelled) if record.last_copied == 0 => {
            ctx.journal.abort()?;
            return Err(EngineError::Cancelled);
        }
        Err(e) => {
            let _ = ctx.journal.flush(&record);
            return Err(e);
        }
    };

    let mut details = json!({ "sha256": source_hash });
    if args.verify {
        ctx.bus.progress(
            ProgressEvent::percent(96)
                .phase(OpPhase::Verifying)
                .message("re-reading device"),
        );
        let verified = hash_device_prefix(ctx, &device.node, source_len, block)?;
        if verified != source_hash {
            let _ = ctx.journal.flush(&record);
            return Err(EngineError::VerificationFailed {
                expected: source_hash,
                actual: verified,
            });
        }
        details["verified_hash"] = json!(verified);
    }

    ctx.journal.commit()?;
    info!(device = %args.device, "image flashed");
    Ok(OpReport::with_details(details))
}

/// SHA-256 of the first `len` bytes of a block device.
fn hash_device_prefix(
    ctx: &OpContext,
    node: &Path,
    len: u64,
    block: u64,
) -> EngineResult<String> {
    let mut file = File::open(node).map_err(|e| EngineError::io("opening device", e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block as usize];
    let mut remaining = len;
    while remaining > 0 {
        ctx.check_cancel()?;
        let want = block.min(remaining) as usize;
        let n = file
            .read(&mut buf[..want])
            .map_err(|e| EngineError::io("reading device", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Stream a device into an image file, optionally gzip-compressed, and
/// verify by re-reading both sides.
pub fn backup_image(ctx: &mut OpContext, args: &BackupArgs) -> EngineResult<OpReport> {
    if args.target.exists() && !args.overwrite {
        return Err(EngineError::InvalidInput {
            field: "target".into(),
            reason: "target exists; pass overwrite to replace it".into(),
        });
    }

    let device = ctx.inspector.device(&args.device)?;
    partition::unmount_all(ctx, &device)?;

    let block = align_up(ctx.config.engine.copy_block_bytes, device.block_size);
    let total = device.size;
    let mut record = JournalRecord {
        operation: CopyKind::Backup,
        device: device.identifier.clone(),
        disk: device.identifier.clone(),
        src_offset: None,
        dst_offset: 0,
        size: total,
        block_size: device.block_size,
        last_copied: 0,
        updated_at: Utc::now(),
    };
    ctx.journal.begin(&record)?;

    let result = (|| -> EngineResult<()> {
        let mut source = File::open(&device.node)
            .map_err(|e| EngineError::io("opening device", e))?;
        let target = File::create(&args.target)
            .map_err(|e| EngineError::io("creating backup file", e))?;
        let mut writer: Box<dyn Write> = if args.compress {
            Box::new(GzEncoder::new(target, Compression::default()))
        } else {
            Box::new(target)
        };

        let mut buf = vec![0u8; block as usize];
        let mut read = 0u64;
        ctx.bus.progress(
            ProgressEvent::percent(0)
                .phase(OpPhase::Copying)
                .bytes(0, total),
        );
        while read < total {
            ctx.check_cancel()?;
            let want = block.min(total - read) as usize;
            let n = source
                .read(&mut buf[..want])
                .map_err(|e| EngineError::io("reading device", e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .map_err(|e| EngineError::io("writing backup", e))?;
            read += n as u64;
            ctx.journal.checkpoint(&mut record, read)?;
            let percent = ((read as u128 * 90) / total.max(1) as u128) as u8;
            ctx.bus.progress(
                ProgressEvent::percent(percent)
                    .phase(OpPhase::Copying)
                    .bytes(read, total),
            );
        }
        writer
            .flush()
            .map_err(|e| EngineError::io("flushing backup", e))?;
        drop(writer);
        Ok(())
    })();

    if let Err(e) = result {
        // A partial backup file is worthless; do not leave it behind.
        let _ = std::fs::remove_file(&args.target);
        ctx.journal.abort()?;
        return Err(e);
    }

    // Verification: hash the uncompressed logical stream of the archive
    // against a fresh read of the device.
    ctx.bus.progress(
        ProgressEvent::percent(92)
            .phase(OpPhase::Verifying)
            .message("re-reading both sides"),
    );
    let device_hash = hash_device_prefix(ctx, &device.node, total, block)?;
    let archive_hash = hash_archive(ctx, &args.target, args.compress, block)?;
    if device_hash != archive_hash {
        let _ = ctx.journal.flush(&record);
        return Err(EngineError::VerificationFailed {
            expected: device_hash,
            actual: archive_hash,
        });
    }

    ctx.journal.commit()?;
    info!(device = %args.device, target = %args.target.display(), "backup written");
    Ok(OpReport::with_details(json!({
        "sha256": device_hash,
        "verified_hash": archive_hash,
        "compressed": args.compress,
    })))
}

/// SHA-256 of a backup's logical contents, decompressing when needed.
fn hash_archive(
    ctx: &OpContext,
    path: &Path,
    compressed: bool,
    block: u64,
) -> EngineResult<String> {
    let file = File::open(path).map_err(|e| EngineError::io("opening backup", e))?;
    let mut reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block as usize];
    loop {
        ctx.check_cancel()?;
        let n = reader
            .read(&mut buf)
            .map_err(|e| EngineError::io("reading backup", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Stage a Windows installer: GPT + single exFAT partition, file-level ISO
/// copy, and an `autounattend.xml` carrying the enabled overrides.
pub fn windows_install(ctx: &mut OpContext, args: &WindowsInstallArgs) -> EngineResult<OpReport> {
    if let Some(layout) = args.layout.as_deref() {
        if layout != "exfat" {
            return Err(EngineError::Unsupported {
                reason: format!("{} two-partition layout", layout),
            });
        }
    }
    validate_label(FsKind::Exfat, &args.label)?;

    let inspection = inspect_image(&args.source)?;
    if !inspection.is_windows {
        return Err(EngineError::InvalidInput {
            field: "source".into(),
            reason: format!("not a windows installer ({})", inspection.reason),
        });
    }

    ctx.bus.progress(
        ProgressEvent::percent(2)
            .phase(OpPhase::Preparing)
            .message("preparing target device"),
    );
    partition::wipe_device(
        ctx,
        &args.device,
        TableKind::Gpt,
        FsKind::Exfat,
        &args.label,
        false,
    )?;

    let fresh = ctx.inspector.device(&args.device)?;
    let target_part = fresh
        .partitions
        .first()
        .ok_or_else(|| EngineError::Io {
            op: "windows install".into(),
            detail: "no partition after preparation".into(),
        })?
        .clone();

    // Loopback-mount the ISO read-only and mount the fresh partition.
    let iso_mount = ctx.config.paths.mount_root.join("windows-iso");
    std::fs::create_dir_all(&iso_mount).map_err(|e| EngineError::io("creating mount point", e))?;
    let source = args.source.display().to_string();
    let mount_point = iso_mount.display().to_string();
    ctx.registry
        .invoke("mount")?
        .args(["-o", "loop,ro", source.as_str(), mount_point.as_str()])
        .run(ctx.bus, None)?;

    let copy_result = (|| -> EngineResult<()> {
        partition::mount_partition(ctx, &target_part.identifier)?;
        let target_root = ctx.config.paths.mount_root.join(&target_part.identifier);

        copy_tree(ctx, &iso_mount, &target_root)?;

        ctx.bus.progress(
            ProgressEvent::percent(95)
                .phase(OpPhase::Finalizing)
                .message("writing answer file"),
        );
        let unattend = autounattend_xml(args.tpm_bypass, args.local_account, args.privacy_defaults);
        std::fs::write(target_root.join("autounattend.xml"), unattend)
            .map_err(|e| EngineError::io("writing autounattend.xml", e))?;

        partition::unmount_partition(ctx, &target_part.identifier)?;
        Ok(())
    })();

    // The ISO mount must come down whatever happened above.
    let unmount_iso = ctx
        .registry
        .invoke("umount")
        .and_then(|inv| inv.arg(iso_mount.display().to_string()).run(ctx.bus, None));
    copy_result?;
    unmount_iso?;

    info!(device = %args.device, "windows installer staged");
    Ok(OpReport::with_details(json!({
        "label": args.label,
        "tpm_bypass": args.tpm_bypass,
        "local_account": args.local_account,
        "privacy_defaults": args.privacy_defaults,
    })))
}

/// File-level tree copy with byte progress. exFAT has no 4 GiB ceiling,
/// so `install.wim` passes through unsplit.
fn copy_tree(ctx: &mut OpContext, from: &Path, to: &Path) -> EngineResult<u64> {
    let io = |op: &str, e: std::io::Error| EngineError::io(op.to_string(), e);

    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.map_err(|e| EngineError::Io {
            op: "scanning image tree".into(),
            detail: e.to_string(),
        })?;
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }

    let mut copied = 0u64;
    for entry in walkdir::WalkDir::new(from) {
        ctx.check_cancel()?;
        let entry = entry.map_err(|e| EngineError::Io {
            op: "scanning image tree".into(),
            detail: e.to_string(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|_| EngineError::Io {
                op: "copying image tree".into(),
                detail: "path escaped the image root".into(),
            })?;
        let dest = to.join(rel);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest).map_err(|e| io("creating directory", e))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dest).map_err(|e| io("copying file", e))?;
            copied += entry.metadata().map(|m| m.len()).unwrap_or(0);
            let percent = 5 + ((copied as u128 * 85) / total.max(1) as u128) as u8;
            ctx.bus.progress(
                ProgressEvent::percent(percent)
                    .phase(OpPhase::Copying)
                    .bytes(copied, total),
            );
            ctx.bus
                .log("engine", format!("copied {}", rel.display()));
        }
    }
    Ok(copied)
}

/// The unattended-setup answer file, with only the enabled overrides.
pub fn autounattend_xml(tpm_bypass: bool, local_account: bool, privacy_defaults: bool) -> String {
    let mut first_boot = String::new();
    if tpm_bypass {
        first_boot.push_str(
            r#"        <RunSynchronousCommand wcm:action="add">
          <Order>1</Order>
          <Path>reg add HKLM\SYSTEM\Setup\LabConfig /v BypassTPMCheck /t REG_DWORD /d 1 /f</Path>
        </RunSynchronousCommand>
        <RunSynchronousCommand wcm:action="add">
          <Order>2</Order>
          <Path>reg add HKLM\SYSTEM\Setup\LabConfig /v BypassSecureBootCheck /t REG_DWORD /d 1 /f</Path>
        </RunSynchronousCommand>
"#,
        );
    }
    if local_account {
        first_boot.push_str(
            r#"        <RunSynchronousCommand wcm:action="add">
          <Order>3</Order>
          <Path>reg add HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\OOBE /v BypassNRO /t REG_DWORD /d 1 /f</Path>
        </RunSynchronousCommand>
"#,
        );
    }

    let privacy = if privacy_defaults {
        r#"      <component name="Microsoft-Windows-Shell-Setup" processorArchitecture="amd64" publicKeyToken="31bf3856ad364e35" language="neutral" versionScope="nonSxS">
        <OOBE>
          <ProtectYourPC>3</ProtectYourPC>
          <HideEULAPage>true</HideEULAPage>
        </OOBE>
      </component>
"#
    } else {
        ""
    };

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<unattend xmlns="urn:schemas-microsoft-com:unattend" xmlns:wcm="http://schemas.microsoft.com/WMIConfig/2002/State">
  <settings pass="windowsPE">
    <component name="Microsoft-Windows-Setup" processorArchitecture="amd64" publicKeyToken="31bf3856ad364e35" language="neutral" versionScope="nonSxS">
      <RunSynchronous>
{first_boot}      </RunSynchronous>
    </component>
  </settings>
  <settings pass="oobeSystem">
{privacy}  </settings>
</unattend>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestHarness;

    #[test]
    fn test_autounattend_overrides() {
        let all = autounattend_xml(true, true, true);
        assert!(all.contains("BypassTPMCheck"));
        assert!(all.contains("BypassNRO"));
        assert!(all.contains("ProtectYourPC"));

        let none = autounattend_xml(false, false, false);
        assert!(!none.contains("BypassTPMCheck"));
        assert!(!none.contains("BypassNRO"));
        assert!(!none.contains("ProtectYourPC"));
        assert!(none.starts_with("<?xml"));
    }

    #[test]
    fn test_layout_fallback_is_unsupported() {
        let mut harness = TestHarness::new();
        let args = WindowsInstallArgs {
            source: PathBuf::from("/img/win.iso"),
            device: "sdz".into(),
            label: "WININSTALL".into(),
            tpm_bypass: false,
            local_account: false,
            privacy_defaults: false,
            layout: Some("fat32".into()),
        };
        // Refused before anything touches the device or the image.
        let err = windows_install(&mut harness.ctx(), &args).unwrap_err();
        assert!(matches!(err, EngineError::Unsupported { .. }));
    }

    #[test]
    fn test_hash_image_matches_direct_hash() {
        let mut harness = TestHarness::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.img");
        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let report = hash_image(&mut harness.ctx(), &path).unwrap();
        let details = report.details.unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&data);
        assert_eq!(details["sha256"], hex::encode(hasher.finalize()));
        assert_eq!(details["size"], data.len() as u64);
    }

    #[test]
    fn test_hash_archive_roundtrip() {
        let mut harness = TestHarness::new();
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();

        let plain = dir.path().join("backup.img");
        std::fs::write(&plain, &data).unwrap();

        let gz = dir.path().join("backup.img.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(&data).unwrap();
        encoder.finish().unwrap();

        let block = 64 * 1024;
        let plain_hash = hash_archive(&harness.ctx(), &plain, false, block).unwrap();
        let gz_hash = hash_archive(&harness.ctx(), &gz, true, block).unwrap();
        // The logical stream hashes identically whatever the container.
        assert_eq!(plain_hash, gz_hash);
    }

    #[test]
    fn test_backup_refuses_existing_target() {
        let mut harness = TestHarness::new();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("backup.img");
        std::fs::write(&target, b"already here").unwrap();

        let args = BackupArgs {
            device: "sdz".into(),
            target,
            compress: false,
            overwrite: false,
        };
        let err = backup_image(&mut harness.ctx(), &args).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { ref field, .. } if field == "target"));
    }
}
