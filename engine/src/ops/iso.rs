//! Minimal ISO9660 reader for image classification
//!
//! Reads the primary volume descriptor and walks the root directory, just
//! enough to tell a Windows installer from a Linux live image without
//! mounting anything.

use liboxidisk::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

pub const SECTOR: u64 = 2048;
/// The primary volume descriptor lives in sector 16.
const PVD_SECTOR: u64 = 16;

/// Classification of an image file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInspection {
    #[serde(rename = "isWindows")]
    pub is_windows: bool,
    /// Short machine reason string
    pub reason: String,
    pub brand: String,
    pub label: String,
}

/// One root-level directory record.
#[derive(Debug, Clone)]
struct DirRecord {
    name: String,
    is_dir: bool,
    extent: u64,
    size: u64,
}

/// Classify an image by its boot records and root directory contents.
pub fn inspect_image(path: &Path) -> EngineResult<ImageInspection> {
    let file = File::open(path).map_err(|e| EngineError::io("opening image", e))?;

    let mut pvd = [0u8; SECTOR as usize];
    if file.read_exact_at(&mut pvd, PVD_SECTOR * SECTOR).is_err()
        || pvd[0] != 1
        || &pvd[1..6] != b"CD001"
    {
        return Ok(ImageInspection {
            is_windows: false,
            reason: "no iso9660 volume descriptor".into(),
            brand: "raw".into(),
            label: String::new(),
        });
    }

    let label = String::from_utf8_lossy(&pvd[40..72]).trim().to_string();

    // Root directory record sits at a fixed offset inside the PVD.
    let root = parse_record(&pvd[156..190]).ok_or_else(|| malformed("root directory record"))?;
    let entries = read_directory(&file, root.extent, root.size)?;

    let has = |name: &str, dir: bool| {
        entries
            .iter()
            .any(|e| e.is_dir == dir && e.name.eq_ignore_ascii_case(name))
    };

    if has("bootmgr", false) {
        if let Some(sources) = entries
            .iter()
            .find(|e| e.is_dir && e.name.eq_ignore_ascii_case("sources"))
        {
            let sources = read_directory(&file, sources.extent, sources.size)?;
            let image = sources.iter().find(|e| {
                !e.is_dir
                    && (e.name.eq_ignore_ascii_case("install.wim")
                        || e.name.eq_ignore_ascii_case("install.esd"))
            });
            if let Some(image) = image {
                return Ok(ImageInspection {
                    is_windows: true,
                    reason: format!("bootmgr+sources/{} present", image.name.to_lowercase()),
                    brand: "windows".into(),
                    label,
                });
            }
        }
        return Ok(ImageInspection {
            is_windows: true,
            reason: "bootmgr present".into(),
            brand: "windows".into(),
            label,
        });
    }

    if has("isolinux", true) || has("syslinux", true) {
        return Ok(ImageInspection {
            is_windows: false,
            reason: "isolinux present".into(),
            brand: "linux".into(),
            label,
        });
    }
    if has("boot", true) && has("efi", true) {
        return Ok(ImageInspection {
            is_windows: false,
            reason: "boot+efi trees present".into(),
            brand: "linux".into(),
            label,
        });
    }

    Ok(ImageInspection {
        is_windows: false,
        reason: "no recognized boot markers".into(),
        brand: "unknown".into(),
        label,
    })
}

fn malformed(what: &str) -> EngineError {
    EngineError::Io {
        op: "parsing iso9660".into(),
        detail: format!("malformed {}", what),
    }
}

/// Decode one directory record. `None` for empty padding.
fn parse_record(buf: &[u8]) -> Option<DirRecord> {
    let len = *buf.first()? as usize;
    if len < 34 || buf.len() < len {
        return None;
    }
    let extent = u32::from_le_bytes(buf[2..6].try_into().ok()?) as u64;
    let size = u32::from_le_bytes(buf[10..14].try_into().ok()?) as u64;
    let flags = buf[25];
    let name_len = buf[32] as usize;
    if 33 + name_len > len {
        return None;
    }

    let raw = &buf[33..33 + name_len];
    let name = match raw {
        [0x00] => ".".to_string(),
        [0x01] => "..".to_string(),
        _ => {
            let s = String::from_utf8_lossy(raw);
            // Strip the ";1" version suffix and a bare trailing dot.
            let s = s.split(';').next().unwrap_or("");
            s.trim_end_matches('.').to_string()
        }
    };

    Some(DirRecord {
        name,
        is_dir: flags & 0x02 != 0,
        extent,
        size,
    })
}

/// All records of a directory extent. Records never cross sector
/// boundaries; a zero length byte skips to the next sector.
fn read_directory(file: &File, extent: u64, size: u64) -> EngineResult<Vec<DirRecord>> {
    // Directory extents are small; a runaway size field must not make us
    // allocate gigabytes.
    let size = size.min(64 * SECTOR);
    let mut buf = vec![0u8; size as usize];
    file.read_exact_at(&mut buf, extent * SECTOR)
        .map_err(|e| EngineError::io("reading iso directory", e))?;

    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let len = buf[pos] as usize;
        if len == 0 {
            pos = (pos / SECTOR as usize + 1) * SECTOR as usize;
            continue;
        }
        if let Some(record) = parse_record(&buf[pos..]) {
            if record.name != "." && record.name != ".." {
                records.push(record);
            }
        }
        pos += len;
    }
    Ok(records)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Build a directory record in a sector buffer.
    pub fn record(name: &[u8], is_dir: bool, extent: u32, size: u32) -> Vec<u8> {
        let name_len = name.len();
        let len = 33 + name_len + (33 + name_len) % 2;
        let mut rec = vec![0u8; len];
        rec[0] = len as u8;
        rec[2..6].copy_from_slice(&extent.to_le_bytes());
        rec[6..10].copy_from_slice(&extent.to_be_bytes());
        rec[10..14].copy_from_slice(&size.to_le_bytes());
        rec[14..18].copy_from_slice(&size.to_be_bytes());
        rec[25] = if is_dir { 0x02 } else { 0 };
        rec[32] = name_len as u8;
        rec[33..33 + name_len].copy_from_slice(name);
        rec
    }

    /// Assemble a minimal single-descriptor ISO with the given root and
    /// subdirectory contents.
    pub fn build_iso(
        label: &str,
        root_entries: &[Vec<u8>],
        extra_sectors: &[(u64, Vec<Vec<u8>>)],
    ) -> Vec<u8> {
        let sectors = 24;
        let mut image = vec![0u8; sectors * SECTOR as usize];

        let pvd_at = (PVD_SECTOR * SECTOR) as usize;
        image[pvd_at] = 1;
        image[pvd_at + 1..pvd_at + 6].copy_from_slice(b"CD001");
        let mut padded = [b' '; 32];
        padded[..label.len()].copy_from_slice(label.as_bytes());
        image[pvd_at + 40..pvd_at + 72].copy_from_slice(&padded);

        // Root directory: sector 20.
        let root_size: usize = root_entries.iter().map(Vec::len).sum();
        let root = record(&[0x00], true, 20, root_size as u32);
        image[pvd_at + 156..pvd_at + 156 + root.len()].copy_from_slice(&root);

        let mut pos = (20 * SECTOR) as usize;
        for entry in root_entries {
            image[pos..pos + entry.len()].copy_from_slice(entry);
            pos += entry.len();
        }

        for (sector, entries) in extra_sectors {
            let mut pos = (sector * SECTOR) as usize;
            for entry in entries {
                image[pos..pos + entry.len()].copy_from_slice(entry);
                pos += entry.len();
            }
        }
        image
    }

    fn write_temp(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.iso");
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_windows_iso_detected() {
        let iso = build_iso(
            "CCCOMA_X64FRE_EN-US_DV9",
            &[
                record(b"BOOTMGR", false, 22, 512),
                record(b"SOURCES", true, 21, 2048),
            ],
            &[(21, vec![record(b"INSTALL.WIM;1", false, 23, 4096)])],
        );
        let (_dir, path) = write_temp(&iso);

        let inspection = inspect_image(&path).unwrap();
        assert!(inspection.is_windows);
        assert_eq!(inspection.brand, "windows");
        assert_eq!(inspection.reason, "bootmgr+sources/install.wim present");
        assert_eq!(inspection.label, "CCCOMA_X64FRE_EN-US_DV9");
    }

    #[test]
    fn test_linux_iso_detected() {
        let iso = build_iso(
            "UBUNTU_24_04",
            &[
                record(b"ISOLINUX", true, 21, 2048),
                record(b"CASPER", true, 22, 2048),
            ],
            &[],
        );
        let (_dir, path) = write_temp(&iso);

        let inspection = inspect_image(&path).unwrap();
        assert!(!inspection.is_windows);
        assert_eq!(inspection.brand, "linux");
        assert_eq!(inspection.label, "UBUNTU_24_04");
    }

    #[test]
    fn test_raw_image_not_iso() {
        let (_dir, path) = write_temp(&vec![0u8; 4096]);
        let inspection = inspect_image(&path).unwrap();
        assert!(!inspection.is_windows);
        assert_eq!(inspection.brand, "raw");
    }

    #[test]
    fn test_wire_field_names() {
        let inspection = ImageInspection {
            is_windows: true,
            reason: "bootmgr present".into(),
            brand: "windows".into(),
            label: "WIN11".into(),
        };
        let v = serde_json::to_value(&inspection).unwrap();
        assert!(v.get("isWindows").is_some());
    }
}
