//! Size strings, alignment, and per-filesystem naming rules

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

/// One mebibyte; the engine aligns every partition boundary to this.
pub const MIB: u64 = 1024 * 1024;

/// Default block size for byte-copy loops.
pub const COPY_BLOCK: u64 = 4 * MIB;

/// Filesystem families the engine can create and repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsKind {
    Fat32,
    Exfat,
    Ntfs,
    Ext4,
    Apfs,
    Swap,
    #[serde(other)]
    Other,
}

impl FsKind {
    /// Resolve an `lsblk` fstype string to a family.
    pub fn from_probe(fstype: &str) -> Option<FsKind> {
        match fstype {
            "vfat" | "fat32" => Some(FsKind::Fat32),
            "exfat" => Some(FsKind::Exfat),
            "ntfs" => Some(FsKind::Ntfs),
            "ext4" => Some(FsKind::Ext4),
            "apfs" => Some(FsKind::Apfs),
            "swap" => Some(FsKind::Swap),
            "" => None,
            _ => Some(FsKind::Other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsKind::Fat32 => "fat32",
            FsKind::Exfat => "exfat",
            FsKind::Ntfs => "ntfs",
            FsKind::Ext4 => "ext4",
            FsKind::Apfs => "apfs",
            FsKind::Swap => "swap",
            FsKind::Other => "other",
        }
    }

    /// Whether the engine remounts this filesystem after formatting.
    pub fn natively_mountable(&self) -> bool {
        !matches!(self, FsKind::Swap | FsKind::Apfs | FsKind::Other)
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FsKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fat32" | "vfat" => Ok(FsKind::Fat32),
            "exfat" => Ok(FsKind::Exfat),
            "ntfs" => Ok(FsKind::Ntfs),
            "ext4" => Ok(FsKind::Ext4),
            "apfs" => Ok(FsKind::Apfs),
            "swap" => Ok(FsKind::Swap),
            other => Err(EngineError::InvalidInput {
                field: "fs".into(),
                reason: format!("unknown filesystem: {}", other),
            }),
        }
    }
}

/// Parse a user-facing size string: `integer ('.' digit+)? ('m'|'g')`.
///
/// The result is canonical bytes, aligned down to 1 MiB.
pub fn parse_size(s: &str) -> Result<u64, EngineError> {
    let s = s.trim().to_ascii_lowercase();
    let invalid = |reason: &str| EngineError::InvalidInput {
        field: "size".into(),
        reason: reason.into(),
    };

    if !s.is_ascii() {
        return Err(invalid("size must end in 'm' or 'g'"));
    }
    let (number, unit) = s.split_at(s.len().saturating_sub(1));
    let multiplier = match unit {
        "m" => MIB,
        "g" => 1024 * MIB,
        _ => return Err(invalid("size must end in 'm' or 'g'")),
    };

    if number.is_empty() {
        return Err(invalid("missing number"));
    }
    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (number, None),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("malformed integer part"));
    }
    if let Some(f) = frac_part {
        if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("malformed fraction"));
        }
    }

    let whole: u64 = int_part
        .parse()
        .map_err(|_| invalid("integer part out of range"))?;
    let mut bytes = whole
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("size out of range"))?;

    if let Some(f) = frac_part {
        // Scale the fraction without going through floats. Anything past
        // nine digits is below 1 MiB resolution anyway.
        let f = &f[..f.len().min(9)];
        let digits: u128 = f.parse().map_err(|_| invalid("fraction out of range"))?;
        let scale = 10u128.pow(f.len() as u32);
        let frac_bytes = (digits * multiplier as u128 / scale) as u64;
        bytes = bytes
            .checked_add(frac_bytes)
            .ok_or_else(|| invalid("size out of range"))?;
    }

    Ok(align_down(bytes, MIB))
}

/// Round down to a multiple of `align`. `align` must be non-zero.
pub fn align_down(value: u64, align: u64) -> u64 {
    value - value % align
}

/// Round up to a multiple of `align`. `align` must be non-zero.
pub fn align_up(value: u64, align: u64) -> u64 {
    match value % align {
        0 => value,
        rem => value + (align - rem),
    }
}

/// Validate a volume label against the per-filesystem rules.
pub fn validate_label(fs: FsKind, label: &str) -> Result<(), EngineError> {
    let invalid = |reason: String| EngineError::InvalidInput {
        field: "label".into(),
        reason,
    };

    match fs {
        FsKind::Fat32 => {
            let ok = label.len() <= 11
                && label
                    .bytes()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b"_- ".contains(&b));
            if !ok {
                return Err(invalid("fat32 \u{2264} 11 chars uppercase".into()));
            }
        }
        FsKind::Exfat => {
            if label.chars().count() > 15 {
                return Err(invalid("exfat \u{2264} 15 chars".into()));
            }
        }
        FsKind::Ntfs | FsKind::Ext4 | FsKind::Apfs => {
            if label.chars().count() > 32 {
                return Err(invalid(format!("{} \u{2264} 32 chars", fs)));
            }
        }
        FsKind::Swap => {
            if !label.is_empty() {
                return Err(invalid("swap takes no label".into()));
            }
        }
        FsKind::Other => {
            return Err(invalid("unsupported filesystem".into()));
        }
    }
    Ok(())
}

/// Validate a requested UUID against the per-filesystem rules.
///
/// ext4 additionally accepts the literal `random`, which the maker resolves.
pub fn validate_uuid(fs: FsKind, value: &str) -> Result<(), EngineError> {
    let invalid = |reason: &str| EngineError::InvalidInput {
        field: "uuid".into(),
        reason: reason.into(),
    };

    match fs {
        FsKind::Ext4 => {
            if value != "random" && uuid::Uuid::parse_str(value).is_err() {
                return Err(invalid("ext4 uuid must be RFC-4122 form or 'random'"));
            }
        }
        FsKind::Apfs => {
            if uuid::Uuid::parse_str(value).is_err() {
                return Err(invalid("apfs uuid must be RFC-4122 form"));
            }
        }
        _ => return Err(invalid("filesystem does not take a uuid")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_basic() {
        assert_eq!(parse_size("100m").unwrap(), 100 * MIB);
        assert_eq!(parse_size("2g").unwrap(), 2048 * MIB);
        assert_eq!(parse_size("1.5g").unwrap(), 1536 * MIB);
    }

    #[test]
    fn test_parse_size_aligns_down() {
        // 0.3m is below one alignment block
        assert_eq!(parse_size("0.3m").unwrap(), 0);
        assert_eq!(parse_size("2.25g").unwrap(), 2304 * MIB);
    }

    #[test]
    fn test_parse_size_rejects() {
        assert!(parse_size("100").is_err());
        assert!(parse_size("m").is_err());
        assert!(parse_size("1..5g").is_err());
        assert!(parse_size("-1m").is_err());
        assert!(parse_size("1,5g").is_err());
        assert!(parse_size(".5g").is_err());
    }

    #[test]
    fn test_align() {
        assert_eq!(align_down(MIB + 1, MIB), MIB);
        assert_eq!(align_down(MIB, MIB), MIB);
        assert_eq!(align_up(MIB + 1, MIB), 2 * MIB);
        assert_eq!(align_up(0, MIB), 0);
    }

    #[test]
    fn test_fat32_label() {
        assert!(validate_label(FsKind::Fat32, "OXI").is_ok());
        assert!(validate_label(FsKind::Fat32, "DATA_01").is_ok());
        assert!(validate_label(FsKind::Fat32, "too-long-label-here").is_err());
        assert!(validate_label(FsKind::Fat32, "lower").is_err());
    }

    #[test]
    fn test_other_labels() {
        assert!(validate_label(FsKind::Exfat, "Sixteen chars!!!").is_err());
        assert!(validate_label(FsKind::Exfat, "Fifteen chars!!").is_ok());
        assert!(validate_label(FsKind::Ntfs, &"x".repeat(32)).is_ok());
        assert!(validate_label(FsKind::Ext4, &"x".repeat(33)).is_err());
        assert!(validate_label(FsKind::Swap, "").is_ok());
        assert!(validate_label(FsKind::Swap, "x").is_err());
    }

    #[test]
    fn test_uuid_rules() {
        assert!(validate_uuid(FsKind::Ext4, "random").is_ok());
        assert!(validate_uuid(FsKind::Ext4, "c4966089-7a33-43c0-b734-653f1916e01f").is_ok());
        assert!(validate_uuid(FsKind::Ext4, "not-a-uuid").is_err());
        assert!(validate_uuid(FsKind::Apfs, "random").is_err());
        assert!(validate_uuid(FsKind::Fat32, "c4966089-7a33-43c0-b734-653f1916e01f").is_err());
    }

    #[test]
    fn test_fs_probe() {
        assert_eq!(FsKind::from_probe("vfat"), Some(FsKind::Fat32));
        assert_eq!(FsKind::from_probe("ext4"), Some(FsKind::Ext4));
        assert_eq!(FsKind::from_probe(""), None);
        assert_eq!(FsKind::from_probe("btrfs"), Some(FsKind::Other));
    }
}
