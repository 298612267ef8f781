//! Engine configuration

use anyhow::Result;
use liboxidisk::VolumeRole;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    /// System protection set
    #[serde(default)]
    pub protection: ProtectionConfig,

    #[serde(default)]
    pub battery: BatteryConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub engine: EngineTuning,
}

impl EngineConfig {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Unix socket the engine listens on
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Single-slot operation journal
    #[serde(default = "default_journal")]
    pub journal: PathBuf,

    /// Where the engine creates managed mount points
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,

    /// Sudoers fragment installed by `install_sudoers_helper`
    #[serde(default = "default_sudoers")]
    pub sudoers_fragment: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            journal: default_journal(),
            mount_root: default_mount_root(),
            sudoers_fragment: default_sudoers(),
        }
    }
}

/// What counts as system-critical and therefore immutable from the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Mount points whose backing partitions are protected
    #[serde(default = "default_protected_mounts")]
    pub mount_points: Vec<PathBuf>,

    /// Partition type GUIDs that are protected regardless of contents
    #[serde(default = "default_protected_parttypes")]
    pub parttype_guids: Vec<String>,

    /// Container volume roles that are read-only to the engine
    #[serde(default = "default_protected_roles")]
    pub roles: Vec<VolumeRole>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            mount_points: default_protected_mounts(),
            parttype_guids: default_protected_parttypes(),
            roles: default_protected_roles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryConfig {
    /// Warn when a laptop runs on battery at all
    #[serde(default = "default_true")]
    pub warn_on_battery: bool,

    /// Block destructive operations below this battery percentage
    #[serde(default = "default_battery_floor")]
    pub min_percent: u8,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            warn_on_battery: true,
            min_percent: default_battery_floor(),
        }
    }
}

/// Soft deadlines for inspection and preflight steps. Overruns downgrade
/// the step to a warning instead of failing the verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_list_secs")]
    pub disk_listing_secs: u64,

    #[serde(default = "default_fsck_secs")]
    pub fs_check_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            disk_listing_secs: default_list_secs(),
            fs_check_secs: default_fsck_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTuning {
    /// Copy block size in bytes; rounded to the device block size at use
    #[serde(default = "default_copy_block")]
    pub copy_block_bytes: u64,

    /// How long a preflight verdict stays fresh
    #[serde(default = "default_preflight_ttl")]
    pub preflight_ttl_secs: u64,

    /// The user granted no-password sidecar execution
    #[serde(default = "default_helper_user")]
    pub helper_user: String,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            copy_block_bytes: default_copy_block(),
            preflight_ttl_secs: default_preflight_ttl(),
            helper_user: default_helper_user(),
        }
    }
}

fn default_socket() -> PathBuf {
    PathBuf::from("/run/oxidisk/engine.sock")
}

fn default_journal() -> PathBuf {
    PathBuf::from("/var/lib/oxidisk/journal.json")
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/run/oxidisk/mnt")
}

fn default_sudoers() -> PathBuf {
    PathBuf::from("/etc/sudoers.d/oxidisk-helper")
}

fn default_protected_mounts() -> Vec<PathBuf> {
    ["/", "/boot", "/boot/efi", "/efi", "/usr", "/var"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn default_protected_parttypes() -> Vec<String> {
    vec![
        // EFI system partition
        "c12a7328-f81f-11d2-ba4b-00a0c93ec93b".into(),
        // BIOS boot
        "21686148-6449-6e6f-744e-656564454649".into(),
        // Windows recovery environment
        "de94bba4-06d1-4d40-a16a-bfd50179d6ac".into(),
    ]
}

fn default_protected_roles() -> Vec<VolumeRole> {
    vec![
        VolumeRole::System,
        VolumeRole::Preboot,
        VolumeRole::Recovery,
        VolumeRole::Vm,
    ]
}

fn default_true() -> bool {
    true
}

fn default_battery_floor() -> u8 {
    25
}

fn default_list_secs() -> u64 {
    5
}

fn default_fsck_secs() -> u64 {
    15
}

fn default_copy_block() -> u64 {
    liboxidisk::units::COPY_BLOCK
}

fn default_preflight_ttl() -> u64 {
    120
}

fn default_helper_user() -> String {
    "oxidisk".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.battery.min_percent, 25);
        assert_eq!(cfg.engine.copy_block_bytes, 4 * 1024 * 1024);
        assert!(cfg.protection.mount_points.contains(&PathBuf::from("/")));
    }

    #[test]
    fn test_partial_yaml() {
        let cfg: EngineConfig = serde_yaml::from_str("battery:\n  min_percent: 10\n").unwrap();
        assert_eq!(cfg.battery.min_percent, 10);
        assert!(cfg.battery.warn_on_battery);
        assert_eq!(cfg.timeouts.fs_check_secs, 15);
    }
}
