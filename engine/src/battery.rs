//! Host power state for the preflight battery check

use liboxidisk::BatterySnapshot;
use std::fs;
use std::path::{Path, PathBuf};

pub struct BatteryProbe {
    power_supply_path: PathBuf,
}

impl BatteryProbe {
    pub fn new() -> Self {
        Self {
            power_supply_path: PathBuf::from("/sys/class/power_supply"),
        }
    }

    #[cfg(test)]
    fn with_root(path: PathBuf) -> Self {
        Self {
            power_supply_path: path,
        }
    }

    /// Snapshot the host power state. A host without a battery reports
    /// `is_laptop = false` and is treated as mains-powered.
    pub fn snapshot(&self) -> BatterySnapshot {
        let mut ac_online = Vec::new();
        let mut capacities = Vec::new();

        let entries = match fs::read_dir(&self.power_supply_path) {
            Ok(entries) => entries,
            Err(_) => {
                return BatterySnapshot {
                    is_laptop: false,
                    on_ac: true,
                    percent: None,
                }
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let supply_type = read_sysfs(&path.join("type")).unwrap_or_default();
            match supply_type.trim() {
                "Mains" | "USB" => {
                    ac_online.push(read_sysfs(&path.join("online")).as_deref() == Some("1"));
                }
                "Battery" => {
                    if let Some(capacity) =
                        read_sysfs(&path.join("capacity")).and_then(|s| s.parse::<u8>().ok())
                    {
                        capacities.push(capacity.min(100));
                    }
                }
                _ => {}
            }
        }

        let is_laptop = !capacities.is_empty();
        let on_ac = !is_laptop || ac_online.iter().any(|&o| o) || ac_online.is_empty();
        let percent = if capacities.is_empty() {
            None
        } else {
            Some((capacities.iter().map(|&c| c as u32).sum::<u32>() / capacities.len() as u32) as u8)
        };

        BatterySnapshot {
            is_laptop,
            on_ac,
            percent,
        }
    }
}

impl Default for BatteryProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn read_sysfs(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(entries: &[(&str, &[(&str, &str)])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, attrs) in entries {
            let path = dir.path().join(name);
            fs::create_dir_all(&path).unwrap();
            for (attr, value) in *attrs {
                fs::write(path.join(attr), format!("{}\n", value)).unwrap();
            }
        }
        dir
    }

    #[test]
    fn test_desktop_without_battery() {
        let dir = fixture(&[("AC", &[("type", "Mains"), ("online", "1")])]);
        let snap = BatteryProbe::with_root(dir.path().to_path_buf()).snapshot();
        assert!(!snap.is_laptop);
        assert!(snap.on_ac);
        assert_eq!(snap.percent, None);
    }

    #[test]
    fn test_laptop_discharging() {
        let dir = fixture(&[
            ("AC", &[("type", "Mains"), ("online", "0")]),
            ("BAT0", &[("type", "Battery"), ("capacity", "42")]),
        ]);
        let snap = BatteryProbe::with_root(dir.path().to_path_buf()).snapshot();
        assert!(snap.is_laptop);
        assert!(!snap.on_ac);
        assert_eq!(snap.percent, Some(42));
    }

    #[test]
    fn test_missing_sysfs_treated_as_mains() {
        let snap = BatteryProbe::with_root(PathBuf::from("/does/not/exist")).snapshot();
        assert!(!snap.is_laptop);
        assert!(snap.on_ac);
    }
}
