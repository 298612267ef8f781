//! Preflight safety gate
//!
//! Builds a pass/warn/block verdict for a requested operation by composing
//! independent checks. The checker mutates nothing and may be re-run
//! freely; each sub-check carries a soft deadline, and an overrun demotes
//! that check to a warning instead of failing the verdict.

use chrono::Utc;
use liboxidisk::units::MIB;
use liboxidisk::{
    BusyProcess, Device, EngineError, EngineResult, FsCheckResult, FsKind, OperationKind,
    Partition, PreflightVerdict,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::battery::BatteryProbe;
use crate::config::EngineConfig;
use crate::inspect::Inspector;
use crate::sidecar::{self, SidecarRegistry};

/// What the UI asks preflight about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightRequest {
    pub operation: OperationKind,
    /// Device or partition identifier
    pub target: String,
    #[serde(default)]
    pub fs: Option<FsKind>,
    #[serde(default)]
    pub new_size: Option<u64>,
}

enum Target {
    Device(Device),
    Partition(Device, Partition),
    /// A container reference the block-device lister cannot see; the
    /// container operations re-resolve it themselves.
    Container,
}

pub struct PreflightChecker {
    registry: Arc<SidecarRegistry>,
    config: Arc<EngineConfig>,
    battery: BatteryProbe,
}

impl PreflightChecker {
    pub fn new(registry: Arc<SidecarRegistry>, config: Arc<EngineConfig>) -> Self {
        Self {
            registry,
            config,
            battery: BatteryProbe::new(),
        }
    }

    pub fn run(
        &self,
        inspector: &Inspector,
        req: &PreflightRequest,
    ) -> EngineResult<PreflightVerdict> {
        let target = self.resolve_target(inspector, &req.target, req.operation)?;

        let mut blockers = Vec::new();
        let mut warnings = Vec::new();

        // 1. Protection
        let protection = match &target {
            Target::Device(d) => d.protection,
            Target::Partition(_, p) => p.protection,
            Target::Container => None,
        };
        if let Some(reason) = protection {
            if req.operation.is_destructive() {
                blockers.push(format!("protected:{}", reason));
            }
        }

        // 2. Sidecars
        let required = sidecar::required_for(req.operation, req.fs);
        let mut sidecars = Vec::new();
        for name in &required {
            let r = self.registry.resolve(name);
            if !r.found {
                blockers.push(format!("missing sidecar: {}", name));
            } else if let (Some(version), Some(floor)) =
                (r.version.as_deref(), sidecar::recommended_floor(name))
            {
                if sidecar::version_below(version, floor) {
                    warnings.push(format!(
                        "{} {} is older than recommended {}",
                        name, version, floor
                    ));
                }
            }
            sidecars.push(liboxidisk::SidecarStatus {
                name: name.to_string(),
                found: r.found,
                path: r.path.map(|p| p.display().to_string()),
                version: r.version,
            });
        }

        // 3. Busy processes
        let deadline = Duration::from_secs(self.config.timeouts.disk_listing_secs);
        let busy_processes = match &target {
            Target::Partition(_, p) => {
                let (procs, complete) =
                    busy_processes(&p.node, p.mount_point.as_deref(), deadline);
                if !complete {
                    warnings.push("busy-process scan timed out; list may be partial".into());
                }
                for proc in &procs {
                    warnings.push(format!(
                        "filesystem in use by {} (pid {})",
                        proc.command, proc.pid
                    ));
                }
                procs
            }
            Target::Device(_) | Target::Container => Vec::new(),
        };

        // 4. Battery
        let battery = self.battery.snapshot();
        if battery.is_laptop && !battery.on_ac {
            match battery.percent {
                Some(p) if p < self.config.battery.min_percent => {
                    blockers.push(format!(
                        "battery at {}%, below the {}% floor",
                        p, self.config.battery.min_percent
                    ));
                }
                _ if self.config.battery.warn_on_battery => {
                    warnings.push("host is running on battery power".into());
                }
                _ => {}
            }
        }

        // 5. Filesystem sanity for operations that rewrite extents
        let fs_check = if req.operation.needs_fs_sanity() {
            match &target {
                Target::Partition(_, p) => {
                    let result = self.fs_sanity(p, &mut warnings);
                    if let Some(check) = &result {
                        if !check.ok {
                            blockers.push("filesystem consistency check failed".into());
                        }
                    }
                    result
                }
                Target::Device(_) | Target::Container => None,
            }
        } else {
            None
        };

        // 6. Size/alignment plausibility
        if let Some(new_size) = req.new_size {
            self.check_size(&target, req.operation, new_size, &mut blockers, &mut warnings);
        }

        let verdict = PreflightVerdict {
            ok: blockers.is_empty(),
            operation: req.operation,
            target: req.target.clone(),
            fs: req.fs,
            new_size: req.new_size,
            blockers,
            warnings,
            busy_processes,
            battery,
            sidecars,
            fs_check,
            issued_at: Utc::now(),
        };
        debug!(target = %req.target, op = req.operation.as_str(), ok = verdict.ok, "preflight");
        Ok(verdict)
    }

    fn resolve_target(
        &self,
        inspector: &Inspector,
        identifier: &str,
        operation: OperationKind,
    ) -> EngineResult<Target> {
        let devices = inspector.list_devices(true)?;
        if let Some(d) = devices.iter().find(|d| d.identifier == identifier) {
            return Ok(Target::Device(d.clone()));
        }
        for d in devices {
            if let Some(p) = d.partition(identifier) {
                let p = p.clone();
                return Ok(Target::Partition(d, p));
            }
        }
        if matches!(operation, OperationKind::ApfsAdd | OperationKind::ApfsDelete) {
            return Ok(Target::Container);
        }
        Err(EngineError::DeviceGone {
            identifier: identifier.to_string(),
        })
    }

    /// Read-only consistency check; `None` when the filesystem family has
    /// no checker or the target is mounted.
    fn fs_sanity(&self, partition: &Partition, warnings: &mut Vec<String>) -> Option<FsCheckResult> {
        if partition.is_mounted() {
            warnings.push("target is mounted; consistency check skipped".into());
            return None;
        }
        let fs = partition.fs_type?;
        let checker = sidecar::checker_for(fs)?;
        let node = partition.node.display().to_string();

        let invocation = match self.registry.invoke(checker) {
            Ok(inv) => inv,
            // Already reported as a missing-sidecar blocker.
            Err(_) => return None,
        };
        let invocation = match fs {
            FsKind::Ext4 => invocation.args(["-n", node.as_str()]),
            FsKind::Fat32 | FsKind::Exfat => invocation.args(["-n", node.as_str()]),
            FsKind::Ntfs => invocation.args(["--no-action", node.as_str()]),
            _ => return None,
        };

        let timeout = Duration::from_secs(self.config.timeouts.fs_check_secs);
        match invocation.capture(timeout) {
            Ok(captured) if captured.timed_out => {
                warnings.push("filesystem consistency check timed out".into());
                None
            }
            Ok(captured) => Some(FsCheckResult {
                ok: captured.exit == Some(0),
                output: Some(if captured.stdout.trim().is_empty() {
                    captured.stderr
                } else {
                    captured.stdout
                }),
            }),
            Err(e) => {
                warnings.push(format!("consistency check could not run: {}", e));
                None
            }
        }
    }

    fn check_size(
        &self,
        target: &Target,
        operation: OperationKind,
        new_size: u64,
        blockers: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) {
        let available = match (operation, target) {
            (OperationKind::Create, Target::Device(d)) => {
                d.largest_gap().map(|g| g.size).unwrap_or(0)
            }
            (OperationKind::Resize, Target::Partition(d, p)) => {
                // Current size plus the gap that starts exactly at its end.
                let end = p.offset.map(|o| o + p.size);
                let free_after = end
                    .and_then(|e| d.unallocated.iter().find(|g| g.offset == e))
                    .map(|g| g.size)
                    .unwrap_or(0);
                p.size + free_after
            }
            _ => return,
        };

        if new_size > available {
            blockers.push(format!(
                "requested {} bytes exceeds the {} available",
                new_size, available
            ));
        }
        if new_size % MIB != 0 {
            warnings.push("size is not aligned to 1 MiB".into());
        }
    }
}

/// Processes holding a filesystem open, from `/proc/<pid>/fd` and `cwd`.
/// The scan stops at the deadline; the bool reports completeness.
pub fn busy_processes(
    node: &Path,
    mount_point: Option<&Path>,
    deadline: Duration,
) -> (Vec<BusyProcess>, bool) {
    let started = Instant::now();
    let mut found = Vec::new();

    let entries = match std::fs::read_dir("/proc") {
        Ok(e) => e,
        Err(_) => return (found, true),
    };

    for entry in entries.flatten() {
        if started.elapsed() >= deadline {
            return (found, false);
        }
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        let proc_path = entry.path();
        let mut hit = false;

        if let Ok(cwd) = std::fs::read_link(proc_path.join("cwd")) {
            hit = points_into(&cwd, node, mount_point);
        }
        if !hit {
            if let Ok(fds) = std::fs::read_dir(proc_path.join("fd")) {
                hit = fds
                    .flatten()
                    .filter_map(|fd| std::fs::read_link(fd.path()).ok())
                    .any(|link| points_into(&link, node, mount_point));
            }
        }

        if hit {
            let command = std::fs::read_to_string(proc_path.join("comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| format!("pid {}", pid));
            found.push(BusyProcess { pid, command });
        }
    }
    (found, true)
}

fn points_into(link: &Path, node: &Path, mount_point: Option<&Path>) -> bool {
    if link == node {
        return true;
    }
    match mount_point {
        Some(mp) if mp.as_os_str() != "/" => link.starts_with(mp),
        _ => false,
    }
}

/// Whether a device is listed in `/proc/swaps`.
pub fn swap_is_active(name: &str) -> bool {
    let Ok(swaps) = std::fs::read_to_string("/proc/swaps") else {
        return false;
    };
    let node = format!("/dev/{}", name);
    swaps
        .lines()
        .skip(1)
        .any(|line| line.split_whitespace().next() == Some(node.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_into() {
        let node = Path::new("/dev/sda3");
        let mp = Path::new("/mnt/data");
        assert!(points_into(Path::new("/dev/sda3"), node, Some(mp)));
        assert!(points_into(Path::new("/mnt/data/work/file"), node, Some(mp)));
        assert!(!points_into(Path::new("/mnt/other"), node, Some(mp)));
        // A root mount point must not mark every process busy.
        assert!(!points_into(
            Path::new("/home/user"),
            Path::new("/dev/sda2"),
            Some(Path::new("/"))
        ));
    }

    #[test]
    fn test_busy_scan_self() {
        // This test's own cwd is inside the temp mount point, so the scan
        // must find at least the test process.
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let old = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let (procs, complete) = busy_processes(
            Path::new("/dev/nonexistent"),
            Some(&canonical),
            Duration::from_secs(5),
        );
        std::env::set_current_dir(old).unwrap();

        assert!(complete);
        assert!(procs.iter().any(|p| p.pid == std::process::id()));
    }
}
