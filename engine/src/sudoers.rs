//! Sudoers fragment for no-password sidecar execution
//!
//! The desktop shell runs unprivileged and asks the engine daemon for
//! everything, but installing the engine itself needs a one-time grant.
//! The fragment is deterministic, so re-installation is byte-equal and
//! removal is exact.

use liboxidisk::{EngineError, EngineResult, OpReport};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::config::EngineConfig;
use crate::sidecar::{SidecarRegistry, CATALOG};

/// Render the fragment: one line per declared sidecar, sorted, so two
/// installs always produce identical bytes.
pub fn render_fragment(registry: &SidecarRegistry, user: &str) -> String {
    let mut paths: Vec<String> = CATALOG
        .iter()
        .map(|spec| {
            registry
                .resolve(spec.name)
                .path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| spec.candidates[0].to_string())
        })
        .collect();
    paths.sort_unstable();
    paths.dedup();

    let mut out = String::from(
        "# Managed by oxidisk-engined; do not edit.\n# Grants the engine helper password-less access to its disk sidecars.\n",
    );
    for path in paths {
        out.push_str(&format!("{} ALL=(root) NOPASSWD: {}\n", user, path));
    }
    out
}

/// Install the fragment. Idempotent: an identical existing fragment is
/// left untouched.
pub fn install(registry: &SidecarRegistry, config: &EngineConfig) -> EngineResult<OpReport> {
    let fragment = render_fragment(registry, &config.engine.helper_user);
    let target = &config.paths.sudoers_fragment;

    if let Ok(existing) = std::fs::read_to_string(target) {
        if existing == fragment {
            return Ok(OpReport::ok());
        }
    }

    let io = |op: &str, e: std::io::Error| EngineError::io(op.to_string(), e);
    let dir = target
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).map_err(|e| io("creating sudoers directory", e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| io("sudoers write", e))?;
    tmp.write_all(fragment.as_bytes())
        .map_err(|e| io("sudoers write", e))?;
    let mut perms = tmp
        .as_file()
        .metadata()
        .map_err(|e| io("sudoers write", e))?
        .permissions();
    perms.set_mode(0o440);
    tmp.as_file()
        .set_permissions(perms)
        .map_err(|e| io("sudoers write", e))?;

    // Validate before the fragment goes live; a bad sudoers file can lock
    // the administrator out.
    let mut report = OpReport::ok();
    if registry.resolve("visudo").found {
        let fragment_path = tmp.path().display().to_string();
        let check = registry
            .invoke("visudo")?
            .args(["-c", "-f", fragment_path.as_str()])
            .capture(Duration::from_secs(5))?;
        if !check.success() {
            return Err(EngineError::SubprocessFailed {
                binary: "visudo".into(),
                exit: check.exit,
                stderr_tail: check.stderr.lines().take(4).collect::<Vec<_>>().join("\n"),
            });
        }
    } else {
        report = report.warn("visudo not found; fragment installed unvalidated");
    }

    tmp.persist(target).map_err(|e| io("sudoers write", e.error))?;
    info!(path = %target.display(), "sudoers fragment installed");
    Ok(report)
}

/// Remove the fragment. A missing file is a no-op.
pub fn remove(config: &EngineConfig) -> EngineResult<OpReport> {
    match std::fs::remove_file(&config.paths.sudoers_fragment) {
        Ok(()) => Ok(OpReport::ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OpReport::ok()),
        Err(e) => Err(EngineError::io("removing sudoers fragment", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.paths.sudoers_fragment = dir.path().join("sudoers.d/oxidisk-helper");
        config
    }

    #[test]
    fn test_install_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SidecarRegistry::new();
        let config = test_config(&dir);

        install(&registry, &config).unwrap();
        let first = std::fs::read(&config.paths.sudoers_fragment).unwrap();
        install(&registry, &config).unwrap();
        let second = std::fs::read(&config.paths.sudoers_fragment).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fragment_shape() {
        let registry = SidecarRegistry::new();
        let fragment = render_fragment(&registry, "oxidisk");
        assert!(fragment.starts_with('#'));
        assert!(fragment.contains("oxidisk ALL=(root) NOPASSWD: "));
        // Deterministic ordering.
        assert_eq!(fragment, render_fragment(&registry, "oxidisk"));
    }

    #[test]
    fn test_remove_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SidecarRegistry::new();
        let config = test_config(&dir);

        install(&registry, &config).unwrap();
        remove(&config).unwrap();
        assert!(!config.paths.sudoers_fragment.exists());
        remove(&config).unwrap();
    }
}
