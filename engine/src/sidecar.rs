//! Sidecar registry and the single child-process run abstraction
//!
//! Every external binary the engine composes is declared here with its
//! discovery strategy. All invocations go through [`Invocation`]: one place
//! that owns the process group, the stdout line streaming, the per-binary
//! progress parser, and cancellation.

use liboxidisk::{EngineError, EngineResult, ProgressEvent, SidecarStatus};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::bus::Bus;

/// Lines of stderr kept for error reports.
const STDERR_TAIL: usize = 8;

/// Discovery strategy for one external binary.
pub struct SidecarSpec {
    /// Catalog key, also the invoked binary name
    pub name: &'static str,
    /// Human name for the status screen
    pub display: &'static str,
    /// Absolute paths tried before falling back to PATH lookup
    pub candidates: &'static [&'static str],
    /// Arguments for the version probe; empty disables probing
    pub version_args: &'static [&'static str],
}

pub const CATALOG: &[SidecarSpec] = &[
    SidecarSpec {
        name: "lsblk",
        display: "block device lister",
        candidates: &["/usr/bin/lsblk", "/bin/lsblk"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "sfdisk",
        display: "partition table editor",
        candidates: &["/usr/sbin/sfdisk", "/sbin/sfdisk"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "blockdev",
        display: "block device control",
        candidates: &["/usr/sbin/blockdev", "/sbin/blockdev"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "mkfs.vfat",
        display: "FAT32 maker",
        candidates: &["/usr/sbin/mkfs.vfat", "/sbin/mkfs.vfat"],
        version_args: &[],
    },
    SidecarSpec {
        name: "mkfs.exfat",
        display: "exFAT maker",
        candidates: &["/usr/sbin/mkfs.exfat", "/sbin/mkfs.exfat"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "mkfs.ntfs",
        display: "NTFS maker",
        candidates: &["/usr/sbin/mkfs.ntfs", "/sbin/mkfs.ntfs"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "mkfs.ext4",
        display: "ext4 maker",
        candidates: &["/usr/sbin/mkfs.ext4", "/sbin/mkfs.ext4"],
        version_args: &["-V"],
    },
    SidecarSpec {
        name: "mkswap",
        display: "swap maker",
        candidates: &["/usr/sbin/mkswap", "/sbin/mkswap"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "e2fsck",
        display: "ext4 checker",
        candidates: &["/usr/sbin/e2fsck", "/sbin/e2fsck"],
        version_args: &["-V"],
    },
    SidecarSpec {
        name: "fsck.vfat",
        display: "FAT checker",
        candidates: &["/usr/sbin/fsck.vfat", "/sbin/fsck.vfat"],
        version_args: &[],
    },
    SidecarSpec {
        name: "fsck.exfat",
        display: "exFAT checker",
        candidates: &["/usr/sbin/fsck.exfat", "/sbin/fsck.exfat"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "ntfsfix",
        display: "NTFS checker",
        candidates: &["/usr/bin/ntfsfix", "/bin/ntfsfix"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "resize2fs",
        display: "ext4 resizer",
        candidates: &["/usr/sbin/resize2fs", "/sbin/resize2fs"],
        version_args: &["-V"],
    },
    SidecarSpec {
        name: "ntfsresize",
        display: "NTFS resizer",
        candidates: &["/usr/bin/ntfsresize", "/bin/ntfsresize"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "tune2fs",
        display: "ext4 tuner",
        candidates: &["/usr/sbin/tune2fs", "/sbin/tune2fs"],
        version_args: &["-V"],
    },
    SidecarSpec {
        name: "fatlabel",
        display: "FAT labeler",
        candidates: &["/usr/sbin/fatlabel", "/sbin/fatlabel"],
        version_args: &[],
    },
    SidecarSpec {
        name: "exfatlabel",
        display: "exFAT labeler",
        candidates: &["/usr/sbin/exfatlabel", "/sbin/exfatlabel"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "ntfslabel",
        display: "NTFS labeler",
        candidates: &["/usr/bin/ntfslabel", "/bin/ntfslabel"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "mount",
        display: "mounter",
        candidates: &["/usr/bin/mount", "/bin/mount"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "umount",
        display: "unmounter",
        candidates: &["/usr/bin/umount", "/bin/umount"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "eject",
        display: "media ejector",
        candidates: &["/usr/bin/eject", "/bin/eject"],
        version_args: &["--version"],
    },
    SidecarSpec {
        name: "diskutil",
        display: "container volume manager",
        candidates: &["/usr/sbin/diskutil"],
        version_args: &[],
    },
    SidecarSpec {
        name: "visudo",
        display: "sudoers validator",
        candidates: &["/usr/sbin/visudo", "/sbin/visudo"],
        version_args: &["--version"],
    },
];

/// Sidecars an operation family needs before it may be dispatched.
pub fn required_for(op: liboxidisk::OperationKind, fs: Option<liboxidisk::FsKind>) -> Vec<&'static str> {
    use liboxidisk::{FsKind, OperationKind};

    // Everything except container management starts from a topology scan.
    let mut names: Vec<&'static str> = match op {
        OperationKind::ApfsAdd | OperationKind::ApfsDelete => Vec::new(),
        _ => vec!["lsblk"],
    };
    match op {
        OperationKind::Wipe | OperationKind::CreateTable | OperationKind::Create => {
            names.extend(["sfdisk", "blockdev"]);
        }
        OperationKind::Delete => names.extend(["sfdisk", "blockdev", "umount"]),
        OperationKind::Format => names.push("umount"),
        OperationKind::Resize | OperationKind::Move | OperationKind::Copy => {
            names.extend(["sfdisk", "blockdev", "umount"]);
        }
        OperationKind::Flash | OperationKind::Backup => names.push("umount"),
        OperationKind::WindowsInstall => names.extend(["sfdisk", "blockdev", "mount", "umount"]),
        OperationKind::Mount => names.push("mount"),
        OperationKind::Unmount => names.push("umount"),
        OperationKind::Eject => names.extend(["umount", "eject"]),
        OperationKind::ApfsAdd | OperationKind::ApfsDelete => names.push("diskutil"),
        OperationKind::Check | OperationKind::LabelUuid => {}
    }
    match (op, fs) {
        (OperationKind::Wipe | OperationKind::Create | OperationKind::Format, Some(fs)) => {
            if let Some(maker) = maker_for(fs) {
                names.push(maker);
            }
        }
        (OperationKind::Check, Some(fs)) => {
            if let Some(checker) = checker_for(fs) {
                names.push(checker);
            }
        }
        (OperationKind::Resize, Some(FsKind::Ext4)) => names.extend(["e2fsck", "resize2fs"]),
        (OperationKind::Resize, Some(FsKind::Ntfs)) => names.push("ntfsresize"),
        (OperationKind::LabelUuid, Some(fs)) => {
            if let Some(labeler) = labeler_for(fs) {
                names.push(labeler);
            }
        }
        _ => {}
    }
    names.sort_unstable();
    names.dedup();
    names
}

pub fn maker_for(fs: liboxidisk::FsKind) -> Option<&'static str> {
    use liboxidisk::FsKind;
    match fs {
        FsKind::Fat32 => Some("mkfs.vfat"),
        FsKind::Exfat => Some("mkfs.exfat"),
        FsKind::Ntfs => Some("mkfs.ntfs"),
        FsKind::Ext4 => Some("mkfs.ext4"),
        FsKind::Swap => Some("mkswap"),
        FsKind::Apfs | FsKind::Other => None,
    }
}

pub fn checker_for(fs: liboxidisk::FsKind) -> Option<&'static str> {
    use liboxidisk::FsKind;
    match fs {
        FsKind::Fat32 => Some("fsck.vfat"),
        FsKind::Exfat => Some("fsck.exfat"),
        FsKind::Ntfs => Some("ntfsfix"),
        FsKind::Ext4 => Some("e2fsck"),
        FsKind::Apfs | FsKind::Swap | FsKind::Other => None,
    }
}

pub fn labeler_for(fs: liboxidisk::FsKind) -> Option<&'static str> {
    use liboxidisk::FsKind;
    match fs {
        FsKind::Fat32 => Some("fatlabel"),
        FsKind::Exfat => Some("exfatlabel"),
        FsKind::Ntfs => Some("ntfslabel"),
        FsKind::Ext4 => Some("tune2fs"),
        FsKind::Apfs | FsKind::Swap | FsKind::Other => None,
    }
}

/// One binary's resolution, cached per process.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub found: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

pub struct SidecarRegistry {
    cache: Mutex<HashMap<&'static str, Resolution>>,
}

impl SidecarRegistry {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn spec(name: &str) -> Option<&'static SidecarSpec> {
        CATALOG.iter().find(|s| s.name == name)
    }

    /// Locate a binary, probing its version on first resolution.
    pub fn resolve(&self, name: &str) -> Resolution {
        let Some(spec) = Self::spec(name) else {
            return Resolution {
                found: false,
                path: None,
                version: None,
            };
        };

        if let Some(cached) = self.cache.lock().unwrap().get(spec.name) {
            return cached.clone();
        }

        let path = spec
            .candidates
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file())
            .or_else(|| which::which(spec.name).ok());

        let version = path
            .as_deref()
            .filter(|_| !spec.version_args.is_empty())
            .and_then(|p| probe_version(p, spec.version_args));

        let resolution = Resolution {
            found: path.is_some(),
            path,
            version,
        };
        debug!(sidecar = spec.name, found = resolution.found, "resolved");
        self.cache
            .lock()
            .unwrap()
            .insert(spec.name, resolution.clone());
        resolution
    }

    /// Fail fast when an operation's binaries are missing.
    pub fn require(&self, names: &[&str]) -> EngineResult<()> {
        for name in names {
            if !self.resolve(name).found {
                return Err(EngineError::MissingSidecar {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Every catalog entry's state, for the UI status screen.
    pub fn status_all(&self) -> Vec<SidecarStatus> {
        CATALOG
            .iter()
            .map(|spec| {
                let r = self.resolve(spec.name);
                SidecarStatus {
                    name: spec.name.to_string(),
                    found: r.found,
                    path: r.path.map(|p| p.display().to_string()),
                    version: r.version,
                }
            })
            .collect()
    }

    /// Build an invocation; errors if the binary is absent.
    pub fn invoke(&self, name: &str) -> EngineResult<Invocation> {
        let resolution = self.resolve(name);
        let path = resolution.path.ok_or_else(|| EngineError::MissingSidecar {
            name: name.to_string(),
        })?;
        Ok(Invocation {
            name: name.to_string(),
            path,
            args: Vec::new(),
            stdin: None,
        })
    }
}

impl Default for SidecarRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Versions below these floors draw a preflight warning; the tools still
/// work, but lack fixes the engine relies on (sfdisk JSON output shape,
/// mkfs.exfat label handling).
pub fn recommended_floor(name: &str) -> Option<&'static str> {
    match name {
        "sfdisk" | "lsblk" => Some("2.35"),
        "mkfs.exfat" => Some("1.1"),
        "ntfsresize" => Some("2017.3"),
        _ => None,
    }
}

/// Lexicographic-by-component version comparison; unparseable components
/// compare equal so odd vendor strings never produce false warnings.
pub fn version_below(version: &str, floor: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|c| {
                c.chars()
                    .take_while(|ch| ch.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let v = parse(version);
    let f = parse(floor);
    for i in 0..v.len().max(f.len()) {
        let a = v.get(i).copied().unwrap_or(0);
        let b = f.get(i).copied().unwrap_or(0);
        if a != b {
            return a < b;
        }
    }
    false
}

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+\.\d+(?:\.\d+)?)").unwrap());

fn probe_version(path: &std::path::Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let text = if text.trim().is_empty() {
        String::from_utf8_lossy(&output.stderr)
    } else {
        text
    };
    VERSION_RE
        .captures(text.lines().next()?)
        .map(|c| c[1].to_string())
}

/// Maps sidecar stdout lines to progress events. One implementation per
/// binary that reports progress; parser bugs must never corrupt operation
/// state, so the return value is advisory only.
pub trait LineParser: Send {
    fn parse_line(&mut self, line: &str) -> Option<ProgressEvent>;
}

/// Parser for binaries that print a bare percentage somewhere in the line
/// (`ntfsresize`, `mkfs.exfat`, `diskutil` activity lines).
pub struct PercentParser {
    re: Regex,
    last: u8,
}

impl PercentParser {
    pub fn new() -> Self {
        Self {
            re: Regex::new(r"(\d{1,3})(?:\.\d+)?\s*(?:%|percent)").unwrap(),
            last: 0,
        }
    }
}

impl Default for PercentParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LineParser for PercentParser {
    fn parse_line(&mut self, line: &str) -> Option<ProgressEvent> {
        let caps = self.re.captures(line)?;
        let percent: u8 = caps[1].parse().ok().filter(|p| *p <= 100)?;
        if percent < self.last {
            return None;
        }
        self.last = percent;
        Some(ProgressEvent::percent(percent))
    }
}

/// Outcome of a streamed run that did not fail at the transport level.
pub struct StreamOutcome {
    pub exit: Option<i32>,
    pub stdout: String,
    pub stderr_tail: String,
}

/// Outcome of a captured run. Non-zero exits and timeouts are data here,
/// not errors; preflight downgrades timeouts to warnings.
pub struct Captured {
    pub exit: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.exit == Some(0) && !self.timed_out
    }
}

/// A single prepared sidecar invocation. The child runs in its own process
/// group so cancellation can terminate the whole tree.
pub struct Invocation {
    name: String,
    path: PathBuf,
    args: Vec<String>,
    stdin: Option<String>,
}

impl Invocation {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed the child a script on stdin (`sfdisk` takes its table this way).
    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    fn spawn(&self) -> EngineResult<std::process::Child> {
        let mut cmd = Command::new(&self.path);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::io(format!("spawning {}", self.name), e))?;

        if let Some(data) = &self.stdin {
            let mut pipe = child.stdin.take().expect("stdin was piped");
            pipe.write_all(data.as_bytes())
                .map_err(|e| EngineError::io(format!("writing {} stdin", self.name), e))?;
        }
        Ok(child)
    }

    /// Stream the child through the bus: every stdout/stderr line becomes a
    /// log event, the parser may turn stdout lines into progress, and the
    /// cancel flag is honored at every line boundary.
    pub fn stream(
        self,
        bus: &Bus,
        mut parser: Option<&mut dyn LineParser>,
    ) -> EngineResult<StreamOutcome> {
        debug!(binary = %self.name, args = ?self.args, "sidecar start");
        let mut child = self.spawn()?;
        let pgid = Pid::from_raw(child.id() as i32);

        let stderr = child.stderr.take().expect("stderr was piped");
        let name_for_tail = self.name.clone();
        let stderr_thread = std::thread::spawn(move || collect_tail(stderr, &name_for_tail));

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut collected = String::new();
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(binary = %self.name, "stdout read error: {}", e);
                    break;
                }
            };

            bus.log(&self.name, line.clone());
            if let Some(p) = parser.as_deref_mut() {
                if let Some(event) = p.parse_line(&line) {
                    bus.progress(event);
                }
            }
            collected.push_str(&line);
            collected.push('\n');

            if bus.cancel_requested() {
                let _ = killpg(pgid, Signal::SIGTERM);
                let _ = child.wait();
                let _ = stderr_thread.join();
                return Err(EngineError::Cancelled);
            }
        }

        let status = child
            .wait()
            .map_err(|e| EngineError::io(format!("waiting for {}", self.name), e))?;
        let stderr_tail = stderr_thread.join().unwrap_or_default();

        Ok(StreamOutcome {
            exit: status.code(),
            stdout: collected,
            stderr_tail,
        })
    }

    /// Stream and require a clean exit.
    pub fn run(self, bus: &Bus, parser: Option<&mut dyn LineParser>) -> EngineResult<String> {
        let name = self.name.clone();
        let outcome = self.stream(bus, parser)?;
        if outcome.exit != Some(0) {
            return Err(EngineError::SubprocessFailed {
                binary: name,
                exit: outcome.exit,
                stderr_tail: outcome.stderr_tail,
            });
        }
        Ok(outcome.stdout)
    }

    /// Run without the bus under a soft wall-clock deadline. Used by the
    /// inspector and preflight, which must stay bounded.
    pub fn capture(self, timeout: Duration) -> EngineResult<Captured> {
        let mut child = self.spawn()?;
        let pgid = Pid::from_raw(child.id() as i32);

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let out_thread = std::thread::spawn(move || read_all(stdout));
        let err_thread = std::thread::spawn(move || read_all(stderr));

        let started = Instant::now();
        let exit = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if started.elapsed() >= timeout {
                        warn!(binary = %self.name, "sidecar deadline exceeded, terminating");
                        let _ = killpg(pgid, Signal::SIGTERM);
                        let _ = child.wait();
                        break None;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    return Err(EngineError::io(format!("waiting for {}", self.name), e));
                }
            }
        };

        let stdout = out_thread.join().unwrap_or_default();
        let stderr = err_thread.join().unwrap_or_default();
        Ok(Captured {
            exit: exit.and_then(|s| s.code()),
            stdout,
            stderr,
            timed_out: exit.is_none(),
        })
    }

    /// Capture and require a clean, in-deadline exit.
    pub fn capture_ok(self, timeout: Duration) -> EngineResult<String> {
        let name = self.name.clone();
        let captured = self.capture(timeout)?;
        if !captured.success() {
            return Err(EngineError::SubprocessFailed {
                binary: name,
                exit: captured.exit,
                stderr_tail: tail_of(&captured.stderr),
            });
        }
        Ok(captured.stdout)
    }
}

fn read_all(mut reader: impl Read) -> String {
    let mut buf = String::new();
    let _ = reader.read_to_string(&mut buf);
    buf
}

fn collect_tail(reader: impl Read, _name: &str) -> String {
    let mut tail: Vec<String> = Vec::new();
    for line in BufReader::new(reader).lines().map_while(Result::ok) {
        tail.push(line);
        if tail.len() > STDERR_TAIL {
            tail.remove(0);
        }
    }
    tail.join("\n")
}

fn tail_of(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use liboxidisk::{FsKind, OperationKind};

    #[test]
    fn test_catalog_has_no_duplicates() {
        let mut names: Vec<_> = CATALOG.iter().map(|s| s.name).collect();
        names.sort_unstable();
        let len = names.len();
        names.dedup();
        assert_eq!(len, names.len());
    }

    #[test]
    fn test_required_for_format() {
        let names = required_for(OperationKind::Format, Some(FsKind::Exfat));
        assert!(names.contains(&"mkfs.exfat"));
        assert!(names.contains(&"umount"));
    }

    #[test]
    fn test_required_for_apfs() {
        let names = required_for(OperationKind::ApfsDelete, None);
        assert!(names.contains(&"diskutil"));
    }

    #[test]
    fn test_unknown_sidecar_not_found() {
        let registry = SidecarRegistry::new();
        assert!(!registry.resolve("definitely-not-a-tool").found);
        assert!(registry.require(&["definitely-not-a-tool"]).is_err());
    }

    #[test]
    fn test_percent_parser() {
        let mut parser = PercentParser::new();
        let e = parser.parse_line("23.5 percent completed").unwrap();
        assert_eq!(e.percent, 23);
        // Regressions are dropped, the bus never sees them.
        assert!(parser.parse_line("10 percent completed").is_none());
        let e = parser.parse_line("done: 100%").unwrap();
        assert_eq!(e.percent, 100);
        assert!(parser.parse_line("no numbers here").is_none());
    }

    #[test]
    fn test_version_regex() {
        let caps = VERSION_RE.captures("sfdisk from util-linux 2.39.3").unwrap();
        assert_eq!(&caps[1], "2.39.3");
    }

    #[test]
    fn test_version_below() {
        assert!(version_below("2.34", "2.35"));
        assert!(!version_below("2.35", "2.35"));
        assert!(!version_below("2.39.3", "2.35"));
        assert!(version_below("1.9", "1.10"));
    }
}
