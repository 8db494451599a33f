//! Python runtime discovery.
//!
//! The manager is a native binary, so it never has "its own" interpreter to
//! fall back on the way an embedded host would. A [`RuntimeLocator`] is picked
//! once at startup:
//!
//! - [`RuntimeLocator::Pinned`] uses a configured interpreter directly.
//! - [`RuntimeLocator::Discover`] searches `PATH` (skipping known decoy
//!   shims) and then a fixed list of per-OS install locations, probing each
//!   candidate with `--version` under a short timeout.
//!
//! Discovery never fails loudly: `None` means sandboxing is unavailable and
//! callers degrade.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, instrument, trace, warn};

/// Default timeout for a single `--version` probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Executable names searched on `PATH`, in priority order.
#[cfg(windows)]
const RUNTIME_NAMES: &[&str] = &["python", "python3"];
#[cfg(not(windows))]
const RUNTIME_NAMES: &[&str] = &["python3", "python"];

/// Path fragments of install locations that look like Python but are not.
///
/// The Microsoft Store alias under `WindowsApps` opens the Store instead of
/// running an interpreter.
const DECOY_MARKERS: &[&str] = &["WindowsApps"];

/// A validated interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Absolute path to the executable.
    pub path: PathBuf,
    /// Output of `--version`, e.g. `Python 3.12.3`.
    pub version: String,
}

/// Strategy for finding a Python runtime.
#[derive(Debug, Clone)]
pub enum RuntimeLocator {
    /// Use this interpreter without searching.
    Pinned(PathBuf),
    /// Search `PATH` and well-known locations.
    Discover {
        /// Timeout per candidate probe.
        probe_timeout: Duration,
    },
}

impl Default for RuntimeLocator {
    fn default() -> Self {
        Self::Discover {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl RuntimeLocator {
    /// Picks the strategy from configuration: a pinned interpreter wins.
    #[must_use]
    pub fn from_config(pinned: Option<PathBuf>, probe_timeout: Duration) -> Self {
        match pinned {
            Some(path) => Self::Pinned(path),
            None => Self::Discover { probe_timeout },
        }
    }

    /// Returns true for the use-this-interpreter strategy.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        matches!(self, Self::Pinned(_))
    }

    /// Locates a usable runtime.
    ///
    /// Returns `None` when nothing validates.
    #[instrument(skip(self))]
    pub async fn find_runtime(&self) -> Option<RuntimeInfo> {
        match self {
            Self::Pinned(path) => {
                if path.exists() {
                    trace!(path = %path.display(), "Using pinned runtime");
                    Some(RuntimeInfo {
                        path: path.clone(),
                        version: String::new(),
                    })
                } else {
                    warn!(path = %path.display(), "Pinned runtime does not exist");
                    None
                }
            }
            Self::Discover { probe_timeout } => {
                for candidate in candidate_runtimes() {
                    if let Some(version) = probe_runtime(&candidate, *probe_timeout).await {
                        debug!(path = %candidate.display(), %version, "Found Python runtime");
                        return Some(RuntimeInfo {
                            path: candidate,
                            version,
                        });
                    }
                }
                warn!("No usable Python runtime found");
                None
            }
        }
    }
}

/// Returns the prioritized, de-duplicated candidate list.
///
/// `PATH` matches come first (decoys removed), then well-known locations that
/// exist on disk.
#[must_use]
pub fn candidate_runtimes() -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    let from_path = RUNTIME_NAMES.iter().flat_map(|name| {
        which::which_all(name)
            .map(|found| found.collect::<Vec<_>>())
            .unwrap_or_default()
    });

    for path in from_path.chain(well_known_locations()) {
        if is_decoy(&path) || !path.is_file() {
            continue;
        }
        if seen.insert(path.clone()) {
            candidates.push(path);
        }
    }

    trace!(count = candidates.len(), "Collected runtime candidates");
    candidates
}

/// Returns true for install paths known to be non-functional shims.
#[must_use]
pub fn is_decoy(path: &Path) -> bool {
    let text = path.to_string_lossy();
    DECOY_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Runs `<path> --version` and returns the reported version if it is a
/// Python 3 interpreter that answered within `timeout`.
pub async fn probe_runtime(path: &Path, timeout: Duration) -> Option<String> {
    let child = Command::new(path)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            trace!(path = %path.display(), error = %e, "Runtime probe failed to start");
            return None;
        }
        Err(_) => {
            debug!(path = %path.display(), "Runtime probe timed out");
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }

    // Python 2 reports its version on stderr, Python 3 on stdout.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let version = if stdout.trim().is_empty() {
        stderr.trim().to_string()
    } else {
        stdout.trim().to_string()
    };

    version.starts_with("Python 3").then_some(version)
}

#[cfg(target_os = "linux")]
fn well_known_locations() -> Vec<PathBuf> {
    ["/usr/bin/python3", "/usr/local/bin/python3", "/bin/python3"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

#[cfg(target_os = "macos")]
fn well_known_locations() -> Vec<PathBuf> {
    [
        "/opt/homebrew/bin/python3",
        "/usr/local/bin/python3",
        "/Library/Frameworks/Python.framework/Versions/Current/bin/python3",
        "/usr/bin/python3",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

#[cfg(windows)]
fn well_known_locations() -> Vec<PathBuf> {
    const MINORS: &[u32] = &[13, 12, 11, 10, 9, 8];

    let mut roots = Vec::new();
    if let Ok(local) = std::env::var("LOCALAPPDATA") {
        roots.push(PathBuf::from(local).join("Programs").join("Python"));
    }
    if let Ok(program_files) = std::env::var("ProgramFiles") {
        roots.push(PathBuf::from(program_files));
    }
    roots.push(PathBuf::from("C:\\"));

    let mut locations = Vec::new();
    for root in &roots {
        for minor in MINORS {
            locations.push(root.join(format!("Python3{minor}")).join("python.exe"));
        }
    }
    locations
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn well_known_locations() -> Vec<PathBuf> {
    vec![PathBuf::from("/usr/local/bin/python3")]
}
