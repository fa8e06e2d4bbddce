//! Socket directory maintenance.
//!
//! Every decision re-reads the entry with `lstat` right before acting on it:
//! symlinks are never followed and anything that is not a socket is left
//! alone. Entries may appear or vanish concurrently.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tether_core::{sidecar, ProcessIdentity};

/// How long a connection probe may take before the socket counts as owned.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of [`cleanup_stale_sockets`](super::SessionManager::cleanup_stale_sockets).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Sockets whose daemon is alive
    pub kept: Vec<PathBuf>,
    /// Stale sockets that were deleted
    pub removed: Vec<PathBuf>,
    /// Symlinks and other non-socket `.sock` entries
    pub skipped: Vec<PathBuf>,
}

/// Scans `dir` and removes sockets no live daemon owns.
///
/// Ownership comes from `known` (the session table), else the identity
/// sidecar, else a connection probe.
pub(crate) async fn cleanup_stale_sockets(
    dir: &Path,
    known: &HashMap<PathBuf, ProcessIdentity>,
) -> std::io::Result<CleanupReport> {
    let mut report = CleanupReport::default();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sock") {
            continue;
        }

        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                debug!(socket = %path.display(), error = %e, "cannot stat entry, skipping");
                report.skipped.push(path);
                continue;
            }
        };
        if !meta.file_type().is_socket() {
            debug!(socket = %path.display(), "not a socket, skipping");
            report.skipped.push(path);
            continue;
        }

        if is_owned(&path, known).await {
            report.kept.push(path);
        } else if remove_if_socket(&path).await {
            sidecar::remove(&path);
            info!(socket = %path.display(), "removed stale socket");
            report.removed.push(path);
        } else {
            report.skipped.push(path);
        }
    }

    Ok(report)
}

async fn is_owned(path: &Path, known: &HashMap<PathBuf, ProcessIdentity>) -> bool {
    let identity = known.get(path).copied().or_else(|| sidecar::read(path));
    match identity {
        Some(identity) => identity.is_alive(),
        None => probe(path).await,
    }
}

/// True unless the socket definitely has no listener.
async fn probe(path: &Path) -> bool {
    match timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => !matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound),
        Err(_) => true,
    }
}

/// Removes `path` only if it is still a socket. Returns true if removed.
pub(crate) async fn remove_if_socket(path: &Path) -> bool {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_socket() => match tokio::fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(socket = %path.display(), error = %e, "failed to remove socket");
                false
            }
        },
        _ => false,
    }
}
