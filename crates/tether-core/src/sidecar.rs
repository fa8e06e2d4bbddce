//! Identity sidecar files.
//!
//! Every socket `<dir>/<id>.sock` may have a sibling `<dir>/<id>.pid` holding
//! the owning daemon's [`ProcessIdentity`] as JSON. It lets a supervisor that
//! did not spawn the daemon decide whether the socket is still owned.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::process::ProcessIdentity;

/// Path of the sidecar that belongs to `socket_path`.
pub fn sidecar_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("pid")
}

/// Writes the sidecar with mode 0600, replacing any previous one.
pub fn write(socket_path: &Path, identity: &ProcessIdentity) -> std::io::Result<PathBuf> {
    let path = sidecar_path(socket_path);
    let json = serde_json::to_vec(identity).map_err(std::io::Error::other)?;

    let tmp = path.with_extension("pid.tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    std::fs::rename(&tmp, &path)?;

    Ok(path)
}

/// Reads the sidecar next to `socket_path`.
///
/// Returns `None` if it is missing, not a regular file, or unparseable.
pub fn read(socket_path: &Path) -> Option<ProcessIdentity> {
    let path = sidecar_path(socket_path);
    let meta = std::fs::symlink_metadata(&path).ok()?;
    if !meta.file_type().is_file() {
        return None;
    }
    let raw = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(identity) => Some(identity),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "ignoring malformed sidecar");
            None
        }
    }
}

/// Removes the sidecar if present.
pub fn remove(socket_path: &Path) {
    let path = sidecar_path(socket_path);
    match std::fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "removed sidecar"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "failed to remove sidecar"),
    }
}
