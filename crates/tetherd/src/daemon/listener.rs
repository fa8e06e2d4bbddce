//! Socket setup and teardown.
//!
//! The socket path is never followed through a symlink and anything that is
//! not a socket is never deleted. An existing socket is only replaced when
//! nothing answers on it.

use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::Path;

use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use super::DaemonError;

/// Mode of the socket directory.
pub const SOCKET_DIR_MODE: u32 = 0o700;

/// Mode of the socket file.
pub const SOCKET_FILE_MODE: u32 = 0o600;

/// Binds `path`, creating its directory and clearing a stale socket.
///
/// Must be called inside a tokio runtime.
pub fn bind_socket(path: &Path) -> Result<UnixListener, DaemonError> {
    let setup_err = |error: std::io::Error| DaemonError::SocketSetup {
        path: path.to_path_buf(),
        error: error.to_string(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(SOCKET_DIR_MODE)
            .create(parent)
            .map_err(setup_err)?;
    }

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            match std::os::unix::net::UnixStream::connect(path) {
                Ok(_) => return Err(DaemonError::SocketInUse(path.to_path_buf())),
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
                    info!(socket = %path.display(), "removing stale socket");
                    remove_if_socket(path);
                }
                Err(e) => return Err(setup_err(e)),
            }
        }
        Ok(_) => return Err(DaemonError::NotASocket(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(setup_err(e)),
    }

    let listener = UnixListener::bind(path).map_err(setup_err)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_FILE_MODE))
        .map_err(setup_err)?;

    info!(socket = %path.display(), "listening");
    Ok(listener)
}

/// Removes `path` only if it is (still) a socket. Returns true if removed.
pub fn remove_if_socket(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(socket = %path.display(), "socket removed");
                true
            }
            Err(e) => {
                warn!(socket = %path.display(), error = %e, "failed to remove socket");
                false
            }
        },
        Ok(_) => {
            warn!(socket = %path.display(), "refusing to remove non-socket");
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_creates_private_dir_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("s.sock");

        let _listener = bind_socket(&path).unwrap();

        let dir_mode = std::fs::metadata(path.parent().unwrap()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, SOCKET_DIR_MODE);
        let sock_meta = std::fs::symlink_metadata(&path).unwrap();
        assert!(sock_meta.file_type().is_socket());
        assert_eq!(sock_meta.permissions().mode() & 0o777, SOCKET_FILE_MODE);
    }

    #[tokio::test]
    async fn test_live_socket_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let _listener = bind_socket(&path).unwrap();

        assert!(matches!(bind_socket(&path), Err(DaemonError::SocketInUse(_))));
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        assert!(bind_socket(&path).is_ok());
    }

    #[tokio::test]
    async fn test_regular_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        assert!(matches!(bind_socket(&path), Err(DaemonError::NotASocket(_))));
        assert!(path.exists());
        assert!(!remove_if_socket(&path));
    }

    #[tokio::test]
    async fn test_symlink_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.sock");
        let _listener = bind_socket(&target).unwrap();
        let link = dir.path().join("link.sock");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(matches!(bind_socket(&link), Err(DaemonError::NotASocket(_))));
    }
}
