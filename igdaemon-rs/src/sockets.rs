/* Socket-root path handling.
 *
 * Every device listens under one directory: the numeric id socket,
 * optional location/user alias sockets, and the daemon's control
 * socket.  Names containing '/' are taken as full paths so users can
 * point clients anywhere. */

use std::io;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tracing::debug;

/// Default socket root on POSIX systems.
pub const DEFAULT_SOCKET_ROOT: &str = "/var/run/iguanaIR";

/// Name of the daemon-level control socket.
pub const CTL_SOCKET_NAME: &str = "ctl";

/// Resolve a socket name under the root.  Names with a '/' pass
/// through unchanged.
pub fn socket_path(root: &Path, name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        root.join(name)
    }
}

/// Bind a listening socket, replacing any stale file left by an
/// earlier daemon instance.
pub fn bind(root: &Path, name: &str) -> io::Result<(UnixListener, PathBuf)> {
    let path = socket_path(root, name);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(&path) {
        Ok(_) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&path)?;
    debug!("listening on {}", path.display());
    Ok((listener, path))
}

/// Remove a socket file during shutdown, quietly.
pub fn cleanup(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_joins_plain_names() {
        let root = Path::new("/var/run/iguanaIR");
        assert_eq!(
            socket_path(root, "0"),
            PathBuf::from("/var/run/iguanaIR/0")
        );
        assert_eq!(
            socket_path(root, "ctl"),
            PathBuf::from("/var/run/iguanaIR/ctl")
        );
    }

    #[test]
    fn test_socket_path_passes_full_paths_through() {
        let root = Path::new("/var/run/iguanaIR");
        assert_eq!(
            socket_path(root, "/tmp/custom/sock"),
            PathBuf::from("/tmp/custom/sock")
        );
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = std::env::temp_dir().join(format!("igd-sock-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let (first, path) = bind(&dir, "0").unwrap();
        drop(first);
        /* the socket file is still on disk; a rebind must succeed */
        let (second, _) = bind(&dir, "0").unwrap();
        drop(second);

        cleanup(&path);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
