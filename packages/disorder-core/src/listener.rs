//! Binds every configured client-facing socket and hands accepted
//! connections to [`protocol::connection::serve_connection`].
//!
//! Runs a primary TCP listener, an optional secondary TCP listener (a
//! second interface), and a privileged Unix-domain socket whose
//! connections are granted the
//! synthetic [`Rights::LOCAL`](crate::rights::Rights::LOCAL) bit. Every
//! listener runs its own accept loop and stops when `shutdown` is
//! cancelled; in-flight connections are left to finish on their own.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrappedServices;
use crate::protocol::connection::serve_connection;

/// Binds every listener named in `services.config` and runs their accept
/// loops until `shutdown` is cancelled. Returns once every loop has
/// exited.
pub async fn run(services: Arc<BootstrappedServices>, shutdown: CancellationToken) {
    let mut handles = Vec::new();
    let config = services.config();

    handles.push(tokio::spawn(accept_tcp(
        config.listen,
        services.clone(),
        false,
        shutdown.clone(),
    )));

    if let Some(addr) = config.listen_secondary {
        handles.push(tokio::spawn(accept_tcp(addr, services.clone(), false, shutdown.clone())));
    }

    match prepare_unix_socket_path(&config.privileged_socket) {
        Ok(()) => {
            handles.push(tokio::spawn(accept_unix(
                config.privileged_socket.clone(),
                services.clone(),
                shutdown.clone(),
            )));
        }
        Err(err) => {
            tracing::error!(
                path = %config.privileged_socket.display(),
                %err,
                "skipping privileged socket"
            );
        }
    }

    for handle in handles {
        let _ = handle.await;
    }
}

async fn accept_tcp(addr: SocketAddr, services: Arc<BootstrappedServices>, local: bool, shutdown: CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, %err, "failed to bind TCP listener");
            return;
        }
    };
    tracing::info!(%addr, "listening for client connections");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let services = services.clone();
                    tracing::debug!(%peer, "accepted connection");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(async move {
                        serve_connection(stream, services, local).await;
                    });
                }
                Err(err) => tracing::warn!(%err, "accept failed"),
            },
        }
    }
    tracing::info!(%addr, "listener stopped");
}

async fn accept_unix(path: PathBuf, services: Arc<BootstrappedServices>, shutdown: CancellationToken) {
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(path = %path.display(), %err, "failed to bind privileged socket");
            return;
        }
    };
    if let Err(err) = restrict_socket_permissions(&path) {
        tracing::error!(path = %path.display(), %err, "failed to restrict privileged socket permissions");
        return;
    }
    tracing::info!(path = %path.display(), "listening on privileged socket");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let services = services.clone();
                    tracing::debug!("accepted local connection");
                    tokio::spawn(async move {
                        serve_connection(stream, services, true).await;
                    });
                }
                Err(err) => tracing::warn!(%err, "accept failed"),
            },
        }
    }
    let _ = std::fs::remove_file(&path);
    tracing::info!(path = %path.display(), "privileged socket stopped");
}

/// Ensures the privileged socket's parent directory exists and that no
/// stale socket file from a previous run is left behind to collide with
/// the bind.
fn prepare_unix_socket_path(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Restricts the privileged socket to the owner and its group, per §4.F
/// ("mode rwx only to the server group"): its grant of
/// [`Rights::LOCAL`](crate::rights::Rights::LOCAL) must not be reachable
/// by unrelated local users.
#[cfg(unix)]
fn restrict_socket_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
}

#[cfg(not(unix))]
fn restrict_socket_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap_services;
    use crate::config::Config;
    use std::time::Duration;

    fn test_config(dir: &Path) -> Config {
        let root = dir.join("music");
        std::fs::create_dir_all(&root).unwrap();
        Config {
            root,
            home: dir.join("home"),
            listen: "127.0.0.1:0".parse().unwrap(),
            privileged_socket: dir.join("private.sock"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn privileged_socket_is_created_owner_and_group_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let socket_path = config.privileged_socket.clone();
        let services = Arc::new(bootstrap_services(&config).unwrap());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(accept_unix(socket_path.clone(), services, shutdown.clone()));
        // Give the accept loop a moment to bind before asserting on the file.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mode = std::fs::metadata(&socket_path).unwrap().permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(mode.mode() & 0o777, 0o660);
        }

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn tcp_listener_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let services = Arc::new(bootstrap_services(&config).unwrap());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(accept_tcp("127.0.0.1:0".parse().unwrap(), services, false, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }

    #[test]
    fn prepare_unix_socket_path_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"not a socket").unwrap();
        prepare_unix_socket_path(&path).unwrap();
        assert!(!path.exists());
    }
}
