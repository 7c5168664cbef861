//! Per-connection state and the command/response read loop.
//!
//! Builds the buffered-reader/writer-with-a-tie shape on top of plain
//! `tokio::io` halves: the reader drives the command loop directly (no
//! separate callback-driven ring buffer is needed since
//! `tokio::io::AsyncBufReadExt::read_line` already amortizes short reads),
//! while the writer enforces the time-bound and space-bound via
//! [`BoundedWriter`]. Closing either half releases every per-connection
//! resource: the RTP request destination, a held playlist lock, and the
//! event-log subscription.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::bootstrap::BootstrappedServices;
use crate::constants::{MAX_LINE_BYTES, WRITER_SPACE_BOUND_BYTES, WRITER_TIME_BOUND_SECS};
use crate::rights::Rights;

use super::commands::{dispatch, lookup};
use super::response::Response;
use super::wire::{normalize_command_line, tokenize, TokenizeError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A unique, per-boot connection tag, used in diagnostics and as the
/// playlist-lock/RTP-destination ownership key.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// What a successfully authenticated connection is allowed to do.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub username: String,
    pub rights: Rights,
}

/// The line-handling mode a connection is in: ordinary command dispatch,
/// or mid-body-collection while accumulating a `playlist-set` body.
enum LineMode {
    Command,
    Body {
        /// The pending `playlist-set` name and sharing word, needed once
        /// the body is complete.
        playlist: String,
        lines: Vec<String>,
    },
}

/// Per-connection context handed to every command handler.
pub struct ConnCtx {
    pub id: u64,
    pub services: Arc<BootstrappedServices>,
    /// True if this connection was accepted on the privileged local
    /// socket; grants the synthetic [`Rights::LOCAL`] bit.
    pub local: bool,
    pub nonce: Vec<u8>,
    auth: RwLock<Option<AuthState>>,
    rtp_destination: RwLock<Option<SocketAddr>>,
    held_playlist: RwLock<Option<String>>,
    log_subscribed: std::sync::atomic::AtomicBool,
}

impl ConnCtx {
    pub fn new(id: u64, services: Arc<BootstrappedServices>, local: bool, nonce: Vec<u8>) -> Self {
        Self {
            id,
            services,
            local,
            nonce,
            auth: RwLock::new(None),
            rtp_destination: RwLock::new(None),
            held_playlist: RwLock::new(None),
            log_subscribed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.read().is_some()
    }

    pub fn username(&self) -> Option<String> {
        self.auth.read().as_ref().map(|a| a.username.clone())
    }

    /// The connection's rights: the authenticated user's rights, ORed
    /// with [`Rights::LOCAL`] if accepted on the privileged socket, or
    /// just `LOCAL` alone pre-auth so `local`-gated pre-auth checks still
    /// work. Unauthenticated non-local connections hold no rights.
    pub fn rights(&self) -> Rights {
        let base = self.auth.read().as_ref().map(|a| a.rights).unwrap_or_else(Rights::empty);
        if self.local {
            base | Rights::LOCAL
        } else {
            base
        }
    }

    /// Records a successful authentication. A connection may authenticate
    /// at most once; callers check [`Self::is_authenticated`] before
    /// calling this.
    pub fn authenticate(&self, username: String, rights: Rights) {
        *self.auth.write() = Some(AuthState { username, rights });
    }

    /// Re-reads rights from the user store, used after `edituser`/a
    /// rights-affecting `deluser` on this connection's own user.
    pub fn refresh_rights(&self) {
        let mut auth = self.auth.write();
        if let Some(state) = auth.as_mut() {
            if let Some(record) = self.services.users.get(&state.username) {
                state.rights = record.rights;
            } else {
                // The user was deleted out from under this session.
                state.rights = Rights::empty();
            }
        }
    }

    pub fn set_rtp_destination(&self, addr: SocketAddr) {
        *self.rtp_destination.write() = Some(addr);
        self.services.rtp.add_destination(addr);
    }

    pub fn clear_rtp_destination(&self) {
        if let Some(addr) = self.rtp_destination.write().take() {
            self.services.rtp.remove_destination(addr);
        }
    }

    pub fn set_held_playlist(&self, name: Option<String>) {
        *self.held_playlist.write() = name;
    }

    pub fn held_playlist(&self) -> Option<String> {
        self.held_playlist.read().clone()
    }

    pub fn mark_log_subscribed(&self) {
        self.log_subscribed.store(true, Ordering::Relaxed);
    }

    /// Releases every per-connection resource on close: the RTP request
    /// destination, a held playlist lock, and (implicitly, since its
    /// receiver is simply dropped) the event-log subscription.
    pub fn release_resources(&self) {
        self.clear_rtp_destination();
        if let Some(name) = self.held_playlist.write().take() {
            self.services.playlists.unlock(&name, self.id);
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WriterError {
    #[error("writer time bound exceeded")]
    TimedOut,
    #[error("writer space bound exceeded")]
    SpaceBoundExceeded,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A writer enforcing a time bound and a space bound: queued lines
/// accumulate in a bounded channel tracked by byte count, and each socket
/// write is wrapped in a timeout.
struct BoundedWriter {
    tx: mpsc::UnboundedSender<String>,
    queued_bytes: Arc<std::sync::atomic::AtomicUsize>,
    space_bound: usize,
}

impl BoundedWriter {
    fn spawn<W>(write_half: W, time_bound: Duration) -> (Self, tokio::task::JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let queued_bytes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let queued_bytes_task = queued_bytes.clone();
        let handle = tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(line) = rx.recv().await {
                let bytes = line.len();
                let result = tokio::time::timeout(time_bound, write_half.write_all(line.as_bytes())).await;
                queued_bytes_task.fetch_sub(bytes, Ordering::Relaxed);
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                        tracing::info!("connection write failed: broken pipe");
                        break;
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(%err, "connection write error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!("writer time bound exceeded, abandoning connection");
                        break;
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });
        (
            Self {
                tx,
                queued_bytes,
                space_bound: WRITER_SPACE_BOUND_BYTES,
            },
            handle,
        )
    }

    /// Enqueues `line` (without a trailing newline) for transmission.
    /// Fails if the writer's space bound would be exceeded or the writer
    /// task has already exited.
    fn enqueue(&self, line: &str) -> Result<(), WriterError> {
        let framed = format!("{line}\n");
        let size = framed.len();
        let updated = self.queued_bytes.fetch_add(size, Ordering::Relaxed) + size;
        if updated > self.space_bound {
            self.queued_bytes.fetch_sub(size, Ordering::Relaxed);
            return Err(WriterError::SpaceBoundExceeded);
        }
        self.tx.send(framed).map_err(|_| {
            WriterError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer closed"))
        })
    }
}

/// Serves one accepted connection end-to-end: greeting, command loop,
/// body intake, and resource cleanup on close. `local` is true for
/// connections accepted on the privileged Unix socket.
pub async fn serve_connection<S>(stream: S, services: Arc<BootstrappedServices>, local: bool)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let id = next_connection_id();
    let (read_half, write_half) = tokio::io::split(stream);
    let (writer, writer_task) = BoundedWriter::spawn(write_half, Duration::from_secs(WRITER_TIME_BOUND_SECS));

    let nonce = {
        use rand::RngCore;
        let mut buf = vec![0u8; crate::constants::CHALLENGE_BYTES];
        rand::rng().fill_bytes(&mut buf);
        buf
    };
    let ctx = Arc::new(ConnCtx::new(id, services, local, nonce.clone()));

    let greeting = format!(
        "231 {} {} {}",
        crate::PROTOCOL_VERSION,
        ctx.services.config().authorization_algorithm,
        hex::encode(&nonce)
    );
    if writer.enqueue(&greeting).is_err() {
        return;
    }

    let mut reader = BufReader::new(read_half);
    let mut raw_line = String::new();
    let mut mode = LineMode::Command;
    let mut log_rx: Option<tokio::sync::broadcast::Receiver<crate::events::LogEvent>> = None;
    // Independent of whether the client asked for `log`: every connection
    // watches for a `RightsChanged` naming its own user, so `deluser`
    // "concurrently revokes all live sessions" even for sessions that
    // never subscribed to the event log.
    let mut rights_rx = ctx.services.events.subscribe();

    loop {
        raw_line.clear();
        let read_result = tokio::select! {
            biased;
            rights_event = rights_rx.recv() => {
                if let Ok(event) = rights_event {
                    if event.kind == crate::events::LogEventKind::RightsChanged
                        && event.args.first().map(String::as_str) == ctx.username().as_deref()
                    {
                        ctx.refresh_rights();
                    }
                }
                continue;
            }
            log_event = recv_log_event(&mut log_rx) => {
                if let Some(event) = log_event {
                    if super::logstream::visible_to(&event, ctx.rights(), ctx.services.config().remote_userman) {
                        let line = super::logstream::render_event(&event);
                        if writer.enqueue(&line).is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
            result = reader.read_line(&mut raw_line) => result,
        };

        let n = match read_result {
            Ok(0) => break, // EOF
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(%err, connection = id, "connection read error");
                break;
            }
        };
        if n > MAX_LINE_BYTES {
            let _ = writer.enqueue("500 line too long");
            break;
        }

        // A `log`-subscribed connection discards further client lines
        // (keepalive only).
        if log_rx.is_some() {
            continue;
        }

        match &mut mode {
            LineMode::Command => {
                let normalized = normalize_command_line(&raw_line);
                if normalized.is_empty() {
                    continue;
                }
                let tokens = match tokenize(&normalized) {
                    Ok(tokens) => tokens,
                    Err(TokenizeError::UnterminatedQuote) => {
                        let _ = writer.enqueue("500 unterminated quoted string");
                        continue;
                    }
                    Err(TokenizeError::DanglingEscape) => {
                        let _ = writer.enqueue("500 dangling escape character");
                        continue;
                    }
                };
                if tokens.is_empty() {
                    continue;
                }
                let (name, args) = (tokens[0].clone(), tokens[1..].to_vec());

                if name.eq_ignore_ascii_case("log") {
                    match lookup_and_check(&ctx, &name, &args) {
                        Ok(()) => {
                            let _ = writer.enqueue("254 OK");
                            ctx.mark_log_subscribed();
                            log_rx = Some(ctx.services.events.subscribe());
                            continue;
                        }
                        Err(resp) => {
                            for line in resp.render_lines() {
                                let _ = writer.enqueue(&line);
                            }
                            continue;
                        }
                    }
                }

                let response = dispatch(&ctx, &name, &args).await;

                // `playlist-set` switches this connection into body mode
                // instead of replying immediately; its continuation fires
                // once the terminating `.` line arrives.
                if name.eq_ignore_ascii_case("playlist-set") && response.code / 10 == 23 {
                    mode = LineMode::Body {
                        playlist: args.first().cloned().unwrap_or_default(),
                        lines: Vec::new(),
                    };
                    for line in response.render_lines() {
                        let _ = writer.enqueue(&line);
                    }
                    continue;
                }

                for line in response.render_lines() {
                    if writer.enqueue(&line).is_err() {
                        break;
                    }
                }
            }
            LineMode::Body { playlist, lines } => {
                let raw = raw_line.strip_suffix('\n').unwrap_or(&raw_line);
                let raw = raw.strip_suffix('\r').unwrap_or(raw);
                if raw == "." {
                    let playlist = std::mem::take(playlist);
                    let collected = std::mem::take(lines);
                    let response = super::commands::finish_playlist_set(&ctx, &playlist, collected).await;
                    for line in response.render_lines() {
                        let _ = writer.enqueue(&line);
                    }
                    mode = LineMode::Command;
                } else {
                    // Body bytes are preserved verbatim (Resolved Open
                    // Question (a)): only the dot-stuffing escape is
                    // undone, nothing else is normalized.
                    lines.push(super::wire::dot_unstuff_line(raw));
                }
            }
        }
    }

    ctx.release_resources();
    drop(writer);
    let _ = writer_task.await;
}

async fn recv_log_event(
    rx: &mut Option<tokio::sync::broadcast::Receiver<crate::events::LogEvent>>,
) -> Option<crate::events::LogEvent> {
    match rx {
        Some(receiver) => loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => std::future::pending().await,
    }
}

fn lookup_and_check(ctx: &ConnCtx, name: &str, args: &[String]) -> Result<(), Response> {
    let command = lookup(name).ok_or_else(|| Response::message(500, format!("unknown command: {name}")))?;
    command.check_arity(args.len()).map_err(Response::from)?;
    command.check_auth_and_rights(ctx).map_err(Response::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap_services;
    use crate::config::Config;
    use crate::rights::Rights;
    use crate::users::{expected_response, hash_password, AuthAlgorithm, UserRecord};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn test_config(dir: &std::path::Path) -> Config {
        let root = dir.join("music");
        std::fs::create_dir_all(&root).unwrap();
        Config {
            root,
            home: dir.join("home"),
            ..Config::default()
        }
    }

    /// An already-authenticated connection that never subscribed to `log`
    /// still loses its rights the moment another session deletes its
    /// user: the connection loop's internal `RightsChanged` watcher is
    /// what makes `deluser` revoke live sessions rather than only the
    /// next login.
    #[tokio::test]
    async fn deluser_zeroes_rights_of_a_live_non_log_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let services = Arc::new(bootstrap_services(&config).unwrap());

        services
            .users
            .add(UserRecord {
                username: "alice".to_string(),
                password_hash: hash_password(AuthAlgorithm::Sha1, "secret"),
                email: None,
                rights: Rights::PLAY | Rights::READ,
                confirmation: None,
                last_reminder: None,
            })
            .unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let serve = tokio::spawn(serve_connection(server, services.clone(), false));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        // greeting: "231 <version> <algorithm> <nonce>"
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let nonce_hex = line.trim().split(' ').nth(3).unwrap().to_string();
        let nonce = hex::decode(&nonce_hex).unwrap();

        let response = expected_response(AuthAlgorithm::Sha1, &nonce, "secret");
        write_half
            .write_all(format!("user alice {response}\n").as_bytes())
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("230"), "unexpected auth response: {line}");

        // A rights-gated command succeeds while the account still exists.
        // `queue` replies with a dot-stuffed body; drain it fully so the
        // next read doesn't pick up the stray "." terminator.
        write_half.write_all(b"queue\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("253"), "unexpected queue response: {line}");
        loop {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            if line.trim() == "." {
                break;
            }
        }

        services.users.delete("alice").unwrap();
        use crate::events::EventEmitter;
        services.events.emit(
            crate::events::LogEvent::new(crate::events::LogEventKind::RightsChanged, vec!["alice".to_string()])
                .user_management(),
        );

        // Give the connection's select loop a chance to observe the event
        // before issuing a command that now must be rejected.
        tokio::time::sleep(Duration::from_millis(50)).await;

        write_half.write_all(b"queue\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(
            line.trim(),
            "510 permission denied: queue: insufficient rights",
            "rights were not revoked: {line}"
        );

        drop(write_half);
        let _ = tokio::time::timeout(Duration::from_secs(1), serve).await;
    }
}
