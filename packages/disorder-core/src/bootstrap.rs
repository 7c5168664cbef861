//! Composition root: wires every subsystem together from [`Config`] into a
//! [`BootstrappedServices`] the server binary drives.
//!
//! Runs the startup sequence as explicit dependency construction: load
//! config, load the user database and cookie keys, open the track
//! library, bind the RTP destination socket, restore the queue journal,
//! then start the background reactor tasks.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{DisorderError, DisorderResult};
use crate::events::BroadcastEventBridge;
use crate::lifecycle::{Lifecycle, ServerLifecycle};
use crate::mailer::{LoggingMailer, Mailer};
use crate::protocol::global_prefs::GlobalPrefsStore;
use crate::protocol::playlists::PlaylistStore;
use crate::protocol::schedule::ScheduleStore;
use crate::protocol::volume::VolumeControl;
use crate::queue::QueueEngine;
use crate::reactor::signals::DisorderSignal;
use crate::reactor::{ChildReaper, SignalHub, TimerWheel};
use crate::rtp::{bind_destination, RtpSender};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::trackdb::{FsTrackDatabase, TrackDatabase};
use crate::users::{AuthAlgorithm, CookieStore, UserStore};

/// Every long-lived service a running server needs, constructed once at
/// startup and handed to the listener and protocol layers.
#[derive(Clone)]
pub struct BootstrappedServices {
    config: Arc<RwLock<Arc<Config>>>,
    /// File `reconfigure` re-reads from, if this server was started with
    /// `--config`. CLI/env overrides applied at startup are not reapplied
    /// on reload, matching a config file reread rather than a full
    /// re-invocation of the command line.
    config_path: Option<PathBuf>,
    pub users: Arc<UserStore>,
    pub cookies: Arc<CookieStore>,
    pub trackdb: Arc<dyn TrackDatabase>,
    pub queue: Arc<QueueEngine>,
    pub rtp: Arc<RtpSender>,
    pub events: Arc<BroadcastEventBridge>,
    pub playlists: Arc<PlaylistStore>,
    pub schedule: Arc<ScheduleStore>,
    pub global_prefs: Arc<GlobalPrefsStore>,
    pub mailer: Arc<dyn Mailer>,
    pub lifecycle: Arc<dyn Lifecycle>,
    pub volume: Arc<VolumeControl>,
    pub timers: Arc<TimerWheel>,
    pub signals: Arc<SignalHub>,
    pub reaper: Arc<ChildReaper>,
    pub spawner: TokioSpawner,
    pub shutdown: CancellationToken,
}

impl BootstrappedServices {
    /// Cancels the shared shutdown token, signalling every background
    /// task (timer wheel, signal hub, queue engine ticker, listeners) to
    /// wind down.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested, cancelling background tasks");
        self.shutdown.cancel();
    }

    /// The currently active configuration snapshot. Cloning the `Arc` is
    /// cheap; callers take one snapshot at the top of a command handler
    /// rather than re-reading the lock field by field, so a concurrent
    /// `reconfigure` can't hand one handler a mix of old and new values.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Re-reads the config file named by `--config` at startup, validates
    /// it, and swaps it in atomically for every subsequent snapshot taken
    /// via [`Self::config`]. Listener addresses, the privileged socket
    /// path, and the RTP destination are bound once at startup and are not
    /// re-bound by a reload; every other knob (rights defaults, queue
    /// tuning, mail settings, the decoder command) takes effect
    /// immediately. Returns an error if no `--config` file was given at
    /// startup, or if the file fails to parse or validate.
    pub fn reload_config(&self) -> DisorderResult<()> {
        let Some(path) = &self.config_path else {
            return Err(DisorderError::Unrecoverable(
                "no configuration file to reload from".into(),
            ));
        };
        let reloaded = Config::load(path)
            .map_err(|e| DisorderError::Unrecoverable(format!("reloading configuration: {e}")))?;
        self.queue.set_config(crate::queue::QueueConfig::from(&reloaded));
        *self.config.write() = Arc::new(reloaded);
        tracing::info!(path = %path.display(), "configuration reloaded");
        Ok(())
    }
}

/// Wires a fresh [`BootstrappedServices`] from `config`. Must be called
/// from within a running Tokio runtime, since it spawns the reactor's
/// background tasks (timer wheel, signal fan-out) immediately.
///
/// Equivalent to [`bootstrap_services_at`] with no reload path, so
/// `reconfigure` will report an error rather than reloading anything.
pub fn bootstrap_services(config: &Config) -> DisorderResult<BootstrappedServices> {
    bootstrap_services_at(config, None)
}

/// Like [`bootstrap_services`], additionally recording `config_path` so
/// the `reconfigure` command can later re-read it.
pub fn bootstrap_services_at(
    config: &Config,
    config_path: Option<PathBuf>,
) -> DisorderResult<BootstrappedServices> {
    let shutdown = CancellationToken::new();
    let spawner = TokioSpawner::current();

    let users = Arc::new(
        UserStore::load(&config.home)
            .map_err(|e| DisorderError::Unrecoverable(format!("loading user database: {e}")))?,
    );

    let algorithm = AuthAlgorithm::parse(&config.authorization_algorithm).ok_or_else(|| {
        DisorderError::Unrecoverable(format!(
            "unknown authorization_algorithm: {}",
            config.authorization_algorithm
        ))
    })?;
    let cookies = Arc::new(CookieStore::new(algorithm, config.cookie_key_lifetime));

    let trackdb: Arc<dyn TrackDatabase> = Arc::new(
        FsTrackDatabase::open(config.root.clone(), &config.home)
            .map_err(|e| DisorderError::Unrecoverable(format!("opening track library: {e}")))?,
    );

    let events = Arc::new(BroadcastEventBridge::new(256));

    let socket = bind_destination(
        config.rtp_mode,
        config.broadcast,
        config.broadcast_from,
        config.multicast_ttl,
        config.multicast_loop,
    )
    .map_err(|e| DisorderError::Unrecoverable(format!("binding RTP destination: {e}")))?;
    let rtp = Arc::new(RtpSender::new(
        socket,
        config.rtp_mode,
        true,
        std::time::Duration::from_millis(500),
        config.rtp_max_payload,
    ));

    let queue = QueueEngine::load(
        &config.home,
        trackdb.clone(),
        events.clone() as Arc<dyn crate::events::EventEmitter>,
        Arc::new(spawner.clone()) as Arc<dyn TaskSpawner>,
        rtp.clone(),
        crate::queue::QueueConfig::from(config),
    )
    .map_err(|e| DisorderError::Unrecoverable(format!("loading queue journal: {e}")))?;

    let timers = Arc::new(TimerWheel::new());
    {
        let timers = timers.clone();
        let shutdown = shutdown.clone();
        spawner.spawn(async move {
            timers.run(shutdown).await;
        });
    }
    schedule_queue_tick(Arc::clone(&timers), Arc::clone(&queue), spawner.clone(), shutdown.clone());
    schedule_rtp_keepalive(Arc::clone(&timers), Arc::clone(&queue), spawner.clone(), shutdown.clone());
    schedule_cookie_key_rotation(Arc::clone(&timers), Arc::clone(&cookies), spawner.clone(), shutdown.clone());

    let signals = Arc::new(
        SignalHub::new()
            .map_err(|e| DisorderError::Unrecoverable(format!("installing signal handlers: {e}")))?,
    );
    {
        let signals = signals.clone();
        let shutdown = shutdown.clone();
        spawner.spawn(async move {
            if let Err(e) = signals.run(shutdown).await {
                tracing::error!(error = %e, "signal handling loop exited");
            }
        });
    }

    let reaper = Arc::new(ChildReaper::new());

    let playlists = Arc::new(
        PlaylistStore::load(
            &config.home,
            std::time::Duration::from_secs(config.playlist_lock_timeout),
        )
        .map_err(|e| DisorderError::Unrecoverable(format!("loading playlists: {e}")))?,
    );
    let schedule = Arc::new(
        ScheduleStore::load(&config.home)
            .map_err(|e| DisorderError::Unrecoverable(format!("loading schedule store: {e}")))?,
    );
    let mailer: Arc<dyn Mailer> = Arc::new(LoggingMailer);
    let lifecycle: Arc<dyn Lifecycle> = Arc::new(ServerLifecycle::new(shutdown.clone()));
    let volume = Arc::new(VolumeControl::default());
    let global_prefs = Arc::new(
        GlobalPrefsStore::load(&config.home)
            .map_err(|e| DisorderError::Unrecoverable(format!("loading global preferences: {e}")))?,
    );

    let services = BootstrappedServices {
        config: Arc::new(RwLock::new(Arc::new(config.clone()))),
        config_path,
        users,
        cookies,
        trackdb,
        queue,
        rtp,
        events,
        playlists,
        schedule,
        global_prefs,
        mailer,
        lifecycle,
        volume,
        timers,
        signals: signals.clone(),
        reaper,
        spawner: spawner.clone(),
        shutdown: shutdown.clone(),
    };
    spawn_signal_reactions(services.clone(), signals, shutdown, spawner);

    Ok(services)
}

/// Reacts to the signals `SignalHub` fans out: `SIGHUP` re-reads the
/// configuration exactly as the `reconfigure` command does, `SIGTERM`/
/// `SIGINT` request the same graceful shutdown `shutdown` does. Runs
/// until `shutdown` fires or the signal channel closes.
fn spawn_signal_reactions(
    services: BootstrappedServices,
    signals: Arc<SignalHub>,
    shutdown: CancellationToken,
    spawner: TokioSpawner,
) {
    spawner.spawn(async move {
        let mut rx = signals.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                signal = rx.recv() => match signal {
                    Ok(signal) => {
                        if !react_to_signal(&services, signal) {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    });
}

/// Applies one delivered signal's effect. Returns `false` once the
/// reaction loop should stop (a shutdown was requested).
fn react_to_signal(services: &BootstrappedServices, signal: DisorderSignal) -> bool {
    match signal {
        DisorderSignal::Hup => {
            services.lifecycle.request_reconfigure();
            if let Err(err) = services.reload_config() {
                tracing::warn!(%err, "SIGHUP reconfigure failed");
            }
            true
        }
        DisorderSignal::Term | DisorderSignal::Int => {
            services.lifecycle.request_shutdown();
            false
        }
    }
}

/// Re-arms itself on [`TimerWheel`] every [`crate::constants::QUEUE_TICK_INTERVAL`]
/// so prepare-ahead and `queue_pad` random fill keep running even when no
/// command or decoder completion happens to trigger [`QueueEngine::tick`].
fn schedule_queue_tick(
    timers: Arc<TimerWheel>,
    queue: Arc<QueueEngine>,
    spawner: TokioSpawner,
    shutdown: CancellationToken,
) {
    if shutdown.is_cancelled() {
        return;
    }
    let timers_next = timers.clone();
    let queue_next = queue.clone();
    let spawner_next = spawner.clone();
    let shutdown_next = shutdown.clone();
    timers.schedule(crate::constants::QUEUE_TICK_INTERVAL, move || {
        let queue_run = queue.clone();
        spawner.spawn(async move { queue_run.tick().await });
        schedule_queue_tick(timers_next, queue_next, spawner_next, shutdown_next);
    });
}

/// Re-arms itself on [`TimerWheel`] every
/// [`crate::constants::RTP_KEEPALIVE_INTERVAL`] so the RTP sender keeps
/// emitting empty-payload packets while paused and is promptly marked
/// idle between tracks, independent of the coarser [`schedule_queue_tick`]
/// cadence.
fn schedule_rtp_keepalive(
    timers: Arc<TimerWheel>,
    queue: Arc<QueueEngine>,
    spawner: TokioSpawner,
    shutdown: CancellationToken,
) {
    if shutdown.is_cancelled() {
        return;
    }
    let timers_next = timers.clone();
    let queue_next = queue.clone();
    let spawner_next = spawner.clone();
    let shutdown_next = shutdown.clone();
    timers.schedule(crate::constants::RTP_KEEPALIVE_INTERVAL, move || {
        let queue_run = queue.clone();
        spawner.spawn(async move { queue_run.rtp_keepalive_tick().await });
        schedule_rtp_keepalive(timers_next, queue_next, spawner_next, shutdown_next);
    });
}

/// Re-arms itself on [`TimerWheel`] every
/// [`crate::constants::COOKIE_KEY_ROTATION_CHECK_INTERVAL`] so
/// `cookie_key_lifetime` is actually enforced: without this, `CookieStore`
/// held a signing key forever no matter how stale, since nothing outside
/// its own unit tests ever called `rotate_if_stale`.
fn schedule_cookie_key_rotation(
    timers: Arc<TimerWheel>,
    cookies: Arc<CookieStore>,
    spawner: TokioSpawner,
    shutdown: CancellationToken,
) {
    if shutdown.is_cancelled() {
        return;
    }
    let timers_next = timers.clone();
    let cookies_next = cookies.clone();
    let spawner_next = spawner.clone();
    let shutdown_next = shutdown.clone();
    timers.schedule(crate::constants::COOKIE_KEY_ROTATION_CHECK_INTERVAL, move || {
        cookies.rotate_if_stale();
        schedule_cookie_key_rotation(timers_next, cookies_next, spawner_next, shutdown_next);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> Config {
        let root = dir.join("music");
        std::fs::create_dir_all(&root).unwrap();
        Config {
            root,
            home: dir.join("home"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_wires_every_service_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let services = bootstrap_services(&config).unwrap();
        assert!(services.users.list().is_empty());
        assert!(services.queue.state().entries.is_empty());
        services.shutdown();
    }

    #[tokio::test]
    async fn reload_config_without_a_config_path_errs() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let services = bootstrap_services(&config).unwrap();
        assert!(services.reload_config().is_err());
        services.shutdown();
    }

    #[tokio::test]
    async fn reload_config_swaps_in_a_new_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let config_path = dir.path().join("disorder.yaml");
        std::fs::write(&config_path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let services = bootstrap_services_at(&config, Some(config_path.clone())).unwrap();
        assert_eq!(services.config().history, config.history);

        let mut changed = config.clone();
        changed.history = config.history + 7;
        std::fs::write(&config_path, serde_yaml::to_string(&changed).unwrap()).unwrap();

        services.reload_config().unwrap();
        assert_eq!(services.config().history, config.history + 7);
        services.shutdown();
    }

    #[tokio::test]
    async fn hup_reaction_reloads_configuration_and_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let config_path = dir.path().join("disorder.yaml");
        std::fs::write(&config_path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let services = bootstrap_services_at(&config, Some(config_path.clone())).unwrap();

        let mut changed = config.clone();
        changed.history = config.history + 3;
        std::fs::write(&config_path, serde_yaml::to_string(&changed).unwrap()).unwrap();

        assert!(react_to_signal(&services, DisorderSignal::Hup));
        assert_eq!(services.config().history, config.history + 3);
        assert!(!services.shutdown.is_cancelled());
        services.shutdown();
    }

    #[tokio::test]
    async fn term_reaction_requests_shutdown_and_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let services = bootstrap_services(&config).unwrap();

        assert!(!react_to_signal(&services, DisorderSignal::Term));
        assert!(services.shutdown.is_cancelled());
    }
}
