//! Application lifecycle abstraction.
//!
//! This module provides a [`Lifecycle`] trait for controlling process-level
//! operations triggered by the protocol engine's `reconfigure` and
//! `shutdown` commands.

/// Trait for application lifecycle operations.
///
/// Command handlers depend on this trait rather than calling
/// `std::process::exit` or reloading configuration directly, so tests can
/// observe the request instead of tearing down the test process.
pub trait Lifecycle: Send + Sync {
    /// Notes that a reload was requested, for logging/metrics. The actual
    /// reload (re-reading the config file and swapping it in) is done by
    /// `BootstrappedServices::reload_config`, which has the state this
    /// trait intentionally doesn't carry.
    fn request_reconfigure(&self);

    /// Requests a graceful shutdown: stop accepting new connections, let
    /// the in-flight decode finish or be interrupted, flush the journal,
    /// then exit.
    fn request_shutdown(&self);
}

/// Default lifecycle implementation for the standalone server binary.
///
/// `shutdown` cancels the server's root cancellation token rather than
/// calling `std::process::exit` directly, so outstanding connections and
/// the RTP sender get a chance to flush before the process actually exits.
pub struct ServerLifecycle {
    shutdown: tokio_util::sync::CancellationToken,
}

impl ServerLifecycle {
    pub fn new(shutdown: tokio_util::sync::CancellationToken) -> Self {
        Self { shutdown }
    }
}

impl Lifecycle for ServerLifecycle {
    fn request_reconfigure(&self) {
        tracing::info!("reconfigure requested");
    }

    fn request_shutdown(&self) {
        tracing::info!("shutdown requested");
        self.shutdown.cancel();
    }
}

/// No-op lifecycle for unit tests.
pub struct NoopLifecycle;

impl Lifecycle for NoopLifecycle {
    fn request_reconfigure(&self) {
        tracing::debug!("reconfigure requested (no-op)");
    }

    fn request_shutdown(&self) {
        tracing::debug!("shutdown requested (no-op)");
    }
}
