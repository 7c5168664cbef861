//! Signal handling.
//!
//! A traditional unix daemon funnels `SIGTERM`/`SIGHUP`/`SIGINT` through a
//! self-pipe so a handler never runs user code directly. Tokio's
//! `signal::unix` already delivers signals via the async runtime rather
//! than an interrupt context, so the self-pipe trick is unnecessary; this
//! module just fans each signal out to every subscriber via a broadcast
//! channel, giving each signal kind one logical registration point.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;

/// The signals DisOrder's server cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisorderSignal {
    /// Graceful shutdown request.
    Term,
    /// Reload configuration.
    Hup,
    /// Interactive interrupt (same handling as `Term`).
    Int,
}

/// Fans out Unix signals to every subscriber.
pub struct SignalHub {
    tx: broadcast::Sender<DisorderSignal>,
}

impl SignalHub {
    pub fn new() -> std::io::Result<Self> {
        let (tx, _) = broadcast::channel(16);
        Ok(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisorderSignal> {
        self.tx.subscribe()
    }

    /// Runs the signal-listening loop until `shutdown` fires. Spawned once
    /// from `bootstrap`.
    pub async fn run(&self, shutdown: tokio_util::sync::CancellationToken) -> std::io::Result<()> {
        let mut term = signal(SignalKind::terminate())?;
        let mut hup = signal(SignalKind::hangup())?;
        let mut int = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = term.recv() => { let _ = self.tx.send(DisorderSignal::Term); }
                _ = hup.recv() => { let _ = self.tx.send(DisorderSignal::Hup); }
                _ = int.recv() => { let _ = self.tx.send(DisorderSignal::Int); }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_each_get_their_own_receiver() {
        let hub = SignalHub::new().unwrap();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();
        hub.tx.send(DisorderSignal::Hup).unwrap();
        assert_eq!(rx1.recv().await.unwrap(), DisorderSignal::Hup);
        assert_eq!(rx2.recv().await.unwrap(), DisorderSignal::Hup);
    }
}
