//! Bridge implementation that maps domain events to the `log` streaming
//! transport.
//!
//! The [`BroadcastEventBridge`] lives at the boundary between domain
//! services (queue engine, protocol engine, RTP sender) and the `log`
//! command's per-connection fan-out, mapping [`LogEvent`] occurrences onto
//! a `tokio::sync::broadcast` channel that every subscribed connection
//! reads from independently.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::LogEvent;

/// Bridges domain events to the `log` command's broadcast channel.
///
/// For deployments that also want events forwarded elsewhere (e.g. a
/// metrics sidecar), the bridge forwards to an optional external emitter
/// that can be set after construction.
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<LogEvent>,
    external_emitter: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Creates a new bridge wrapping an existing broadcast sender.
    pub fn with_sender(tx: broadcast::Sender<LogEvent>) -> Self {
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets an external emitter for additional event delivery.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.external_emitter.write() = Some(emitter);
    }

    /// Returns a new receiver for the broadcast channel.
    ///
    /// Each `log`-subscribed connection holds its own receiver so a slow
    /// reader only lags its own queue, never another connection's.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }

    /// Returns a reference to the broadcast sender.
    pub fn sender(&self) -> &broadcast::Sender<LogEvent> {
        &self.tx
    }
}

impl EventEmitter for BroadcastEventBridge {
    fn emit(&self, event: LogEvent) {
        if let Some(ref emitter) = *self.external_emitter.read() {
            emitter.emit(event.clone());
        }
        if let Err(e) = self.tx.send(event) {
            tracing::trace!("no log subscribers: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogEventKind;

    #[test]
    fn subscriber_receives_emitted_events_in_order() {
        let bridge = BroadcastEventBridge::new(16);
        let mut rx = bridge.subscribe();
        bridge.emit(LogEvent::new(LogEventKind::Queue, vec!["a".into()]));
        bridge.emit(LogEvent::new(LogEventKind::Playing, vec!["b".into()]));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, LogEventKind::Queue);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.kind, LogEventKind::Playing);
    }

    #[test]
    fn external_emitter_also_receives_events() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct CountingEmitter(AtomicUsize);
        impl EventEmitter for CountingEmitter {
            fn emit(&self, _event: LogEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bridge = BroadcastEventBridge::new(16);
        let counter = Arc::new(CountingEmitter(AtomicUsize::new(0)));
        bridge.set_external_emitter(counter.clone());
        bridge.emit(LogEvent::new(LogEventKind::Volume, vec![]));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bridge = BroadcastEventBridge::new(4);
        bridge.emit(LogEvent::new(LogEventKind::Rescanned, vec!["0".into()]));
    }
}
