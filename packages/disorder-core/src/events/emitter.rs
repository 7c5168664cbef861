//! Event emitter abstraction for decoupling services from transport.
//!
//! The queue engine, protocol engine, and RTP sender depend on the
//! [`EventEmitter`] trait rather than a concrete broadcast channel, so
//! they can be unit-tested without a live `log` subscriber attached.

use super::LogEvent;

/// Trait for emitting event-log occurrences without knowledge of transport.
pub trait EventEmitter: Send + Sync {
    /// Emits one event-log line's worth of content.
    fn emit(&self, event: LogEvent);
}

/// No-op emitter, used in unit tests that don't care about the log stream.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: LogEvent) {}
}

/// Logging emitter: forwards every event to `tracing` at debug level in
/// addition to (or instead of) any live broadcast fan-out.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: LogEvent) {
        tracing::debug!(kind = event.kind.as_str(), args = ?event.args, "log_event");
    }
}

#[cfg(test)]
mod tests {
    use super::super::LogEventKind;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEventEmitter {
        count: AtomicUsize,
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, _event: LogEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter {
            count: AtomicUsize::new(0),
        });

        emitter.emit(LogEvent::new(LogEventKind::Playing, vec!["id1".into()]));
        emitter.emit(LogEvent::new(LogEventKind::Queue, vec![]));

        assert_eq!(emitter.count.load(Ordering::SeqCst), 2);
    }
}
