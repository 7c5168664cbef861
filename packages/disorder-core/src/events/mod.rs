//! Event log fan-out for streaming `log` subscribers.
//!
//! This module provides:
//! - [`EventEmitter`] trait for domain services (queue, protocol, RTP) to
//!   emit log events without depending on the transport that fans them out
//! - [`LogEvent`] and its per-category payloads, matching the event-log
//!   line grammar `<hex-seconds> <kind> [<quoted-arg>...]`
//!
//! The actual transport (one line per event written to every connection
//! subscribed via the `log` command) lives in `protocol::logstream` and
//! consumes a [`BroadcastEventBridge`].

mod bridge;
mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

/// A single event-log occurrence, tagged with the kind word the wire
/// grammar uses and carrying its arguments pre-rendered as the quoted
/// tokens that follow it on the line.
///
/// Arguments are kept as already-tokenized strings (rather than typed
/// fields re-serialized at fan-out time) because the wire format is the
/// protocol's own tokenizer output, not JSON — the `queue` event's
/// argument, for instance, is itself a marshalled queue entry.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Seconds since the epoch when the event occurred.
    pub timestamp: u64,
    /// The event kind, one of the grammar's fixed kind words.
    pub kind: LogEventKind,
    /// Arguments, in emission order, each to be written as one quoted
    /// token.
    pub args: Vec<String>,
    /// Whether this event concerns user-account management and should
    /// be withheld from non-admin, non-local subscribers when
    /// `remote_userman` is disabled.
    pub user_management: bool,
}

/// The fixed set of event-log kind words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEventKind {
    Playing,
    Scratched,
    Completed,
    Failed,
    Moved,
    Removed,
    Queue,
    RecentAdded,
    RecentRemoved,
    State,
    Volume,
    RightsChanged,
    Rescanned,
    Adopted,
}

impl LogEventKind {
    /// The literal word written on the wire for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::Scratched => "scratched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Moved => "moved",
            Self::Removed => "removed",
            Self::Queue => "queue",
            Self::RecentAdded => "recent_added",
            Self::RecentRemoved => "recent_removed",
            Self::State => "state",
            Self::Volume => "volume",
            Self::RightsChanged => "rights_changed",
            Self::Rescanned => "rescanned",
            Self::Adopted => "adopted",
        }
    }
}

impl LogEvent {
    pub fn new(kind: LogEventKind, args: Vec<String>) -> Self {
        Self {
            timestamp: crate::utils::now_secs(),
            kind,
            args,
            user_management: false,
        }
    }

    /// Marks this event as user-management sensitive (filtered per
    /// `remote_userman`).
    pub fn user_management(mut self) -> Self {
        self.user_management = true;
        self
    }
}
