//! DisOrder Core - shared library for the DisOrder network jukebox.
//!
//! This crate implements the four tightly coupled subsystems that make up
//! a running DisOrder server:
//!
//! - [`reactor`]: timer wheel, signal fan-out, and subprocess reaping built
//!   on the tokio runtime
//! - [`queue`]: the playing state machine, journal persistence, prepare-
//!   ahead, and random selection
//! - [`protocol`]: the line-based client protocol, authentication, rights
//!   enforcement, and the streaming event log
//! - [`rtp`]: the sample-clocked RTP packet sender
//!
//! plus the collaborators those subsystems depend on: [`trackdb`] (the
//! track library), [`users`] (accounts and cookies), [`rights`], and
//! [`config`].
//!
//! # Concurrency model
//!
//! Although this crate runs on a multi-thread tokio runtime rather than a
//! single-threaded reactor, it preserves a "no interleaved partial
//! mutation" guarantee by giving each stateful subsystem exactly one lock
//! acquired for the duration of a single logical mutation, never held
//! across an `.await` (see [`queue::QueueEngine`], [`rtp::RtpSender`],
//! [`users::CookieStore`]).

#![warn(clippy::all)]

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod listener;
pub mod mailer;
pub mod protocol;
pub mod queue;
pub mod reactor;
pub mod rights;
pub mod rtp;
pub mod runtime;
pub mod trackdb;
pub mod users;
pub mod utils;

pub use bootstrap::{bootstrap_services, bootstrap_services_at, BootstrappedServices};
pub use config::Config;
pub use error::{DisorderError, DisorderResult, ErrorCode};
pub use events::{BroadcastEventBridge, EventEmitter, LogEvent, LogEventKind};
pub use queue::{QueueEngine, QueueEntry, QueueState};
pub use rights::Rights;
pub use rtp::{RtpMode, RtpSender};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use trackdb::{FsTrackDatabase, TrackDatabase, TrackId};
pub use users::{AuthAlgorithm, CookieStore, UserStore};

/// Protocol version advertised in the greeting banner (`231 2 ...`).
pub const PROTOCOL_VERSION: u32 = 2;
