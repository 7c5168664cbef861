//! Event reactor primitives.
//!
//! A classic single-threaded jukebox server funnels fds, timeouts,
//! signals, and children through one `select`/min-heap/self-pipe loop. On
//! top of the tokio runtime those four responsibilities become four
//! small, independently testable components instead of one monolithic
//! `select`: a lazily-cancelled [`timer::TimerWheel`], a
//! [`signals::SignalHub`], and a [`children::ChildReaper`]. Listener and
//! connection I/O (the fourth responsibility) is ordinary `tokio::net`
//! usage and lives in `crate::listener`/`crate::protocol::connection`.

pub mod children;
pub mod signals;
pub mod timer;

pub use children::ChildReaper;
pub use signals::SignalHub;
pub use timer::TimerWheel;
