//! The client protocol engine: wire codec, per-connection lifecycle,
//! command dispatch, and the collaborators individual commands consult
//! (playlists, schedule, global preferences, volume, the streaming event
//! log).
//!
//! [`connection::serve_connection`] is the entry point a listener hands an
//! accepted socket to; it drives the read loop, delegating each parsed
//! command line to [`commands::dispatch`].

pub mod commands;
pub mod connection;
pub mod global_prefs;
pub mod logstream;
pub mod playlists;
pub mod response;
pub mod schedule;
pub mod volume;
pub mod wire;

pub use response::Response;
