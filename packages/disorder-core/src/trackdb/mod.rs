//! Track library interface.
//!
//! The track database is an opaque collaborator: the queue engine and
//! protocol engine only need to resolve aliases to canonical paths, check
//! existence, read/write per-track preferences, list/search the library,
//! and pick a random track under a weighting scheme. [`TrackDatabase`] is
//! that interface; [`FsTrackDatabase`] is a filesystem-backed
//! implementation sufficient to run the server standalone, not a
//! replacement for a full tag database.

mod fs;

pub use fs::FsTrackDatabase;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An opaque track identifier: a canonical path into the library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TrackId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for TrackId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Weighting parameters for [`TrackDatabase::pick_random`], named for the
/// configuration keys that drive them: `replay_min`, `new_max`,
/// `new_bias_age`, `new_bias`.
#[derive(Debug, Clone)]
pub struct RandomFilter<'a> {
    /// Tracks played within this long are excluded from selection.
    pub replay_min: Duration,
    /// At most this many of the library's newest tracks are eligible for
    /// the new-track weighting below (older tracks are weighted normally
    /// but still eligible).
    pub new_max: usize,
    /// A track younger than this age receives the `new_bias` weight
    /// multiplier.
    pub new_bias_age: Duration,
    /// Weight multiplier (in the sense of "this many times as likely")
    /// applied to tracks younger than `new_bias_age`.
    pub new_bias: u64,
    /// Tracks to exclude outright regardless of weighting (the queue
    /// engine's recent-history ring, played more recently than
    /// `replay_min` ago).
    pub recently_played: &'a [TrackId],
}

/// The interface the queue engine and protocol engine consume for track
/// resolution, preferences, and random selection.
///
/// Implementations are synchronous: library scans and preference writes
/// are expected to be fast in-memory index lookups backed by an
/// occasional blocking rescan, which callers run via a dedicated blocking
/// task/child process rather than on the connection-handling path.
pub trait TrackDatabase: Send + Sync {
    /// Resolves a client-supplied alias (a relative or absolute path) to
    /// a canonical [`TrackId`], or `None` if it does not name a track in
    /// the library.
    fn resolve(&self, alias: &str) -> Option<TrackId>;

    /// True if `track` currently exists in the library index.
    fn exists(&self, track: &TrackId) -> bool;

    /// Reads a per-track preference value (`get`/`get-global` when
    /// `track` is the sentinel global scope are handled by the protocol
    /// layer, not here).
    fn get_pref(&self, track: &TrackId, key: &str) -> Option<String>;

    /// Writes a per-track preference value.
    fn set_pref(&self, track: &TrackId, key: &str, value: &str) -> std::io::Result<()>;

    /// Removes a per-track preference value.
    fn unset_pref(&self, track: &TrackId, key: &str) -> std::io::Result<()>;

    /// Lists every preference currently stored for `track`, for the
    /// `prefs` command's full dump (as opposed to [`Self::get_pref`]'s
    /// single-key lookup).
    fn prefs(&self, track: &TrackId) -> Vec<(String, String)>;

    /// Lists the direct children of `dir` (one level, matching the `dirs`/
    /// `files`/`allfiles` commands' directory-listing semantics).
    fn list(&self, dir: &str) -> Vec<TrackId>;

    /// Finds tracks whose path contains every word in `words`
    /// (case-insensitive), the `search` command's matcher.
    fn search(&self, words: &[String]) -> Vec<TrackId>;

    /// Picks one track at random under `filter`'s weighting, or `None` if
    /// the library has nothing eligible.
    fn pick_random(&self, filter: &RandomFilter<'_>) -> Option<TrackId>;

    /// Re-walks the library from disk, replacing the in-memory index.
    /// Returns the number of tracks found. Expected to be invoked from a
    /// blocking task, not the connection-handling path.
    fn rescan(&self) -> std::io::Result<usize>;
}
