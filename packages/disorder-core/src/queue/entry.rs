//! Queue entry data model.
//!
//! `wait_status` captures the raw wait(2) status word as an
//! exit-code/terminating-signal pair recorded at reap time.

use serde::{Deserialize, Serialize};

use crate::trackdb::TrackId;

/// Where a queue entry came from, governing which `*-mine`/`*-random`/
/// `*-any` right applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Submitted directly by a user via `play`/`playafter`.
    Submitted,
    /// Chosen by the random selector.
    Random,
    /// A random-origin entry a user has taken ownership of via `adopt`.
    Adopted,
    /// A scratch-clip entry inserted by the `scratch` command.
    Scratch,
}

/// The playing-entry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Submitted/selected but its decoder has not yet produced audio.
    Unplayed,
    /// Actively playing.
    Started,
    /// Playback paused; decoder suspended.
    Paused,
    /// Terminated normally (decoder exited 0).
    Ok,
    /// Terminated abnormally (decoder exited non-zero or was killed).
    Failed,
    /// Terminated by a `scratch` command.
    Scratched,
    /// Terminated because the server is shutting down.
    Quitting,
    /// Decoder could not be launched at all.
    NoPlayer,
    /// A scratch-clip entry currently playing.
    IsScratch,
}

impl EntryState {
    /// True for the states the "at most one entry has state
    /// started/paused/no_player/isscratch" invariant covers — the
    /// *playing* entry.
    pub fn is_playing_slot(self) -> bool {
        matches!(
            self,
            Self::Started | Self::Paused | Self::NoPlayer | Self::IsScratch
        )
    }

    /// True for states that move an entry to history.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Ok | Self::Failed | Self::Scratched | Self::Quitting
        )
    }

    /// The wire word reported in `queue`/`recent`/`playing` responses and
    /// the `state` event-log kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unplayed => "unplayed",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Scratched => "scratched",
            Self::Quitting => "quitting",
            Self::NoPlayer => "no_player",
            Self::IsScratch => "isscratch",
        }
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The exit status of a reaped decoder subprocess, captured at reap time
/// as the raw wait(2) status word, decomposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitStatus {
    pub exit_code: Option<i32>,
    pub terminating_signal: Option<i32>,
}

impl WaitStatus {
    pub fn from_exit_status(status: std::process::ExitStatus) -> Self {
        use crate::reactor::children::ExitStatusExt;
        Self {
            exit_code: status.exit_code(),
            terminating_signal: status.terminating_signal(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A single queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Stable, opaque, monotonic-within-boot identifier.
    pub id: String,
    pub track: TrackId,
    pub submitter: Option<String>,
    /// Unix seconds the entry was submitted.
    pub when: u64,
    /// Unix seconds playback actually started, 0 if never.
    pub played: u64,
    pub state: EntryState,
    pub scratched_by: Option<String>,
    pub wait_status: Option<WaitStatus>,
    pub origin: Origin,
    /// Frames already transmitted from this entry.
    pub sofar: u64,
}

impl QueueEntry {
    pub fn new_submitted(id: String, track: TrackId, submitter: String, when: u64) -> Self {
        Self {
            id,
            track,
            submitter: Some(submitter),
            when,
            played: 0,
            state: EntryState::Unplayed,
            scratched_by: None,
            wait_status: None,
            origin: Origin::Submitted,
            sofar: 0,
        }
    }

    pub fn new_random(id: String, track: TrackId, when: u64) -> Self {
        Self {
            id,
            track,
            submitter: None,
            when,
            played: 0,
            state: EntryState::Unplayed,
            scratched_by: None,
            wait_status: None,
            origin: Origin::Random,
            sofar: 0,
        }
    }

    pub fn new_scratch_clip(id: String, track: TrackId, when: u64) -> Self {
        Self {
            id,
            track,
            submitter: None,
            when,
            played: 0,
            state: EntryState::Unplayed,
            scratched_by: None,
            wait_status: None,
            origin: Origin::Scratch,
            sofar: 0,
        }
    }

    /// True if this entry was chosen by the random selector and not yet
    /// adopted (the access pattern `right_scoped`'s `is_random_origin`
    /// parameter needs).
    pub fn is_random_origin(&self) -> bool {
        matches!(self.origin, Origin::Random)
    }

    /// Renders one quoted-token summary line for the `queue`/`recent`/
    /// `playing` commands' dot-stuffed body: `id track submitter state`.
    pub fn summary_line(&self) -> String {
        let submitter = self.submitter.as_deref().unwrap_or("-");
        format!(
            "{} {} {} {}",
            crate::protocol::wire::quote_token(&self.id),
            crate::protocol::wire::quote_token(self.track.as_str()),
            crate::protocol::wire::quote_token(submitter),
            crate::protocol::wire::quote_token(self.state.as_str()),
        )
    }
}
