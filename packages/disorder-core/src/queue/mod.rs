//! The queue engine: the playing-entry state machine, prepare-ahead
//! random selection, and journal persistence.
//!
//! A running server has exactly one [`QueueEngine`]. Every mutation
//! (submit, remove, move, scratch, pause/resume, decoder completion)
//! takes the single internal lock for the duration of that mutation and
//! releases it before touching the track database, RTP sender, or event
//! emitter — the same "no interleaved partial mutation, never held
//! across an `.await`" discipline [`crate::users::CookieStore`] and
//! [`crate::rtp::RtpSender`] use.

mod entry;
mod journal;

pub use entry::{EntryState, Origin, QueueEntry, WaitStatus};

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Child;

use crate::error::{DisorderError, DisorderResult};
use crate::events::{EventEmitter, LogEvent, LogEventKind};
use crate::rights::{right_scoped, Rights};
use crate::rtp::RtpSender;
use crate::runtime::TaskSpawner;
use crate::trackdb::{RandomFilter, TrackDatabase, TrackId};

const JOURNAL_FILE: &str = "queue.journal";

/// Tuning the queue engine needs out of [`crate::config::Config`],
/// gathered so callers don't have to hand the whole config through.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub queue_pad: usize,
    pub history: usize,
    pub replay_min: Duration,
    pub new_max: usize,
    pub new_bias_age: Duration,
    pub new_bias: u64,
    pub decoder_command: Vec<String>,
    /// Scratch clip candidates, chosen uniformly by the `scratch` command.
    pub scratch: Vec<PathBuf>,
}

impl From<&crate::config::Config> for QueueConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            queue_pad: config.queue_pad,
            history: config.history,
            replay_min: Duration::from_secs(config.replay_min),
            new_max: config.new_max,
            new_bias_age: Duration::from_secs(config.new_bias_age),
            new_bias: config.new_bias,
            decoder_command: config.decoder_command.clone(),
            scratch: config.scratch.clone(),
        }
    }
}

/// A point-in-time snapshot of the queue and its recent history, for the
/// `queue`/`recent` commands and the `log` stream's initial catch-up.
#[derive(Debug, Clone, Default)]
pub struct QueueState {
    pub entries: Vec<QueueEntry>,
    pub history: Vec<QueueEntry>,
}

struct Inner {
    entries: Vec<QueueEntry>,
    history: VecDeque<QueueEntry>,
    next_seq: u64,
    boot_nonce: String,
    /// Queue id to position in `entries`, rebuilt with [`Self::reindex`]
    /// after every mutation that changes positions. `find` would otherwise
    /// be an O(n) scan of the whole queue on every lookup.
    index: HashMap<String, usize>,
}

impl Inner {
    fn alloc_id(&mut self) -> String {
        let id = format!("{}-{}", self.boot_nonce, self.next_seq);
        self.next_seq += 1;
        id
    }

    fn find(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Rebuilds `index` from `entries`. Whole-index rebuild rather than
    /// incremental maintenance: every mutation here already re-walks or
    /// re-slices `entries` (insert/remove/move all shift positions), so a
    /// full rebuild is no more expensive than patching the shifted range
    /// and is much harder to get wrong.
    fn reindex(&mut self) {
        self.index.clear();
        self.index.extend(self.entries.iter().enumerate().map(|(i, e)| (e.id.clone(), i)));
    }
}

fn boot_nonce() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A spawned decoder subprocess and the pipe feeding its stdout to the
/// RTP sender, tracked outside the main lock since it outlives any
/// single mutation and is torn down asynchronously on scratch/removal.
struct Transient {
    child: Child,
    /// Launched by [`QueueEngine::prepare_next`] ahead of the entry
    /// reaching the playing slot, rather than by [`QueueEngine::start_entry`]
    /// when it got there. A prepared transient is reused by `start_entry`
    /// instead of relaunching the decoder, and is the only kind
    /// [`QueueEngine::abandon_prepared`] is allowed to kill — one that's
    /// actually playing is torn down through `scratch`/`shutdown` instead.
    prepared: bool,
}

/// The queue engine.
pub struct QueueEngine {
    inner: Mutex<Inner>,
    transient: Mutex<HashMap<String, Transient>>,
    journal_path: PathBuf,
    trackdb: Arc<dyn TrackDatabase>,
    emitter: Arc<dyn EventEmitter>,
    spawner: Arc<dyn TaskSpawner>,
    rtp: Arc<RtpSender>,
    config: Mutex<QueueConfig>,
    /// Gates [`Self::start_next_if_idle`]: `disable`/`enable` stop new
    /// tracks from starting without disturbing whatever is already
    /// playing.
    playback_enabled: AtomicBool,
    /// Gates [`Self::fill_random`]: `random-disable`/`random-enable`.
    random_enabled: AtomicBool,
}

impl QueueEngine {
    /// Loads the journal from `home/queue.journal`, creating a fresh
    /// (empty) queue if none exists.
    ///
    /// Decoder subprocesses are reaped directly by the stdout-pump task
    /// each one gets (see [`Self::start_entry`]); `reactor::ChildReaper`
    /// is for the other fire-and-forget subprocesses a running server
    /// spawns (the rescan helper), not for queue playback.
    pub fn load(
        home: &std::path::Path,
        trackdb: Arc<dyn TrackDatabase>,
        emitter: Arc<dyn EventEmitter>,
        spawner: Arc<dyn TaskSpawner>,
        rtp: Arc<RtpSender>,
        config: QueueConfig,
    ) -> std::io::Result<Arc<Self>> {
        let journal_path = home.join(JOURNAL_FILE);
        let (entries, history) = journal::load_journal(&journal_path)?;
        let history_cap = config.history;
        let mut inner = Inner {
            entries,
            history: history.into_iter().collect(),
            next_seq: 0,
            boot_nonce: boot_nonce(),
            index: HashMap::new(),
        };
        inner.reindex();
        Ok(Arc::new(Self {
            inner: Mutex::new(inner),
            transient: Mutex::new(HashMap::new()),
            journal_path,
            trackdb,
            emitter,
            spawner,
            rtp,
            config: Mutex::new(QueueConfig {
                history: history_cap,
                ..config
            }),
            playback_enabled: AtomicBool::new(true),
            random_enabled: AtomicBool::new(true),
        }))
    }

    /// True unless a `disable` command has suspended starting new tracks.
    pub fn playback_enabled(&self) -> bool {
        self.playback_enabled.load(Ordering::Relaxed)
    }

    pub fn set_playback_enabled(&self, enabled: bool) {
        self.playback_enabled.store(enabled, Ordering::Relaxed);
    }

    /// True unless a `random-disable` command has suspended padding the
    /// queue with random selections.
    pub fn random_enabled(&self) -> bool {
        self.random_enabled.load(Ordering::Relaxed)
    }

    pub fn set_random_enabled(&self, enabled: bool) {
        self.random_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Replaces the tuning knobs (`queue_pad`, `history`, `replay_min`,
    /// new-track bias, `decoder_command`, `scratch`) in place, for
    /// `reconfigure`. A lowered `history` limit takes effect the next time
    /// an entry is appended to history rather than truncating immediately.
    pub fn set_config(&self, config: QueueConfig) {
        *self.config.lock() = config;
    }

    /// Writes the journal. Callers that hold a client waiting on the
    /// result (`play`, `play_after`, `remove`, `move_entry`, `adopt`,
    /// `scratch`) must roll back the mutation they just made and report
    /// the failure rather than claim success over an unpersisted queue —
    /// spec.md's "journal equals memory" invariant would otherwise only
    /// hold until the next crash. Background callers with no one to
    /// report to (`fill_random`, `fail_entry`, `shutdown`) log and move on.
    fn persist(&self, inner: &Inner) -> std::io::Result<()> {
        let history: Vec<QueueEntry> = inner.history.iter().cloned().collect();
        journal::write_journal(&self.journal_path, &inner.entries, &history)
    }

    fn emit(&self, kind: LogEventKind, args: Vec<String>) {
        self.emitter.emit(LogEvent::new(kind, args));
    }

    /// A snapshot of the queue and history, for the `queue`/`recent`
    /// commands.
    pub fn state(&self) -> QueueState {
        let inner = self.inner.lock();
        QueueState {
            entries: inner.entries.clone(),
            history: inner.history.iter().cloned().collect(),
        }
    }

    /// The currently playing entry, if any (the head of the queue when
    /// its state occupies the single playing slot).
    pub fn playing(&self) -> Option<QueueEntry> {
        let inner = self.inner.lock();
        inner
            .entries
            .first()
            .filter(|e| e.state.is_playing_slot())
            .cloned()
    }

    /// Submits a track at the back of the queue.
    pub fn play(&self, track: TrackId, submitter: &str) -> DisorderResult<QueueEntry> {
        let mut inner = self.inner.lock();
        let id = inner.alloc_id();
        let when = crate::utils::now_secs();
        let entry = QueueEntry::new_submitted(id, track, submitter.to_string(), when);
        inner.entries.push(entry.clone());
        inner.reindex();
        if let Err(err) = self.persist(&inner) {
            tracing::error!(%err, "failed to persist queue journal on play");
            inner.entries.pop();
            inner.reindex();
            return Err(DisorderError::Temporary(format!("queue journal write failed: {err}")));
        }
        drop(inner);
        self.emit(LogEventKind::Queue, vec![entry.id.clone()]);
        Ok(entry)
    }

    /// Submits a track immediately after `after_id`, or at the front of
    /// the queue if `after_id` is `None`. The playing entry (if any) is
    /// never displaced — inserting "at the front" means position 1, not
    /// position 0.
    pub fn play_after(
        &self,
        after_id: Option<&str>,
        track: TrackId,
        submitter: &str,
    ) -> DisorderResult<QueueEntry> {
        let mut inner = self.inner.lock();
        let id = inner.alloc_id();
        let when = crate::utils::now_secs();
        let entry = QueueEntry::new_submitted(id, track, submitter.to_string(), when);

        let insert_at = match after_id {
            Some(after_id) => {
                let pos = inner
                    .find(after_id)
                    .ok_or_else(|| DisorderError::NotFound(format!("no such queue id: {after_id}")))?;
                pos + 1
            }
            None => {
                if inner.entries.first().is_some_and(|e| e.state.is_playing_slot()) {
                    1
                } else {
                    0
                }
            }
        };
        inner.entries.insert(insert_at, entry.clone());
        inner.reindex();
        if let Err(err) = self.persist(&inner) {
            tracing::error!(%err, "failed to persist queue journal on play_after");
            inner.entries.remove(insert_at);
            inner.reindex();
            return Err(DisorderError::Temporary(format!("queue journal write failed: {err}")));
        }
        drop(inner);
        self.emit(LogEventKind::Queue, vec![entry.id.clone()]);
        Ok(entry)
    }

    /// Removes a queue entry, enforcing the mine/random/any-scoped
    /// remove rights.
    pub fn remove(&self, id: &str, rights: Rights, user: &str) -> DisorderResult<()> {
        let mut inner = self.inner.lock();
        let pos = inner
            .find(id)
            .ok_or_else(|| DisorderError::NotFound(format!("no such queue id: {id}")))?;
        if inner.entries[pos].state.is_playing_slot() {
            return Err(DisorderError::Argument(
                "cannot remove the currently playing entry, use scratch".into(),
            ));
        }
        let entry = &inner.entries[pos];
        if !right_scoped(
            rights,
            Rights::REMOVE_MINE,
            Rights::REMOVE_RANDOM,
            Rights::REMOVE_ANY,
            user,
            entry.submitter.as_deref(),
            entry.is_random_origin(),
        ) {
            return Err(DisorderError::Rights("remove requires a remove right".into()));
        }
        let removed = inner.entries.remove(pos);
        inner.reindex();
        if let Err(err) = self.persist(&inner) {
            tracing::error!(%err, "failed to persist queue journal on remove");
            inner.entries.insert(pos, removed);
            inner.reindex();
            return Err(DisorderError::Temporary(format!("queue journal write failed: {err}")));
        }
        drop(inner);
        self.abandon_prepared(id);
        self.emit(LogEventKind::Removed, vec![id.to_string()]);
        Ok(())
    }

    /// Moves a queue entry to immediately after `after_id` (or the front
    /// if `None`), enforcing the mine/random/any-scoped move rights.
    pub fn move_entry(
        &self,
        id: &str,
        after_id: Option<&str>,
        rights: Rights,
        user: &str,
    ) -> DisorderResult<()> {
        let mut inner = self.inner.lock();
        let pos = inner
            .find(id)
            .ok_or_else(|| DisorderError::NotFound(format!("no such queue id: {id}")))?;
        if inner.entries[pos].state.is_playing_slot() {
            return Err(DisorderError::Argument(
                "cannot move the currently playing entry".into(),
            ));
        }
        {
            let entry = &inner.entries[pos];
            if !right_scoped(
                rights,
                Rights::MOVE_MINE,
                Rights::MOVE_RANDOM,
                Rights::MOVE_ANY,
                user,
                entry.submitter.as_deref(),
                entry.is_random_origin(),
            ) {
                return Err(DisorderError::Rights("move requires a move right".into()));
            }
        }
        let entry = inner.entries.remove(pos);
        inner.reindex();
        let target = match after_id {
            Some(after_id) => match inner.find(after_id) {
                Some(after_pos) => after_pos + 1,
                None => {
                    inner.entries.insert(pos, entry);
                    inner.reindex();
                    return Err(DisorderError::NotFound(format!("no such queue id: {after_id}")));
                }
            },
            None => {
                if inner.entries.first().is_some_and(|e| e.state.is_playing_slot()) {
                    1
                } else {
                    0
                }
            }
        };
        let target = target.min(inner.entries.len());
        inner.entries.insert(target, entry);
        inner.reindex();
        if let Err(err) = self.persist(&inner) {
            tracing::error!(%err, "failed to persist queue journal on move_entry");
            let entry = inner.entries.remove(target);
            inner.entries.insert(pos, entry);
            inner.reindex();
            return Err(DisorderError::Temporary(format!("queue journal write failed: {err}")));
        }
        drop(inner);
        self.abandon_prepared(id);
        self.emit(LogEventKind::Moved, vec![id.to_string()]);
        Ok(())
    }

    /// Converts a random-origin entry to an adopted one, taking
    /// ownership on behalf of `user`.
    pub fn adopt(&self, id: &str, user: &str) -> DisorderResult<()> {
        let mut inner = self.inner.lock();
        let pos = inner
            .find(id)
            .ok_or_else(|| DisorderError::NotFound(format!("no such queue id: {id}")))?;
        if !inner.entries[pos].is_random_origin() {
            return Err(DisorderError::Argument(
                "only a randomly selected entry can be adopted".into(),
            ));
        }
        let prior_origin = inner.entries[pos].origin.clone();
        let prior_submitter = inner.entries[pos].submitter.clone();
        inner.entries[pos].origin = Origin::Adopted;
        inner.entries[pos].submitter = Some(user.to_string());
        if let Err(err) = self.persist(&inner) {
            tracing::error!(%err, "failed to persist queue journal on adopt");
            inner.entries[pos].origin = prior_origin;
            inner.entries[pos].submitter = prior_submitter;
            return Err(DisorderError::Temporary(format!("queue journal write failed: {err}")));
        }
        drop(inner);
        self.emit(LogEventKind::Adopted, vec![id.to_string(), user.to_string()]);
        Ok(())
    }

    /// Scratches (stops) the currently playing entry, then inserts a
    /// uniformly-chosen clip from `scratch` at the head of the queue and
    /// lets normal play resume once it finishes.
    pub async fn scratch(self: &Arc<Self>, rights: Rights, user: &str) -> DisorderResult<()> {
        let entry = {
            let inner = self.inner.lock();
            inner
                .entries
                .first()
                .filter(|e| e.state.is_playing_slot())
                .cloned()
                .ok_or_else(|| DisorderError::Argument("nothing is playing".into()))?
        };
        if !right_scoped(
            rights,
            Rights::SCRATCH_MINE,
            Rights::SCRATCH_RANDOM,
            Rights::SCRATCH_ANY,
            user,
            entry.submitter.as_deref(),
            entry.is_random_origin(),
        ) {
            return Err(DisorderError::Rights("scratch requires a scratch right".into()));
        }
        self.kill_transient(&entry.id, libc_sigterm());

        // Both the state transition and the clip insertion must land in
        // the same journal write: persisting only the clip (as a prior
        // version of this method did) would lose the scratch disposition
        // entirely if no scratch clip was ever configured.
        let mut inner = self.inner.lock();
        let clip_id = self.choose_scratch_clip().map(|track| {
            let id = inner.alloc_id();
            let when = crate::utils::now_secs();
            inner.entries.insert(0, QueueEntry::new_scratch_clip(id.clone(), track, when));
            id
        });
        if clip_id.is_some() {
            inner.reindex();
        }
        let pos = inner.find(&entry.id);
        let prior = pos.map(|p| (inner.entries[p].state, inner.entries[p].scratched_by.clone()));
        if let Some(p) = pos {
            inner.entries[p].state = EntryState::Scratched;
            inner.entries[p].scratched_by = Some(user.to_string());
        }
        if let Err(err) = self.persist(&inner) {
            tracing::error!(%err, "failed to persist queue journal on scratch");
            if let (Some(p), Some((state, scratched_by))) = (pos, prior) {
                inner.entries[p].state = state;
                inner.entries[p].scratched_by = scratched_by;
            }
            if clip_id.is_some() {
                inner.entries.remove(0);
                inner.reindex();
            }
            return Err(DisorderError::Temporary(format!("queue journal write failed: {err}")));
        }
        drop(inner);

        self.emit(LogEventKind::Scratched, vec![entry.id.clone(), user.to_string()]);
        if let Some(id) = clip_id {
            self.emit(LogEventKind::Queue, vec![id]);
        }
        self.tick().await;
        Ok(())
    }

    /// Picks one scratch clip uniformly at random from `scratch`: no
    /// per-clip weighting.
    fn choose_scratch_clip(&self) -> Option<TrackId> {
        use rand::seq::IndexedRandom;
        self.config
            .lock()
            .scratch
            .choose(&mut rand::rng())
            .map(|p| TrackId::new(p.to_string_lossy().into_owned()))
    }

    /// Pauses the currently playing entry by suspending its decoder.
    pub fn pause(&self, rights: Rights) -> DisorderResult<()> {
        if !rights.satisfies(Rights::PAUSE) {
            return Err(DisorderError::Rights("pause requires RIGHT_PAUSE".into()));
        }
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .first_mut()
            .filter(|e| e.state == EntryState::Started)
            .ok_or_else(|| DisorderError::Argument("nothing is playing".into()))?;
        let id = entry.id.clone();
        entry.state = EntryState::Paused;
        drop(inner);
        self.signal_transient(&id, Signal::Stop);
        self.emit(LogEventKind::State, vec![id, "paused".to_string()]);
        Ok(())
    }

    /// Resumes a paused entry by continuing its decoder.
    pub fn resume(&self, rights: Rights) -> DisorderResult<()> {
        if !rights.satisfies(Rights::PAUSE) {
            return Err(DisorderError::Rights("resume requires RIGHT_PAUSE".into()));
        }
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .first_mut()
            .filter(|e| e.state == EntryState::Paused)
            .ok_or_else(|| DisorderError::Argument("nothing is paused".into()))?;
        let id = entry.id.clone();
        entry.state = EntryState::Started;
        drop(inner);
        self.signal_transient(&id, Signal::Continue);
        self.emit(LogEventKind::State, vec![id, "started".to_string()]);
        Ok(())
    }

    fn kill_transient(&self, id: &str, sig: i32) {
        let transient = self.transient.lock();
        if let Some(t) = transient.get(id) {
            signal_child(&t.child, sig);
        }
    }

    fn signal_transient(&self, id: &str, sig: Signal) {
        #[cfg(unix)]
        {
            let raw = match sig {
                Signal::Stop => libc::SIGSTOP,
                Signal::Continue => libc::SIGCONT,
            };
            self.kill_transient(id, raw);
        }
        #[cfg(not(unix))]
        {
            let _ = (id, sig);
        }
    }

    /// Adds random selections until the queue reaches `queue_pad`
    /// entries, starts the next unplayed entry if nothing is currently
    /// playing, then launches the decoder for whatever comes after that
    /// so its output is already buffering by the time it's promoted.
    /// Intended to be driven by a periodic timer as well as after every
    /// decoder completion and queue mutation.
    pub async fn tick(self: &Arc<Self>) {
        self.fill_random();
        self.start_next_if_idle().await;
        self.prepare_next().await;
    }

    /// Drives the RTP clock independent of decoder output: while the
    /// playing entry is paused, keeps emitting empty-payload packets so
    /// receivers don't lose their timing reference (§4.E); while nothing
    /// is playing at all, marks the sender idle so the first packet of
    /// the next track resyncs `rtp_time` to the wall clock and carries
    /// the marker bit instead of leaving a stale clock behind.
    pub async fn rtp_keepalive_tick(&self) {
        match self.playing() {
            Some(entry) if entry.state == EntryState::Paused => {
                if let Err(err) = self.rtp.send_silence().await {
                    tracing::warn!(%err, "rtp silence send failed");
                }
            }
            None => self.rtp.note_idle(),
            _ => {}
        }
    }

    fn fill_random(&self) {
        if !self.random_enabled() {
            return;
        }
        loop {
            let config = self.config.lock().clone();
            let (needed, recently_played) = {
                let inner = self.inner.lock();
                if inner.entries.len() >= config.queue_pad {
                    return;
                }
                let cutoff = crate::utils::now_secs().saturating_sub(config.replay_min.as_secs());
                let recent: Vec<TrackId> = inner
                    .history
                    .iter()
                    .filter(|e| e.played >= cutoff)
                    .map(|e| e.track.clone())
                    .collect();
                (config.queue_pad - inner.entries.len(), recent)
            };
            if needed == 0 {
                return;
            }
            let filter = RandomFilter {
                replay_min: config.replay_min,
                new_max: config.new_max,
                new_bias_age: config.new_bias_age,
                new_bias: config.new_bias,
                recently_played: &recently_played,
            };
            let Some(track) = self.trackdb.pick_random(&filter) else {
                return;
            };
            let mut inner = self.inner.lock();
            let id = inner.alloc_id();
            let when = crate::utils::now_secs();
            let entry = QueueEntry::new_random(id.clone(), track, when);
            inner.entries.push(entry);
            inner.reindex();
            if let Err(err) = self.persist(&inner) {
                tracing::error!(%err, "failed to persist queue journal on fill_random");
                inner.entries.pop();
                inner.reindex();
                return;
            }
            drop(inner);
            self.emit(LogEventKind::Queue, vec![id]);
        }
    }

    async fn start_next_if_idle(self: &Arc<Self>) {
        if !self.playback_enabled() {
            return;
        }
        let already_playing = self.inner.lock().entries.first().is_some_and(|e| e.state.is_playing_slot());
        if already_playing {
            return;
        }
        let next = self.inner.lock().entries.first().cloned();
        let Some(entry) = next.filter(|e| e.state == EntryState::Unplayed) else {
            return;
        };
        self.start_entry(entry).await;
    }

    /// Launches the decoder for the entry sitting right after the playing
    /// slot, if any, so its PCM output is already buffering in the kernel
    /// pipe by the time [`Self::start_entry`] promotes it — avoiding
    /// decoder startup latency showing up as a gap between tracks.
    ///
    /// Idempotent: a target already prepared is left alone. A prepared
    /// transient whose entry is no longer the target (it was removed,
    /// moved, or the queue was scratched out from under it) is killed and
    /// reaped before moving on.
    async fn prepare_next(self: &Arc<Self>) {
        if !self.playback_enabled() {
            return;
        }
        let target = {
            let inner = self.inner.lock();
            let playing_now = inner.entries.first().is_some_and(|e| e.state.is_playing_slot());
            if !playing_now {
                None
            } else {
                inner.entries.get(1).filter(|e| e.state == EntryState::Unplayed).cloned()
            }
        };

        self.abandon_stale_prepared(target.as_ref().map(|e| e.id.as_str()));

        let Some(target) = target else { return };
        if self.transient.lock().contains_key(&target.id) {
            return;
        }
        if let Some(child) = self.spawn_decoder(&target) {
            self.transient.lock().insert(target.id.clone(), Transient { child, prepared: true });
        }
    }

    /// Kills and reaps every transient still marked `prepared` whose id
    /// isn't `keep_id`.
    fn abandon_stale_prepared(&self, keep_id: Option<&str>) {
        let stale: Vec<String> = self
            .transient
            .lock()
            .iter()
            .filter(|(id, t)| t.prepared && Some(id.as_str()) != keep_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.abandon_prepared(&id);
        }
    }

    /// Kills and reaps the transient for `id`, but only if it is still
    /// `prepared` — never one that has since been promoted to actually
    /// playing, which is torn down through `scratch`/`shutdown` instead.
    fn abandon_prepared(&self, id: &str) {
        let removed = {
            let mut transient = self.transient.lock();
            let is_prepared = transient.get(id).is_some_and(|t| t.prepared);
            if is_prepared {
                transient.remove(id)
            } else {
                None
            }
        };
        let Some(transient) = removed else { return };
        let mut child = transient.child;
        signal_child(&child, libc_sigterm());
        self.spawner.spawn(async move {
            let _ = child.wait().await;
        });
    }

    /// Spawns the decoder subprocess for `entry`'s track, per
    /// `decoder_command`. Shared by [`Self::start_entry`] (spawned right
    /// before it's needed) and [`Self::prepare_next`] (spawned ahead of
    /// time). Returns `None` if `decoder_command` is empty or the spawn
    /// itself fails; the caller is responsible for the resulting
    /// `no_player`/retry disposition.
    fn spawn_decoder(&self, entry: &QueueEntry) -> Option<Child> {
        let command = self
            .config
            .lock()
            .decoder_command
            .iter()
            .map(|part| part.replace("{path}", entry.track.as_str()))
            .collect::<Vec<_>>();
        let (program, args) = command.split_first()?;
        match tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
        {
            Ok(child) => Some(child),
            Err(err) => {
                tracing::warn!(%err, track = %entry.track, "failed to launch decoder");
                None
            }
        }
    }

    async fn start_entry(self: &Arc<Self>, entry: QueueEntry) {
        let prepared = self.transient.lock().remove(&entry.id);
        let mut child = match prepared {
            Some(transient) => transient.child,
            None => match self.spawn_decoder(&entry) {
                Some(child) => child,
                None => {
                    self.fail_entry(&entry.id, EntryState::NoPlayer, None).await;
                    return;
                }
            },
        };

        let stdout = child.stdout.take();
        {
            let mut inner = self.inner.lock();
            if let Some(e) = inner.entries.first_mut().filter(|e| e.id == entry.id) {
                e.state = EntryState::Started;
                e.played = crate::utils::now_secs();
            }
            if let Err(err) = self.persist(&inner) {
                tracing::error!(%err, "failed to persist queue journal on start_entry");
            }
        }
        self.emit(LogEventKind::Playing, vec![entry.id.clone()]);

        // Decoder children are reaped directly by the stdout-pump task
        // below, which needs the live `Child` to read its exit status
        // after EOF; `ChildReaper` tracks other fire-and-forget
        // subprocesses (the rescan helper) instead.
        self.transient.lock().insert(entry.id.clone(), Transient { child, prepared: false });

        let engine = Arc::clone(self);
        let entry_id = entry.id.clone();
        let rtp = Arc::clone(&self.rtp);
        self.spawner.spawn(async move {
            let mut reader = match stdout {
                Some(stdout) => BufReader::new(stdout),
                None => {
                    engine.decoder_finished(&entry_id, None).await;
                    return;
                }
            };
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(err) = rtp.send_pcm(&buf[..n]).await {
                            tracing::warn!(%err, "rtp send failed while streaming decoder output");
                        }
                        engine.add_sofar(&entry_id, n as u64);
                    }
                    Err(err) => {
                        tracing::warn!(%err, "error reading decoder stdout");
                        break;
                    }
                }
            }
            let status = engine.reap_transient(&entry_id).await;
            engine.decoder_finished(&entry_id, status).await;
        });
    }

    /// Terminates the currently playing entry (if any) for server
    /// shutdown, marking it `quitting` rather than `failed` so a restart
    /// can distinguish a deliberate stop from a decoder crash.
    pub fn shutdown(&self) {
        let entry_id = {
            let inner = self.inner.lock();
            inner
                .entries
                .first()
                .filter(|e| e.state.is_playing_slot())
                .map(|e| e.id.clone())
        };
        if let Some(id) = entry_id {
            self.kill_transient(&id, libc_sigterm());
            let mut inner = self.inner.lock();
            if let Some(e) = inner.entries.first_mut().filter(|e| e.id == id) {
                e.state = EntryState::Quitting;
            }
            if let Err(err) = self.persist(&inner) {
                tracing::error!(%err, "failed to persist queue journal on shutdown");
            }
        }
    }

    fn add_sofar(&self, id: &str, bytes: u64) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.entries.first_mut().filter(|e| e.id == id) {
            e.sofar += bytes;
        }
    }

    async fn reap_transient(&self, id: &str) -> Option<std::process::ExitStatus> {
        let child = self.transient.lock().remove(id);
        if let Some(mut transient) = child {
            transient.child.wait().await.ok()
        } else {
            None
        }
    }

    async fn decoder_finished(self: &Arc<Self>, id: &str, status: Option<std::process::ExitStatus>) {
        // `scratch`/`shutdown` mark an entry `scratched`/`quitting`
        // synchronously before its decoder is killed; preserve that
        // disposition instead of reclassifying it from the (non-zero,
        // since it was killed) exit status.
        let already_dispositioned = {
            let inner = self.inner.lock();
            inner
                .find(id)
                .map(|pos| matches!(inner.entries[pos].state, EntryState::Scratched | EntryState::Quitting))
                .unwrap_or(false)
        };
        let final_state = if already_dispositioned {
            let inner = self.inner.lock();
            inner.find(id).map(|pos| inner.entries[pos].state).unwrap()
        } else {
            match status.map(WaitStatus::from_exit_status) {
                Some(ws) if ws.is_success() => EntryState::Ok,
                _ => EntryState::Failed,
            }
        };
        self.fail_entry(id, final_state, status.map(WaitStatus::from_exit_status)).await;
        self.tick().await;
    }

    async fn fail_entry(&self, id: &str, state: EntryState, wait_status: Option<WaitStatus>) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.find(id) else { return };
        let mut entry = inner.entries.remove(pos);
        inner.reindex();
        entry.state = state;
        entry.wait_status = wait_status;
        inner.history.push_front(entry);
        let history_cap = self.config.lock().history;
        let mut trimmed = Vec::new();
        while inner.history.len() > history_cap {
            if let Some(dropped) = inner.history.pop_back() {
                trimmed.push(dropped.id);
            }
        }
        if let Err(err) = self.persist(&inner) {
            tracing::error!(%err, "failed to persist queue journal on fail_entry");
        }
        drop(inner);
        let kind = if state == EntryState::Ok {
            LogEventKind::Completed
        } else {
            LogEventKind::Failed
        };
        self.emit(kind, vec![id.to_string()]);
        self.emit(LogEventKind::RecentAdded, vec![id.to_string()]);
        for dropped_id in trimmed {
            self.emit(LogEventKind::RecentRemoved, vec![dropped_id]);
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Stop,
    Continue,
}

#[cfg(unix)]
fn libc_sigterm() -> i32 {
    libc::SIGTERM
}

#[cfg(not(unix))]
fn libc_sigterm() -> i32 {
    15
}

#[cfg(unix)]
fn signal_child(child: &Child, sig: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, sig);
        }
    }
}

#[cfg(not(unix))]
fn signal_child(_child: &Child, _sig: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::runtime::TokioSpawner;
    use std::net::SocketAddr;

    struct FakeTrackDb;

    impl TrackDatabase for FakeTrackDb {
        fn resolve(&self, alias: &str) -> Option<TrackId> {
            Some(TrackId::new(alias.to_string()))
        }
        fn exists(&self, _track: &TrackId) -> bool {
            true
        }
        fn get_pref(&self, _track: &TrackId, _key: &str) -> Option<String> {
            None
        }
        fn set_pref(&self, _track: &TrackId, _key: &str, _value: &str) -> std::io::Result<()> {
            Ok(())
        }
        fn unset_pref(&self, _track: &TrackId, _key: &str) -> std::io::Result<()> {
            Ok(())
        }
        fn prefs(&self, _track: &TrackId) -> Vec<(String, String)> {
            Vec::new()
        }
        fn list(&self, _dir: &str) -> Vec<TrackId> {
            Vec::new()
        }
        fn search(&self, _words: &[String]) -> Vec<TrackId> {
            Vec::new()
        }
        fn pick_random(&self, _filter: &RandomFilter<'_>) -> Option<TrackId> {
            None
        }
        fn rescan(&self) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    async fn loopback_rtp_sender() -> Arc<RtpSender> {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
        socket.connect(dest).await.unwrap();
        Arc::new(RtpSender::new(
            socket,
            crate::rtp::RtpMode::Unicast,
            true,
            Duration::from_millis(2000),
            1400,
        ))
    }

    async fn test_engine() -> (Arc<QueueEngine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let rtp = loopback_rtp_sender().await;
        (
            QueueEngine::load(
                dir.path(),
                Arc::new(FakeTrackDb),
                Arc::new(NoopEventEmitter),
                Arc::new(TokioSpawner::current()),
                rtp,
                QueueConfig {
                    queue_pad: 0,
                    history: 10,
                    replay_min: Duration::from_secs(0),
                    new_max: 0,
                    new_bias_age: Duration::from_secs(0),
                    new_bias: 1,
                    decoder_command: vec!["true".to_string()],
                    scratch: vec![std::path::PathBuf::from("/usr/share/disorder/scratch.ogg")],
                },
            )
            .unwrap(),
            dir,
        )
    }

    #[tokio::test]
    async fn play_appends_unplayed_entry() {
        let (engine, _dir) = test_engine().await;
        let entry = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        assert_eq!(entry.state, EntryState::Unplayed);
        assert_eq!(engine.state().entries.len(), 1);
    }

    #[tokio::test]
    async fn remove_enforces_mine_right() {
        let (engine, _dir) = test_engine().await;
        let entry = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        let err = engine.remove(&entry.id, Rights::empty(), "bob").unwrap_err();
        assert!(matches!(err, DisorderError::Rights(_)));
        engine.remove(&entry.id, Rights::REMOVE_MINE, "alice").unwrap();
        assert_eq!(engine.state().entries.len(), 0);
    }

    #[tokio::test]
    async fn adopt_requires_random_origin() {
        let (engine, _dir) = test_engine().await;
        let entry = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        let err = engine.adopt(&entry.id, "bob").unwrap_err();
        assert!(matches!(err, DisorderError::Argument(_)));
    }

    #[tokio::test]
    async fn move_entry_requires_move_right() {
        let (engine, _dir) = test_engine().await;
        let a = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        let _b = engine.play(TrackId::new("b.ogg"), "alice").unwrap();
        let err = engine.move_entry(&a.id, None, Rights::empty(), "alice").unwrap_err();
        assert!(matches!(err, DisorderError::Rights(_)));
        engine.move_entry(&a.id, None, Rights::MOVE_MINE, "alice").unwrap();
    }

    #[tokio::test]
    async fn scratch_inserts_clip_and_preserves_disposition() {
        let (engine, _dir) = test_engine().await;
        let entry = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        engine.start_next_if_idle().await;
        assert_eq!(engine.playing().unwrap().id, entry.id);

        engine.scratch(Rights::SCRATCH_MINE, "alice").await.unwrap();
        // Allow the decoder-finished continuation to run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = engine.state();
        let scratched = state.history.iter().find(|e| e.id == entry.id);
        assert!(scratched.is_some_and(|e| e.state == EntryState::Scratched));
    }

    #[tokio::test]
    async fn scratch_without_anything_playing_errors() {
        let (engine, _dir) = test_engine().await;
        let err = engine.scratch(Rights::SCRATCH_ANY, "alice").await.unwrap_err();
        assert!(matches!(err, DisorderError::Argument(_)));
    }

    #[tokio::test]
    async fn keepalive_tick_is_noop_with_nothing_playing() {
        let (engine, _dir) = test_engine().await;
        engine.rtp.send_silence().await.unwrap();
        assert!(!engine.rtp.is_idle_pending());

        // Nothing playing: the tick should just mark the sender idle and
        // return without erroring, never sending a packet.
        engine.rtp_keepalive_tick().await;
        assert!(engine.rtp.is_idle_pending());
    }

    #[tokio::test]
    async fn keepalive_tick_sends_silence_while_paused() {
        let (engine, _dir) = test_engine().await;
        let entry = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        engine.start_next_if_idle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.playing().unwrap().id, entry.id);

        engine.pause(Rights::PAUSE).unwrap();
        assert_eq!(engine.playing().unwrap().state, EntryState::Paused);

        let before = engine.rtp.rtp_time();
        engine.rtp_keepalive_tick().await;
        let after = engine.rtp.rtp_time();
        assert!(after >= before);
    }

    #[tokio::test]
    async fn prepare_next_launches_decoder_for_upcoming_entry() {
        let (engine, _dir) = test_engine().await;
        let a = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        let b = engine.play(TrackId::new("b.ogg"), "alice").unwrap();
        engine.start_next_if_idle().await;
        assert_eq!(engine.playing().unwrap().id, a.id);

        engine.prepare_next().await;
        assert!(engine.transient.lock().get(&b.id).is_some_and(|t| t.prepared));
    }

    #[tokio::test]
    async fn prepare_next_is_idempotent() {
        let (engine, _dir) = test_engine().await;
        let _a = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        let _b = engine.play(TrackId::new("b.ogg"), "alice").unwrap();
        engine.start_next_if_idle().await;

        engine.prepare_next().await;
        let first_pid = engine.transient.lock().values().find(|t| t.prepared).and_then(|t| t.child.id());
        engine.prepare_next().await;
        let second_pid = engine.transient.lock().values().find(|t| t.prepared).and_then(|t| t.child.id());
        assert_eq!(first_pid, second_pid, "prepare_next should not relaunch an already-prepared decoder");
    }

    #[tokio::test]
    async fn prepare_next_abandons_stale_transient_after_move() {
        let (engine, _dir) = test_engine().await;
        let a = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        let b = engine.play(TrackId::new("b.ogg"), "alice").unwrap();
        let c = engine.play(TrackId::new("c.ogg"), "alice").unwrap();
        engine.start_next_if_idle().await;
        assert_eq!(engine.playing().unwrap().id, a.id);

        engine.prepare_next().await;
        assert!(engine.transient.lock().contains_key(&b.id));

        engine.move_entry(&c.id, Some(&a.id), Rights::MOVE_ANY, "alice").unwrap();
        engine.prepare_next().await;

        assert!(!engine.transient.lock().contains_key(&b.id));
        assert!(engine.transient.lock().contains_key(&c.id));
    }

    #[tokio::test]
    async fn start_entry_reuses_a_prepared_decoder() {
        let (engine, _dir) = test_engine().await;
        let a = engine.play(TrackId::new("a.ogg"), "alice").unwrap();
        let b = engine.play(TrackId::new("b.ogg"), "alice").unwrap();
        engine.start_next_if_idle().await;
        assert_eq!(engine.playing().unwrap().id, a.id);

        engine.prepare_next().await;
        let prepared_pid = engine.transient.lock().get(&b.id).and_then(|t| t.child.id());
        assert!(prepared_pid.is_some());

        // Let `a`'s decoder ("true") exit on its own; the stdout-pump
        // task's completion should promote `b` by reusing the decoder
        // already prepared for it, not by spawning a new one.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.playing().unwrap().id, b.id);
        let started_pid = engine.transient.lock().get(&b.id).and_then(|t| t.child.id());
        assert_eq!(prepared_pid, started_pid, "start_entry should reuse the prepared decoder, not relaunch");
        assert!(!engine.transient.lock().get(&b.id).unwrap().prepared);
    }
}
