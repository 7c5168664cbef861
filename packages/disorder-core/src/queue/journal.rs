//! Queue journal persistence.
//!
//! One line per entry, `key="value"` pairs rendered with
//! [`crate::utils::render_kv_line`] and parsed back with
//! [`crate::utils::parse_kv_line`] — the same codec the track-preference
//! store uses. The queue and history sections are distinguished by a
//! leading `section` field rather than separate files, so a single
//! write-then-rename keeps both consistent with each other.

use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::trackdb::TrackId;
use crate::utils::{parse_kv_line, render_kv_line};

use super::entry::{EntryState, Origin, QueueEntry, WaitStatus};

const SECTION_QUEUE: &str = "queue";
const SECTION_HISTORY: &str = "history";

fn state_word(state: EntryState) -> &'static str {
    match state {
        EntryState::Unplayed => "unplayed",
        EntryState::Started => "started",
        EntryState::Paused => "paused",
        EntryState::Ok => "ok",
        EntryState::Failed => "failed",
        EntryState::Scratched => "scratched",
        EntryState::Quitting => "quitting",
        EntryState::NoPlayer => "no_player",
        EntryState::IsScratch => "isscratch",
    }
}

fn parse_state(word: &str) -> Option<EntryState> {
    Some(match word {
        "unplayed" => EntryState::Unplayed,
        "started" => EntryState::Started,
        "paused" => EntryState::Paused,
        "ok" => EntryState::Ok,
        "failed" => EntryState::Failed,
        "scratched" => EntryState::Scratched,
        "quitting" => EntryState::Quitting,
        "no_player" => EntryState::NoPlayer,
        "isscratch" => EntryState::IsScratch,
        _ => return None,
    })
}

fn origin_word(origin: Origin) -> &'static str {
    match origin {
        Origin::Submitted => "submitted",
        Origin::Random => "random",
        Origin::Adopted => "adopted",
        Origin::Scratch => "scratch",
    }
}

fn parse_origin(word: &str) -> Option<Origin> {
    Some(match word {
        "submitted" => Origin::Submitted,
        "random" => Origin::Random,
        "adopted" => Origin::Adopted,
        "scratch" => Origin::Scratch,
        _ => return None,
    })
}

fn render_entry(section: &str, entry: &QueueEntry) -> String {
    let submitter = entry.submitter.clone().unwrap_or_default();
    let scratched_by = entry.scratched_by.clone().unwrap_or_default();
    let exit_code = entry
        .wait_status
        .and_then(|w| w.exit_code)
        .map(|c| c.to_string())
        .unwrap_or_default();
    let signal = entry
        .wait_status
        .and_then(|w| w.terminating_signal)
        .map(|s| s.to_string())
        .unwrap_or_default();
    let when = entry.when.to_string();
    let played = entry.played.to_string();
    let sofar = entry.sofar.to_string();

    render_kv_line(&[
        ("section", section),
        ("id", &entry.id),
        ("track", entry.track.as_str()),
        ("submitter", &submitter),
        ("when", &when),
        ("played", &played),
        ("state", state_word(entry.state)),
        ("scratched_by", &scratched_by),
        ("exit_code", &exit_code),
        ("signal", &signal),
        ("origin", origin_word(entry.origin)),
        ("sofar", &sofar),
    ])
}

fn parse_entry(line: &str) -> Option<(String, QueueEntry)> {
    let pairs = parse_kv_line(line)?;
    let get = |key: &str| -> Option<String> {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    let non_empty = |key: &str| get(key).filter(|v| !v.is_empty());

    let section = get("section")?;
    let id = get("id")?;
    let track = TrackId::new(get("track")?);
    let submitter = non_empty("submitter");
    let when: u64 = get("when")?.parse().ok()?;
    let played: u64 = get("played")?.parse().ok()?;
    let state = parse_state(&get("state")?)?;
    let scratched_by = non_empty("scratched_by");
    let exit_code: Option<i32> = non_empty("exit_code").and_then(|v| v.parse().ok());
    let signal: Option<i32> = non_empty("signal").and_then(|v| v.parse().ok());
    let wait_status = if exit_code.is_some() || signal.is_some() {
        Some(WaitStatus {
            exit_code,
            terminating_signal: signal,
        })
    } else {
        None
    };
    let origin = parse_origin(&get("origin")?)?;
    let sofar: u64 = non_empty("sofar").unwrap_or_default().parse().unwrap_or(0);

    Some((
        section,
        QueueEntry {
            id,
            track,
            submitter,
            when,
            played,
            state,
            scratched_by,
            wait_status,
            origin,
            sofar,
        },
    ))
}

/// Writes `queue` then `history` entries to `path` via write-then-rename.
pub fn write_journal(path: &Path, queue: &[QueueEntry], history: &[QueueEntry]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut contents = String::new();
    for entry in queue {
        contents.push_str(&render_entry(SECTION_QUEUE, entry));
        contents.push('\n');
    }
    for entry in history {
        contents.push_str(&render_entry(SECTION_HISTORY, entry));
        contents.push('\n');
    }
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// Reads a previously written journal, returning `(queue, history)` in
/// file order. A missing file yields two empty vectors (a fresh server).
/// A line that fails to parse is skipped and logged rather than aborting
/// the whole load, so one corrupt entry cannot take down startup.
pub fn load_journal(path: &Path) -> std::io::Result<(Vec<QueueEntry>, Vec<QueueEntry>)> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
        Err(e) => return Err(e),
    };
    let mut queue = Vec::new();
    let mut history = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_entry(&line) {
            Some((section, entry)) if section == SECTION_QUEUE => queue.push(entry),
            Some((section, entry)) if section == SECTION_HISTORY => history.push(entry),
            Some(_) => tracing::warn!(%line, "queue journal line has unknown section, skipping"),
            None => tracing::warn!(%line, "queue journal line failed to parse, skipping"),
        }
    }
    Ok((queue, history))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> QueueEntry {
        QueueEntry::new_submitted(
            "aaaa-0".to_string(),
            TrackId::new("/music/song.ogg"),
            "alice".to_string(),
            1_000,
        )
    }

    #[test]
    fn entry_round_trips_through_render_and_parse() {
        let mut entry = sample_entry();
        entry.state = EntryState::Failed;
        entry.wait_status = Some(WaitStatus {
            exit_code: Some(1),
            terminating_signal: None,
        });
        let line = render_entry(SECTION_QUEUE, &entry);
        let (section, parsed) = parse_entry(&line).unwrap();
        assert_eq!(section, SECTION_QUEUE);
        assert_eq!(parsed.id, entry.id);
        assert_eq!(parsed.track, entry.track);
        assert_eq!(parsed.state, EntryState::Failed);
        assert_eq!(parsed.wait_status.unwrap().exit_code, Some(1));
    }

    #[test]
    fn journal_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.journal");
        let queue = vec![sample_entry()];
        let mut history_entry = sample_entry();
        history_entry.id = "aaaa-1".to_string();
        history_entry.state = EntryState::Ok;
        let history = vec![history_entry];

        write_journal(&path, &queue, &history).unwrap();
        let (loaded_queue, loaded_history) = load_journal(&path).unwrap();
        assert_eq!(loaded_queue.len(), 1);
        assert_eq!(loaded_history.len(), 1);
        assert_eq!(loaded_queue[0].id, "aaaa-0");
        assert_eq!(loaded_history[0].state, EntryState::Ok);
    }

    #[test]
    fn missing_journal_yields_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        let (queue, history) = load_journal(&path).unwrap();
        assert!(queue.is_empty());
        assert!(history.is_empty());
    }
}
