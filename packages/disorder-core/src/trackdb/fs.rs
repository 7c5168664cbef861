//! Filesystem-backed default [`TrackDatabase`].
//!
//! Walks a configured root directory (`walkdir`, grounded on the same
//! crate `music-minder` uses for its own library scan) and keeps an
//! in-memory index of canonical paths plus modification times, so
//! `pick_random`'s new-track bias can be computed without re-statting the
//! filesystem on every selection. Per-track preferences persist to a flat
//! `prefs` file in the configured home directory using the same
//! key=value line format as the queue journal (write-then-rename).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use rand::Rng;

use crate::utils::{parse_kv_line, render_kv_line};

use super::{RandomFilter, TrackDatabase, TrackId};

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "ogg", "oga", "flac", "wav", "m4a", "opus", "wma"];
const PREFS_FILE: &str = "prefs";

#[derive(Clone)]
struct IndexEntry {
    id: TrackId,
    modified: SystemTime,
}

/// A `(track, key)` preference store persisted as flat key=value lines.
type PrefKey = (String, String);

/// A [`TrackDatabase`] backed by a directory tree on disk.
pub struct FsTrackDatabase {
    root: PathBuf,
    prefs_path: PathBuf,
    index: RwLock<Vec<IndexEntry>>,
    prefs: RwLock<HashMap<PrefKey, String>>,
}

impl FsTrackDatabase {
    /// Opens the database, performing an initial scan of `root` and
    /// loading any existing preferences from `home`.
    pub fn open(root: impl Into<PathBuf>, home: &Path) -> std::io::Result<Self> {
        let root = root.into();
        let prefs_path = home.join(PREFS_FILE);
        let prefs = load_prefs(&prefs_path)?;
        let db = Self {
            root,
            prefs_path,
            index: RwLock::new(Vec::new()),
            prefs: RwLock::new(prefs),
        };
        db.rescan()?;
        Ok(db)
    }

    fn canonical_id(&self, path: &Path) -> Option<TrackId> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let normalized = relative.to_string_lossy().replace('\\', "/");
        Some(TrackId::new(format!("/{}", normalized)))
    }

    fn absolute_path(&self, track: &TrackId) -> PathBuf {
        let relative = track.as_str().trim_start_matches('/');
        self.root.join(relative)
    }

    fn save_prefs(&self) -> std::io::Result<()> {
        let guard = self.prefs.read();
        let mut contents = String::new();
        for ((track, key), value) in guard.iter() {
            contents.push_str(&render_kv_line(&[
                ("track", track.as_str()),
                ("key", key.as_str()),
                ("value", value.as_str()),
            ]));
            contents.push('\n');
        }
        drop(guard);
        if let Some(parent) = self.prefs_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.prefs_path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.prefs_path)
    }
}

fn load_prefs(path: &Path) -> std::io::Result<HashMap<PrefKey, String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e),
    };
    let mut map = HashMap::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(pairs) = parse_kv_line(line) {
            let mut track = None;
            let mut key = None;
            let mut value = None;
            for (k, v) in pairs {
                match k.as_str() {
                    "track" => track = Some(v),
                    "key" => key = Some(v),
                    "value" => value = Some(v),
                    _ => {}
                }
            }
            if let (Some(track), Some(key), Some(value)) = (track, key, value) {
                map.insert((track, key), value);
            }
        }
    }
    Ok(map)
}

impl TrackDatabase for FsTrackDatabase {
    fn resolve(&self, alias: &str) -> Option<TrackId> {
        let candidate = if let Some(stripped) = alias.strip_prefix(&*self.root.to_string_lossy()) {
            self.canonical_id(&self.root.join(stripped.trim_start_matches('/')))
        } else {
            self.canonical_id(&self.root.join(alias.trim_start_matches('/')))
        }?;
        if self.exists(&candidate) {
            Some(candidate)
        } else {
            None
        }
    }

    fn exists(&self, track: &TrackId) -> bool {
        self.index.read().iter().any(|e| &e.id == track)
    }

    fn get_pref(&self, track: &TrackId, key: &str) -> Option<String> {
        self.prefs
            .read()
            .get(&(track.as_str().to_string(), key.to_string()))
            .cloned()
    }

    fn set_pref(&self, track: &TrackId, key: &str, value: &str) -> std::io::Result<()> {
        self.prefs.write().insert(
            (track.as_str().to_string(), key.to_string()),
            value.to_string(),
        );
        self.save_prefs()
    }

    fn unset_pref(&self, track: &TrackId, key: &str) -> std::io::Result<()> {
        self.prefs
            .write()
            .remove(&(track.as_str().to_string(), key.to_string()));
        self.save_prefs()
    }

    fn list(&self, dir: &str) -> Vec<TrackId> {
        let prefix = if dir.is_empty() || dir == "/" {
            String::new()
        } else {
            format!("{}/", dir.trim_end_matches('/').trim_start_matches('/'))
        };
        let mut out: Vec<TrackId> = self
            .index
            .read()
            .iter()
            .filter_map(|entry| {
                let rest = entry.id.as_str().trim_start_matches('/');
                let rest = rest.strip_prefix(&prefix)?;
                if rest.contains('/') {
                    None
                } else {
                    Some(entry.id.clone())
                }
            })
            .collect();
        out.sort();
        out
    }

    fn search(&self, words: &[String]) -> Vec<TrackId> {
        let needles: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
        let mut out: Vec<TrackId> = self
            .index
            .read()
            .iter()
            .filter(|entry| {
                let haystack = entry.id.as_str().to_lowercase();
                needles.iter().all(|needle| haystack.contains(needle))
            })
            .map(|entry| entry.id.clone())
            .collect();
        out.sort();
        out
    }

    fn pick_random(&self, filter: &RandomFilter<'_>) -> Option<TrackId> {
        let index = self.index.read();
        if index.is_empty() {
            return None;
        }

        let now = SystemTime::now();
        let mut newest: Vec<&IndexEntry> = index.iter().collect();
        newest.sort_by_key(|e| std::cmp::Reverse(e.modified));
        let new_cutoff: std::collections::HashSet<&TrackId> = newest
            .iter()
            .take(filter.new_max)
            .map(|e| &e.id)
            .collect();

        let eligible: Vec<(&IndexEntry, u64)> = index
            .iter()
            .filter(|entry| !filter.recently_played.contains(&entry.id))
            .filter(|entry| {
                now.duration_since(entry.modified)
                    .map(|age| age >= Duration::ZERO)
                    .unwrap_or(true)
                    && replay_eligible(entry, filter)
            })
            .map(|entry| {
                let age = now
                    .duration_since(entry.modified)
                    .unwrap_or(Duration::ZERO);
                let weight = if new_cutoff.contains(&entry.id) && age <= filter.new_bias_age {
                    filter.new_bias.max(1)
                } else {
                    1
                };
                (entry, weight)
            })
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let total_weight: u64 = eligible.iter().map(|(_, weight)| *weight).sum();
        let mut target = rand::rng().random_range(0..total_weight);
        for (entry, weight) in &eligible {
            if target < *weight {
                return Some(entry.id.clone());
            }
            target -= *weight;
        }
        eligible.last().map(|(entry, _)| entry.id.clone())
    }

    fn rescan(&self) -> std::io::Result<usize> {
        if !self.root.exists() {
            *self.index.write() = Vec::new();
            return Ok(0);
        }
        let mut entries = Vec::new();
        for dir_entry in walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !dir_entry.file_type().is_file() {
                continue;
            }
            let path = dir_entry.path();
            let has_audio_ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
            if !has_audio_ext {
                continue;
            }
            let Some(id) = self.canonical_id(path) else {
                continue;
            };
            let modified = dir_entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(IndexEntry { id, modified });
        }
        let count = entries.len();
        *self.index.write() = entries;
        Ok(count)
    }
}

/// Placeholder hook for `replay_min`: a full implementation would track
/// per-track last-played times; the queue engine already excludes tracks
/// played within `replay_min` via `recently_played`, so this simply lets
/// every still-indexed track through.
fn replay_eligible(_entry: &IndexEntry, _filter: &RandomFilter<'_>) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_library() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("artist/album")).unwrap();
        fs::write(dir.path().join("artist/album/one.ogg"), b"").unwrap();
        fs::write(dir.path().join("artist/album/two.mp3"), b"").unwrap();
        fs::write(dir.path().join("artist/notes.txt"), b"").unwrap();
        dir
    }

    #[test]
    fn rescan_finds_only_audio_files() {
        let lib = make_library();
        let home = tempfile::tempdir().unwrap();
        let db = FsTrackDatabase::open(lib.path(), home.path()).unwrap();
        assert_eq!(db.index.read().len(), 2);
    }

    #[test]
    fn resolve_and_exists_round_trip() {
        let lib = make_library();
        let home = tempfile::tempdir().unwrap();
        let db = FsTrackDatabase::open(lib.path(), home.path()).unwrap();
        let id = db.resolve("/artist/album/one.ogg").expect("resolves");
        assert!(db.exists(&id));
        assert!(db.resolve("/no/such/file.ogg").is_none());
    }

    #[test]
    fn list_returns_direct_children_only() {
        let lib = make_library();
        let home = tempfile::tempdir().unwrap();
        let db = FsTrackDatabase::open(lib.path(), home.path()).unwrap();
        let children = db.list("/artist/album");
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn search_matches_all_words_case_insensitively() {
        let lib = make_library();
        let home = tempfile::tempdir().unwrap();
        let db = FsTrackDatabase::open(lib.path(), home.path()).unwrap();
        let found = db.search(&["ARTIST".to_string(), "one".to_string()]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn prefs_round_trip_through_disk() {
        let lib = make_library();
        let home = tempfile::tempdir().unwrap();
        let db = FsTrackDatabase::open(lib.path(), home.path()).unwrap();
        let id = db.resolve("/artist/album/one.ogg").unwrap();
        db.set_pref(&id, "rating", "5").unwrap();
        assert_eq!(db.get_pref(&id, "rating"), Some("5".to_string()));

        let reopened = FsTrackDatabase::open(lib.path(), home.path()).unwrap();
        assert_eq!(reopened.get_pref(&id, "rating"), Some("5".to_string()));

        db.unset_pref(&id, "rating").unwrap();
        assert_eq!(db.get_pref(&id, "rating"), None);
    }

    #[test]
    fn pick_random_excludes_recently_played() {
        let lib = make_library();
        let home = tempfile::tempdir().unwrap();
        let db = FsTrackDatabase::open(lib.path(), home.path()).unwrap();
        let one = db.resolve("/artist/album/one.ogg").unwrap();
        let recently = vec![one.clone()];
        let filter = RandomFilter {
            replay_min: Duration::from_secs(0),
            new_max: 10,
            new_bias_age: Duration::from_secs(0),
            new_bias: 1,
            recently_played: &recently,
        };
        for _ in 0..10 {
            let picked = db.pick_random(&filter).expect("one eligible track left");
            assert_ne!(picked, one);
        }
    }

    #[test]
    fn pick_random_returns_none_when_everything_excluded() {
        let lib = make_library();
        let home = tempfile::tempdir().unwrap();
        let db = FsTrackDatabase::open(lib.path(), home.path()).unwrap();
        let all: Vec<TrackId> = db.search(&[]);
        let filter = RandomFilter {
            replay_min: Duration::from_secs(0),
            new_max: 10,
            new_bias_age: Duration::from_secs(0),
            new_bias: 1,
            recently_played: &all,
        };
        assert!(db.pick_random(&filter).is_none());
    }
}
