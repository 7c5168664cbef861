//! Playlists: named, persisted per-user/shared/public lists of track
//! paths with an exclusive per-connection modify lock.
//!
//! `playlist-lock` grants exclusive modify rights to that connection for
//! one playlist at a time; `playlist-set` requires holding the lock.
//! Locks are released on unlock, connection close, or server shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const PLAYLISTS_FILE: &str = "playlists.yaml";

/// A single playlist: an ordered list of track paths plus the username
/// that owns it (`None` for the shared/public namespace).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Playlist {
    pub tracks: Vec<String>,
    pub sharing: Sharing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Sharing {
    /// Only the owning user (and admins) may read or write it.
    Private,
    /// Any authenticated user may read it; only the owner may write it.
    #[default]
    Shared,
    /// Any authenticated user may read or write it.
    Public,
}

struct Lock {
    connection_id: u64,
    acquired_at: Instant,
}

#[derive(Default)]
struct Inner {
    playlists: HashMap<String, Playlist>,
    locks: HashMap<String, Lock>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("no such playlist")]
    NotFound,
    #[error("playlist is locked by another connection")]
    LockedByOther,
    #[error("playlist-set requires holding the lock first")]
    NotLocked,
    #[error("persisting playlists: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared store of playlists plus their exclusive modify locks.
pub struct PlaylistStore {
    home: PathBuf,
    inner: RwLock<Inner>,
    lock_timeout: Duration,
}

impl PlaylistStore {
    pub fn load(home: &Path, lock_timeout: Duration) -> std::io::Result<Self> {
        let path = home.join(PLAYLISTS_FILE);
        let playlists = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            home: home.to_path_buf(),
            inner: RwLock::new(Inner {
                playlists,
                locks: HashMap::new(),
            }),
            lock_timeout,
        })
    }

    fn save(&self, inner: &Inner) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)?;
        let path = self.home.join(PLAYLISTS_FILE);
        let tmp = self.home.join("playlists.yaml.tmp");
        let contents = serde_yaml::to_string(&inner.playlists)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().playlists.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Playlist> {
        self.inner.read().playlists.get(name).cloned()
    }

    /// Acquires the exclusive modify lock on `name` for `connection_id`.
    /// A connection may hold at most one playlist lock at a time; callers
    /// enforce that by releasing any previous lock before acquiring a new
    /// one (mirrors "exclusive... for one playlist at a time").
    pub fn lock(&self, name: &str, connection_id: u64) -> Result<(), PlaylistError> {
        let mut inner = self.inner.write();
        self.expire_stale(&mut inner);
        if let Some(existing) = inner.locks.get(name) {
            if existing.connection_id != connection_id {
                return Err(PlaylistError::LockedByOther);
            }
            return Ok(());
        }
        inner.locks.insert(
            name.to_string(),
            Lock {
                connection_id,
                acquired_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Releases `name`'s lock if held by `connection_id`; a no-op
    /// otherwise (releasing a lock you don't hold is not an error).
    pub fn unlock(&self, name: &str, connection_id: u64) {
        let mut inner = self.inner.write();
        if inner.locks.get(name).is_some_and(|l| l.connection_id == connection_id) {
            inner.locks.remove(name);
        }
    }

    /// Releases every lock held by `connection_id` (connection close).
    pub fn release_all(&self, connection_id: u64) {
        self.inner
            .write()
            .locks
            .retain(|_, lock| lock.connection_id != connection_id);
    }

    fn expire_stale(&self, inner: &mut Inner) {
        let timeout = self.lock_timeout;
        inner.locks.retain(|_, lock| lock.acquired_at.elapsed() < timeout);
    }

    /// Replaces `name`'s track list; requires `connection_id` to be
    /// holding the lock (`playlist-set` is the only mutator).
    pub fn set(
        &self,
        name: &str,
        connection_id: u64,
        tracks: Vec<String>,
        sharing: Sharing,
    ) -> Result<(), PlaylistError> {
        let mut inner = self.inner.write();
        self.expire_stale(&mut inner);
        match inner.locks.get(name) {
            Some(lock) if lock.connection_id == connection_id => {}
            Some(_) => return Err(PlaylistError::LockedByOther),
            None => return Err(PlaylistError::NotLocked),
        }
        inner
            .playlists
            .entry(name.to_string())
            .and_modify(|p| p.tracks = tracks.clone())
            .or_insert(Playlist { tracks, sharing });
        self.save(&inner)?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), PlaylistError> {
        let mut inner = self.inner.write();
        if inner.playlists.remove(name).is_none() {
            return Err(PlaylistError::NotFound);
        }
        inner.locks.remove(name);
        self.save(&inner)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_to_other_connections() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaylistStore::load(dir.path(), Duration::from_secs(3600)).unwrap();
        store.lock("mylist", 1).unwrap();
        assert!(matches!(store.lock("mylist", 2), Err(PlaylistError::LockedByOther)));
        store.unlock("mylist", 1);
        store.lock("mylist", 2).unwrap();
    }

    #[test]
    fn set_requires_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaylistStore::load(dir.path(), Duration::from_secs(3600)).unwrap();
        assert!(matches!(
            store.set("mylist", 1, vec!["/a.ogg".into()], Sharing::Shared),
            Err(PlaylistError::NotLocked)
        ));
        store.lock("mylist", 1).unwrap();
        store.set("mylist", 1, vec!["/a.ogg".into()], Sharing::Shared).unwrap();
        assert_eq!(store.get("mylist").unwrap().tracks, vec!["/a.ogg".to_string()]);
    }

    #[test]
    fn release_all_drops_every_lock_for_a_connection() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaylistStore::load(dir.path(), Duration::from_secs(3600)).unwrap();
        store.lock("a", 1).unwrap();
        store.lock("b", 1).unwrap();
        store.release_all(1);
        store.lock("a", 2).unwrap();
        store.lock("b", 2).unwrap();
    }

    #[test]
    fn playlists_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PlaylistStore::load(dir.path(), Duration::from_secs(3600)).unwrap();
            store.lock("mylist", 1).unwrap();
            store.set("mylist", 1, vec!["/a.ogg".into()], Sharing::Public).unwrap();
        }
        let reopened = PlaylistStore::load(dir.path(), Duration::from_secs(3600)).unwrap();
        assert_eq!(reopened.get("mylist").unwrap().tracks, vec!["/a.ogg".to_string()]);
    }
}
