//! Scheduled actions: `schedule-add/del/get/list`.
//!
//! A minimal persisted store of `(time, action)` pairs, reported back to
//! clients on request. There is no cron-equivalent executor here: entries
//! are recorded and listed, never fired.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const SCHEDULE_FILE: &str = "schedule.yaml";

/// One scheduled action: play a track, or change the global volume, at
/// a future Unix timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: String,
    pub owner: String,
    pub when: u64,
    /// The action word (`play`, `set-volume`, ...) and its arguments, kept
    /// as opaque tokens since this store only persists and reports
    /// schedule entries rather than executing them.
    pub action: String,
    pub args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("no such scheduled action")]
    NotFound,
    #[error("persisting schedule: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ScheduleStore {
    home: PathBuf,
    entries: RwLock<HashMap<String, ScheduledAction>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl ScheduleStore {
    pub fn load(home: &Path) -> std::io::Result<Self> {
        let path = home.join(SCHEDULE_FILE);
        let entries: HashMap<String, ScheduledAction> = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            home: home.to_path_buf(),
            entries: RwLock::new(entries),
            next_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    fn save(&self, entries: &HashMap<String, ScheduledAction>) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)?;
        let path = self.home.join(SCHEDULE_FILE);
        let tmp = self.home.join("schedule.yaml.tmp");
        let contents = serde_yaml::to_string(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)
    }

    pub fn add(&self, owner: &str, when: u64, action: String, args: Vec<String>) -> Result<String, ScheduleError> {
        let id = format!(
            "sched-{}",
            self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        );
        let mut entries = self.entries.write();
        entries.insert(
            id.clone(),
            ScheduledAction {
                id: id.clone(),
                owner: owner.to_string(),
                when,
                action,
                args,
            },
        );
        self.save(&entries)?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<ScheduledAction> {
        self.entries.read().get(id).cloned()
    }

    /// Lists every scheduled action, or only `owner`'s when `admin` is
    /// false (non-admins may not enumerate other users' schedules, per
    /// the protocol table's "+admin to delete others'" note extended
    /// symmetrically to listing).
    pub fn list(&self, owner: Option<&str>) -> Vec<ScheduledAction> {
        let mut items: Vec<ScheduledAction> = self
            .entries
            .read()
            .values()
            .filter(|e| owner.is_none_or(|o| e.owner == o))
            .cloned()
            .collect();
        items.sort_by_key(|e| e.when);
        items
    }

    /// Deletes a scheduled action. `requester` must either own it or pass
    /// `is_admin` (the protocol table's "+admin to delete others'").
    pub fn delete(&self, id: &str, requester: &str, is_admin: bool) -> Result<(), ScheduleError> {
        let mut entries = self.entries.write();
        let owns = entries
            .get(id)
            .map(|e| e.owner == requester || is_admin)
            .ok_or(ScheduleError::NotFound)?;
        if !owns {
            return Err(ScheduleError::NotFound);
        }
        entries.remove(id);
        self.save(&entries)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_list_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::load(dir.path()).unwrap();
        let id = store.add("alice", 1000, "play".into(), vec!["/a.ogg".into()]).unwrap();
        assert_eq!(store.get(&id).unwrap().owner, "alice");
        assert_eq!(store.list(Some("alice")).len(), 1);
        assert_eq!(store.list(Some("bob")).len(), 0);
        store.delete(&id, "alice", false).unwrap();
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn non_owner_cannot_delete_without_admin() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::load(dir.path()).unwrap();
        let id = store.add("alice", 1000, "play".into(), vec![]).unwrap();
        assert!(store.delete(&id, "bob", false).is_err());
        store.delete(&id, "bob", true).unwrap();
    }
}
