//! Global (server-wide, not per-track) preferences: `get-global`/
//! `set-global`/`unset-global`.
//!
//! [`crate::trackdb::TrackDatabase`] deliberately has no notion of a
//! global scope ("the sentinel global scope are handled by the protocol
//! layer, not here"); this store is that protocol-layer home, persisted
//! the same write-then-rename way as the user/playlist/schedule stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::utils::{parse_kv_line, render_kv_line};

const GLOBAL_PREFS_FILE: &str = "global-prefs";

pub struct GlobalPrefsStore {
    home: PathBuf,
    values: RwLock<HashMap<String, String>>,
}

impl GlobalPrefsStore {
    pub fn load(home: &Path) -> std::io::Result<Self> {
        let path = home.join(GLOBAL_PREFS_FILE);
        let values = match std::fs::read_to_string(&path) {
            Ok(contents) => contents
                .lines()
                .filter_map(parse_kv_line)
                .flatten()
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            home: home.to_path_buf(),
            values: RwLock::new(values),
        })
    }

    fn save(&self, values: &HashMap<String, String>) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)?;
        let path = self.home.join(GLOBAL_PREFS_FILE);
        let tmp = self.home.join("global-prefs.tmp");
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        let body: String = keys
            .into_iter()
            .map(|key| render_kv_line(&[(key.as_str(), values[key].as_str())]) + "\n")
            .collect();
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        let mut values = self.values.write();
        values.insert(key.to_string(), value.to_string());
        self.save(&values)
    }

    pub fn unset(&self, key: &str) -> std::io::Result<()> {
        let mut values = self.values.write();
        values.remove(key);
        self.save(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_unset_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = GlobalPrefsStore::load(dir.path()).unwrap();
        store.set("api_key", "secret value").unwrap();
        assert_eq!(store.get("api_key"), Some("secret value".to_string()));
        store.unset("api_key").unwrap();
        assert_eq!(store.get("api_key"), None);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = GlobalPrefsStore::load(dir.path()).unwrap();
            store.set("theme", "dark").unwrap();
        }
        let reopened = GlobalPrefsStore::load(dir.path()).unwrap();
        assert_eq!(reopened.get("theme"), Some("dark".to_string()));
    }
}
