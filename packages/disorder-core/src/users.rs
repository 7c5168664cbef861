//! User accounts, authentication, and signed login cookies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::rights::Rights;
use crate::utils::now_secs;

/// A stored user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Hex-encoded digest of the password under the configured algorithm.
    /// Never the plaintext password.
    pub password_hash: String,
    pub email: Option<String>,
    #[serde(with = "rights_serde")]
    pub rights: Rights,
    /// Present between `register` and `confirm`; cleared on confirmation.
    pub confirmation: Option<String>,
    /// Unix timestamp of the last reminder email sent, for
    /// `reminder_interval` rate limiting.
    pub last_reminder: Option<u64>,
}

mod rights_serde {
    use super::Rights;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(rights: &Rights, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&rights.to_words())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Rights, D::Error> {
        let words = String::deserialize(d)?;
        Ok(Rights::parse(&words))
    }
}

/// The hash family used for challenge-response auth and cookie signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlgorithm {
    Sha1,
    Sha256,
}

impl AuthAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Computes `hex(hash(left || right))`, the keyed-hash construction
    /// used for both the `user` challenge response and cookie signing.
    fn keyed_hash(self, left: &[u8], right: &[u8]) -> String {
        match self {
            Self::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(left);
                hasher.update(right);
                hex::encode(hasher.finalize())
            }
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                hex::encode(hasher.finalize())
            }
        }
    }
}

/// Computes the expected `user` command response: `hex(hash(nonce ||
/// password))`.
pub fn expected_response(algorithm: AuthAlgorithm, nonce: &[u8], password: &str) -> String {
    algorithm.keyed_hash(nonce, password.as_bytes())
}

/// Hashes a password for storage, using the nonce-free single-argument
/// form (`hex(hash(password))`) since a stored hash has no per-session
/// nonce to mix in.
pub fn hash_password(algorithm: AuthAlgorithm, password: &str) -> String {
    algorithm.keyed_hash(b"", password.as_bytes())
}

const USERS_FILE: &str = "users.yaml";

/// In-memory user table, persisted to `home/users.yaml` via write-then-
/// rename, matching the journal's atomic-replace discipline.
pub struct UserStore {
    home: PathBuf,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl UserStore {
    /// Loads the user table from `home`, creating an empty one if the
    /// file does not yet exist.
    pub fn load(home: &Path) -> std::io::Result<Self> {
        let path = home.join(USERS_FILE);
        let users = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            home: home.to_path_buf(),
            users: RwLock::new(users),
        })
    }

    fn save(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)?;
        let path = self.home.join(USERS_FILE);
        let tmp = self.home.join("users.yaml.tmp");
        let contents = serde_yaml::to_string(&*self.users.read())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &path)
    }

    pub fn get(&self, username: &str) -> Option<UserRecord> {
        self.users.read().get(username).cloned()
    }

    pub fn exists(&self, username: &str) -> bool {
        self.users.read().contains_key(username)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.users.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Adds a new user. Fails if the username is already taken.
    pub fn add(&self, record: UserRecord) -> Result<(), UserError> {
        let mut users = self.users.write();
        if users.contains_key(&record.username) {
            return Err(UserError::AlreadyExists);
        }
        users.insert(record.username.clone(), record);
        drop(users);
        self.save().map_err(UserError::Io)
    }

    /// Deletes a user. Any live sessions for that user keep their
    /// in-memory `Rights` snapshot taken at auth time; callers are
    /// expected to additionally broadcast a rights-revocation so that
    /// `protocol::connection` sessions zero their cached rights (see
    /// `deluser`'s handler, which revokes all live sessions for the
    /// deleted user concurrently with this call).
    pub fn delete(&self, username: &str) -> Result<(), UserError> {
        let mut users = self.users.write();
        if users.remove(username).is_none() {
            return Err(UserError::NotFound);
        }
        drop(users);
        self.save().map_err(UserError::Io)
    }

    /// Updates an existing user's password, email, or rights in place.
    pub fn edit<F>(&self, username: &str, f: F) -> Result<(), UserError>
    where
        F: FnOnce(&mut UserRecord),
    {
        let mut users = self.users.write();
        let record = users.get_mut(username).ok_or(UserError::NotFound)?;
        f(record);
        drop(users);
        self.save().map_err(UserError::Io)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("user already exists")]
    AlreadyExists,
    #[error("no such user")]
    NotFound,
    #[error("persisting user store: {0}")]
    Io(std::io::Error),
}

/// A signed bearer cookie carrying `(username, rights, expiry)`.
///
/// The wire form is `user:rights_words:expiry:hex(signature)`; the
/// signature is the keyed hash of the signing key with the other three
/// fields, mirroring the same `hex(hash(key || data))` construction the
/// challenge-response login uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub username: String,
    pub rights: Rights,
    pub expires_at: u64,
}

pub struct CookieStore {
    algorithm: AuthAlgorithm,
    signing_key: RwLock<Vec<u8>>,
    key_issued_at: RwLock<u64>,
    key_lifetime: u64,
}

fn random_key() -> Vec<u8> {
    use rand::RngCore;
    let mut key = vec![0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

impl CookieStore {
    pub fn new(algorithm: AuthAlgorithm, key_lifetime: u64) -> Self {
        Self {
            algorithm,
            signing_key: RwLock::new(random_key()),
            key_issued_at: RwLock::new(now_secs()),
            key_lifetime,
        }
    }

    /// Rotates the signing key if it has exceeded `cookie_key_lifetime`.
    /// Previously issued cookies become unverifiable after rotation,
    /// which is the documented tradeoff of bounding key lifetime rather
    /// than keeping a ring of historical keys.
    pub fn rotate_if_stale(&self) {
        if now_secs().saturating_sub(*self.key_issued_at.read()) >= self.key_lifetime {
            *self.signing_key.write() = random_key();
            *self.key_issued_at.write() = now_secs();
        }
    }

    /// Unconditionally rotates the signing key, invalidating every
    /// outstanding cookie server-wide. Backs the `revoke` command: the
    /// shared-key scheme has no way to invalidate a single user's cookies
    /// without a per-user salt, so `revoke` pays that cost for everyone
    /// rather than not supporting revocation at all.
    pub fn force_rotate(&self) {
        *self.signing_key.write() = random_key();
        *self.key_issued_at.write() = now_secs();
    }

    fn canonical(username: &str, rights: Rights, expires_at: u64) -> String {
        format!("{}:{}:{}", username, rights.to_words(), expires_at)
    }

    pub fn issue(&self, username: &str, rights: Rights, lifetime_secs: u64) -> String {
        let expires_at = now_secs() + lifetime_secs;
        let payload = Self::canonical(username, rights, expires_at);
        let sig = self
            .algorithm
            .keyed_hash(&self.signing_key.read(), payload.as_bytes());
        format!("{}:{}", payload, sig)
    }

    /// Verifies and decodes a cookie string, rejecting expired or
    /// tampered tokens.
    pub fn verify(&self, token: &str) -> Option<Cookie> {
        let mut parts = token.rsplitn(2, ':');
        let sig = parts.next()?;
        let payload = parts.next()?;
        let expected = self
            .algorithm
            .keyed_hash(&self.signing_key.read(), payload.as_bytes());
        if sig != expected {
            return None;
        }
        let mut fields = payload.splitn(3, ':');
        let username = fields.next()?.to_string();
        let rights_words = fields.next()?;
        let expires_at: u64 = fields.next()?.parse().ok()?;
        if expires_at < now_secs() {
            return None;
        }
        Some(Cookie {
            username,
            rights: Rights::parse(rights_words),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_response_is_deterministic() {
        let r1 = expected_response(AuthAlgorithm::Sha1, b"nonce", "hunter2");
        let r2 = expected_response(AuthAlgorithm::Sha1, b"nonce", "hunter2");
        assert_eq!(r1, r2);
    }

    #[test]
    fn different_nonce_changes_response() {
        let r1 = expected_response(AuthAlgorithm::Sha1, b"nonce-a", "hunter2");
        let r2 = expected_response(AuthAlgorithm::Sha1, b"nonce-b", "hunter2");
        assert_ne!(r1, r2);
    }

    #[test]
    fn cookie_round_trips() {
        let store = CookieStore::new(AuthAlgorithm::Sha256, 86400);
        let token = store.issue("alice", Rights::READ | Rights::PLAY, 3600);
        let cookie = store.verify(&token).expect("valid cookie");
        assert_eq!(cookie.username, "alice");
        assert!(cookie.rights.contains(Rights::PLAY));
    }

    #[test]
    fn tampered_cookie_is_rejected() {
        let store = CookieStore::new(AuthAlgorithm::Sha256, 86400);
        let mut token = store.issue("alice", Rights::READ, 3600);
        token.push('x');
        assert!(store.verify(&token).is_none());
    }

    #[test]
    fn expired_cookie_is_rejected() {
        let store = CookieStore::new(AuthAlgorithm::Sha256, 86400);
        let token = store.issue("alice", Rights::READ, 0);
        std::thread::sleep(std::time::Duration::from_secs(1));
        assert!(store.verify(&token).is_none());
    }

    #[test]
    fn user_store_add_and_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::load(dir.path()).unwrap();
        store
            .add(UserRecord {
                username: "alice".into(),
                password_hash: hash_password(AuthAlgorithm::Sha1, "hunter2"),
                email: None,
                rights: Rights::READ,
                confirmation: None,
                last_reminder: None,
            })
            .unwrap();
        assert!(store.exists("alice"));
        assert!(matches!(
            store.add(UserRecord {
                username: "alice".into(),
                password_hash: String::new(),
                email: None,
                rights: Rights::empty(),
                confirmation: None,
                last_reminder: None,
            }),
            Err(UserError::AlreadyExists)
        ));
        store.delete("alice").unwrap();
        assert!(!store.exists("alice"));
    }
}
