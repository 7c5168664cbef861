//! Server configuration.
//!
//! [`Config`] gathers every knob the core observes: listener addresses,
//! RTP transmission parameters, queue/selection tuning, rights defaults,
//! and authentication lifetimes. It is deserialized from YAML by the
//! server binary (`serde_yaml`) and then overridden by environment
//! variables and CLI flags in that order, matching the precedence chain
//! documented in `apps/disorder-server::config`.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::rtp::RtpMode;

/// System configuration for a running server.
///
/// All fields carry sensible defaults; a freshly generated config file
/// needs only `root` (the track library) and `broadcast`/`rtp_mode` set
/// to be useful.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of the track library, walked by the default track
    /// database.
    pub root: PathBuf,

    /// Directory for the queue journal, user database, and cookie keys.
    pub home: PathBuf,

    /// Primary TCP listen address for client connections.
    pub listen: SocketAddr,

    /// Secondary listen address (e.g. a second interface), if configured.
    pub listen_secondary: Option<SocketAddr>,

    /// Filesystem path of the local, privileged Unix-domain socket.
    /// Connections accepted here are granted `RIGHT_LOCAL` automatically.
    pub privileged_socket: PathBuf,

    /// Address audio is sent to; interpretation depends on `rtp_mode`.
    pub broadcast: Option<SocketAddr>,

    /// Source address for outbound RTP packets.
    pub broadcast_from: Option<SocketAddr>,

    /// How RTP destinations are determined.
    pub rtp_mode: RtpMode,

    /// Multicast TTL for `rtp_mode = multicast`.
    pub multicast_ttl: u32,

    /// Whether multicast packets are looped back locally.
    pub multicast_loop: bool,

    /// Maximum bytes of RTP payload per packet passed to the socket
    /// (excludes UDP/IP headers).
    pub rtp_max_payload: usize,

    /// Target number of tracks the queue is padded out to with random
    /// selections.
    pub queue_pad: usize,

    /// Maximum number of recently played tracks retained in history.
    pub history: usize,

    /// Minimum interval, in seconds, before a track may be replayed.
    pub replay_min: u64,

    /// Maximum number of tracks considered "new" for bias purposes.
    pub new_max: usize,

    /// Maximum age, in seconds, for a track to be eligible for the new-bias
    /// weighting.
    pub new_bias_age: u64,

    /// Weighting multiplier applied to tracks younger than `new_bias_age`.
    pub new_bias: u64,

    /// Maximum size, in bytes, of a saved playlist body.
    pub playlist_max: usize,

    /// Maximum lifetime, in seconds, of an exclusive playlist lock.
    pub playlist_lock_timeout: u64,

    /// Login cookie lifetime, in seconds.
    pub cookie_login_lifetime: u64,

    /// Cookie-signing key rotation lifetime, in seconds.
    pub cookie_key_lifetime: u64,

    /// Minimum interval, in seconds, between password reminder emails to
    /// the same user.
    pub reminder_interval: u64,

    /// Default rights mask (as the rights grammar's word list) assigned
    /// to a newly registered user.
    pub default_rights: String,

    /// Hash algorithm used for challenge-response authentication:
    /// `sha1` or `sha256`.
    pub authorization_algorithm: String,

    /// Whether `adduser`/`deluser`/`edituser` are permitted over a
    /// non-local connection.
    pub remote_userman: bool,

    /// Termination signal sent to decoder subprocesses on scratch/remove.
    pub signal: u8,

    /// Unprivileged user to drop privileges to after binding listeners, if
    /// running as root.
    pub user: Option<String>,

    /// Path to the `sendmail`-compatible binary used for password
    /// reminders, if `smtp_server` is unset.
    pub sendmail: Option<PathBuf>,

    /// SMTP server for password reminder email, if not using `sendmail`.
    pub smtp_server: Option<String>,

    /// Origin address for outbound reminder mail.
    pub mail_sender: Option<String>,

    /// Scratch-clip tracks, in priority order.
    pub scratch: Vec<PathBuf>,

    /// Command template used to launch a decoder for a queue entry.
    /// `{path}` is substituted with the track's library-relative path.
    /// Format-specific decoding is an external collaborator (see the
    /// crate's top-level documentation); the queue engine only knows how
    /// to invoke this template and read raw PCM from its stdout.
    pub decoder_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/disorder/music"),
            home: PathBuf::from("/var/lib/disorder"),
            listen: "0.0.0.0:9999".parse().expect("valid default listen addr"),
            listen_secondary: None,
            privileged_socket: PathBuf::from("/var/lib/disorder/private/socket"),
            broadcast: None,
            broadcast_from: None,
            rtp_mode: RtpMode::Request,
            multicast_ttl: 1,
            multicast_loop: false,
            rtp_max_payload: 1400,
            queue_pad: 10,
            history: 60,
            replay_min: 8 * 3600,
            new_max: 100,
            new_bias_age: 7 * 86400,
            new_bias: 4500,
            playlist_max: 256 * 1024,
            playlist_lock_timeout: 8 * 3600,
            cookie_login_lifetime: 86400,
            cookie_key_lifetime: 86400,
            reminder_interval: 600,
            default_rights: "read play".to_string(),
            authorization_algorithm: "sha1".to_string(),
            remote_userman: false,
            signal: 15, // SIGTERM
            user: None,
            sendmail: Some(PathBuf::from("/usr/sbin/sendmail")),
            smtp_server: None,
            mail_sender: None,
            scratch: Vec::new(),
            decoder_command: vec![
                "/usr/bin/disorder-decode".to_string(),
                "{path}".to_string(),
            ],
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file, falling back to defaults for
    /// any field the file omits.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that can't be expressed via serde defaults alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root must be set".into()));
        }
        if matches!(self.rtp_mode, RtpMode::Broadcast | RtpMode::Multicast) && self.broadcast.is_none()
        {
            return Err(ConfigError::Invalid(
                "broadcast address required for broadcast/multicast rtp_mode".into(),
            ));
        }
        if self.rtp_max_payload < 64 {
            return Err(ConfigError::Invalid(
                "rtp_max_payload too small to carry a useful frame".into(),
            ));
        }
        Ok(())
    }
}

/// Errors encountered while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_for_request_mode() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn broadcast_mode_requires_destination() {
        let mut config = Config::default();
        config.rtp_mode = RtpMode::Broadcast;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_tiny_payload() {
        let mut config = Config {
            rtp_max_payload: 10,
            ..Config::default()
        };
        config.broadcast = Some("239.1.1.1:5004".parse().unwrap());
        config.rtp_mode = RtpMode::Unicast;
        assert!(config.validate().is_err());
    }
}
