//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the wire protocol or RFC 3550/3551 and
//! changing them would break interoperability with any other client.
//! Tunable behavior (queue padding, rights defaults, RTP-ahead window,
//! lock timeouts, …) lives in [`crate::config::Config`] instead.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// RTP (RFC 3550/3551)
// ─────────────────────────────────────────────────────────────────────────────

/// Size in bytes of the fixed RTP header (no extensions, no CSRC list).
pub const RTP_HEADER_BYTES: usize = 12;

/// RTP version carried in the first two bits of the first header octet.
pub const RTP_VERSION: u8 = 2;

/// Static RTP payload type for stereo 16-bit linear PCM at 44.1 kHz (L16).
pub const RTP_PAYLOAD_TYPE_STEREO: u8 = 10;

/// Static RTP payload type for mono 16-bit linear PCM at 44.1 kHz (L16).
pub const RTP_PAYLOAD_TYPE_MONO: u8 = 11;

/// Marker bit, OR'd into the second header octet alongside the payload
/// type on the first packet after an idle gap.
pub const RTP_MARKER_BIT: u8 = 0x80;

/// Sample rate in Hz for the L16 stereo/mono payload types above. Fixed by
/// the payload type assignment itself, not configurable.
pub const SAMPLE_RATE_HZ: u32 = 44_100;

/// Bytes per sample per channel (16-bit linear PCM).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Typical Ethernet-safe UDP payload budget: 1500 byte MTU minus an 8 byte
/// UDP header, a 40 byte IPv6 header, and 8 bytes of conservatism margin.
/// `Config::rtp_max_payload` may be set lower but this is the ceiling a
/// fresh install is seeded with.
pub const NETWORK_BYTES_DEFAULT: usize = 1500 - 8 - 40 - 8;

// ─────────────────────────────────────────────────────────────────────────────
// Wire protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum length, in bytes, of a single command or body line before the
/// connection is treated as abusive and dropped.
pub const MAX_LINE_BYTES: usize = 512 * 1024;

/// Length in bytes of the random nonce sent in the greeting banner.
pub const CHALLENGE_BYTES: usize = 20;

/// Application identity string reported by the `version` command.
pub const APP_NAME: &str = "disorder";

// ─────────────────────────────────────────────────────────────────────────────
// Reactor / connection defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default writer time bound: abandon a connection that hasn't completed a
/// write in this long.
pub const WRITER_TIME_BOUND_SECS: u64 = 600;

/// Default writer space bound: abandon a connection whose buffered unsent
/// data exceeds this many bytes.
pub const WRITER_SPACE_BOUND_BYTES: usize = 512 * 1024;

/// Capacity of the broadcast channel fanning event-log occurrences out to
/// `log` subscribers.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How often the periodic queue tick (prepare-ahead, `queue_pad` fill,
/// idle-start check) re-fires on its own, independent of the ticks that
/// already follow every decoder completion and queue mutation.
pub const QUEUE_TICK_INTERVAL: Duration = Duration::from_secs(2);

/// How often the RTP keep-alive tick re-fires: while paused, this is the
/// cadence of empty-payload packets sent to hold the receiver's clock;
/// while idle, this is how promptly the sender is marked idle so the
/// next track's first packet resyncs and carries the marker bit.
pub const RTP_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(20);

/// How often `CookieStore::rotate_if_stale` is polled to enforce
/// `cookie_key_lifetime`. Independent of that lifetime itself — this is
/// just the check cadence, so a key can be up to this long past its
/// configured lifetime before rotation actually happens.
pub const COOKIE_KEY_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// RTP sender tuning
// ─────────────────────────────────────────────────────────────────────────────

/// Default number of milliseconds of audio the sender is permitted to
/// transmit ahead of the wall clock.
pub const RTP_AHEAD_MS_DEFAULT: u64 = 2000;

/// Consecutive `writev`/`send` errors that cause the sender to abort.
pub const RTP_ERROR_ABORT_THRESHOLD: u32 = 10;
