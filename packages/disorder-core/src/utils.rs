//! General utilities shared across the core library.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen
/// in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in whole seconds, the unit the
/// event-log line grammar's `<hex-seconds>` field uses.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// RTP Destination Address Validation
// ─────────────────────────────────────────────────────────────────────────────

use std::net::{IpAddr, Ipv4Addr};

use crate::error::ErrorCode;

/// Error returned when an address is not valid as an RTP transmission
/// source or destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressValidationError {
    /// IPv6 destinations are not yet supported.
    Ipv6NotSupported,
    /// Loopback address (127.x.x.x) - useless as an RTP destination.
    Loopback,
    /// Unspecified address (0.0.0.0).
    Unspecified,
}

impl ErrorCode for AddressValidationError {
    fn code(&self) -> &'static str {
        "invalid_address"
    }
}

impl AddressValidationError {
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ipv6NotSupported => "IPv6 RTP destinations are not supported",
            Self::Loopback => "loopback addresses cannot receive a broadcast RTP stream",
            Self::Unspecified => "unspecified address (0.0.0.0) is not a valid destination",
        }
    }
}

impl std::fmt::Display for AddressValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AddressValidationError {}

/// Validates an address is usable as an RTP source or fixed (broadcast/
/// multicast) destination. Unicast-on-request destinations are supplied
/// by clients and validated separately since a loopback client is
/// legitimate for local testing.
pub fn validate_fixed_destination(ip: &IpAddr) -> Result<Ipv4Addr, AddressValidationError> {
    let ipv4 = match ip {
        IpAddr::V4(v4) => *v4,
        IpAddr::V6(_) => return Err(AddressValidationError::Ipv6NotSupported),
    };

    if ipv4.is_loopback() {
        return Err(AddressValidationError::Loopback);
    }
    if ipv4.is_unspecified() {
        return Err(AddressValidationError::Unspecified);
    }

    Ok(ipv4)
}

// ─────────────────────────────────────────────────────────────────────────────
// Key=value line codec (queue journal, track preferences, user store)
// ─────────────────────────────────────────────────────────────────────────────

/// Quotes `value` the way the queue journal and track-preference files do:
/// wrapped in double quotes, with embedded `\` and `"` escaped.
#[must_use]
pub fn quote_kv_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '\\' || ch == '"' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Parses one `key="value" key2="value2"` line into ordered pairs.
/// Returns `None` on an unterminated quote (a parse error on the wire, a
/// corrupt-journal-line condition on disk).
#[must_use]
pub fn parse_kv_line(line: &str) -> Option<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };
        if first == '"' {
            return None; // a bare quoted value with no key is malformed
        }

        let mut key = String::new();
        while matches!(chars.peek(), Some(&c) if c != '=' && !c.is_whitespace()) {
            key.push(chars.next().unwrap());
        }
        if chars.next() != Some('=') {
            return None;
        }
        if chars.next() != Some('"') {
            return None;
        }
        let mut value = String::new();
        loop {
            match chars.next() {
                Some('"') => break,
                Some('\\') => match chars.next() {
                    Some(escaped) => value.push(escaped),
                    None => return None,
                },
                Some(c) => value.push(c),
                None => return None, // unterminated quote
            }
        }
        pairs.push((key, value));
    }
    Some(pairs)
}

/// Renders `pairs` back into one `key="value" ...` line (no trailing
/// newline). The inverse of [`parse_kv_line`]; round-trips any value
/// `parse_kv_line` would accept.
#[must_use]
pub fn render_kv_line(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, quote_kv_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_line_round_trips() {
        let line = render_kv_line(&[("track", "/a/b.ogg"), ("state", "unplayed")]);
        let parsed = parse_kv_line(&line).unwrap();
        assert_eq!(parsed[0], ("track".to_string(), "/a/b.ogg".to_string()));
        assert_eq!(parsed[1], ("state".to_string(), "unplayed".to_string()));
    }

    #[test]
    fn kv_line_round_trips_escaped_quotes() {
        let line = render_kv_line(&[("note", "she said \"hi\" and \\left")]);
        let parsed = parse_kv_line(&line).unwrap();
        assert_eq!(parsed[0].1, "she said \"hi\" and \\left");
    }

    #[test]
    fn kv_line_rejects_unterminated_quote() {
        assert!(parse_kv_line("track=\"unterminated").is_none());
    }

    #[test]
    fn accepts_private_address() {
        let ip: IpAddr = "192.168.1.100".parse().unwrap();
        assert!(validate_fixed_destination(&ip).is_ok());
    }

    #[test]
    fn accepts_multicast_address() {
        let ip: IpAddr = "239.1.1.1".parse().unwrap();
        assert!(validate_fixed_destination(&ip).is_ok());
    }

    #[test]
    fn rejects_ipv6() {
        let ip: IpAddr = "::1".parse().unwrap();
        assert_eq!(
            validate_fixed_destination(&ip),
            Err(AddressValidationError::Ipv6NotSupported)
        );
    }

    #[test]
    fn rejects_loopback() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            validate_fixed_destination(&ip),
            Err(AddressValidationError::Loopback)
        );
    }

    #[test]
    fn rejects_unspecified() {
        let ip: IpAddr = "0.0.0.0".parse().unwrap();
        assert_eq!(
            validate_fixed_destination(&ip),
            Err(AddressValidationError::Unspecified)
        );
    }
}
