//! Renders [`LogEvent`] occurrences into the `log` command's streaming
//! wire grammar: `<hex-seconds> <kind> [<quoted-arg>...]`.

use crate::events::LogEvent;

use super::wire::quote_token;

/// Renders one event-log line, without a trailing newline (the caller's
/// writer appends it).
pub fn render_event(event: &LogEvent) -> String {
    let mut line = format!("{:x} {}", event.timestamp, event.kind.as_str());
    for arg in &event.args {
        line.push(' ');
        line.push_str(&quote_token(arg));
    }
    line
}

/// True if `event` should be withheld from a subscriber that is neither
/// an admin nor on the privileged local socket. User-management events
/// are filtered to admin subscribers and, when `remote_userman` is off,
/// to local-right subscribers only.
pub fn visible_to(event: &LogEvent, rights: crate::rights::Rights, remote_userman: bool) -> bool {
    if !event.user_management {
        return true;
    }
    if rights.contains(crate::rights::Rights::ADMIN) {
        return true;
    }
    if !remote_userman && rights.contains(crate::rights::Rights::LOCAL) {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogEventKind;
    use crate::rights::Rights;

    #[test]
    fn renders_hex_timestamp_and_quoted_args() {
        let event = LogEvent {
            timestamp: 255,
            kind: LogEventKind::Queue,
            args: vec!["q1-7".to_string()],
            user_management: false,
        };
        assert_eq!(render_event(&event), r#"ff queue "q1-7""#);
    }

    #[test]
    fn user_management_event_hidden_from_plain_subscriber() {
        let event = LogEvent::new(LogEventKind::RightsChanged, vec!["alice".into()]).user_management();
        assert!(!visible_to(&event, Rights::READ, false));
        assert!(visible_to(&event, Rights::ADMIN, false));
        assert!(visible_to(&event, Rights::LOCAL, false));
        assert!(visible_to(&event, Rights::READ, true));
    }
}
