//! Password reminder email.
//!
//! `reminder`'s mail delivery is treated as an external collaborator: a
//! real deployment would shell out to `sendmail` or talk to an SMTP relay
//! from a forked child, the same way other blocking work (stats, rescan)
//! runs out of process rather than on the connection-handling path.
//! [`Mailer`] is the interface the `reminder` command handler depends on;
//! [`LoggingMailer`] is the default implementation, which logs the
//! message it would have sent instead of spawning a real mail transport,
//! since neither `sendmail` nor an SMTP client is part of this crate's
//! scope.

/// Sends a single plain-text message to one recipient.
pub trait Mailer: Send + Sync {
    /// Sends `body` with `subject` to `to`. Errors are logged by the
    /// caller and translated to a `DisorderError::Temporary` response;
    /// the connection survives a failed send.
    fn send(&self, to: &str, subject: &str, body: &str) -> std::io::Result<()>;
}

/// Default [`Mailer`]: logs the message at info level instead of
/// delivering it. `mail_sender`/`smtp_server` are configuration the core
/// observes but does not implement a transport for; mail delivery sits
/// alongside format-specific audio decoders and platform sound APIs as an
/// external collaborator this crate only defines the interface to.
pub struct LoggingMailer;

impl Mailer for LoggingMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> std::io::Result<()> {
        tracing::info!(to, subject, body, "password reminder (no mail transport configured)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_mailer_never_fails() {
        let mailer = LoggingMailer;
        assert!(mailer.send("alice@example.com", "Password reminder", "hunter2").is_ok());
    }
}
