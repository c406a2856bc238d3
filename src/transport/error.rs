// ABOUTME: Classified failure conditions reported by transports.
// ABOUTME: Retry policy matches on tagged variants, never on message text.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A protocol-reported failure, classified for the negotiator.
///
/// The auth-retryable variants drive the bounded escalation table in
/// `negotiate`; everything else is terminal for the session that hit it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureReason {
    #[error("host key for {host} is unknown (fingerprint {fingerprint})")]
    UnknownHostKey { host: String, fingerprint: String },

    #[error("host key for {0} has changed; refusing to connect")]
    HostKeyMismatch(String),

    #[error("key authentication rejected")]
    KeyAuthFailed,

    #[error("password required")]
    PasswordRequired,

    #[error("authentication rejected")]
    AuthFailed,

    #[error("sudo requires a tty")]
    SudoTtyRequired,

    #[error("sudo password required")]
    SudoPasswordRequired,

    #[error("incorrect sudo password")]
    BadSudoPassword,

    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),

    #[error("failed to load key from {path}: {reason}")]
    KeyLoadFailed { path: PathBuf, reason: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel closed without exit status")]
    ChannelClosed,

    #[error("{0}")]
    Unsupported(String),
}

impl FailureReason {
    /// Whether this class appears in the negotiator's escalation table.
    ///
    /// A `true` here does not mean a retry will happen; it means the class is
    /// *eligible* and subject to the per-class bound. Timeouts in particular
    /// are never retried.
    pub fn is_auth_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::UnknownHostKey { .. }
                | FailureReason::KeyAuthFailed
                | FailureReason::PasswordRequired
                | FailureReason::SudoTtyRequired
                | FailureReason::SudoPasswordRequired
                | FailureReason::BadSudoPassword
        )
    }
}

pub type Result<T> = std::result::Result<T, FailureReason>;
