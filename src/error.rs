// ABOUTME: Application-wide error types for fanout.
// ABOUTME: Uses thiserror for ergonomic error handling.

use thiserror::Error;

/// Exit code for batch-level usage and target errors.
const BATCH_ERROR_EXIT: i32 = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no targets given")]
    NoTargets,

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("duplicated hosts: {0}")]
    DuplicateHosts(String),

    #[error("no sessions could be established")]
    NoSessions,

    #[error("aborting: {host} failed: {reason}")]
    ExitOnError { host: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Process exit code for this error. Target and batch composition
    /// problems use a distinct code so wrappers can tell them apart from
    /// remote command failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NoTargets
            | Error::NoSessions
            | Error::DuplicateHosts(_)
            | Error::InvalidTarget(_) => BATCH_ERROR_EXIT,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
