//! Error types for cfgbuild

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cfgbuild
#[derive(Debug, Error)]
pub enum Error {
    // Process errors
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code}")]
    ExitStatus { program: String, code: i32 },

    #[error("{program} was terminated by signal {signal}")]
    Signalled { program: String, signal: String },

    #[error("{program} finished without reporting an exit status")]
    MissingExitStatus { program: String },

    #[error("Command already started")]
    AlreadyStarted,

    #[error("Command not started")]
    NotStarted,

    #[error("Interrupted")]
    Cancelled,

    // Remote session errors
    #[error("Failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("Host key for {host} was rejected")]
    HostKeyRejected { host: String },

    #[error("Authentication failed for {user}@{host}")]
    AuthenticationFailed { user: String, host: String },

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Keys(#[from] russh_keys::Error),

    // Build engine errors
    #[error("{0}")]
    BuildFailed(String),

    #[error("Could not parse store path name \"{0}\", wrong format")]
    InvalidStorePath(String),

    // Infrastructure errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a clean non-zero exit of a command
    pub fn is_exit_status(&self) -> bool {
        matches!(self, Error::ExitStatus { .. })
    }

    /// Get the process exit code this error should map to
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ExitStatus { code, .. } if *code > 0 => *code,
            Error::Signalled { .. } | Error::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
