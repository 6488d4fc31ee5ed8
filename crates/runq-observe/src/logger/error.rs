use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("unknown log format '{0}' (expected text, json or journald)")]
    InvalidFormat(String),
    #[error("journald output needs Linux and the `journald` feature")]
    JournaldUnavailable,
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
    #[error("invalid log filter '{directives}': {reason}")]
    InvalidFilter { directives: String, reason: String },
    #[error("failed to install logger: {0}")]
    Install(String),
}
