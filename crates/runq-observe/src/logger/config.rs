use crate::logger::{error::LoggerError, format::LoggerFormat};

/// Variable holding `EnvFilter` directives.
pub const ENV_LEVEL: &str = "RUNQ_LOG";
/// Variable selecting the output format (`text|json|journald`).
pub const ENV_FORMAT: &str = "RUNQ_LOG_FORMAT";

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directives, e.g. `info` or `warn,runq.core=debug`.
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: cfg!(test) || atty::is(atty::Stream::Stdout),
        }
    }
}

impl LoggerConfig {
    /// Defaults overridden by `RUNQ_LOG`, `RUNQ_LOG_FORMAT` and `NO_COLOR`.
    pub fn from_env() -> Result<Self, LoggerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggerError> {
        let mut cfg = Self::default();
        if let Some(level) = lookup(ENV_LEVEL).filter(|l| !l.trim().is_empty()) {
            cfg.level = level;
        }
        if let Some(format) = lookup(ENV_FORMAT) {
            cfg.format = format.parse()?;
        }
        if lookup("NO_COLOR").is_some_and(|v| !v.is_empty()) {
            cfg.use_color = false;
        }
        Ok(cfg)
    }
}
