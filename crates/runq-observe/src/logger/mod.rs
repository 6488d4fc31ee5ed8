mod config;
mod error;
mod format;
mod log;

pub use config::{ENV_FORMAT, ENV_LEVEL, LoggerConfig};
pub use error::LoggerError;
pub use format::LoggerFormat;

/// Install the process-wide `tracing` subscriber described by `cfg`.
///
/// Fails with [`LoggerError::AlreadyInitialized`] if a global subscriber is
/// already set.
pub fn logger_init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    log::install(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The only test in this binary that installs globally.
    #[test]
    fn scoped_subscriber_does_not_block_install_and_second_init_is_rejected() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            tracing::info!(target: "runq.observe", "scoped");
        });
        assert!(tracing::dispatcher::has_been_set());

        let cfg = LoggerConfig {
            level: "runq=debug".into(),
            ..Default::default()
        };
        logger_init(&cfg).unwrap();
        assert!(matches!(
            logger_init(&cfg),
            Err(LoggerError::AlreadyInitialized)
        ));
    }

    #[test]
    fn bad_level_is_reported_before_install() {
        let cfg = LoggerConfig {
            level: "runq=loud".into(),
            ..Default::default()
        };
        assert!(matches!(
            logger_init(&cfg),
            Err(LoggerError::InvalidFilter { directives, .. }) if directives == "runq=loud"
        ));
    }
}
