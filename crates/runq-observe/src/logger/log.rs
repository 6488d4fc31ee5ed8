use std::sync::atomic::{AtomicBool, Ordering};

use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, fmt::time::OffsetTime, layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::logger::{config::LoggerConfig, error::LoggerError, format::LoggerFormat};

static INSTALLED: AtomicBool = AtomicBool::new(false);

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Build the output layer for `cfg.format` and install it globally behind an
/// `EnvFilter` made from `cfg.level`.
pub(super) fn install(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let filter = EnvFilter::try_new(&cfg.level).map_err(|e| LoggerError::InvalidFilter {
        directives: cfg.level.clone(),
        reason: e.to_string(),
    })?;
    let output = output_layer(cfg)?;

    // Scoped subscribers (`with_default`) do not count, only a global install does.
    if INSTALLED.load(Ordering::Acquire) {
        return Err(LoggerError::AlreadyInitialized);
    }
    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(as_error)?;
    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

/// A global dispatcher or `log` logger set by someone else reports "already".
fn as_error(e: impl std::fmt::Display) -> LoggerError {
    let s = e.to_string();
    if s.contains("SetGlobalDefaultError") || s.contains("already") {
        LoggerError::AlreadyInitialized
    } else {
        LoggerError::Install(s)
    }
}

fn output_layer(cfg: &LoggerConfig) -> Result<BoxedLayer, LoggerError> {
    Ok(match cfg.format {
        LoggerFormat::Text => fmt::layer()
            .with_ansi(cfg.use_color)
            .with_target(cfg.with_targets)
            .with_timer(local_rfc3339())
            .boxed(),
        LoggerFormat::Json => fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(cfg.with_targets)
            .with_timer(local_rfc3339())
            .boxed(),
        LoggerFormat::Journald => journald_layer()?,
    })
}

/// RFC 3339 timestamps in the local offset, UTC when it cannot be determined.
fn local_rfc3339() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

#[cfg(all(target_os = "linux", feature = "journald"))]
fn journald_layer() -> Result<BoxedLayer, LoggerError> {
    tracing_journald::layer()
        .map(|layer| layer.boxed())
        .map_err(|e| LoggerError::Install(format!("journald: {e}")))
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
fn journald_layer() -> Result<BoxedLayer, LoggerError> {
    Err(LoggerError::JournaldUnavailable)
}
