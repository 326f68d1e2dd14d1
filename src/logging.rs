use std::fs;
use std::path::Path;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::EnvFilter;

use crate::errors::{Result, UpdateError};

pub const DEFAULT_LOG_PREFIX: &str = "updater.log";
/// Engine lines at `info`, dependencies (hyper, reqwest) only when they warn.
const DEFAULT_FILTER: &str = "warn,epoch_updater=info";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Routes `tracing` output to `<log_dir>/<file_prefix>.<date>`, rolled daily.
///
/// `RUST_LOG` replaces the default filter. Only one subscriber can be installed per
/// process, so a second call returns `Config`.
pub fn init(log_dir: &Path, file_prefix: &str) -> Result<()> {
    if LOG_GUARD.get().is_some() {
        return Err(UpdateError::Config("logging already initialized".to_string()));
    }
    fs::create_dir_all(log_dir)?;

    let prefix = match file_prefix.trim() {
        "" => DEFAULT_LOG_PREFIX,
        trimmed => trimmed,
    };
    let file_appender = tracing_appender::rolling::daily(log_dir, prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let subscriber = Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| UpdateError::Config(err.to_string()))?;
    let _ = LOG_GUARD.set(guard);

    tracing::info!(
        "epoch-updater {} logging to {}/{}",
        env!("CARGO_PKG_VERSION"),
        log_dir.display(),
        prefix
    );
    Ok(())
}
