use std::path::PathBuf;
use std::sync::Arc;

use epoch_updater::services::{ConfigStore, JsonFileConfigStore};
use epoch_updater::{
    cancel_pair, logging, ApplyOutcome, CheckOutcome, Result, UpdateError, UpdateOrchestrator,
    UpdaterSettings,
};

const DEFAULT_CONFIG_PATH: &str = "launcher-config.json";
const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Check,
    Update,
}

fn env_path(key: &str, fallback: &str) -> PathBuf {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(fallback))
}

fn parse_command() -> Result<Command> {
    match std::env::args().nth(1).as_deref() {
        None | Some("check") => Ok(Command::Check),
        Some("update") => Ok(Command::Update),
        Some(other) => Err(UpdateError::Config(format!(
            "unknown command {other:?}, expected `check` or `update`"
        ))),
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!("updater failed: {err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let command = parse_command()?;
    logging::init(
        &env_path("EPOCH_UPDATER_LOG_DIR", DEFAULT_LOG_DIR),
        logging::DEFAULT_LOG_PREFIX,
    )?;

    let settings = UpdaterSettings::from_env();
    let store = Arc::new(JsonFileConfigStore::open(env_path(
        "EPOCH_UPDATER_CONFIG",
        DEFAULT_CONFIG_PATH,
    )));
    if let Ok(dir) = std::env::var("EPOCH_UPDATER_INSTALL_DIR") {
        if !dir.trim().is_empty() {
            store.set_install_path(PathBuf::from(dir.trim()))?;
        }
    }
    tracing::info!(
        "updater starting command={:?} config={} install_path={:?}",
        command,
        store.path().display(),
        store.install_path()
    );

    let orchestrator = UpdateOrchestrator::from_settings(&settings, store.clone())?;
    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            handle.cancel();
        }
    });

    let (version, files, total_bytes) = match orchestrator.check_for_updates(&token).await {
        Ok(CheckOutcome::UpToDate { version }) => {
            println!("Up to date (version {version}).");
            return Ok(());
        }
        Ok(CheckOutcome::UpdatesAvailable {
            version,
            files,
            total_bytes,
        }) => (version, files, total_bytes),
        Err(UpdateError::Cancelled) => {
            println!("Update check was cancelled.");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    println!(
        "Version {version}: {} files need updating ({total_bytes} bytes).",
        files.len()
    );
    if command == Command::Check {
        for file in &files {
            println!("  {} ({} bytes)", file.relative_path, file.size_bytes);
        }
        return Ok(());
    }

    let outcome = orchestrator
        .apply_updates(
            &files,
            |progress| {
                println!(
                    "[{}/{}] {:5.1}% {}",
                    progress.file_index,
                    progress.total_files,
                    progress.overall_percent,
                    progress.status_text
                );
            },
            &token,
        )
        .await?;

    match outcome {
        ApplyOutcome::Success {
            files_downloaded,
            bytes_downloaded,
        } => {
            if !store.is_setup_completed() {
                store.mark_setup_completed()?;
            }
            println!("Download completed: {files_downloaded} files, {bytes_downloaded} bytes.");
            Ok(())
        }
        ApplyOutcome::Cancelled {
            files_downloaded, ..
        } => {
            println!("Download was cancelled after {files_downloaded} files.");
            Ok(())
        }
        ApplyOutcome::PartialFailure {
            error,
            files_downloaded,
            ..
        } => {
            println!("Download failed after {files_downloaded} files.");
            Err(error)
        }
    }
}
