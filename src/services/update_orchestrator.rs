use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::errors::{Result, UpdateError};
use crate::models::{DownloadProgress, FileEntry};
use crate::services::{ConfigStore, FileProgress, InstallationVerifier, ManifestClient, MirrorDownloader};
use crate::settings::{build_http_client, UpdaterSettings};
use crate::utils::cancel::CancelToken;
use crate::utils::file::resolve_install_path;

const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(250);
const PROGRESS_MIN_STEP_PERCENT: f64 = 0.5;
pub const DOWNLOAD_COMPLETE_TEXT: &str = "Download Complete!";

#[derive(Clone, Debug, PartialEq)]
pub enum CheckOutcome {
    UpToDate {
        version: String,
    },
    UpdatesAvailable {
        version: String,
        files: Vec<FileEntry>,
        total_bytes: u64,
    },
}

#[derive(Debug)]
pub enum ApplyOutcome {
    Success {
        files_downloaded: usize,
        bytes_downloaded: u64,
    },
    /// The batch stopped at the first file no mirror could deliver.
    PartialFailure {
        error: UpdateError,
        files_downloaded: usize,
        bytes_downloaded: u64,
    },
    Cancelled {
        files_downloaded: usize,
        bytes_downloaded: u64,
    },
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Success { .. })
    }

    pub fn files_downloaded(&self) -> usize {
        match self {
            ApplyOutcome::Success { files_downloaded, .. }
            | ApplyOutcome::PartialFailure { files_downloaded, .. }
            | ApplyOutcome::Cancelled { files_downloaded, .. } => *files_downloaded,
        }
    }

    pub fn bytes_downloaded(&self) -> u64 {
        match self {
            ApplyOutcome::Success { bytes_downloaded, .. }
            | ApplyOutcome::PartialFailure { bytes_downloaded, .. }
            | ApplyOutcome::Cancelled { bytes_downloaded, .. } => *bytes_downloaded,
        }
    }
}

/// Runs check and apply cycles against one install directory.
///
/// Overlapping runs on the same directory are not guarded against; callers
/// cancel the running cycle before starting another.
#[derive(Clone)]
pub struct UpdateOrchestrator {
    manifest_client: ManifestClient,
    verifier: InstallationVerifier,
    downloader: MirrorDownloader,
    config: Arc<dyn ConfigStore>,
}

impl UpdateOrchestrator {
    pub fn new(
        manifest_client: ManifestClient,
        verifier: InstallationVerifier,
        downloader: MirrorDownloader,
        config: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            manifest_client,
            verifier,
            downloader,
            config,
        }
    }

    pub fn from_settings(settings: &UpdaterSettings, config: Arc<dyn ConfigStore>) -> Result<Self> {
        let client = build_http_client(settings)?;
        Ok(Self::new(
            ManifestClient::from_settings(client.clone(), settings),
            InstallationVerifier::new(settings.verify_read_retries),
            MirrorDownloader::from_settings(client, settings),
            config,
        ))
    }

    pub fn config(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    pub async fn check_for_updates(&self, cancel: &CancelToken) -> Result<CheckOutcome> {
        tracing::info!("starting update check");
        let manifest = self.manifest_client.fetch_manifest(cancel).await?;

        let install_path = self.config.install_path().unwrap_or_default();
        let report = self.verifier.diff(&install_path, &manifest, cancel).await?;

        if let Err(err) = self.config.record_update_check(Utc::now()) {
            tracing::warn!("failed to record update check time: {}", err);
        }

        if report.is_up_to_date() {
            tracing::info!("installation is up to date with version {}", manifest.version);
            return Ok(CheckOutcome::UpToDate {
                version: manifest.version,
            });
        }

        tracing::info!(
            "{} files need updating ({} bytes) for version {}",
            report.files_to_update.len(),
            report.total_bytes,
            manifest.version
        );
        Ok(CheckOutcome::UpdatesAvailable {
            version: manifest.version,
            files: report.files_to_update,
            total_bytes: report.total_bytes,
        })
    }

    /// Downloads `files` one at a time, in order, stopping at the first file
    /// that cannot be delivered. `on_progress` receives snapshots from a single
    /// producer with non-decreasing `bytes_downloaded`.
    pub async fn apply_updates<F>(
        &self,
        files: &[FileEntry],
        mut on_progress: F,
        cancel: &CancelToken,
    ) -> Result<ApplyOutcome>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let install_path = self
            .config
            .install_path()
            .ok_or_else(|| UpdateError::Config("install path is not configured".to_string()))?;
        tokio::fs::create_dir_all(&install_path).await?;

        let run_id = Uuid::new_v4();
        let total_bytes = files
            .iter()
            .fold(0_u64, |total, entry| total.saturating_add(entry.size_bytes));
        tracing::info!(
            "[{}] applying {} files ({} bytes) into {}",
            run_id,
            files.len(),
            total_bytes,
            install_path.display()
        );

        let mut emitter = ProgressEmitter::new(files.len(), total_bytes);
        let mut files_downloaded = 0_usize;

        for (index, entry) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!("[{}] cancelled before {}", run_id, entry.relative_path);
                return Ok(ApplyOutcome::Cancelled {
                    files_downloaded,
                    bytes_downloaded: emitter.bytes_downloaded,
                });
            }

            let result = match resolve_install_path(&install_path, &entry.relative_path) {
                Ok(destination) => {
                    on_progress(emitter.file_started(index, entry));
                    self.download_entry(entry, &destination, index, &mut emitter, &mut on_progress, cancel)
                        .await
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {
                    files_downloaded += 1;
                    on_progress(emitter.file_finished(index, entry));
                    tracing::debug!(
                        "[{}] finished {} ({}/{})",
                        run_id,
                        entry.relative_path,
                        index + 1,
                        files.len()
                    );
                }
                Err(UpdateError::Cancelled) => {
                    tracing::info!("[{}] cancelled during {}", run_id, entry.relative_path);
                    return Ok(ApplyOutcome::Cancelled {
                        files_downloaded,
                        bytes_downloaded: emitter.bytes_downloaded,
                    });
                }
                Err(error) => {
                    tracing::error!(
                        "[{}] stopping update after {} of {} files: {}",
                        run_id,
                        files_downloaded,
                        files.len(),
                        error
                    );
                    return Ok(ApplyOutcome::PartialFailure {
                        error,
                        files_downloaded,
                        bytes_downloaded: emitter.bytes_downloaded,
                    });
                }
            }
        }

        on_progress(emitter.completed());
        tracing::info!(
            "[{}] update complete: {} files, {} bytes",
            run_id,
            files_downloaded,
            emitter.bytes_downloaded
        );
        Ok(ApplyOutcome::Success {
            files_downloaded,
            bytes_downloaded: emitter.bytes_downloaded,
        })
    }

    async fn download_entry<F>(
        &self,
        entry: &FileEntry,
        destination: &Path,
        index: usize,
        emitter: &mut ProgressEmitter,
        on_progress: &mut F,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        self.downloader
            .download_one(
                entry,
                destination,
                |progress: FileProgress| {
                    if let Some(snapshot) = emitter.file_progress(index, entry, progress) {
                        on_progress(snapshot);
                    }
                },
                cancel,
            )
            .await
    }

    pub fn install_path(&self) -> Option<PathBuf> {
        self.config.install_path()
    }
}

/// Builds progress snapshots for one apply run.
///
/// `bytes_downloaded` only advances when a file completes; in-flight bytes
/// show up in `file_progress_percent` and, capped, in `overall_percent`.
struct ProgressEmitter {
    total_files: usize,
    total_bytes: u64,
    bytes_downloaded: u64,
    last_overall: f64,
    last_file_percent: f64,
    last_sent: Instant,
}

impl ProgressEmitter {
    fn new(total_files: usize, total_bytes: u64) -> Self {
        Self {
            total_files,
            total_bytes,
            bytes_downloaded: 0,
            last_overall: 0.0,
            last_file_percent: 0.0,
            last_sent: Instant::now(),
        }
    }

    fn file_started(&mut self, index: usize, entry: &FileEntry) -> DownloadProgress {
        self.last_file_percent = 0.0;
        self.last_sent = Instant::now();
        let name = entry.file_name();
        self.snapshot(index, &name, self.bytes_downloaded, 0.0, format!("Downloading {name}..."))
    }

    fn file_progress(
        &mut self,
        index: usize,
        entry: &FileEntry,
        progress: FileProgress,
    ) -> Option<DownloadProgress> {
        let percent = progress.percent()?;
        let step = (percent - self.last_file_percent).abs();
        let due = step >= PROGRESS_MIN_STEP_PERCENT
            || self.last_sent.elapsed() >= PROGRESS_MIN_INTERVAL
            || (percent >= 100.0 && self.last_file_percent < 100.0);
        if !due {
            return None;
        }
        self.last_file_percent = percent;
        self.last_sent = Instant::now();

        let in_flight = ((entry.size_bytes as f64) * percent / 100.0) as u64;
        let name = entry.file_name();
        Some(self.snapshot(
            index,
            &name,
            self.bytes_downloaded.saturating_add(in_flight),
            percent,
            format!("Downloading {name}... {percent:.1}%"),
        ))
    }

    fn file_finished(&mut self, index: usize, entry: &FileEntry) -> DownloadProgress {
        self.bytes_downloaded = self.bytes_downloaded.saturating_add(entry.size_bytes);
        self.last_file_percent = 100.0;
        self.last_sent = Instant::now();
        let name = entry.file_name();
        self.snapshot(index, &name, self.bytes_downloaded, 100.0, format!("Downloaded {name}"))
    }

    fn completed(&mut self) -> DownloadProgress {
        self.last_overall = 100.0;
        DownloadProgress {
            file_name: "Complete".to_string(),
            file_index: self.total_files,
            total_files: self.total_files,
            bytes_downloaded: self.bytes_downloaded,
            total_bytes: self.total_bytes,
            overall_percent: 100.0,
            file_progress_percent: 100.0,
            status_text: DOWNLOAD_COMPLETE_TEXT.to_string(),
        }
    }

    fn snapshot(
        &mut self,
        index: usize,
        name: &str,
        effective_bytes: u64,
        file_percent: f64,
        status_text: String,
    ) -> DownloadProgress {
        let overall = if self.total_bytes == 0 {
            0.0
        } else {
            ((effective_bytes as f64) / (self.total_bytes as f64) * 100.0).clamp(0.0, 100.0)
        };
        self.last_overall = self.last_overall.max(overall);
        DownloadProgress {
            file_name: name.to_string(),
            file_index: index + 1,
            total_files: self.total_files,
            bytes_downloaded: self.bytes_downloaded,
            total_bytes: self.total_bytes,
            overall_percent: self.last_overall,
            file_progress_percent: file_percent,
            status_text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryConfigStore;
    use crate::test_support::{FixtureServer, Route};
    use crate::utils::cancel::cancel_pair;
    use crate::utils::file::temp_path_for;
    use crate::utils::hash::sha256_hex;
    use std::collections::BTreeMap;

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("epoch-orchestrator-{label}-{}", Uuid::new_v4()))
    }

    fn orchestrator(server: &FixtureServer, install: &Path, timeout: Duration) -> UpdateOrchestrator {
        let client = reqwest::Client::new();
        UpdateOrchestrator::new(
            ManifestClient::new(client.clone(), server.url("api/v2/manifest"), Duration::from_secs(5)),
            InstallationVerifier::new(0),
            MirrorDownloader::new(
                client,
                vec!["cloudflare".into(), "digitalocean".into(), "none".into()],
                timeout,
            ),
            Arc::new(MemoryConfigStore::with_install_path(install)),
        )
    }

    fn manifest_json(files: &[(&str, &[u8], String)]) -> String {
        let files: Vec<serde_json::Value> = files
            .iter()
            .map(|(path, content, url)| {
                serde_json::json!({
                    "path": path,
                    "hash": sha256_hex(content),
                    "size": content.len(),
                    "custom": false,
                    "urls": { "x": url },
                })
            })
            .collect();
        serde_json::json!({
            "version": "42",
            "uid": "epoch",
            "files": files,
            "checkedAt": "2025-01-01T00:00:00Z",
        })
        .to_string()
    }

    #[tokio::test]
    async fn fresh_install_downloads_then_reports_up_to_date() {
        let server = FixtureServer::start();
        let content = vec![0xAB_u8; 100];
        server.route("files/a.dat", Route::ok(content.clone()));
        server.route(
            "api/v2/manifest",
            Route::ok(manifest_json(&[("a.dat", &content[..], server.url("files/a.dat"))])),
        );
        let install = temp_dir("fresh");
        let updater = orchestrator(&server, &install, Duration::from_secs(5));

        let outcome = updater
            .check_for_updates(&CancelToken::none())
            .await
            .expect("check");
        let CheckOutcome::UpdatesAvailable { files, total_bytes, version } = outcome else {
            panic!("expected updates to be available");
        };
        assert_eq!(version, "42");
        assert_eq!(total_bytes, 100);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "a.dat");
        assert!(updater.config().last_update_check().is_some());

        let mut snapshots: Vec<DownloadProgress> = Vec::new();
        let applied = updater
            .apply_updates(&files, |progress| snapshots.push(progress), &CancelToken::none())
            .await
            .expect("apply");
        assert!(matches!(
            applied,
            ApplyOutcome::Success { files_downloaded: 1, bytes_downloaded: 100 }
        ));
        assert_eq!(std::fs::read(install.join("a.dat")).expect("read a.dat"), content);

        assert!(snapshots
            .windows(2)
            .all(|pair| pair[0].bytes_downloaded <= pair[1].bytes_downloaded
                && pair[0].overall_percent <= pair[1].overall_percent));
        let last = snapshots.last().expect("final snapshot");
        assert_eq!(last.status_text, DOWNLOAD_COMPLETE_TEXT);
        assert_eq!(last.bytes_downloaded, 100);
        assert_eq!(last.overall_percent, 100.0);

        let again = updater
            .check_for_updates(&CancelToken::none())
            .await
            .expect("second check");
        assert_eq!(again, CheckOutcome::UpToDate { version: "42".to_string() });
    }

    #[tokio::test]
    async fn matching_local_file_is_up_to_date() {
        let server = FixtureServer::start();
        let content = vec![1_u8; 100];
        server.route(
            "api/v2/manifest",
            Route::ok(manifest_json(&[("a.dat", &content[..], server.url("files/a.dat"))])),
        );
        let install = temp_dir("current");
        std::fs::create_dir_all(&install).expect("create install");
        std::fs::write(install.join("a.dat"), &content).expect("seed a.dat");

        let outcome = orchestrator(&server, &install, Duration::from_secs(5))
            .check_for_updates(&CancelToken::none())
            .await
            .expect("check");
        assert_eq!(outcome, CheckOutcome::UpToDate { version: "42".to_string() });
        assert_eq!(server.hits(), vec!["/api/v2/manifest"]);
    }

    #[tokio::test]
    async fn first_exhausted_file_stops_the_batch() {
        let server = FixtureServer::start();
        let first = b"first file".to_vec();
        let second = b"second file".to_vec();
        let third = b"third file".to_vec();
        server.route("1", Route::ok(first.clone()));
        server.route("2", Route::status(500));
        server.route("3", Route::ok(third.clone()));
        let manifest = manifest_json(&[
            ("one.dat", &first[..], server.url("1")),
            ("two.dat", &second[..], server.url("2")),
            ("three.dat", &third[..], server.url("3")),
        ]);
        server.route("api/v2/manifest", Route::ok(manifest));
        let install = temp_dir("failfast");
        let updater = orchestrator(&server, &install, Duration::from_secs(5));

        let CheckOutcome::UpdatesAvailable { files, .. } = updater
            .check_for_updates(&CancelToken::none())
            .await
            .expect("check")
        else {
            panic!("expected updates");
        };
        let outcome = updater
            .apply_updates(&files, |_| {}, &CancelToken::none())
            .await
            .expect("apply");

        match outcome {
            ApplyOutcome::PartialFailure { error, files_downloaded, bytes_downloaded } => {
                assert!(matches!(error, UpdateError::MirrorExhausted { ref path, .. } if path == "two.dat"));
                assert_eq!(files_downloaded, 1);
                assert_eq!(bytes_downloaded, first.len() as u64);
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
        assert!(install.join("one.dat").exists());
        assert!(!install.join("two.dat").exists());
        assert!(!install.join("three.dat").exists());
        assert!(!server.hits().contains(&"/3".to_string()));
    }

    #[tokio::test]
    async fn cancellation_mid_file_reports_cancelled_and_leaves_no_temp() {
        let server = FixtureServer::start();
        let big = vec![3_u8; 256 * 1024];
        server.route("big", Route::ok(big.clone()).stall_after(4096));
        server.route(
            "api/v2/manifest",
            Route::ok(manifest_json(&[("big.bin", &big[..], server.url("big"))])),
        );
        let install = temp_dir("cancel");
        let updater = orchestrator(&server, &install, Duration::from_secs(30));
        let CheckOutcome::UpdatesAvailable { files, .. } = updater
            .check_for_updates(&CancelToken::none())
            .await
            .expect("check")
        else {
            panic!("expected updates");
        };

        let (handle, token) = cancel_pair();
        let outcome = updater
            .apply_updates(
                &files,
                |progress| {
                    if progress.file_progress_percent > 0.0 {
                        handle.cancel();
                    }
                },
                &token,
            )
            .await
            .expect("apply");

        assert!(matches!(
            outcome,
            ApplyOutcome::Cancelled { files_downloaded: 0, bytes_downloaded: 0 }
        ));
        assert!(!install.join("big.bin").exists());
        assert!(!temp_path_for(&install.join("big.bin")).exists());
    }

    #[tokio::test]
    async fn apply_requires_configured_install_path() {
        let server = FixtureServer::start();
        let updater = UpdateOrchestrator::new(
            ManifestClient::new(reqwest::Client::new(), server.url("m"), Duration::from_secs(1)),
            InstallationVerifier::default(),
            MirrorDownloader::new(reqwest::Client::new(), Vec::new(), Duration::from_secs(1)),
            Arc::new(MemoryConfigStore::default()),
        );
        let entry = FileEntry {
            relative_path: "a.dat".to_string(),
            content_hash: sha256_hex(b"a"),
            size_bytes: 1,
            is_custom: false,
            mirror_urls: BTreeMap::new(),
        };
        let err = updater
            .apply_updates(&[entry], |_| {}, &CancelToken::none())
            .await
            .expect_err("no install path");
        assert!(matches!(err, UpdateError::Config(_)));
    }

    #[tokio::test]
    async fn failed_manifest_fetch_surfaces_as_error() {
        let server = FixtureServer::start();
        server.route("api/v2/manifest", Route::status(502));
        let install = temp_dir("fetchfail");
        let err = orchestrator(&server, &install, Duration::from_secs(5))
            .check_for_updates(&CancelToken::none())
            .await
            .expect_err("fetch fails");
        assert!(matches!(err, UpdateError::ManifestFetch(_)));
    }

    #[test]
    fn emitter_keeps_overall_percent_monotonic_across_mirror_restarts() {
        let entry = FileEntry {
            relative_path: "Data/a.mpq".to_string(),
            content_hash: String::new(),
            size_bytes: 1000,
            is_custom: false,
            mirror_urls: BTreeMap::new(),
        };
        let mut emitter = ProgressEmitter::new(1, 1000);
        emitter.file_started(0, &entry);
        let halfway = emitter
            .file_progress(0, &entry, FileProgress { bytes_written: 500, content_length: Some(1000) })
            .expect("halfway snapshot");
        assert_eq!(halfway.overall_percent, 50.0);
        assert_eq!(halfway.bytes_downloaded, 0);

        // second mirror starts again from zero
        let restart = emitter
            .file_progress(0, &entry, FileProgress { bytes_written: 10, content_length: Some(1000) })
            .expect("restart snapshot");
        assert_eq!(restart.overall_percent, 50.0);
        assert!((restart.file_progress_percent - 1.0).abs() < 1e-9);

        assert!(emitter
            .file_progress(0, &entry, FileProgress { bytes_written: 11, content_length: None })
            .is_none());
        let done = emitter.file_finished(0, &entry);
        assert_eq!(done.bytes_downloaded, 1000);
        assert_eq!(done.file_name, "a.mpq");
    }
}
