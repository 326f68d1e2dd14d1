use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::{Result, UpdateError};
use crate::models::{FileEntry, Manifest};
use crate::utils::cancel::CancelToken;
use crate::utils::file::{install_path_key, resolve_install_path};
use crate::utils::hash::{compute_file_hash, ExpectedHash};

const READ_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_SCAN_WORKERS: usize = 8;
const MAX_REPORTED_FAILURES: usize = 5;

#[derive(Clone, Debug, Default)]
pub struct DiffReport {
    pub files_to_update: Vec<FileEntry>,
    pub total_bytes: u64,
    pub summary: VerificationSummary,
}

impl DiffReport {
    pub fn is_up_to_date(&self) -> bool {
        self.files_to_update.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub total_files: usize,
    pub current_files: usize,
    pub missing_files: usize,
    pub stale_files: usize,
    pub unreadable_files: usize,
    pub fresh_install: bool,
    pub elapsed_ms: u128,
    pub first_failures: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum FileStatus {
    Current,
    Missing,
    Stale(&'static str),
    Unreadable(String),
}

/// Compares an install directory with a manifest by content hash.
#[derive(Clone, Debug)]
pub struct InstallationVerifier {
    read_retries: u32,
}

impl Default for InstallationVerifier {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InstallationVerifier {
    pub fn new(read_retries: u32) -> Self {
        Self { read_retries }
    }

    /// Files that are missing or whose hash differs, in manifest order.
    ///
    /// An empty or absent `install_path` short-circuits to "everything missing"
    /// without touching the filesystem. Read failures never abort the diff; the
    /// affected file is reported as needing an update instead.
    pub async fn diff(
        &self,
        install_path: &Path,
        manifest: &Manifest,
        cancel: &CancelToken,
    ) -> Result<DiffReport> {
        cancel.check()?;
        let started = Instant::now();
        let entries = unique_entries(&manifest.files);

        if install_path.as_os_str().is_empty() || !install_path.is_dir() {
            tracing::info!(
                "install directory {:?} does not exist, treating as fresh install",
                install_path
            );
            let total_bytes = sum_sizes(&entries);
            return Ok(DiffReport {
                summary: VerificationSummary {
                    total_files: entries.len(),
                    missing_files: entries.len(),
                    fresh_install: true,
                    elapsed_ms: started.elapsed().as_millis(),
                    ..VerificationSummary::default()
                },
                files_to_update: entries,
                total_bytes,
            });
        }

        let root = install_path.to_path_buf();
        let retries = self.read_retries;
        let scan_cancel = cancel.clone();
        let scan_entries = entries.clone();
        let statuses = tokio::task::spawn_blocking(move || {
            scan_blocking(&root, &scan_entries, retries, &scan_cancel)
        })
        .await
        .map_err(|err| UpdateError::Config(format!("verification join error: {err}")))??;

        let mut report = DiffReport::default();
        report.summary.total_files = entries.len();
        for (entry, status) in entries.into_iter().zip(statuses) {
            let reason = match &status {
                FileStatus::Current => {
                    tracing::debug!("file up to date: {}", entry.relative_path);
                    report.summary.current_files += 1;
                    continue;
                }
                FileStatus::Missing => {
                    report.summary.missing_files += 1;
                    "missing".to_string()
                }
                FileStatus::Stale(reason) => {
                    report.summary.stale_files += 1;
                    reason.to_string()
                }
                FileStatus::Unreadable(reason) => {
                    report.summary.unreadable_files += 1;
                    reason.clone()
                }
            };
            tracing::debug!("file needs update: {} ({})", entry.relative_path, reason);
            if report.summary.first_failures.len() < MAX_REPORTED_FAILURES {
                report
                    .summary
                    .first_failures
                    .push(format!("{} ({})", entry.relative_path, reason));
            }
            report.total_bytes = report.total_bytes.saturating_add(entry.size_bytes);
            report.files_to_update.push(entry);
        }
        report.summary.elapsed_ms = started.elapsed().as_millis();

        tracing::info!(
            "verified {} files in {}ms: current={} missing={} stale={} unreadable={}",
            report.summary.total_files,
            report.summary.elapsed_ms,
            report.summary.current_files,
            report.summary.missing_files,
            report.summary.stale_files,
            report.summary.unreadable_files
        );
        Ok(report)
    }
}

fn unique_entries(files: &[FileEntry]) -> Vec<FileEntry> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(files.len());
    for entry in files {
        let key = install_path_key(&entry.relative_path);
        if seen.insert(key) {
            unique.push(entry.clone());
        } else {
            tracing::warn!("duplicate manifest path ignored: {}", entry.relative_path);
        }
    }
    unique
}

fn sum_sizes(files: &[FileEntry]) -> u64 {
    files
        .iter()
        .fold(0_u64, |total, entry| total.saturating_add(entry.size_bytes))
}

fn resolve_scan_workers(file_count: usize) -> usize {
    let cores = thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(4);
    cores.min(MAX_SCAN_WORKERS).min(file_count).max(1)
}

fn scan_blocking(
    root: &Path,
    entries: &[FileEntry],
    read_retries: u32,
    cancel: &CancelToken,
) -> Result<Vec<FileStatus>> {
    let next_index = AtomicUsize::new(0);
    let results: Mutex<Vec<Option<FileStatus>>> = Mutex::new(vec![None; entries.len()]);

    thread::scope(|scope| {
        for _ in 0..resolve_scan_workers(entries.len()) {
            scope.spawn(|| loop {
                if cancel.is_cancelled() {
                    break;
                }
                let index = next_index.fetch_add(1, Ordering::SeqCst);
                let Some(entry) = entries.get(index) else {
                    break;
                };
                let status = check_file(root, entry, read_retries);
                if let Ok(mut guard) = results.lock() {
                    guard[index] = Some(status);
                }
            });
        }
    });

    cancel.check()?;
    let results = results
        .into_inner()
        .map_err(|_| UpdateError::Config("verification results lock poisoned".to_string()))?;
    Ok(results
        .into_iter()
        .map(|status| status.unwrap_or_else(|| FileStatus::Unreadable("not_scanned".to_string())))
        .collect())
}

fn check_file(root: &Path, entry: &FileEntry, read_retries: u32) -> FileStatus {
    let target = match resolve_install_path(root, &entry.relative_path) {
        Ok(path) => path,
        Err(_) => return FileStatus::Stale("unsafe_path"),
    };

    let attempts = read_retries.saturating_add(1);
    let mut last_error = String::new();
    for attempt in 0..attempts {
        if attempt > 0 {
            thread::sleep(READ_RETRY_BACKOFF);
        }
        match read_status(&target, entry) {
            Ok(status) => return status,
            Err(err) => {
                tracing::debug!(
                    "read attempt {}/{} failed for {}: {}",
                    attempt + 1,
                    attempts,
                    entry.relative_path,
                    err
                );
                last_error = err;
            }
        }
    }
    FileStatus::Unreadable(format!("{last_error} after {attempts} attempts"))
}

/// One read of the local file. `Err` is a read failure worth retrying.
fn read_status(target: &Path, entry: &FileEntry) -> std::result::Result<FileStatus, String> {
    match std::fs::metadata(target) {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return Ok(FileStatus::Stale("not_a_file")),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(FileStatus::Missing),
        Err(err) => return Err(format!("metadata_failed: {err}")),
    }

    let Some(expected) = ExpectedHash::parse(&entry.content_hash) else {
        return Ok(FileStatus::Stale("invalid_manifest_hash"));
    };

    match compute_file_hash(target, expected.algorithm) {
        Ok(actual) if expected.matches(&actual) => Ok(FileStatus::Current),
        Ok(_) => Ok(FileStatus::Stale("hash_mismatch")),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(FileStatus::Missing),
        Err(err) => Err(format!("hash_read_failed: {err}")),
    }
}

/// Groups of files that must exist for an installation to be launchable.
#[derive(Clone, Debug, Default)]
pub struct RequiredFiles {
    pub base_client: Vec<String>,
    pub overlay: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallationKind {
    NotConfigured,
    Missing,
    Empty,
    BaseClientOnly,
    OverlayOnly,
    Complete,
}

#[derive(Clone, Debug)]
pub struct InstallationReport {
    pub kind: InstallationKind,
    pub install_path: Option<PathBuf>,
    pub missing_base_client: Vec<String>,
    pub missing_overlay: Vec<String>,
}

impl InstallationReport {
    pub fn is_playable(&self) -> bool {
        self.kind == InstallationKind::Complete
    }
}

/// Presence-only check, no hashing. Used to decide whether the game can launch
/// before a full diff has been run.
pub fn inspect_installation(install_path: Option<&Path>, required: &RequiredFiles) -> InstallationReport {
    let Some(root) = install_path.filter(|path| !path.as_os_str().is_empty()) else {
        return InstallationReport {
            kind: InstallationKind::NotConfigured,
            install_path: None,
            missing_base_client: required.base_client.clone(),
            missing_overlay: required.overlay.clone(),
        };
    };
    if !root.is_dir() {
        return InstallationReport {
            kind: InstallationKind::Missing,
            install_path: Some(root.to_path_buf()),
            missing_base_client: required.base_client.clone(),
            missing_overlay: required.overlay.clone(),
        };
    }

    let missing = |names: &[String]| -> Vec<String> {
        names
            .iter()
            .filter(|name| {
                resolve_install_path(root, name)
                    .map(|path| !path.is_file())
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    };
    let missing_base_client = missing(&required.base_client);
    let missing_overlay = missing(&required.overlay);

    let kind = match (missing_base_client.is_empty(), missing_overlay.is_empty()) {
        (true, true) => InstallationKind::Complete,
        (true, false) => InstallationKind::BaseClientOnly,
        (false, true) => InstallationKind::OverlayOnly,
        (false, false) => InstallationKind::Empty,
    };
    tracing::debug!(
        "installation at {} classified as {:?} (missing base={}, overlay={})",
        root.display(),
        kind,
        missing_base_client.len(),
        missing_overlay.len()
    );

    InstallationReport {
        kind,
        install_path: Some(root.to_path_buf()),
        missing_base_client,
        missing_overlay,
    }
}
