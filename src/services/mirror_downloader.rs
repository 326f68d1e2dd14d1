use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::errors::{Result, UpdateError};
use crate::models::{DownloadTask, FileEntry};
use crate::settings::UpdaterSettings;
use crate::utils::cancel::CancelToken;
use crate::utils::file::{remove_if_exists, replace_file};
use crate::utils::hash::{compute_file_hash_async, ExpectedHash};

/// Bytes written for the current mirror attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileProgress {
    pub bytes_written: u64,
    pub content_length: Option<u64>,
}

impl FileProgress {
    /// `None` when the server did not announce a length.
    pub fn percent(&self) -> Option<f64> {
        let total = self.content_length.filter(|len| *len > 0)?;
        Some(((self.bytes_written as f64) / (total as f64) * 100.0).clamp(0.0, 100.0))
    }
}

#[derive(Clone)]
pub struct MirrorDownloader {
    client: reqwest::Client,
    mirror_priority: Vec<String>,
    attempt_timeout: Duration,
}

impl MirrorDownloader {
    pub fn new(client: reqwest::Client, mirror_priority: Vec<String>, attempt_timeout: Duration) -> Self {
        let mirror_priority = mirror_priority
            .into_iter()
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        Self {
            client,
            mirror_priority,
            attempt_timeout,
        }
    }

    pub fn from_settings(client: reqwest::Client, settings: &UpdaterSettings) -> Self {
        Self::new(
            client,
            settings.mirror_priority.clone(),
            settings.download_timeout,
        )
    }

    /// Mirrors to try for `entry`: configured priority first, then any other
    /// named mirror in name order. A URL listed under two names is tried once.
    pub fn candidate_mirrors(&self, entry: &FileEntry) -> Vec<(String, String)> {
        let mut by_name: BTreeMap<String, String> = entry
            .mirror_urls
            .iter()
            .filter(|(_, url)| !url.trim().is_empty())
            .map(|(name, url)| (name.trim().to_ascii_lowercase(), url.trim().to_string()))
            .collect();

        let mut ordered = Vec::with_capacity(by_name.len());
        for name in &self.mirror_priority {
            if let Some(url) = by_name.remove(name) {
                ordered.push((name.clone(), url));
            }
        }
        ordered.extend(by_name);

        let mut seen_urls = HashSet::new();
        ordered.retain(|(_, url)| seen_urls.insert(url.clone()));
        ordered
    }

    /// Fetches `entry` into `destination`, falling back across mirrors.
    ///
    /// Bytes land in `<destination>.tmp` and only replace `destination` after
    /// the hash matches. Cancellation stops the whole download rather than
    /// moving on to the next mirror.
    pub async fn download_one<P>(
        &self,
        entry: &FileEntry,
        destination: &Path,
        mut on_progress: P,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        P: FnMut(FileProgress) + Send,
    {
        cancel.check()?;
        let expected = ExpectedHash::parse(&entry.content_hash).ok_or_else(|| {
            UpdateError::invalid_entry(
                &entry.relative_path,
                format!("unsupported content hash {:?}", entry.content_hash),
            )
        })?;
        let candidates = self.candidate_mirrors(entry);
        if candidates.is_empty() {
            return Err(UpdateError::invalid_entry(
                &entry.relative_path,
                "manifest lists no mirror urls",
            ));
        }

        let mut task = DownloadTask::new(entry.clone(), destination.to_path_buf());
        let temp_path = task.temp_path();
        let mut failures: Vec<String> = Vec::new();

        for (mirror, url) in candidates {
            if !task.attempted_mirrors.insert(mirror.clone()) {
                continue;
            }
            tracing::debug!(
                "downloading {} from mirror {} ({})",
                entry.relative_path,
                mirror,
                url
            );

            match self
                .attempt(&task, &url, &expected, &mut on_progress, cancel)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        "downloaded and verified {} from mirror {}",
                        entry.relative_path,
                        mirror
                    );
                    return Ok(());
                }
                Err(UpdateError::Cancelled) => {
                    discard_temp(&temp_path).await;
                    tracing::debug!("download cancelled: {}", entry.relative_path);
                    return Err(UpdateError::Cancelled);
                }
                Err(err) => {
                    discard_temp(&temp_path).await;
                    tracing::warn!(
                        "mirror {} failed for {}: {}",
                        mirror,
                        entry.relative_path,
                        err
                    );
                    failures.push(format!("{} -> {}", mirror, err));
                }
            }
        }

        tracing::error!(
            "all mirrors exhausted for {} after {} attempts",
            entry.relative_path,
            task.attempted_mirrors.len()
        );
        Err(UpdateError::MirrorExhausted {
            path: entry.relative_path.clone(),
            failures,
        })
    }

    async fn attempt<P>(
        &self,
        task: &DownloadTask,
        url: &str,
        expected: &ExpectedHash,
        on_progress: &mut P,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        P: FnMut(FileProgress) + Send,
    {
        let temp_path = task.temp_path();
        let transfer = self.transfer(url, &temp_path, on_progress, cancel);
        match tokio::time::timeout(self.attempt_timeout, transfer).await {
            Ok(result) => result?,
            Err(_) => return Err(UpdateError::Timeout(self.attempt_timeout)),
        }

        let actual = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            hashed = compute_file_hash_async(&temp_path, expected.algorithm) => hashed?,
        };
        if !expected.matches(&actual) {
            return Err(UpdateError::HashMismatch {
                expected: expected.hex.clone(),
                actual,
            });
        }

        cancel.check()?;
        replace_file(&temp_path, task.destination()).await?;
        Ok(())
    }

    async fn transfer<P>(
        &self,
        url: &str,
        temp_path: &Path,
        on_progress: &mut P,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        P: FnMut(FileProgress) + Send,
    {
        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            response = self.client.get(url).send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Http(format!("HTTP {}", status.as_u16())));
        }

        let content_length = response.content_length().filter(|len| *len > 0);
        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0_u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written = written.saturating_add(chunk.len() as u64);
            on_progress(FileProgress {
                bytes_written: written,
                content_length,
            });
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

async fn discard_temp(temp_path: &Path) {
    if let Err(err) = remove_if_exists(temp_path).await {
        tracing::warn!("failed to remove temp file {}: {}", temp_path.display(), err);
    }
}
