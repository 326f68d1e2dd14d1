use std::time::Duration;

use serde_json::{Map, Value};

use crate::errors::{Result, UpdateError};
use crate::models::Manifest;
use crate::settings::UpdaterSettings;
use crate::utils::cancel::CancelToken;

#[derive(Clone)]
pub struct ManifestClient {
    client: reqwest::Client,
    manifest_url: String,
    timeout: Duration,
}

impl ManifestClient {
    pub fn new(client: reqwest::Client, manifest_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            manifest_url: manifest_url.into(),
            timeout,
        }
    }

    pub fn from_settings(client: reqwest::Client, settings: &UpdaterSettings) -> Self {
        Self::new(client, settings.manifest_url.clone(), settings.manifest_timeout)
    }

    pub fn manifest_url(&self) -> &str {
        &self.manifest_url
    }

    pub async fn fetch_manifest(&self, cancel: &CancelToken) -> Result<Manifest> {
        self.fetch_manifest_with_timeout(self.timeout, cancel).await
    }

    /// Single GET, no retries. The timeout and `cancel` race each other, and
    /// whichever fires first aborts the request.
    pub async fn fetch_manifest_with_timeout(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Manifest> {
        cancel.check()?;
        tracing::info!("fetching manifest from {}", self.manifest_url);

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("manifest fetch cancelled by caller");
                return Err(UpdateError::Cancelled);
            }
            result = tokio::time::timeout(timeout, self.fetch_body()) => match result {
                Ok(body) => body?,
                Err(_) => {
                    tracing::error!("manifest fetch timed out after {}s", timeout.as_secs());
                    return Err(UpdateError::ManifestFetch(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    )));
                }
            },
        };

        tracing::debug!("received manifest body ({} bytes)", body.len());
        let manifest = parse_manifest(&body).map_err(|err| {
            tracing::error!("manifest parse error: {}", err);
            err
        })?;
        tracing::info!(
            "fetched manifest version={} uid={} files={}",
            manifest.version,
            manifest.uid,
            manifest.files.len()
        );
        Ok(manifest)
    }

    async fn fetch_body(&self) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.manifest_url)
            .send()
            .await
            .map_err(fetch_error)?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!("manifest endpoint returned HTTP {}", status.as_u16());
            return Err(UpdateError::ManifestFetch(format!("HTTP {}", status.as_u16())));
        }

        let bytes = response.bytes().await.map_err(fetch_error)?;
        Ok(bytes.to_vec())
    }
}

fn fetch_error(err: reqwest::Error) -> UpdateError {
    tracing::error!("manifest request failed: {}", err);
    UpdateError::ManifestFetch(err.to_string())
}

/// Parses a manifest body, matching field names case-insensitively.
pub fn parse_manifest(body: &[u8]) -> Result<Manifest> {
    let value: Value = serde_json::from_slice(body)?;
    let manifest = serde_json::from_value(lowercase_keys(value))?;
    Ok(manifest)
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut lowered = Map::with_capacity(map.len());
            for (key, inner) in map {
                lowered.insert(key.to_ascii_lowercase(), lowercase_keys(inner));
            }
            Value::Object(lowered)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}
