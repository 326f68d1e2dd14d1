use std::time::Duration;

use crate::errors::{Result, UpdateError};

pub const DEFAULT_MANIFEST_URL: &str = "https://updater.project-epoch.net/api/v2/manifest";
pub const DEFAULT_MIRROR_PRIORITY: [&str; 3] = ["cloudflare", "digitalocean", "none"];

const DEFAULT_MANIFEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_RETRIES: u32 = 1;
const MAX_READ_RETRIES: u32 = 5;

#[derive(Clone, Debug)]
pub struct UpdaterSettings {
    pub manifest_url: String,
    pub manifest_timeout: Duration,
    /// Upper bound for a single mirror attempt, connect through last byte.
    pub download_timeout: Duration,
    pub connect_timeout: Duration,
    pub mirror_priority: Vec<String>,
    pub user_agent: String,
    pub verify_read_retries: u32,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            manifest_url: DEFAULT_MANIFEST_URL.to_string(),
            manifest_timeout: Duration::from_secs(DEFAULT_MANIFEST_TIMEOUT_SECS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            mirror_priority: DEFAULT_MIRROR_PRIORITY
                .iter()
                .map(|name| name.to_string())
                .collect(),
            user_agent: format!("epoch-updater/{}", env!("CARGO_PKG_VERSION")),
            verify_read_retries: DEFAULT_READ_RETRIES,
        }
    }
}

impl UpdaterSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(url) = env_string("EPOCH_UPDATER_MANIFEST_URL") {
            settings.manifest_url = url;
        }
        if let Some(secs) = env_secs("EPOCH_UPDATER_MANIFEST_TIMEOUT_SECS") {
            settings.manifest_timeout = secs;
        }
        if let Some(secs) = env_secs("EPOCH_UPDATER_DOWNLOAD_TIMEOUT_SECS") {
            settings.download_timeout = secs;
        }
        if let Some(secs) = env_secs("EPOCH_UPDATER_CONNECT_TIMEOUT_SECS") {
            settings.connect_timeout = secs;
        }
        if let Some(list) = env_string("EPOCH_UPDATER_MIRRORS") {
            let mirrors = parse_mirror_list(&list);
            if !mirrors.is_empty() {
                settings.mirror_priority = mirrors;
            }
        }
        if let Some(retries) = env_string("EPOCH_UPDATER_READ_RETRIES")
            .and_then(|value| value.parse::<u32>().ok())
        {
            settings.verify_read_retries = retries.min(MAX_READ_RETRIES);
        }
        settings
    }
}

/// The one HTTP client the engine uses; handed to both the manifest client and
/// the mirror downloader.
pub fn build_http_client(settings: &UpdaterSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .user_agent(settings.user_agent.clone())
        .build()
        .map_err(|err| UpdateError::Config(format!("http client: {err}")))
}

fn parse_mirror_list(value: &str) -> Vec<String> {
    let mut mirrors: Vec<String> = Vec::new();
    for name in value.split(',') {
        let name = name.trim().to_ascii_lowercase();
        if !name.is_empty() && !mirrors.contains(&name) {
            mirrors.push(name);
        }
    }
    mirrors
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_string(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
