use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::utils::file::temp_path_for;

/// Remote file list. Keys are matched case-insensitively by the manifest
/// client, which lowercases them before deserializing into this shape.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(
        default,
        rename(serialize = "checkedAt", deserialize = "checkedat"),
        alias = "checked_at",
        deserialize_with = "lenient_timestamp"
    )]
    pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    #[serde(rename = "path")]
    pub relative_path: String,
    #[serde(rename = "hash", default)]
    pub content_hash: String,
    #[serde(rename = "size", default)]
    pub size_bytes: u64,
    #[serde(rename = "custom", default)]
    pub is_custom: bool,
    #[serde(rename = "urls", default)]
    pub mirror_urls: BTreeMap<String, String>,
}

impl FileEntry {
    /// Last path component, used for progress text.
    pub fn file_name(&self) -> String {
        let normalized = self.relative_path.replace('\\', "/");
        normalized
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or(normalized.as_str())
            .to_string()
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Some(serde_json::Value::Number(number)) => number
            .as_i64()
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0)),
        _ => None,
    })
}

/// One file being fetched. Owned by a single downloader invocation and
/// dropped once it succeeds or runs out of mirrors.
#[derive(Clone, Debug)]
pub struct DownloadTask {
    pub entry: FileEntry,
    pub destination_path: PathBuf,
    pub attempted_mirrors: HashSet<String>,
}

impl DownloadTask {
    pub fn new(entry: FileEntry, destination_path: PathBuf) -> Self {
        Self {
            entry,
            destination_path,
            attempted_mirrors: HashSet::new(),
        }
    }

    pub fn temp_path(&self) -> PathBuf {
        temp_path_for(&self.destination_path)
    }

    pub fn destination(&self) -> &Path {
        &self.destination_path
    }
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub file_name: String,
    pub file_index: usize,
    pub total_files: usize,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub overall_percent: f64,
    pub file_progress_percent: f64,
    pub status_text: String,
}
