use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use crate::errors::{Result, UpdateError};

const TEMP_SUFFIX: &str = ".tmp";

/// `<path>.tmp`, beside the destination so the final rename stays on one filesystem.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

pub fn normalize_relative_path(raw: &str) -> String {
    raw.trim()
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_string()
}

/// Path segments as they land on disk: separators normalized, empty and `.` segments dropped.
fn path_segments(raw: &str) -> Vec<String> {
    normalize_relative_path(raw)
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(str::to_string)
        .collect()
}

/// Canonical form of a manifest path; spellings that resolve to the same file share a key.
pub fn install_path_key(raw: &str) -> String {
    path_segments(raw).join("/")
}

pub fn is_safe_relative_path(path: &Path) -> bool {
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => return false,
            _ => {}
        }
    }
    true
}

/// Joins a manifest path onto the install directory, rejecting anything that
/// would escape it.
pub fn resolve_install_path(install_dir: &Path, relative: &str) -> Result<PathBuf> {
    let segments = path_segments(relative);
    if segments.is_empty() {
        return Err(UpdateError::invalid_entry(relative, "empty path"));
    }
    let relative_path: PathBuf = segments.iter().collect();
    if !is_safe_relative_path(&relative_path) {
        return Err(UpdateError::invalid_entry(relative, "path escapes install directory"));
    }
    Ok(install_dir.join(relative_path))
}

pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = temp_path_for(path);
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)?;
    Ok(())
}

pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Moves a verified temp file over `final_path`. The direct rename replaces
/// atomically where the platform allows it; otherwise the old file is removed first.
pub async fn replace_file(temp_path: &Path, final_path: &Path) -> io::Result<()> {
    match tokio::fs::rename(temp_path, final_path).await {
        Ok(()) => Ok(()),
        Err(first) => {
            if tokio::fs::metadata(final_path).await.is_err() {
                return Err(first);
            }
            remove_if_exists(final_path).await?;
            tokio::fs::rename(temp_path, final_path).await
        }
    }
}
