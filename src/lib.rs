//! Update and verification engine for the Project Epoch game launcher.
//!
//! [`services::UpdateOrchestrator`] fetches the remote manifest, diffs it
//! against the install directory by content hash, and pulls stale files from
//! their mirrors one at a time.

pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod settings;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use errors::{Result, UpdateError};
pub use models::{DownloadProgress, DownloadTask, FileEntry, Manifest};
pub use services::{ApplyOutcome, CheckOutcome, ConfigStore, UpdateOrchestrator};
pub use settings::UpdaterSettings;
pub use utils::cancel::{cancel_pair, CancelHandle, CancelToken};
