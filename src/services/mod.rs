pub mod config_store;
pub mod manifest_client;
pub mod mirror_downloader;
pub mod update_orchestrator;
pub mod verifier;

pub use config_store::{ConfigStore, JsonFileConfigStore, LauncherConfig, MemoryConfigStore};
pub use manifest_client::{parse_manifest, ManifestClient};
pub use mirror_downloader::{FileProgress, MirrorDownloader};
pub use update_orchestrator::{ApplyOutcome, CheckOutcome, UpdateOrchestrator};
pub use verifier::{
    inspect_installation, DiffReport, InstallationKind, InstallationReport, InstallationVerifier,
    RequiredFiles, VerificationSummary,
};
