use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::{Result, UpdateError};

const HASH_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    /// Older manifests publish MD5 digests.
    Md5,
}

/// A manifest digest, lowercased, with its algorithm inferred from its length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedHash {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl ExpectedHash {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        if !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return None;
        }
        let algorithm = match normalized.len() {
            64 => HashAlgorithm::Sha256,
            32 => HashAlgorithm::Md5,
            _ => return None,
        };
        Some(Self {
            algorithm,
            hex: normalized,
        })
    }

    pub fn matches(&self, actual_hex: &str) -> bool {
        self.hex.eq_ignore_ascii_case(actual_hex)
    }
}

pub fn compute_file_hash(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0_u8; HASH_BUFFER_BYTES];
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        HashAlgorithm::Md5 => {
            let mut context = md5::Context::new();
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                context.consume(&buffer[..read]);
            }
            Ok(format!("{:x}", context.compute()))
        }
    }
}

/// Hashes on the blocking pool so large archives don't stall the runtime.
pub async fn compute_file_hash_async(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || compute_file_hash(&path, algorithm))
        .await
        .map_err(|err| UpdateError::Config(format!("hash worker join error: {err}")))?
        .map_err(UpdateError::from)
}

#[cfg(test)]
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_algorithm_from_digest_length() {
        let sha = ExpectedHash::parse(&"AB".repeat(32)).expect("sha256 digest");
        assert_eq!(sha.algorithm, HashAlgorithm::Sha256);
        assert_eq!(sha.hex, "ab".repeat(32));

        let md5 = ExpectedHash::parse(" d41d8cd98f00b204e9800998ecf8427e ").expect("md5 digest");
        assert_eq!(md5.algorithm, HashAlgorithm::Md5);

        assert!(ExpectedHash::parse("H1").is_none());
        assert!(ExpectedHash::parse(&"zz".repeat(32)).is_none());
        assert!(ExpectedHash::parse("").is_none());
    }

    #[test]
    fn hashes_files_with_both_algorithms() {
        let path = std::env::temp_dir().join(format!("epoch-hash-test-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"hello world").expect("write sample");

        assert_eq!(
            compute_file_hash(&path, HashAlgorithm::Md5).expect("md5"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(
            compute_file_hash(&path, HashAlgorithm::Sha256).expect("sha256"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let path = std::env::temp_dir().join(format!("epoch-hash-missing-{}", uuid::Uuid::new_v4()));
        let result = compute_file_hash_async(&path, HashAlgorithm::Sha256).await;
        assert!(matches!(result, Err(UpdateError::Io(_))));
    }
}
