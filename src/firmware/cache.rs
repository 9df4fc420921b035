//! Content-addressed firmware cache.
//!
//! Layout: `<root>/<source>/<board>/<version>/<sha256>.bin` plus a sibling
//! `.meta` JSON. Entries have no TTL; they are revalidated against the
//! recorded size and hash before reuse and dropped when either disagrees.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FirmwareError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub source: String,
    pub board: String,
    pub version: String,
    pub sha256: String,
    pub size: u64,
    pub downloaded_at: u64,
    /// Binary filename beside this meta record (hash + upstream
    /// extension, so the image parser can dispatch on it).
    pub file: String,
}

pub struct FirmwareCache {
    root: PathBuf,
}

impl FirmwareCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, source: &str, board: &str, version: &str) -> PathBuf {
        self.root
            .join(sanitize(source))
            .join(sanitize(board))
            .join(sanitize(version))
    }

    /// Store a downloaded binary, returning the content-addressed path.
    /// `extension` keeps the upstream format (`bin`, `apj`, `hex`, `px4`).
    pub async fn store(
        &self,
        source: &str,
        board: &str,
        version: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, FirmwareError> {
        let digest = hex_digest(bytes);
        let dir = self.entry_dir(source, board, version);
        tokio::fs::create_dir_all(&dir).await?;
        let file = format!("{digest}.{}", sanitize(extension));
        let bin_path = dir.join(&file);
        tokio::fs::write(&bin_path, bytes).await?;
        let meta = CacheMeta {
            source: source.to_owned(),
            board: board.to_owned(),
            version: version.to_owned(),
            sha256: digest.clone(),
            size: bytes.len() as u64,
            downloaded_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            file,
        };
        let meta_path = dir.join(format!("{digest}.meta"));
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&meta).unwrap()).await?;
        Ok(bin_path)
    }

    /// Look up a cached binary, validating size and hash against the meta
    /// record. Invalid entries are removed and reported as absent.
    pub async fn lookup(
        &self,
        source: &str,
        board: &str,
        version: &str,
    ) -> Result<Option<PathBuf>, FirmwareError> {
        let dir = self.entry_dir(source, board, version);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let Ok(meta_bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<CacheMeta>(&meta_bytes) else {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            };
            let bin_path = dir.join(&meta.file);
            let Ok(bytes) = tokio::fs::read(&bin_path).await else {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            };
            if bytes.len() as u64 != meta.size || hex_digest(&bytes) != meta.sha256 {
                log::warn!("cache entry {} failed validation, dropping", bin_path.display());
                let _ = tokio::fs::remove_file(&bin_path).await;
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            return Ok(Some(bin_path));
        }
        Ok(None)
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("groundlink-cache-{tag}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn store_then_lookup_roundtrip() {
        let root = scratch_root("roundtrip");
        let cache = FirmwareCache::new(&root);
        let bytes = b"firmware image bytes";
        let stored = cache
            .store("ardupilot", "CubeOrange", "4.5.1", "apj", bytes)
            .await
            .unwrap();
        assert!(stored.to_string_lossy().ends_with(".apj"));
        let found = cache
            .lookup("ardupilot", "CubeOrange", "4.5.1")
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some(stored.as_path()));
        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn corrupted_entry_is_dropped() {
        let root = scratch_root("corrupt");
        let cache = FirmwareCache::new(&root);
        let stored = cache
            .store("betaflight", "MATEKF405", "4.4.0", "hex", b"good bytes")
            .await
            .unwrap();
        tokio::fs::write(&stored, b"tampered").await.unwrap();
        let found = cache.lookup("betaflight", "MATEKF405", "4.4.0").await.unwrap();
        assert_eq!(found, None);
        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
