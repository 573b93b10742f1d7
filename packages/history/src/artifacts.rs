// ABOUTME: Artifact store contract for large workspace files kept out of git
// ABOUTME: Local implementation stores content-addressed blobs under <root>/<ab>/<sha256>

use crate::error::{HistoryError, Result};
use crate::types::ArtifactRef;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the file at `path` and return a stable reference to it.
    /// `relative` is the workspace-relative path recorded in the reference.
    async fn put(&self, session_id: &str, path: &Path, relative: &str) -> Result<ArtifactRef>;

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>>;
}

pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() < 3 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HistoryError::Artifact(format!("invalid artifact hash: {}", hash)));
        }
        Ok(self.root.join(&hash[..2]).join(&hash[2..]))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, session_id: &str, path: &Path, relative: &str) -> Result<ArtifactRef> {
        let content = tokio::fs::read(path).await?;
        let hash = sha256_hex(&content);
        let blob = self.blob_path(&hash)?;

        if tokio::fs::metadata(&blob).await.is_err() {
            if let Some(parent) = blob.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let staging = blob.with_extension(format!("tmp-{}", session_id));
            tokio::fs::write(&staging, &content).await?;
            tokio::fs::rename(&staging, &blob).await?;
            debug!("Stored artifact {} ({} bytes) for {}", hash, content.len(), session_id);
        }

        Ok(ArtifactRef {
            url: format!("file://{}", blob.display()),
            hash,
            size: content.len() as u64,
            path: relative.to_string(),
        })
    }

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.blob_path(hash)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
