//! Raw upload storage.
//!
//! Blobs are addressed by an opaque key (`<owner>/<uuid>-<filename>`)
//! that the contract record keeps in `blob_path`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` and returns the key to read them back with.
    async fn save(&self, owner_id: &str, filename: &str, bytes: &[u8]) -> Result<String>;

    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Deleting a missing blob is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Blobs as files under a root directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key to a path under the root, refusing anything that
    /// could escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob key: {:?}", key);
        }
        Ok(self.root.join(rel))
    }
}

/// Keeps ASCII alphanumerics, `.`, `-` and `_`; everything else becomes `_`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.chars().take(120).collect()
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn save(&self, owner_id: &str, filename: &str, bytes: &[u8]) -> Result<String> {
        let key = format!(
            "{}/{}-{}",
            sanitize_filename(owner_id),
            Uuid::new_v4(),
            sanitize_filename(filename)
        );
        let path = self.resolve(&key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating blob directory {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing blob {}", path.display()))?;
        Ok(key)
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading blob {}", path.display()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting blob {}", path.display())),
        }
    }
}
