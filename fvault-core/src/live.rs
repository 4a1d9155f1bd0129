//! Live file access used by restore

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, VersionError};

/// Destination for restored content
#[async_trait]
pub trait LiveFiles: Send + Sync {
    /// Replace the live content of a tracked file
    async fn write_live(&self, file_key: &str, content: &[u8]) -> Result<()>;
}

/// Live files on the local filesystem, with file keys relative to a root
pub struct FsLiveFiles {
    root: PathBuf,
}

impl FsLiveFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a file key below the root; keys may not climb out of it
    pub fn resolve(&self, file_key: &str) -> Result<PathBuf> {
        let rel = Path::new(file_key.trim_start_matches('/'));
        let mut path = self.root.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(VersionError::Storage(format!(
                        "File key {:?} escapes the live root",
                        file_key
                    )));
                }
            }
        }
        if path == self.root {
            return Err(VersionError::Storage(format!("Empty file key {:?}", file_key)));
        }
        Ok(path)
    }
}

#[async_trait]
impl LiveFiles for FsLiveFiles {
    async fn write_live(&self, file_key: &str, content: &[u8]) -> Result<()> {
        let path = self.resolve(file_key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension(format!("fvault-restore-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp_path, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}
