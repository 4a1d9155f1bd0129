//! Blob storage layout
//!
//! Version blobs (full snapshots or serialized patches) are written under a
//! directory tree sharded by the hash of the owning file key:
//!
//! ```text
//! {base}/blobs/{h[0..2]}/{h[2..]}/{version_id}-{full|diff}.blob
//! ```
//!
//! where `h` is the hex SHA-256 of the file key. The first two hex digits give
//! a fixed 256-way fan-out regardless of how many files or versions exist.
//! The representation suffix lets a promoted version's snapshot sit next to
//! the diff it replaces until the index has switched over.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, VersionError};
use crate::record::{Representation, StorageRef, VersionId};

/// Blob codec tags, stored as the first byte of every blob
const CODEC_RAW: u8 = 0;
const CODEC_ZSTD: u8 = 1;

const BLOB_EXTENSION: &str = "blob";

/// Persistence backend for version blobs
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Durably store a blob; it is visible to `get` only once complete
    async fn put(
        &self,
        file_key: &str,
        version_id: &VersionId,
        representation: Representation,
        blob: Bytes,
    ) -> Result<StorageRef>;

    /// Load a blob
    async fn get(&self, storage_ref: &StorageRef) -> Result<Bytes>;

    /// Check if a blob exists
    async fn exists(&self, storage_ref: &StorageRef) -> Result<bool>;

    /// Delete a blob; deleting a missing blob is not an error
    async fn delete(&self, storage_ref: &StorageRef) -> Result<()>;

    /// Every blob currently in the store
    async fn list_refs(&self) -> Result<Vec<StorageRef>>;
}

/// Compression settings for newly written blobs
#[derive(Debug, Clone, Copy)]
pub struct BlobCompression {
    pub enabled: bool,
    pub level: i32,
}

impl Default for BlobCompression {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 3,
        }
    }
}

/// Hex SHA-256 of a file key, used for sharding
pub fn file_key_hash(file_key: &str) -> String {
    hex::encode(Sha256::digest(file_key.as_bytes()))
}

/// Filesystem blob store sharded by file key hash
pub struct ShardedBlobStore {
    root: PathBuf,
    compression: BlobCompression,
}

impl ShardedBlobStore {
    /// Open or create a store rooted at `{base}/blobs`
    pub fn open(base: &Path, compression: BlobCompression) -> Result<Self> {
        let root = base.join("blobs");
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, compression })
    }

    /// Storage ref for a version of a file
    pub fn storage_ref_for(
        file_key: &str,
        version_id: &VersionId,
        representation: Representation,
    ) -> StorageRef {
        let hash = file_key_hash(file_key);
        StorageRef::new(format!(
            "{}/{}/{}-{}.{}",
            &hash[..2],
            &hash[2..],
            version_id,
            representation,
            BLOB_EXTENSION
        ))
    }

    /// Resolve a ref to a path, refusing anything that escapes the root
    fn blob_path(&self, storage_ref: &StorageRef) -> Result<PathBuf> {
        let parts: Vec<&str> = storage_ref.as_str().split('/').collect();
        let valid = parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && *p != "." && *p != ".." && !p.contains('\\'));
        if !valid {
            return Err(VersionError::Storage(format!(
                "Invalid storage ref: {}",
                storage_ref
            )));
        }
        Ok(self.root.join(parts[0]).join(parts[1]).join(parts[2]))
    }

    fn encode(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if self.compression.enabled {
            let compressed = zstd::encode_all(blob, self.compression.level)
                .map_err(|e| VersionError::Storage(format!("Compression failed: {}", e)))?;
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(CODEC_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(blob.len() + 1);
            out.push(CODEC_RAW);
            out.extend_from_slice(blob);
            Ok(out)
        }
    }

    fn decode(storage_ref: &StorageRef, data: &[u8]) -> Result<Bytes> {
        match data.split_first() {
            Some((&CODEC_RAW, payload)) => Ok(Bytes::copy_from_slice(payload)),
            Some((&CODEC_ZSTD, payload)) => zstd::decode_all(payload)
                .map(Bytes::from)
                .map_err(|e| {
                    VersionError::Storage(format!("Failed to decompress {}: {}", storage_ref, e))
                }),
            Some((tag, _)) => Err(VersionError::Storage(format!(
                "Unknown blob codec {} in {}",
                tag, storage_ref
            ))),
            None => Err(VersionError::Storage(format!("Empty blob file {}", storage_ref))),
        }
    }

    /// Write atomically: temp file, fsync, rename
    fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| std::io::Error::other("blob path has no parent"))?;
        std::fs::create_dir_all(parent)?;

        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let result = (|| {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, path)
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }
}

#[async_trait]
impl BlobStore for ShardedBlobStore {
    async fn put(
        &self,
        file_key: &str,
        version_id: &VersionId,
        representation: Representation,
        blob: Bytes,
    ) -> Result<StorageRef> {
        let storage_ref = Self::storage_ref_for(file_key, version_id, representation);
        let path = self.blob_path(&storage_ref)?;
        let encoded = self.encode(&blob)?;

        Self::write_atomic(&path, &encoded).map_err(|e| {
            VersionError::Storage(format!("Failed to write blob {}: {}", storage_ref, e))
        })?;

        tracing::trace!(
            storage_ref = %storage_ref,
            raw = blob.len(),
            stored = encoded.len(),
            "Blob written"
        );
        Ok(storage_ref)
    }

    async fn get(&self, storage_ref: &StorageRef) -> Result<Bytes> {
        let path = self.blob_path(storage_ref)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Self::decode(storage_ref, &data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VersionError::MissingBlob {
                storage_ref: storage_ref.to_string(),
            }),
            Err(e) => Err(VersionError::Storage(format!(
                "Failed to read blob {}: {}",
                storage_ref, e
            ))),
        }
    }

    async fn exists(&self, storage_ref: &StorageRef) -> Result<bool> {
        let path = self.blob_path(storage_ref)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, storage_ref: &StorageRef) -> Result<()> {
        let path = self.blob_path(storage_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(VersionError::Storage(format!(
                    "Failed to delete blob {}: {}",
                    storage_ref, e
                )));
            }
        }

        // Drop the per-file directory once its last blob is gone
        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir(dir).await;
        }
        Ok(())
    }

    async fn list_refs(&self) -> Result<Vec<StorageRef>> {
        let mut refs = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name().to_string_lossy().into_owned();
            let mut files = tokio::fs::read_dir(shard.path()).await?;
            while let Some(file_dir) = files.next_entry().await? {
                if !file_dir.file_type().await?.is_dir() {
                    continue;
                }
                let dir_name = file_dir.file_name().to_string_lossy().into_owned();
                let mut blobs = tokio::fs::read_dir(file_dir.path()).await?;
                while let Some(blob) = blobs.next_entry().await? {
                    let name = blob.file_name().to_string_lossy().into_owned();
                    if name.ends_with(&format!(".{}", BLOB_EXTENSION)) {
                        refs.push(StorageRef::new(format!("{}/{}/{}", shard_name, dir_name, name)));
                    }
                }
            }
        }
        refs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(refs)
    }
}
