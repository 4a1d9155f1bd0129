//! Durable version index
//!
//! The index is the single source of truth for which versions exist. It is a
//! sled database with one tree per concern:
//!
//! ```text
//! records  version_id                           -> bincode VersionRecord
//! chains   sha256(file_key) ‖ ts_micros ‖ id    -> version_id
//! files    file_key                             -> ()
//! retired  version_id                           -> deletion time
//! flags    version_id                           -> quarantine reason
//! ```
//!
//! `chains` keys sort by file, then timestamp, then version id, so a prefix
//! scan yields one file's history in creation order with deterministic tie
//! breaking. Every mutation is flushed before the call returns.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;

use crate::error::{Result, VersionError};
use crate::record::{VersionId, VersionRecord};
use crate::storage::file_key_hash;

/// Sled-backed ledger of version records
pub struct VersionIndex {
    db: sled::Db,
    records: sled::Tree,
    chains: sled::Tree,
    files: sled::Tree,
    retired: sled::Tree,
    flags: sled::Tree,
}

/// Abort reasons inside index transactions
#[derive(Debug)]
enum Abort {
    Duplicate(String),
    Missing(String),
    Corrupt(String),
}

fn abort_to_error(e: TransactionError<Abort>) -> VersionError {
    match e {
        TransactionError::Abort(Abort::Duplicate(id)) => {
            VersionError::Storage(format!("Version id {} already used", id))
        }
        TransactionError::Abort(Abort::Missing(id)) => VersionError::NotFound(id),
        TransactionError::Abort(Abort::Corrupt(msg)) => VersionError::Serialization(msg),
        TransactionError::Storage(e) => e.into(),
    }
}

/// Key in the `chains` tree
fn chain_key(record: &VersionRecord) -> Vec<u8> {
    let mut key = chain_prefix(&record.file_key);
    // offset so pre-epoch timestamps still sort before later ones
    let micros = (record.timestamp.timestamp_micros() as u64) ^ (1 << 63);
    key.extend_from_slice(&micros.to_be_bytes());
    key.extend_from_slice(record.version_id.as_str().as_bytes());
    key
}

fn chain_prefix(file_key: &str) -> Vec<u8> {
    let mut prefix = file_key_hash(file_key).into_bytes();
    prefix.push(b'/');
    prefix
}

impl VersionIndex {
    /// Open or create the index at `{base}/index.db`
    pub fn open(base: &Path) -> Result<Self> {
        let path = base.join("index.db");
        let db = sled::open(&path).map_err(|e| {
            VersionError::Storage(format!("Failed to open index at {:?}: {}", path, e))
        })?;

        let records = db.open_tree("records")?;
        let chains = db.open_tree("chains")?;
        let files = db.open_tree("files")?;
        let retired = db.open_tree("retired")?;
        let flags = db.open_tree("flags")?;

        Ok(Self {
            db,
            records,
            chains,
            files,
            retired,
            flags,
        })
    }

    /// Durably record a new version
    pub async fn append(&self, record: &VersionRecord) -> Result<()> {
        if !record.is_well_formed() {
            return Err(VersionError::Serialization(format!(
                "Refusing malformed record {}",
                record.version_id
            )));
        }
        let id = record.version_id.as_str().as_bytes().to_vec();
        let value = record.to_bytes()?;
        let chain = chain_key(record);

        (&self.records, &self.chains, &self.files, &self.retired)
            .transaction(|(records, chains, files, retired)| {
                if records.get(&id)?.is_some() || retired.get(&id)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(Abort::Duplicate(
                        record.version_id.to_string(),
                    )));
                }
                records.insert(id.as_slice(), value.as_slice())?;
                chains.insert(chain.as_slice(), id.as_slice())?;
                files.insert(record.file_key.as_bytes(), &[] as &[u8])?;
                Ok(())
            })
            .map_err(abort_to_error)?;

        self.db.flush_async().await?;
        Ok(())
    }

    /// Look up a record
    pub fn get(&self, version_id: &VersionId) -> Result<Option<VersionRecord>> {
        match self.records.get(version_id.as_str().as_bytes())? {
            Some(value) => Ok(Some(VersionRecord::from_bytes(&value)?)),
            None => Ok(None),
        }
    }

    /// History of one file in creation order
    pub fn list(&self, file_key: &str) -> Result<Vec<VersionRecord>> {
        let mut out = Vec::new();
        for item in self.chains.scan_prefix(chain_prefix(file_key)) {
            let (_, id) = item?;
            let value = self.records.get(&id)?.ok_or_else(|| {
                VersionError::Storage(format!(
                    "Chain entry for {} has no record",
                    String::from_utf8_lossy(&id)
                ))
            })?;
            let record = VersionRecord::from_bytes(&value)?;
            // guard against a hash-prefix collision between file keys
            if record.file_key == file_key {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Remove a record and retire its id so it is never handed out again
    pub async fn remove(&self, version_id: &VersionId) -> Result<VersionRecord> {
        let id = version_id.as_str().as_bytes().to_vec();
        let retired_at = chrono::Utc::now().timestamp_micros().to_be_bytes();

        let record = (&self.records, &self.chains, &self.retired)
            .transaction(|(records, chains, retired)| {
                let value = records
                    .remove(id.as_slice())?
                    .ok_or_else(|| ConflictableTransactionError::Abort(Abort::Missing(version_id.to_string())))?;
                let record = VersionRecord::from_bytes(&value)
                    .map_err(|e| ConflictableTransactionError::Abort(Abort::Corrupt(e.to_string())))?;
                chains.remove(chain_key(&record))?;
                retired.insert(id.as_slice(), &retired_at[..])?;
                Ok(record)
            })
            .map_err(abort_to_error)?;

        // A file with no remaining history drops out of sweeps
        if self.chains.scan_prefix(chain_prefix(&record.file_key)).next().is_none() {
            self.files.remove(record.file_key.as_bytes())?;
        }
        self.flags.remove(id.as_slice())?;

        self.db.flush_async().await?;
        Ok(record)
    }

    /// Replace the storage fields of an existing record (promotion of a diff
    /// to a full snapshot). Identity, timestamp and content hash must match.
    pub async fn rebase(&self, record: &VersionRecord) -> Result<()> {
        if !record.is_well_formed() {
            return Err(VersionError::Serialization(format!(
                "Refusing malformed record {}",
                record.version_id
            )));
        }
        let id = record.version_id.as_str().as_bytes().to_vec();
        let value = record.to_bytes()?;

        self.records
            .transaction(|records| {
                let current = records
                    .get(&id)?
                    .ok_or_else(|| ConflictableTransactionError::Abort(Abort::Missing(record.version_id.to_string())))?;
                let current = VersionRecord::from_bytes(&current)
                    .map_err(|e| ConflictableTransactionError::Abort(Abort::Corrupt(e.to_string())))?;
                if current.file_key != record.file_key
                    || current.timestamp != record.timestamp
                    || current.content_hash != record.content_hash
                {
                    return Err(ConflictableTransactionError::Abort(Abort::Corrupt(format!(
                        "Rebase of {} changes its identity",
                        record.version_id
                    ))));
                }
                records.insert(id.as_slice(), value.as_slice())?;
                Ok(())
            })
            .map_err(abort_to_error)?;

        self.db.flush_async().await?;
        Ok(())
    }

    /// Every file key with at least one version
    pub fn file_keys(&self) -> Result<Vec<String>> {
        self.files
            .iter()
            .keys()
            .map(|k| {
                let k = k?;
                String::from_utf8(k.to_vec())
                    .map_err(|e| VersionError::Serialization(format!("Invalid file key: {}", e)))
            })
            .collect()
    }

    /// True if the id was ever used, including retired ids
    pub fn is_known(&self, version_id: &VersionId) -> Result<bool> {
        let id = version_id.as_str().as_bytes();
        Ok(self.records.contains_key(id)? || self.retired.contains_key(id)?)
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Storage refs of all live records
    pub fn storage_refs(&self) -> Result<std::collections::HashSet<String>> {
        let mut refs = std::collections::HashSet::new();
        for item in self.records.iter() {
            let (_, value) = item?;
            refs.insert(VersionRecord::from_bytes(&value)?.storage_ref.to_string());
        }
        Ok(refs)
    }

    /// Quarantine a version after an integrity failure
    pub async fn flag(&self, version_id: &VersionId, reason: &str) -> Result<()> {
        self.flags
            .insert(version_id.as_str().as_bytes(), reason.as_bytes())?;
        self.db.flush_async().await?;
        Ok(())
    }

    /// Clear a quarantine flag after manual repair
    pub async fn unflag(&self, version_id: &VersionId) -> Result<bool> {
        let existed = self.flags.remove(version_id.as_str().as_bytes())?.is_some();
        self.db.flush_async().await?;
        Ok(existed)
    }

    pub fn is_flagged(&self, version_id: &VersionId) -> Result<bool> {
        Ok(self.flags.contains_key(version_id.as_str().as_bytes())?)
    }

    /// All quarantined versions with their reasons
    pub fn flags(&self) -> Result<Vec<(VersionId, String)>> {
        let mut out = Vec::new();
        for item in self.flags.iter() {
            let (k, v) = item?;
            let id = String::from_utf8_lossy(&k);
            if let Some(id) = VersionId::parse(&id) {
                out.push((id, String::from_utf8_lossy(&v).into_owned()));
            }
        }
        Ok(out)
    }

    /// Flush pending writes
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ContentHash, Representation, StorageRef};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn snapshot(file_key: &str, micros: i64) -> VersionRecord {
        let timestamp = Utc.timestamp_micros(micros).unwrap();
        let hash = ContentHash::of(file_key.as_bytes());
        let version_id = VersionId::generate(file_key, &hash, timestamp);
        VersionRecord {
            storage_ref: StorageRef::new(format!("aa/bb/{}.blob", version_id)),
            version_id,
            file_key: file_key.to_string(),
            timestamp,
            author: Some("alice".to_string()),
            change_reason: None,
            representation: Representation::FullSnapshot,
            parent_version_id: None,
            content_hash: hash,
            size: 0,
        }
    }

    #[tokio::test]
    async fn test_append_get_list() {
        let dir = TempDir::new().unwrap();
        let index = VersionIndex::open(dir.path()).unwrap();

        let r1 = snapshot("notes.md", 1_000);
        let r2 = snapshot("notes.md", 2_000);
        let other = snapshot("other.md", 1_500);
        index.append(&r2).await.unwrap();
        index.append(&other).await.unwrap();
        index.append(&r1).await.unwrap();

        assert_eq!(index.get(&r1.version_id).unwrap(), Some(r1.clone()));
        let listed = index.list("notes.md").unwrap();
        assert_eq!(listed, vec![r1, r2]);
        assert!(index.list("unknown.md").unwrap().is_empty());
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn test_ties_break_by_version_id() {
        let dir = TempDir::new().unwrap();
        let index = VersionIndex::open(dir.path()).unwrap();

        let a = snapshot("same.txt", 5_000);
        let b = snapshot("same.txt", 5_000);
        index.append(&a).await.unwrap();
        index.append(&b).await.unwrap();

        let ids: Vec<_> = index.list("same.txt").unwrap().into_iter().map(|r| r.version_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let r1 = snapshot("notes.md", 1_000);
        {
            let index = VersionIndex::open(dir.path()).unwrap();
            index.append(&r1).await.unwrap();
        }
        let index = VersionIndex::open(dir.path()).unwrap();
        assert_eq!(index.list("notes.md").unwrap(), vec![r1]);
        assert_eq!(index.file_keys().unwrap(), vec!["notes.md".to_string()]);
    }

    #[tokio::test]
    async fn test_removed_ids_are_never_reused() {
        let dir = TempDir::new().unwrap();
        let index = VersionIndex::open(dir.path()).unwrap();

        let r1 = snapshot("notes.md", 1_000);
        index.append(&r1).await.unwrap();
        let removed = index.remove(&r1.version_id).await.unwrap();
        assert_eq!(removed, r1);

        assert!(index.get(&r1.version_id).unwrap().is_none());
        assert!(index.is_known(&r1.version_id).unwrap());
        assert!(index.file_keys().unwrap().is_empty());
        assert!(index.append(&r1).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let index = VersionIndex::open(dir.path()).unwrap();
        let r1 = snapshot("notes.md", 1_000);
        let err = index.remove(&r1.version_id).await.unwrap_err();
        assert!(matches!(err, VersionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rebase_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let index = VersionIndex::open(dir.path()).unwrap();

        let r1 = snapshot("notes.md", 1_000);
        index.append(&r1).await.unwrap();

        let mut moved = r1.clone();
        moved.storage_ref = StorageRef::new("cc/dd/new.blob");
        index.rebase(&moved).await.unwrap();
        assert_eq!(index.get(&r1.version_id).unwrap().unwrap().storage_ref, moved.storage_ref);

        let mut bad = r1.clone();
        bad.timestamp = bad.timestamp + Duration::seconds(1);
        assert!(index.rebase(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_malformed_records() {
        let dir = TempDir::new().unwrap();
        let index = VersionIndex::open(dir.path()).unwrap();
        let mut r = snapshot("notes.md", 1_000);
        r.representation = Representation::Diff;
        assert!(index.append(&r).await.is_err());
    }

    #[tokio::test]
    async fn test_flags() {
        let dir = TempDir::new().unwrap();
        let index = VersionIndex::open(dir.path()).unwrap();
        let r1 = snapshot("notes.md", 1_000);
        index.append(&r1).await.unwrap();

        index.flag(&r1.version_id, "hash mismatch").await.unwrap();
        assert!(index.is_flagged(&r1.version_id).unwrap());
        assert_eq!(index.flags().unwrap(), vec![(r1.version_id.clone(), "hash mismatch".to_string())]);

        assert!(index.unflag(&r1.version_id).await.unwrap());
        assert!(!index.is_flagged(&r1.version_id).unwrap());
    }
}
