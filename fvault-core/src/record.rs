//! Version data model
//!
//! A [`VersionRecord`] is the durable metadata entry for one captured state of
//! a file. Content lives in the blob store; the record only points at it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 of reconstructed file content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash content
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Globally unique, never reused version identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionId(String);

impl VersionId {
    /// Length of the hex form
    pub const LEN: usize = 32;

    /// Derive a fresh id from the file key, the content hash and the capture
    /// time. A random nonce makes ids for identical inputs distinct.
    pub fn generate(file_key: &str, content_hash: &ContentHash, timestamp: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(file_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(content_hash.as_bytes());
        hasher.update(timestamp.timestamp_micros().to_be_bytes());
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..Self::LEN / 2]))
    }

    /// Parse an id supplied by a caller
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == Self::LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle to a persisted blob (shard path + file name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageRef(String);

impl StorageRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StorageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a version's blob encodes its content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Representation {
    /// Complete standalone copy of the content
    FullSnapshot,
    /// Patch against `parent_version_id`
    Diff,
}

impl std::fmt::Display for Representation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Representation::FullSnapshot => f.write_str("full"),
            Representation::Diff => f.write_str("diff"),
        }
    }
}

/// Durable metadata for one captured state of a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version_id: VersionId,
    pub file_key: String,
    pub timestamp: DateTime<Utc>,
    pub author: Option<String>,
    pub change_reason: Option<String>,
    pub representation: Representation,
    /// Set iff `representation` is `Diff`
    pub parent_version_id: Option<VersionId>,
    pub storage_ref: StorageRef,
    /// Hash of the reconstructed content
    pub content_hash: ContentHash,
    /// Length of the reconstructed content
    pub size: u64,
}

impl VersionRecord {
    pub fn is_snapshot(&self) -> bool {
        self.representation == Representation::FullSnapshot
    }

    /// Encode for the index
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Structural check: a diff must name a parent, a snapshot must not
    pub fn is_well_formed(&self) -> bool {
        match self.representation {
            Representation::FullSnapshot => self.parent_version_id.is_none(),
            Representation::Diff => self
                .parent_version_id
                .as_ref()
                .is_some_and(|p| *p != self.version_id),
        }
    }
}

/// The records from a target version back to its nearest snapshot.
///
/// Derived on demand; never stored.
#[derive(Debug, Clone)]
pub struct VersionChain {
    /// Target first, snapshot last
    records: Vec<VersionRecord>,
}

impl VersionChain {
    /// Build from records ordered target-first. The last record must be a
    /// snapshot and every other record a diff.
    pub fn from_target_first(records: Vec<VersionRecord>) -> Option<Self> {
        let (base, diffs) = records.split_last()?;
        if !base.is_snapshot() || diffs.iter().any(|r| r.is_snapshot()) {
            return None;
        }
        Some(Self { records })
    }

    pub fn target(&self) -> &VersionRecord {
        &self.records[0]
    }

    /// The full snapshot the chain is rooted at
    pub fn base(&self) -> &VersionRecord {
        &self.records[self.records.len() - 1]
    }

    /// Diff records in replay order: oldest first, target last
    pub fn diffs_oldest_first(&self) -> impl Iterator<Item = &VersionRecord> {
        self.records[..self.records.len() - 1].iter().rev()
    }

    /// Diffs to replay on top of the base
    pub fn diff_count(&self) -> usize {
        self.records.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, repr: Representation, parent: Option<&str>) -> VersionRecord {
        VersionRecord {
            version_id: VersionId(id.to_string()),
            file_key: "notes.md".to_string(),
            timestamp: Utc::now(),
            author: None,
            change_reason: None,
            representation: repr,
            parent_version_id: parent.map(|p| VersionId(p.to_string())),
            storage_ref: StorageRef::new(format!("00/11/{}.blob", id)),
            content_hash: ContentHash::of(id.as_bytes()),
            size: 0,
        }
    }

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let h = ContentHash::of(b"line1\nline2\n");
        assert_eq!(ContentHash::from_hex(&h.to_hex()).unwrap(), h);
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let h = ContentHash::of(b"same");
        let now = Utc::now();
        let a = VersionId::generate("a.txt", &h, now);
        let b = VersionId::generate("a.txt", &h, now);
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), VersionId::LEN);
        assert_eq!(VersionId::parse(a.as_str()), Some(a));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(VersionId::parse("not-a-version").is_none());
        assert!(VersionId::parse("abc").is_none());
    }

    #[test]
    fn test_record_well_formed() {
        assert!(record("v1", Representation::FullSnapshot, None).is_well_formed());
        assert!(record("v2", Representation::Diff, Some("v1")).is_well_formed());
        assert!(!record("v2", Representation::Diff, None).is_well_formed());
        assert!(!record("v2", Representation::Diff, Some("v2")).is_well_formed());
        assert!(!record("v1", Representation::FullSnapshot, Some("v0")).is_well_formed());
    }

    #[test]
    fn test_record_serialization() {
        let r = record("v2", Representation::Diff, Some("v1"));
        let bytes = r.to_bytes().unwrap();
        assert_eq!(VersionRecord::from_bytes(&bytes).unwrap(), r);
    }

    #[test]
    fn test_chain_replay_order() {
        let chain = VersionChain::from_target_first(vec![
            record("v3", Representation::Diff, Some("v2")),
            record("v2", Representation::Diff, Some("v1")),
            record("v1", Representation::FullSnapshot, None),
        ])
        .unwrap();
        assert_eq!(chain.base().version_id.as_str(), "v1");
        assert_eq!(chain.target().version_id.as_str(), "v3");
        let order: Vec<_> = chain.diffs_oldest_first().map(|r| r.version_id.as_str()).collect();
        assert_eq!(order, vec!["v2", "v3"]);
        assert_eq!(chain.diff_count(), 2);
    }

    #[test]
    fn test_chain_requires_snapshot_base() {
        assert!(VersionChain::from_target_first(vec![record("v2", Representation::Diff, Some("v1"))]).is_none());
        assert!(VersionChain::from_target_first(vec![]).is_none());
    }
}
