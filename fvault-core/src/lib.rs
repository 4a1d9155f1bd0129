//! fvault core library
//!
//! Versioned file storage engine:
//! - Line diff codec with forward replay
//! - Sharded, optionally compressed blob store
//! - Durable version index (sled)
//! - Snapshot/diff policy selection
//! - Version manager with per-file locking, restore and retention
//! - Background retention scheduler

pub mod config;
pub mod diff;
pub mod error;
pub mod index;
pub mod live;
pub mod manager;
pub mod policy;
pub mod record;
pub mod scheduler;
pub mod storage;

pub use config::{VersioningConfig, VersioningPolicy};
pub use diff::{apply_diff, compute_diff, PatchData, PatchError};
pub use error::{Result, VersionError};
pub use index::VersionIndex;
pub use live::{FsLiveFiles, LiveFiles};
pub use manager::{CleanupReport, VerifyReport, VersionManager};
pub use record::{ContentHash, Representation, StorageRef, VersionChain, VersionId, VersionRecord};
pub use scheduler::{RetentionScheduler, SchedulerConfig, SchedulerHandle, SchedulerStatus};
pub use storage::{BlobCompression, BlobStore, ShardedBlobStore};
