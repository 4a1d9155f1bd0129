//! Version manager
//!
//! Ties the blob store, the index and the diff codec together. Every mutation
//! of one file's history runs under that file's exclusive lock and reads take
//! it shared, so different files never contend with each other.
//!
//! Write order for a new version is blob first, then index. A crash between
//! the two leaves an unreferenced blob that [`VersionManager::collect_garbage`]
//! removes; the index never points at a blob that was not fully written.

use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::error::Elapsed;

use crate::config::{VersioningConfig, VersioningPolicy};
use crate::diff::{apply_diff, compute_diff, PatchData};
use crate::error::{Result, VersionError};
use crate::index::VersionIndex;
use crate::live::{FsLiveFiles, LiveFiles};
use crate::policy::{classify, select, SelectionInput};
use crate::record::{ContentHash, Representation, StorageRef, VersionChain, VersionId, VersionRecord};
use crate::storage::{BlobCompression, BlobStore, ShardedBlobStore};

/// Chain walks longer than this are treated as cycles
const MAX_CHAIN_WALK: usize = 100_000;

/// First retry delay for blob writes; doubles per attempt
const RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

/// Outcome of one retention sweep
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub files_scanned: usize,
    pub removed: usize,
    pub promoted: usize,
    /// Files skipped because history is flagged as damaged
    pub skipped_flagged: usize,
    /// Files whose cleanup failed, with the error
    pub failed_files: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed_files.is_empty()
    }
}

/// Result of replaying every version of one file
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub file_key: String,
    pub checked: usize,
    pub failures: Vec<(VersionId, String)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct PruneOutcome {
    removed: usize,
    promoted: usize,
    skipped_flagged: bool,
}

/// Holds one file's lock. On drop the file's lock table entry is removed
/// unless another task still holds or waits on it.
struct KeyGuard<'a, G> {
    locks: &'a DashMap<String, Arc<RwLock<()>>>,
    file_key: String,
    guard: Option<G>,
}

impl<G> Drop for KeyGuard<'_, G> {
    fn drop(&mut self) {
        self.guard.take();
        release_lock(self.locks, &self.file_key);
    }
}

/// The table's own reference is the only one left when the count is 1.
/// `lock_for` clones under the same shard lock, so a concurrent acquirer is
/// either counted here or inserts a fresh entry afterwards.
fn release_lock(locks: &DashMap<String, Arc<RwLock<()>>>, file_key: &str) {
    locks.remove_if(file_key, |_, lock| Arc::strong_count(lock) == 1);
}

/// Entry point for creating, reading, restoring and pruning versions
pub struct VersionManager {
    config: VersioningConfig,
    blobs: Arc<dyn BlobStore>,
    index: VersionIndex,
    live: Arc<dyn LiveFiles>,
    locks: DashMap<String, Arc<RwLock<()>>>,
    /// Held shared while a written blob has no index entry yet; gc takes it
    /// exclusively
    unindexed: RwLock<()>,
    cache: Option<Mutex<LruCache<VersionId, Bytes>>>,
}

impl VersionManager {
    /// Open the on-disk store described by `config`
    pub fn open(config: VersioningConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.base_dir)?;

        let blobs = ShardedBlobStore::open(
            &config.base_dir,
            BlobCompression {
                enabled: config.compression_enabled,
                level: config.compression_level,
            },
        )?;
        let index = VersionIndex::open(&config.base_dir)?;
        let live = FsLiveFiles::new(config.live_root.clone());

        if index.is_empty() {
            tracing::info!("Created version store at {:?}", config.base_dir);
        } else {
            tracing::info!(
                "Opened version store at {:?} ({} versions)",
                config.base_dir,
                index.len()
            );
        }
        Ok(Self::with_components(config, Arc::new(blobs), index, Arc::new(live)))
    }

    /// Assemble a manager from explicit parts
    pub fn with_components(
        config: VersioningConfig,
        blobs: Arc<dyn BlobStore>,
        index: VersionIndex,
        live: Arc<dyn LiveFiles>,
    ) -> Self {
        let cache = NonZeroUsize::new(config.cache_capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            config,
            blobs,
            index,
            live,
            locks: DashMap::new(),
            unindexed: RwLock::new(()),
            cache,
        }
    }

    pub fn config(&self) -> &VersioningConfig {
        &self.config
    }

    /// Record a new state of `file_key`
    pub async fn create_version(
        &self,
        file_key: &str,
        content: impl Into<Bytes>,
        author: Option<&str>,
        change_reason: Option<&str>,
        policy_override: Option<VersioningPolicy>,
    ) -> Result<VersionId> {
        check_file_key(file_key)?;
        let content = content.into();
        let _guard = self.write_lock(file_key).await?;
        self.create_locked(file_key, content, author, change_reason, policy_override)
            .await
    }

    /// History of a file, oldest first. Unknown files have an empty history.
    pub async fn list_versions(&self, file_key: &str) -> Result<Vec<VersionRecord>> {
        let _guard = self.read_lock(file_key).await?;
        self.index.list(file_key)
    }

    /// Metadata of one version
    pub fn get_version_info(&self, version_id: &VersionId) -> Result<VersionRecord> {
        self.record(version_id)
    }

    /// Full content of a version, rebuilt from its chain if needed
    pub async fn get_version_content(&self, version_id: &VersionId) -> Result<Bytes> {
        let record = self.record(version_id)?;
        let _guard = self.read_lock(&record.file_key).await?;
        // cleanup may have promoted or removed it while we waited
        let record = self.record(version_id)?;
        self.reconstruct_checked(&record, true).await
    }

    /// Write a version's content back to the live file.
    ///
    /// Returns `Ok(false)` when the version belongs to a different file.
    pub async fn restore_version(&self, file_key: &str, version_id: &VersionId) -> Result<bool> {
        check_file_key(file_key)?;
        let _guard = self.write_lock(file_key).await?;

        let record = self.record(version_id)?;
        if record.file_key != file_key {
            tracing::warn!(
                "Refusing to restore {} onto {}: version belongs to {}",
                version_id,
                file_key,
                record.file_key
            );
            return Ok(false);
        }

        let content = self.reconstruct_checked(&record, true).await?;
        self.live.write_live(file_key, &content).await?;

        if self.config.create_version_on_restore {
            let reason = format!("Restored from version {}", version_id);
            self.create_locked(file_key, content, None, Some(&reason), None)
                .await?;
        }

        tracing::info!("Restored {} to version {}", file_key, version_id);
        Ok(true)
    }

    /// Restore several files concurrently. Failures are logged and reported
    /// as `false` without affecting the other files.
    pub async fn bulk_restore_versions(
        &self,
        requests: HashMap<String, VersionId>,
    ) -> HashMap<String, bool> {
        let restores = requests.into_iter().map(|(file_key, version_id)| async move {
            let ok = match self.restore_version(&file_key, &version_id).await {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::warn!("Restore of {} to {} failed: {}", file_key, version_id, e);
                    false
                }
            };
            (file_key, ok)
        });
        join_all(restores).await.into_iter().collect()
    }

    /// Remove versions older than the retention window. Returns the number of
    /// versions removed.
    pub async fn cleanup_old_versions(&self, retention: Option<Duration>) -> Result<usize> {
        Ok(self.cleanup_report(retention).await?.removed)
    }

    /// Retention sweep with per-file detail
    pub async fn cleanup_report(&self, retention: Option<Duration>) -> Result<CleanupReport> {
        let retention = retention.unwrap_or(self.config.retention_duration);
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let Some(cutoff) = cutoff else {
            // window reaches past the earliest representable time
            tracing::debug!("Retention {:?} exceeds the calendar, nothing expired", retention);
            return Ok(CleanupReport::default());
        };

        let mut report = CleanupReport::default();
        for file_key in self.index.file_keys()? {
            report.files_scanned += 1;
            match self.cleanup_file(&file_key, cutoff).await {
                Ok(outcome) => {
                    report.removed += outcome.removed;
                    report.promoted += outcome.promoted;
                    if outcome.skipped_flagged {
                        report.skipped_flagged += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("Cleanup of {} failed: {}", file_key, e);
                    report.failed_files.push((file_key, e.to_string()));
                }
            }
        }

        tracing::info!(
            files = report.files_scanned,
            removed = report.removed,
            promoted = report.promoted,
            failed = report.failed_files.len(),
            "Retention sweep finished"
        );
        Ok(report)
    }

    /// Delete blobs no index entry refers to. Returns the number deleted.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let _quiet = self.unindexed.write().await;
        let referenced = self.index.storage_refs()?;

        let mut removed = 0;
        for storage_ref in self.blobs.list_refs().await? {
            if referenced.contains(storage_ref.as_str()) {
                continue;
            }
            self.blobs.delete(&storage_ref).await?;
            tracing::debug!("Removed unreferenced blob {}", storage_ref);
            removed += 1;
        }
        if removed > 0 {
            tracing::info!("Garbage collection removed {} blobs", removed);
        }
        Ok(removed)
    }

    /// Rebuild every version of a file from storage, bypassing the cache
    pub async fn verify_file(&self, file_key: &str) -> Result<VerifyReport> {
        let _guard = self.read_lock(file_key).await?;
        let history = self.index.list(file_key)?;
        if history.is_empty() {
            return Err(VersionError::NotFound(format!("file {}", file_key)));
        }

        let mut report = VerifyReport {
            file_key: file_key.to_string(),
            checked: history.len(),
            failures: Vec::new(),
        };
        for record in &history {
            if let Err(e) = self.reconstruct_checked(record, false).await {
                report.failures.push((record.version_id.clone(), e.to_string()));
            }
        }
        Ok(report)
    }

    /// Files with at least one version
    pub fn file_keys(&self) -> Result<Vec<String>> {
        self.index.file_keys()
    }

    /// Versions quarantined after failed integrity checks
    pub fn flagged_versions(&self) -> Result<Vec<(VersionId, String)>> {
        self.index.flags()
    }

    /// Lift a quarantine flag once history has been repaired
    pub async fn clear_flag(&self, version_id: &VersionId) -> Result<bool> {
        self.index.unflag(version_id).await
    }

    /// Number of live version records
    pub fn version_count(&self) -> usize {
        self.index.len()
    }

    /// Flush everything to disk
    pub async fn shutdown(&self) -> Result<()> {
        self.index.flush().await?;
        tracing::info!("Version store at {:?} closed", self.config.base_dir);
        Ok(())
    }

    fn record(&self, version_id: &VersionId) -> Result<VersionRecord> {
        self.index
            .get(version_id)?
            .ok_or_else(|| VersionError::NotFound(format!("version {}", version_id)))
    }

    fn lock_for(&self, file_key: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(file_key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    async fn write_lock(&self, file_key: &str) -> Result<KeyGuard<'_, OwnedRwLockWriteGuard<()>>> {
        let lock = self.lock_for(file_key);
        let acquired = tokio::time::timeout(self.config.lock_timeout, lock.write_owned()).await;
        self.key_guard(file_key, acquired)
    }

    async fn read_lock(&self, file_key: &str) -> Result<KeyGuard<'_, OwnedRwLockReadGuard<()>>> {
        let lock = self.lock_for(file_key);
        let acquired = tokio::time::timeout(self.config.lock_timeout, lock.read_owned()).await;
        self.key_guard(file_key, acquired)
    }

    fn key_guard<G>(
        &self,
        file_key: &str,
        acquired: std::result::Result<G, Elapsed>,
    ) -> Result<KeyGuard<'_, G>> {
        match acquired {
            Ok(guard) => Ok(KeyGuard {
                locks: &self.locks,
                file_key: file_key.to_string(),
                guard: Some(guard),
            }),
            Err(_) => {
                release_lock(&self.locks, file_key);
                Err(self.lock_timed_out(file_key))
            }
        }
    }

    fn lock_timed_out(&self, file_key: &str) -> VersionError {
        tracing::warn!(
            "Gave up waiting {:?} for the lock on {}",
            self.config.lock_timeout,
            file_key
        );
        VersionError::ConcurrencyTimeout {
            file_key: file_key.to_string(),
            waited: self.config.lock_timeout,
        }
    }

    fn cache_get(&self, version_id: &VersionId) -> Option<Bytes> {
        self.cache.as_ref()?.lock().get(version_id).cloned()
    }

    fn cache_put(&self, version_id: VersionId, content: Bytes) {
        if let Some(cache) = &self.cache {
            cache.lock().put(version_id, content);
        }
    }

    fn cache_evict(&self, version_id: &VersionId) {
        if let Some(cache) = &self.cache {
            cache.lock().pop(version_id);
        }
    }

    /// Create a version; the caller holds the file's write lock
    async fn create_locked(
        &self,
        file_key: &str,
        content: Bytes,
        author: Option<&str>,
        change_reason: Option<&str>,
        policy_override: Option<VersioningPolicy>,
    ) -> Result<VersionId> {
        let history = self.index.list(file_key)?;
        let latest = history.last();
        let content_hash = ContentHash::of(&content);

        if self.config.suppress_noop_versions {
            if let Some(latest) = latest.filter(|l| l.content_hash == content_hash) {
                tracing::debug!(
                    "Content of {} unchanged, keeping version {}",
                    file_key,
                    latest.version_id
                );
                return Ok(latest.version_id.clone());
            }
        }

        let policy = policy_override.unwrap_or(self.config.default_policy);
        let input = SelectionInput {
            file_key,
            class: classify(file_key, &content, &self.config),
            has_parent: latest.is_some(),
            chain_len: latest.map(|l| chain_depth(&history, l)).unwrap_or(0),
        };
        let mut representation = select(&input, policy, &self.config);

        // strictly increasing per file, at the index's microsecond resolution
        let mut timestamp = Utc::now().trunc_subsecs(6);
        if let Some(latest) = latest {
            if timestamp <= latest.timestamp {
                timestamp = latest.timestamp + chrono::Duration::microseconds(1);
            }
        }

        let mut version_id = VersionId::generate(file_key, &content_hash, timestamp);
        while self.index.is_known(&version_id)? {
            version_id = VersionId::generate(file_key, &content_hash, timestamp);
        }

        let mut parent_version_id = None;
        let mut blob = content.clone();
        if let (Representation::Diff, Some(parent)) = (representation, latest) {
            match self.reconstruct_checked(parent, true).await {
                Ok(base) => {
                    let patch = compute_diff(&base, &content);
                    let stats = patch.stats();
                    tracing::debug!(
                        "Diff for {}: +{} -{} lines against {}",
                        file_key,
                        stats.added,
                        stats.removed,
                        parent.version_id
                    );
                    blob = Bytes::from(patch.to_bytes());
                    parent_version_id = Some(parent.version_id.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        "Cannot diff {} against {} ({}), storing a full snapshot",
                        file_key,
                        parent.version_id,
                        e
                    );
                    representation = Representation::FullSnapshot;
                }
            }
        } else {
            representation = Representation::FullSnapshot;
        }

        let unindexed = self.unindexed.read().await;
        let storage_ref = self
            .write_blob(file_key, &version_id, representation, blob.clone())
            .await?;

        let record = VersionRecord {
            version_id: version_id.clone(),
            file_key: file_key.to_string(),
            timestamp,
            author: author.map(str::to_string),
            change_reason: change_reason.map(str::to_string),
            representation,
            parent_version_id,
            storage_ref: storage_ref.clone(),
            content_hash,
            size: content.len() as u64,
        };
        if let Err(e) = self.index.append(&record).await {
            tracing::error!("Failed to index version {} of {}: {}", version_id, file_key, e);
            if let Err(del) = self.blobs.delete(&storage_ref).await {
                tracing::warn!("Blob {} left for garbage collection: {}", storage_ref, del);
            }
            return Err(e);
        }
        drop(unindexed);

        self.cache_put(version_id.clone(), content);
        tracing::info!(
            file_key,
            version_id = %version_id,
            representation = %representation,
            stored = blob.len(),
            "Created version"
        );

        self.enforce_version_cap(file_key).await;
        Ok(version_id)
    }

    /// Store a blob and read it back, retrying transient failures
    async fn write_blob(
        &self,
        file_key: &str,
        version_id: &VersionId,
        representation: Representation,
        blob: Bytes,
    ) -> Result<StorageRef> {
        let mut attempt = 0u32;
        loop {
            let err = match self
                .blobs
                .put(file_key, version_id, representation, blob.clone())
                .await
            {
                Ok(storage_ref) => match self.blobs.get(&storage_ref).await {
                    Ok(stored) if stored == blob => return Ok(storage_ref),
                    Ok(_) => VersionError::Storage(format!(
                        "Blob {} does not read back as written",
                        storage_ref
                    )),
                    Err(e) => e,
                },
                Err(e) => e,
            };

            let transient = err.is_retryable() || matches!(err, VersionError::MissingBlob { .. });
            if !transient || attempt >= self.config.storage_retries {
                tracing::error!("Blob write for {} failed: {}", version_id, err);
                return Err(err);
            }
            let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
            attempt += 1;
            tracing::warn!(
                "Blob write for {} failed (attempt {}): {}; retrying in {:?}",
                version_id,
                attempt,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Reconstruct, flagging the version when history turns out damaged
    async fn reconstruct_checked(&self, record: &VersionRecord, use_cache: bool) -> Result<Bytes> {
        match self.reconstruct(record, use_cache).await {
            Err(e) if e.is_corruption() => {
                tracing::error!(
                    file_key = %record.file_key,
                    version_id = %record.version_id,
                    "Version history is damaged: {}",
                    e
                );
                if let Err(flag_err) = self.index.flag(&record.version_id, &e.to_string()).await {
                    tracing::warn!("Could not flag {}: {}", record.version_id, flag_err);
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn reconstruct(&self, target: &VersionRecord, use_cache: bool) -> Result<Bytes> {
        if use_cache {
            if let Some(content) = self.cache_get(&target.version_id) {
                return Ok(content);
            }
        }

        let chain = self.resolve_chain(target)?;
        let diffs: Vec<&VersionRecord> = chain.diffs_oldest_first().collect();

        // resume from the newest state already in memory
        let mut start = 0;
        let mut cached = None;
        if use_cache {
            for (i, record) in diffs.iter().enumerate().rev() {
                if let Some(content) = self.cache_get(&record.version_id) {
                    cached = Some(content);
                    start = i + 1;
                    break;
                }
            }
            if cached.is_none() {
                cached = self.cache_get(&chain.base().version_id);
            }
        }
        tracing::debug!(
            "Rebuilding {} from {}: {} of {} diffs to replay",
            chain.target().version_id,
            chain.base().version_id,
            chain.diff_count() - start,
            chain.diff_count()
        );
        let mut content = match cached {
            Some(content) => content,
            None => {
                let base = chain.base();
                let content = self.blobs.get(&base.storage_ref).await?;
                check_hash(base, &content)?;
                content
            }
        };

        for record in &diffs[start..] {
            let patch_bytes = self.blobs.get(&record.storage_ref).await?;
            let patch = PatchData::parse(&patch_bytes)
                .map_err(|e| VersionError::reconstruction(&record.version_id, e.to_string()))?;
            let next = apply_diff(&content, &patch)
                .map_err(|e| VersionError::reconstruction(&record.version_id, e.to_string()))?;
            content = Bytes::from(next);
            check_hash(record, &content)?;
        }

        if use_cache {
            self.cache_put(target.version_id.clone(), content.clone());
        }
        Ok(content)
    }

    /// Walk parent links from `target` back to its snapshot
    fn resolve_chain(&self, target: &VersionRecord) -> Result<VersionChain> {
        let mut seen = HashSet::from([target.version_id.clone()]);
        let mut records = vec![target.clone()];
        let mut current = target.clone();

        while !current.is_snapshot() {
            let parent_id = current.parent_version_id.clone().ok_or_else(|| {
                VersionError::reconstruction(&current.version_id, "diff has no parent")
            })?;
            if !seen.insert(parent_id.clone()) || records.len() > MAX_CHAIN_WALK {
                return Err(VersionError::reconstruction(
                    &target.version_id,
                    format!("cycle in version chain at {}", parent_id),
                ));
            }
            let parent = self.index.get(&parent_id)?.ok_or_else(|| {
                VersionError::reconstruction(
                    &target.version_id,
                    format!("parent {} is not in the index", parent_id),
                )
            })?;
            if parent.file_key != target.file_key {
                return Err(VersionError::reconstruction(
                    &target.version_id,
                    format!("parent {} belongs to {}", parent_id, parent.file_key),
                ));
            }
            records.push(parent.clone());
            current = parent;
        }

        VersionChain::from_target_first(records).ok_or_else(|| {
            VersionError::reconstruction(&target.version_id, "chain is not rooted at a snapshot")
        })
    }

    async fn cleanup_file(
        &self,
        file_key: &str,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<PruneOutcome> {
        let _guard = self.write_lock(file_key).await?;
        let history = self.index.list(file_key)?;
        let expired = history
            .iter()
            .filter(|r| r.timestamp < cutoff)
            .map(|r| r.version_id.clone())
            .collect();
        self.prune_locked(file_key, &history, expired).await
    }

    /// Trim the oldest versions beyond `max_versions_per_file`. The new
    /// version is already durable, so failures here are only logged.
    async fn enforce_version_cap(&self, file_key: &str) {
        let max = self.config.max_versions_per_file;
        if max == 0 {
            return;
        }
        match self.prune_overflow(file_key, max).await {
            Ok(outcome) if outcome.removed > 0 => {
                tracing::debug!(
                    "Trimmed {} old versions of {} (cap {})",
                    outcome.removed,
                    file_key,
                    max
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not trim history of {}: {}", file_key, e),
        }
    }

    async fn prune_overflow(&self, file_key: &str, max: usize) -> Result<PruneOutcome> {
        let history = self.index.list(file_key)?;
        if history.len() <= max {
            return Ok(PruneOutcome::default());
        }
        let overflow = history[..history.len() - max]
            .iter()
            .map(|r| r.version_id.clone())
            .collect();
        self.prune_locked(file_key, &history, overflow).await
    }

    /// Remove `doomed` versions of one file without breaking any surviving
    /// chain. The caller holds the file's write lock.
    async fn prune_locked(
        &self,
        file_key: &str,
        history: &[VersionRecord],
        mut doomed: HashSet<VersionId>,
    ) -> Result<PruneOutcome> {
        let mut outcome = PruneOutcome::default();
        if let Some(latest) = history.last() {
            doomed.remove(&latest.version_id);
        }
        if doomed.is_empty() {
            return Ok(outcome);
        }
        for record in history {
            if self.index.is_flagged(&record.version_id)? {
                tracing::warn!(
                    "Skipping cleanup of {}: version {} is flagged as damaged",
                    file_key,
                    record.version_id
                );
                outcome.skipped_flagged = true;
                return Ok(outcome);
            }
        }

        let by_id: HashMap<&VersionId, &VersionRecord> =
            history.iter().map(|r| (&r.version_id, r)).collect();

        // survivors that depend on a doomed parent become snapshots first
        for record in history {
            if doomed.contains(&record.version_id) {
                continue;
            }
            let Some(parent) = record.parent_version_id.as_ref() else {
                continue;
            };
            if !doomed.contains(parent) {
                continue;
            }
            match self.promote(record).await {
                Ok(()) => outcome.promoted += 1,
                Err(e) => {
                    tracing::warn!(
                        "Could not promote {} of {}, keeping its ancestors: {}",
                        record.version_id,
                        file_key,
                        e
                    );
                    let mut cursor = Some(parent);
                    let mut steps = 0;
                    while let Some(id) = cursor {
                        doomed.remove(id);
                        steps += 1;
                        if steps > history.len() {
                            break;
                        }
                        cursor = by_id.get(id).and_then(|r| r.parent_version_id.as_ref());
                    }
                }
            }
        }

        // newest first, so a diff always goes before the record it patches
        for record in history.iter().rev() {
            if !doomed.contains(&record.version_id) {
                continue;
            }
            self.index.remove(&record.version_id).await?;
            self.cache_evict(&record.version_id);
            if let Err(e) = self.blobs.delete(&record.storage_ref).await {
                tracing::warn!(
                    "Blob {} of removed version {} left for garbage collection: {}",
                    record.storage_ref,
                    record.version_id,
                    e
                );
            }
            outcome.removed += 1;
        }
        Ok(outcome)
    }

    /// Rewrite a diff version as a full snapshot, keeping its id and timestamp
    async fn promote(&self, record: &VersionRecord) -> Result<()> {
        let content = self.reconstruct_checked(record, true).await?;

        let unindexed = self.unindexed.read().await;
        let storage_ref = self
            .write_blob(
                &record.file_key,
                &record.version_id,
                Representation::FullSnapshot,
                content,
            )
            .await?;
        let promoted = VersionRecord {
            representation: Representation::FullSnapshot,
            parent_version_id: None,
            storage_ref: storage_ref.clone(),
            ..record.clone()
        };
        if let Err(e) = self.index.rebase(&promoted).await {
            if let Err(del) = self.blobs.delete(&storage_ref).await {
                tracing::warn!("Blob {} left for garbage collection: {}", storage_ref, del);
            }
            return Err(e);
        }
        drop(unindexed);

        if let Err(e) = self.blobs.delete(&record.storage_ref).await {
            tracing::warn!(
                "Old diff blob {} left for garbage collection: {}",
                record.storage_ref,
                e
            );
        }
        tracing::info!(
            "Promoted version {} of {} to a full snapshot",
            record.version_id,
            record.file_key
        );
        Ok(())
    }
}

fn check_file_key(file_key: &str) -> Result<()> {
    if file_key.trim().is_empty() || file_key.contains('\0') {
        return Err(VersionError::InvalidFileKey(file_key.to_string()));
    }
    Ok(())
}

fn check_hash(record: &VersionRecord, content: &[u8]) -> Result<()> {
    let actual = ContentHash::of(content);
    if actual != record.content_hash {
        return Err(VersionError::Integrity {
            version_id: record.version_id.to_string(),
            expected: record.content_hash.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

/// Diffs stacked between `latest` and its snapshot
fn chain_depth(history: &[VersionRecord], latest: &VersionRecord) -> usize {
    let by_id: HashMap<&VersionId, &VersionRecord> =
        history.iter().map(|r| (&r.version_id, r)).collect();
    let mut depth = 0;
    let mut current = latest;
    while let Some(parent) = current.parent_version_id.as_ref() {
        depth += 1;
        match by_id.get(parent) {
            Some(record) if depth <= history.len() => current = record,
            _ => break,
        }
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Blob store whose first `failures` puts fail
    struct FlakyStore {
        inner: ShardedBlobStore,
        failures: AtomicUsize,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        async fn put(
            &self,
            file_key: &str,
            version_id: &VersionId,
            representation: Representation,
            blob: Bytes,
        ) -> Result<StorageRef> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(VersionError::Storage("disk hiccup".into()));
            }
            self.inner.put(file_key, version_id, representation, blob).await
        }

        async fn get(&self, storage_ref: &StorageRef) -> Result<Bytes> {
            self.inner.get(storage_ref).await
        }

        async fn exists(&self, storage_ref: &StorageRef) -> Result<bool> {
            self.inner.exists(storage_ref).await
        }

        async fn delete(&self, storage_ref: &StorageRef) -> Result<()> {
            self.inner.delete(storage_ref).await
        }

        async fn list_refs(&self) -> Result<Vec<StorageRef>> {
            self.inner.list_refs().await
        }
    }

    fn flaky_manager(dir: &TempDir, failures: usize, retries: u32) -> (VersionManager, Arc<FlakyStore>) {
        let mut config = VersioningConfig::new(dir.path().join("store")).with_live_root(dir.path().join("live"));
        config.storage_retries = retries;
        let store = Arc::new(FlakyStore {
            inner: ShardedBlobStore::open(&config.base_dir, BlobCompression::default()).unwrap(),
            failures: AtomicUsize::new(failures),
            puts: AtomicUsize::new(0),
        });
        let index = VersionIndex::open(&config.base_dir).unwrap();
        let live = Arc::new(FsLiveFiles::new(config.live_root.clone()));
        let manager = VersionManager::with_components(config, store.clone(), index, live);
        (manager, store)
    }

    #[tokio::test]
    async fn test_transient_write_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let (manager, store) = flaky_manager(&dir, 2, 3);

        let id = manager
            .create_version("a.txt", &b"hello\n"[..], None, None, None)
            .await
            .unwrap();
        assert_eq!(store.puts.load(Ordering::SeqCst), 3);
        assert_eq!(&manager.get_version_content(&id).await.unwrap()[..], b"hello\n");
    }

    #[tokio::test]
    async fn test_write_gives_up_after_retries() {
        let dir = TempDir::new().unwrap();
        let (manager, _store) = flaky_manager(&dir, 10, 1);

        let err = manager
            .create_version("a.txt", &b"hello\n"[..], None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VersionError::Storage(_)));
        assert!(manager.list_versions("a.txt").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_timeout_surfaces_as_error() {
        let dir = TempDir::new().unwrap();
        let mut config = VersioningConfig::new(dir.path().join("store"));
        config.lock_timeout = Duration::from_millis(50);
        let manager = VersionManager::open(config).unwrap();

        let held = manager.lock_for("busy.txt").write_owned().await;
        let err = manager
            .create_version("busy.txt", &b"x"[..], None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VersionError::ConcurrencyTimeout { .. }));
        drop(held);

        manager
            .create_version("busy.txt", &b"x"[..], None, None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_table_entries_released() {
        let dir = TempDir::new().unwrap();
        let manager = VersionManager::open(VersioningConfig::new(dir.path())).unwrap();

        manager.create_version("a.txt", &b"1\n"[..], None, None, None).await.unwrap();
        assert!(manager.list_versions("never-written.txt").await.unwrap().is_empty());
        assert!(manager.verify_file("also-unknown.txt").await.is_err());
        assert!(manager.locks.is_empty());

        // an entry in use survives another task's release
        let guard = manager.read_lock("a.txt").await.unwrap();
        manager.list_versions("a.txt").await.unwrap();
        assert!(manager.locks.contains_key("a.txt"));
        drop(guard);
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_waits_for_in_flight_read() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(VersionManager::open(VersioningConfig::new(dir.path())).unwrap());
        for i in 0..3 {
            manager
                .create_version("held.md", format!("{}\n", i), None, None, None)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reader = manager.read_lock("held.md").await.unwrap();
        let sweeper = manager.clone();
        let sweep =
            tokio::spawn(async move { sweeper.cleanup_old_versions(Some(Duration::ZERO)).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sweep.is_finished());
        assert_eq!(manager.index.list("held.md").unwrap().len(), 3);

        drop(reader);
        assert_eq!(sweep.await.unwrap().unwrap(), 2);
        assert_eq!(manager.list_versions("held.md").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_file_key_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = VersionManager::open(VersioningConfig::new(dir.path())).unwrap();
        let err = manager
            .create_version("  ", &b"x"[..], None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VersionError::InvalidFileKey(_)));
    }

    #[tokio::test]
    async fn test_reconstruction_without_cache() {
        let dir = TempDir::new().unwrap();
        let mut config = VersioningConfig::new(dir.path());
        config.cache_capacity = 0;
        let manager = VersionManager::open(config).unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            let content = format!("header\nrevision {}\nfooter\n", i);
            ids.push(
                manager
                    .create_version("log.txt", content, None, None, None)
                    .await
                    .unwrap(),
            );
        }
        for (i, id) in ids.iter().enumerate() {
            let content = manager.get_version_content(id).await.unwrap();
            assert_eq!(content, format!("header\nrevision {}\nfooter\n", i).as_bytes());
        }
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let manager = VersionManager::open(VersioningConfig::new(dir.path())).unwrap();
        for i in 0..20 {
            manager
                .create_version("fast.txt", format!("{}\n", i), None, None, None)
                .await
                .unwrap();
        }
        let history = manager.list_versions("fast.txt").await.unwrap();
        assert!(history.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_chain_depth() {
        let record = |id: &str, parent: Option<&str>| VersionRecord {
            version_id: VersionId::parse(&id.repeat(32)).unwrap(),
            file_key: "a.txt".to_string(),
            timestamp: Utc::now(),
            author: None,
            change_reason: None,
            representation: if parent.is_some() {
                Representation::Diff
            } else {
                Representation::FullSnapshot
            },
            parent_version_id: parent.map(|p| VersionId::parse(&p.repeat(32)).unwrap()),
            storage_ref: StorageRef::new("x"),
            content_hash: ContentHash::of(id.as_bytes()),
            size: 1,
        };
        let history = vec![
            record("a", None),
            record("b", Some("a")),
            record("c", Some("b")),
            record("d", None),
            record("e", Some("d")),
        ];
        assert_eq!(chain_depth(&history, &history[2]), 2);
        assert_eq!(chain_depth(&history, &history[3]), 0);
        assert_eq!(chain_depth(&history, &history[4]), 1);
    }
}
