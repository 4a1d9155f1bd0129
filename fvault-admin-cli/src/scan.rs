//! Capture changed files under the live root

use anyhow::{Context, Result};
use bytes::Bytes;
use fvault_core::{ContentHash, VersionManager, VersioningConfig};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SCAN_REASON: &str = "Captured by scan";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub examined: usize,
    pub captured: Vec<String>,
    pub unchanged: usize,
    pub failed: Vec<(String, String)>,
}

/// Record a version for every included live file whose content differs from
/// its latest version. One file failing does not stop the scan.
pub async fn scan_live_tree(
    manager: &VersionManager,
    config: &VersioningConfig,
    dry_run: bool,
) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();
    let store = canonical(&config.base_dir);

    for entry in WalkDir::new(&config.live_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| canonical(e.path()) != store)
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file_key) = file_key_for(&config.live_root, entry.path()) else {
            continue;
        };
        if !config.should_auto_version(&file_key) {
            continue;
        }
        summary.examined += 1;

        match capture(manager, &file_key, entry.path(), dry_run).await {
            Ok(true) => summary.captured.push(file_key),
            Ok(false) => summary.unchanged += 1,
            Err(e) => {
                tracing::warn!("Scan of {} failed: {:#}", file_key, e);
                summary.failed.push((file_key, format!("{:#}", e)));
            }
        }
    }
    Ok(summary)
}

async fn capture(manager: &VersionManager, file_key: &str, path: &Path, dry_run: bool) -> Result<bool> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let latest = manager.list_versions(file_key).await?.pop();
    if latest.is_some_and(|r| r.content_hash == ContentHash::of(&content)) {
        return Ok(false);
    }
    if !dry_run {
        manager
            .create_version(file_key, Bytes::from(content), None, Some(SCAN_REASON), None)
            .await?;
    }
    Ok(true)
}

/// Slash-separated key of `path` relative to `root`
fn file_key_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    let key = parts?.join("/");
    (!key.is_empty()).then_some(key)
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
