//! Human-readable rendering of records and scheduler status

use fvault_core::{SchedulerStatus, VersionRecord};
use std::fmt::Write;

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One line per version, oldest first
pub fn history_table(history: &[VersionRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<32}  {:<23}  {:<4}  {:>10}  {:<12}  REASON",
        "VERSION", "TIME (UTC)", "REPR", "SIZE", "AUTHOR"
    );
    for record in history {
        let _ = writeln!(
            out,
            "{:<32}  {:<23}  {:<4}  {:>10}  {:<12}  {}",
            record.version_id,
            record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            record.representation.to_string(),
            format_size(record.size),
            record.author.as_deref().unwrap_or("-"),
            record.change_reason.as_deref().unwrap_or("")
        );
    }
    out
}

pub fn record_details(record: &VersionRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Version:   {}", record.version_id);
    let _ = writeln!(out, "File:      {}", record.file_key);
    let _ = writeln!(
        out,
        "Time:      {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S%.6f UTC")
    );
    let _ = writeln!(out, "Stored as: {}", record.representation);
    if let Some(parent) = &record.parent_version_id {
        let _ = writeln!(out, "Parent:    {}", parent);
    }
    let _ = writeln!(out, "Size:      {}", format_size(record.size));
    let _ = writeln!(out, "SHA-256:   {}", record.content_hash);
    let _ = writeln!(out, "Blob:      {}", record.storage_ref);
    if let Some(author) = &record.author {
        let _ = writeln!(out, "Author:    {}", author);
    }
    if let Some(reason) = &record.change_reason {
        let _ = writeln!(out, "Reason:    {}", reason);
    }
    out
}

pub fn status_line(status: &SchedulerStatus) -> String {
    let when = status
        .last_run
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    match &status.last_error {
        Some(error) => format!(
            "[{}] sweep #{} failed ({} in a row), retry in {:?}: {}",
            when, status.runs, status.consecutive_failures, status.next_delay, error
        ),
        None => format!(
            "[{}] sweep #{} removed {} versions, {} garbage blobs; next in {:?}",
            when, status.runs, status.last_removed, status.last_garbage, status.next_delay
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fvault_core::{ContentHash, Representation, StorageRef, VersionId};
    use std::time::Duration;

    fn record() -> VersionRecord {
        VersionRecord {
            version_id: VersionId::parse("0123456789abcdef0123456789abcdef").unwrap(),
            file_key: "notes.md".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            author: Some("alice".to_string()),
            change_reason: Some("draft".to_string()),
            representation: Representation::Diff,
            parent_version_id: VersionId::parse("ffffffffffffffffffffffffffffffff"),
            storage_ref: StorageRef::new("ab/cdef/x-diff.blob"),
            content_hash: ContentHash::of(b"x"),
            size: 2048,
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_history_table() {
        let table = history_table(&[record()]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("VERSION"));
        assert!(lines[1].contains("2024-05-01 12:30:00.000"));
        assert!(lines[1].contains("diff"));
        assert!(lines[1].contains("alice"));
        assert!(lines[1].ends_with("draft"));
    }

    #[test]
    fn test_record_details_lists_parent() {
        let details = record_details(&record());
        assert!(details.contains("Parent:    ffffffffffffffffffffffffffffffff"));
        assert!(details.contains("Size:      2.0 KB"));
    }

    #[test]
    fn test_status_line() {
        let mut status = SchedulerStatus {
            runs: 3,
            last_removed: 7,
            next_delay: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(status_line(&status).contains("removed 7 versions"));

        status.last_error = Some("disk full".to_string());
        status.consecutive_failures = 2;
        let line = status_line(&status);
        assert!(line.contains("failed (2 in a row)"));
        assert!(line.ends_with("disk full"));
    }
}
