//! Representation policy
//!
//! Decides per file and per event whether a new version is stored as a full
//! snapshot or as a diff against the latest version.

use std::path::Path;

use crate::config::{VersioningConfig, VersioningPolicy};
use crate::record::Representation;

/// Bytes inspected when sniffing for binary content
const SNIFF_LEN: usize = 8 * 1024;

/// Coarse content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Text,
    Binary,
}

/// Classify content: text needs an allow-listed extension and no NUL byte in
/// the leading bytes.
pub fn classify(file_key: &str, content: &[u8], config: &VersioningConfig) -> ContentClass {
    let text_ext = Path::new(file_key)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| config.is_text_extension(ext));
    if !text_ext {
        return ContentClass::Binary;
    }
    let head = &content[..content.len().min(SNIFF_LEN)];
    if head.contains(&0) {
        ContentClass::Binary
    } else {
        ContentClass::Text
    }
}

/// Facts about the file the selector needs
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
    pub file_key: &'a str,
    pub class: ContentClass,
    /// Whether a previous version exists to diff against
    pub has_parent: bool,
    /// Diffs stacked on the latest snapshot (0 if the latest is a snapshot)
    pub chain_len: usize,
}

/// Pick a representation for a new version
pub fn select(
    input: &SelectionInput<'_>,
    policy: VersioningPolicy,
    config: &VersioningConfig,
) -> Representation {
    if !input.has_parent {
        return Representation::FullSnapshot;
    }

    let wants_diff = match policy {
        VersioningPolicy::FullCopy => false,
        VersioningPolicy::DiffBased | VersioningPolicy::Hybrid => input.class == ContentClass::Text,
    };
    if !wants_diff {
        return Representation::FullSnapshot;
    }

    if input.chain_len >= config.max_chain_length {
        tracing::debug!(
            file_key = input.file_key,
            chain_len = input.chain_len,
            "Chain length cap reached, forcing snapshot"
        );
        return Representation::FullSnapshot;
    }
    Representation::Diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(class: ContentClass, has_parent: bool, chain_len: usize) -> SelectionInput<'static> {
        SelectionInput {
            file_key: "notes.md",
            class,
            has_parent,
            chain_len,
        }
    }

    #[test]
    fn test_classify() {
        let config = VersioningConfig::default();
        assert_eq!(classify("notes.md", b"line1\n", &config), ContentClass::Text);
        assert_eq!(classify("photo.png", b"\x89PNG\r\n", &config), ContentClass::Binary);
        assert_eq!(classify("Makefile", b"all:\n", &config), ContentClass::Binary);
        assert_eq!(classify("data.json", b"{\0}", &config), ContentClass::Binary);
    }

    #[test]
    fn test_first_version_is_always_snapshot() {
        let config = VersioningConfig::default();
        for policy in [VersioningPolicy::FullCopy, VersioningPolicy::DiffBased, VersioningPolicy::Hybrid] {
            assert_eq!(
                select(&input(ContentClass::Text, false, 0), policy, &config),
                Representation::FullSnapshot
            );
        }
    }

    #[test]
    fn test_policies() {
        let config = VersioningConfig::default();
        let text = input(ContentClass::Text, true, 0);
        let binary = input(ContentClass::Binary, true, 0);

        assert_eq!(select(&text, VersioningPolicy::FullCopy, &config), Representation::FullSnapshot);
        assert_eq!(select(&text, VersioningPolicy::DiffBased, &config), Representation::Diff);
        assert_eq!(select(&text, VersioningPolicy::Hybrid, &config), Representation::Diff);
        assert_eq!(select(&binary, VersioningPolicy::Hybrid, &config), Representation::FullSnapshot);
        assert_eq!(select(&binary, VersioningPolicy::DiffBased, &config), Representation::FullSnapshot);
    }

    #[test]
    fn test_chain_cap_forces_snapshot() {
        let config = VersioningConfig::default().with_max_chain_length(3);
        assert_eq!(
            select(&input(ContentClass::Text, true, 2), VersioningPolicy::Hybrid, &config),
            Representation::Diff
        );
        assert_eq!(
            select(&input(ContentClass::Text, true, 3), VersioningPolicy::Hybrid, &config),
            Representation::FullSnapshot
        );
        assert_eq!(
            select(&input(ContentClass::Text, true, 3), VersioningPolicy::DiffBased, &config),
            Representation::FullSnapshot
        );
    }
}
