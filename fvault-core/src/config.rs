//! Engine configuration
//!
//! The host resolves configuration and hands a [`VersioningConfig`] to the
//! engine. The struct is serde-friendly so hosts can keep it in JSON, with
//! durations written the humantime way (`"30days"`, `"6h"`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, VersionError};

/// Representation policy applied when a version is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersioningPolicy {
    /// Always store a complete copy
    FullCopy,
    /// Always diff against the latest version (text content only)
    DiffBased,
    /// Diff text, snapshot everything else
    Hybrid,
}

impl Default for VersioningPolicy {
    fn default() -> Self {
        VersioningPolicy::Hybrid
    }
}

impl std::str::FromStr for VersioningPolicy {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "full_copy" | "full" => Ok(VersioningPolicy::FullCopy),
            "diff_based" | "diff" => Ok(VersioningPolicy::DiffBased),
            "hybrid" => Ok(VersioningPolicy::Hybrid),
            other => Err(VersionError::Config(format!("Unknown policy: {}", other))),
        }
    }
}

/// Configuration consumed by the versioning engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    /// Directory holding the blob tree and the index
    pub base_dir: PathBuf,
    /// Root that file keys are resolved against when restoring live files
    pub live_root: PathBuf,
    /// Whether changed files are captured automatically (see `should_auto_version`)
    pub auto_create_versions: bool,
    pub default_policy: VersioningPolicy,
    /// Oldest versions beyond this count are pruned after each create (0 = unlimited)
    pub max_versions_per_file: usize,
    /// Age after which versions become eligible for cleanup
    #[serde(with = "humantime_serde")]
    pub retention_duration: Duration,
    pub compression_enabled: bool,
    pub compression_level: i32,
    /// Paths worth versioning; empty means everything
    pub include_patterns: Vec<String>,
    /// Paths never versioned; checked after includes
    pub exclude_patterns: Vec<String>,
    /// Extensions treated as line-oriented text
    pub text_extensions: Vec<String>,
    /// Diffs allowed after a snapshot before a new snapshot is forced
    pub max_chain_length: usize,
    /// Return the latest version instead of recording unchanged content
    pub suppress_noop_versions: bool,
    /// Record a new version when a file is restored
    pub create_version_on_restore: bool,
    /// Upper bound on waiting for a per-file lock
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Extra attempts for a failed blob write
    pub storage_retries: u32,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Longest delay between cleanup attempts after repeated failures
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Reconstructed contents kept in memory
    pub cache_capacity: usize,
}

fn default_text_extensions() -> Vec<String> {
    [
        "txt", "md", "markdown", "rst", "csv", "tsv", "json", "yaml", "yml", "toml", "ini", "cfg",
        "conf", "xml", "html", "htm", "css", "js", "ts", "jsx", "tsx", "py", "rs", "go", "java",
        "c", "h", "cpp", "hpp", "cs", "rb", "php", "sh", "bash", "sql", "log", "tex",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".fvault"),
            live_root: PathBuf::from("."),
            auto_create_versions: true,
            default_policy: VersioningPolicy::Hybrid,
            max_versions_per_file: 100,
            retention_duration: Duration::from_secs(30 * 24 * 60 * 60),
            compression_enabled: true,
            compression_level: 3,
            include_patterns: Vec::new(),
            exclude_patterns: vec![
                "**/.git/**".to_string(),
                "**/.fvault/**".to_string(),
                "**/*.tmp".to_string(),
            ],
            text_extensions: default_text_extensions(),
            max_chain_length: 20,
            suppress_noop_versions: false,
            create_version_on_restore: true,
            lock_timeout: Duration::from_secs(30),
            storage_retries: 3,
            cleanup_interval: Duration::from_secs(6 * 60 * 60),
            max_backoff: Duration::from_secs(24 * 60 * 60),
            cache_capacity: 128,
        }
    }
}

impl VersioningConfig {
    /// Config rooted at a base directory, everything else default
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_live_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.live_root = root.into();
        self
    }

    pub fn with_policy(mut self, policy: VersioningPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_duration = retention;
        self
    }

    pub fn with_max_versions(mut self, max: usize) -> Self {
        self.max_versions_per_file = max;
        self
    }

    pub fn with_max_chain_length(mut self, max: usize) -> Self {
        self.max_chain_length = max;
        self
    }

    /// Load from a JSON file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: VersioningConfig = serde_json::from_str(&data)
            .map_err(|e| VersionError::Config(format!("Failed to parse {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as JSON, atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Reject settings the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(VersionError::Config("base_dir must not be empty".to_string()));
        }
        if self.max_chain_length == 0 && self.default_policy == VersioningPolicy::DiffBased {
            return Err(VersionError::Config(
                "diff_based policy needs max_chain_length > 0".to_string(),
            ));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(VersionError::Config(format!(
                "compression_level {} outside 1..=22",
                self.compression_level
            )));
        }
        if self.lock_timeout.is_zero() {
            return Err(VersionError::Config("lock_timeout must be positive".to_string()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(VersionError::Config("cleanup_interval must be positive".to_string()));
        }
        for pattern in self.include_patterns.iter().chain(&self.exclude_patterns) {
            glob::Pattern::new(pattern)
                .map_err(|e| VersionError::Config(format!("Bad glob {:?}: {}", pattern, e)))?;
        }
        Ok(())
    }

    /// Whether a path passes the include/exclude filters. Callers apply this
    /// before handing content to the engine.
    pub fn should_version(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        let matches = |patterns: &[String]| {
            patterns.iter().any(|p| {
                glob::Pattern::new(p)
                    .map(|pat| pat.matches(path) || pat.matches(&format!("/{}", path)))
                    .unwrap_or(false)
            })
        };
        let included = self.include_patterns.is_empty() || matches(&self.include_patterns);
        included && !matches(&self.exclude_patterns)
    }

    /// Whether a change to `path` should be captured without an explicit
    /// request
    pub fn should_auto_version(&self, path: &str) -> bool {
        self.auto_create_versions && self.should_version(path)
    }

    /// Whether an extension is on the text allow-list
    pub fn is_text_extension(&self, ext: &str) -> bool {
        self.text_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        let config = VersioningConfig::default();
        assert_eq!(config.default_policy, VersioningPolicy::Hybrid);
        assert!(!config.suppress_noop_versions);
        assert!(config.create_version_on_restore);
        config.validate().unwrap();
    }

    #[test]
    fn test_json_roundtrip_with_humantime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fvault.json");

        let config = VersioningConfig::new(dir.path().join("store"))
            .with_retention(Duration::from_secs(7 * 24 * 3600))
            .with_policy(VersioningPolicy::FullCopy);
        config.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"full_copy\""));
        assert!(text.contains("7days"));

        let loaded = VersioningConfig::load(&path).unwrap();
        assert_eq!(loaded.retention_duration, config.retention_duration);
        assert_eq!(loaded.default_policy, VersioningPolicy::FullCopy);
        assert_eq!(loaded.base_dir, config.base_dir);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: VersioningConfig =
            serde_json::from_str(r#"{"retention_duration": "2h", "default_policy": "diff_based"}"#).unwrap();
        assert_eq!(config.retention_duration, Duration::from_secs(7200));
        assert_eq!(config.default_policy, VersioningPolicy::DiffBased);
        assert_eq!(config.max_chain_length, 20);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = VersioningConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.max_versions_per_file, 100);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = VersioningConfig::default();
        config.compression_level = 40;
        assert!(config.validate().is_err());

        let mut config = VersioningConfig::default();
        config.exclude_patterns = vec!["[".to_string()];
        assert!(matches!(config.validate(), Err(VersionError::Config(_))));

        let config = VersioningConfig::default()
            .with_policy(VersioningPolicy::DiffBased)
            .with_max_chain_length(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_include_exclude_filters() {
        let mut config = VersioningConfig::default();
        assert!(config.should_version("docs/notes.md"));
        assert!(!config.should_version("repo/.git/config"));
        assert!(!config.should_version("build/out.tmp"));

        config.include_patterns = vec!["docs/**".to_string()];
        assert!(config.should_version("docs/a/b.md"));
        assert!(!config.should_version("src/main.rs"));

        assert!(config.should_auto_version("docs/a/b.md"));
        config.auto_create_versions = false;
        assert!(!config.should_auto_version("docs/a/b.md"));
        assert!(config.should_version("docs/a/b.md"));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("hybrid".parse::<VersioningPolicy>().unwrap(), VersioningPolicy::Hybrid);
        assert_eq!("full-copy".parse::<VersioningPolicy>().unwrap(), VersioningPolicy::FullCopy);
        assert_eq!("diff".parse::<VersioningPolicy>().unwrap(), VersioningPolicy::DiffBased);
        assert!("zip".parse::<VersioningPolicy>().is_err());
    }

    #[test]
    fn test_text_extension_lookup() {
        let config = VersioningConfig::default();
        assert!(config.is_text_extension("MD"));
        assert!(!config.is_text_extension("png"));
    }
}
