use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::hasher::{ContentHasher, DEFAULT_MAX_BYTES};
use crate::relevance::RelevanceScorer;
use crate::storage::ManifestStore;
use crate::temporal::{TemporalEnhancer, TimeBucket};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub hashing: HashingConfig,
    #[serde(default)]
    pub temporal: TemporalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub portfolio: PortfolioConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManifestConfig {
    pub path: PathBuf,
    /// Defaults to a `backups/` directory next to `path`.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
}

fn default_backup_retention() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct HashingConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

fn default_max_bytes() -> usize {
    DEFAULT_MAX_BYTES
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemporalConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bucket")]
    pub bucket: TimeBucket,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket: TimeBucket::Document,
        }
    }
}

fn default_enabled() -> bool {
    true
}
fn default_bucket() -> TimeBucket {
    TimeBucket::Document
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            workers: default_workers(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.json".to_string(),
        "**/*.eml".to_string(),
        "**/*.txt".to_string(),
        "**/*.md".to_string(),
    ]
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PortfolioConfig {
    #[serde(default)]
    pub holdings: Vec<String>,
    /// holding → related tickers.
    #[serde(default)]
    pub ecosystem: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Config with every section defaulted, rooted at `manifest_path`.
    pub fn with_manifest_path(manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest: ManifestConfig {
                path: manifest_path.into(),
                backup_dir: None,
                backup_retention: default_backup_retention(),
            },
            hashing: HashingConfig::default(),
            temporal: TemporalConfig::default(),
            ingest: IngestConfig::default(),
            portfolio: PortfolioConfig::default(),
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        match &self.manifest.backup_dir {
            Some(dir) => dir.clone(),
            None => self
                .manifest
                .path
                .parent()
                .map(|p| p.join("backups"))
                .unwrap_or_else(|| PathBuf::from("backups")),
        }
    }

    pub fn manifest_store(&self) -> ManifestStore {
        ManifestStore::new(
            self.manifest.path.clone(),
            self.backup_dir(),
            self.manifest.backup_retention,
        )
    }

    pub fn hasher(&self) -> ContentHasher {
        ContentHasher::new(self.hashing.max_bytes)
    }

    /// `None` when temporal enhancement is switched off.
    pub fn enhancer(&self) -> Option<TemporalEnhancer> {
        self.temporal
            .enabled
            .then(|| TemporalEnhancer::new(self.temporal.bucket))
    }

    pub fn scorer(&self) -> RelevanceScorer {
        RelevanceScorer::new(&self.portfolio.holdings, &self.portfolio.ecosystem)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.manifest.path.as_os_str().is_empty() {
        anyhow::bail!("manifest.path must not be empty");
    }
    if config.manifest.backup_retention == 0 {
        anyhow::bail!("manifest.backup_retention must be >= 1");
    }

    if config.hashing.max_bytes == 0 {
        anyhow::bail!("hashing.max_bytes must be > 0");
    }

    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be >= 1");
    }
    if config.ingest.include_globs.is_empty() {
        anyhow::bail!("ingest.include_globs must list at least one pattern");
    }

    for (holding, related) in &config.portfolio.ecosystem {
        if holding.trim().is_empty() || related.iter().any(|t| t.trim().is_empty()) {
            anyhow::bail!("portfolio.ecosystem entries must be non-empty tickers");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(tmp: &TempDir, body: &str) -> PathBuf {
        let path = tmp.path().join("ice.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "[manifest]\npath = \"./data/manifest.json\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.manifest.backup_retention, 5);
        assert_eq!(config.hashing.max_bytes, DEFAULT_MAX_BYTES);
        assert_eq!(config.ingest.workers, 4);
        assert_eq!(config.temporal.bucket, TimeBucket::Document);
        assert_eq!(config.backup_dir(), PathBuf::from("./data/backups"));
        assert!(config.enhancer().is_some());
    }

    #[test]
    fn test_full_config() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            r#"
[manifest]
path = "m.json"
backup_dir = "bk"
backup_retention = 2

[temporal]
enabled = false
bucket = "quarter"

[ingest]
root = "./inbox"
workers = 8

[portfolio]
holdings = ["NVDA", "AMD"]

[portfolio.ecosystem]
NVDA = ["TSM", "ASML"]
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.backup_dir(), PathBuf::from("bk"));
        assert_eq!(config.temporal.bucket, TimeBucket::Quarter);
        assert!(config.enhancer().is_none());
        assert_eq!(config.ingest.workers, 8);
        assert_eq!(config.portfolio.ecosystem["NVDA"].len(), 2);
        assert_eq!(config.scorer().holdings().len(), 2);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "[manifest]\npath = \"m.json\"\n[ingest]\nworkers = 0\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("ingest.workers"));
    }

    #[test]
    fn test_rejects_unknown_bucket() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "[manifest]\npath = \"m.json\"\n[temporal]\nbucket = \"month\"\n");
        assert!(load_config(&path).is_err());
    }
}
