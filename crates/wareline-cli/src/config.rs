//! Configuration loading from TOML files

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use wareline_core::{PipelineConfig, RetryPolicy, TransactionScope};
use wareline_sources::{CatalogConfig, FeedConfig, StatsConfig};

/// Global configuration for wareline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineSection,
    pub warehouse: WarehouseConfig,
    pub catalog: CatalogConfig,
    pub stats: StatsConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub batch_size: usize,
    #[serde(flatten)]
    pub retry: RetryPolicy,
    pub transaction_scope: TransactionScope,
    /// Raw pages of network runs are archived here (`""` disables)
    pub archive_dir: PathBuf,
    /// Run summaries are written here as `<run_id>.json` (`""` disables)
    pub audit_dir: PathBuf,
    /// Extra load-order edges, `entity = ["depends_on", ...]`
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            batch_size: wareline_core::load::DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            transaction_scope: TransactionScope::default(),
            archive_dir: PathBuf::from("data/archive"),
            audit_dir: PathBuf::from("data/runs"),
            dependencies: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub path: PathBuf,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./warehouse.duckdb"),
        }
    }
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

/// Expand in place; an unset variable leaves the value empty.
fn expand_in_place(value: &mut String) {
    *value = expand_env_var(value).unwrap_or_default();
}

fn non_empty(path: &Path) -> Option<PathBuf> {
    (!path.as_os_str().is_empty()).then(|| path.to_path_buf())
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./wareline.toml (current directory)
    /// 2. ~/.config/wareline/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("wareline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "wareline") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default().resolved())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config.resolved())
    }

    /// Expand `${VAR}` secrets; catalog credentials fall back to
    /// `CATALOG_CLIENT_ID` / `CATALOG_CLIENT_SECRET`.
    fn resolved(mut self) -> Self {
        expand_in_place(&mut self.catalog.client_id);
        expand_in_place(&mut self.catalog.client_secret);
        expand_in_place(&mut self.catalog.playlist_id);
        if self.catalog.client_id.is_empty() {
            self.catalog.client_id = std::env::var("CATALOG_CLIENT_ID").unwrap_or_default();
        }
        if self.catalog.client_secret.is_empty() {
            self.catalog.client_secret = std::env::var("CATALOG_CLIENT_SECRET").unwrap_or_default();
        }
        self
    }

    /// Pipeline settings for one run; `archive` enables raw page archiving.
    pub fn pipeline_config(&self, archive: bool) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.pipeline.batch_size,
            retry: self.pipeline.retry,
            transaction_scope: self.pipeline.transaction_scope,
            dependencies: self.pipeline.dependencies.clone(),
            start_cursor: None,
            archive_dir: if archive {
                non_empty(&self.pipeline.archive_dir)
            } else {
                None
            },
            audit_dir: non_empty(&self.pipeline.audit_dir),
            canonical_out: None,
        }
    }
}
