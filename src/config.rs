use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::semantic::batch::{DEFAULT_BATCH_PAUSE, DEFAULT_BATCH_SIZE};
use crate::semantic::search::{
    SearchOptions, DEFAULT_FALLBACK_MAX_RESULTS, DEFAULT_ON_DEMAND_THRESHOLD,
    DEFAULT_PRECOMPUTED_THRESHOLD,
};
use crate::semantic::DEFAULT_MODEL;

const CONFIG_FILE: &str = "config.yaml";

/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Default number of cached text embeddings kept
const DEFAULT_CACHE_MAX_ENTRIES: usize = 5000;

/// Configuration for semantic similarity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Notes embedded concurrently by `index`
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between batches in milliseconds
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,

    /// Scores must be strictly above this in on-demand search
    #[serde(default = "default_on_demand_threshold")]
    pub on_demand_threshold: f32,

    /// Scores must be at least this in precomputed search
    #[serde(default = "default_precomputed_threshold")]
    pub precomputed_threshold: f32,

    /// Result cap when precomputed search falls back to on-demand
    #[serde(default = "default_fallback_max_results")]
    pub fallback_max_results: usize,

    /// Cached text embeddings kept before the oldest are evicted; 0 keeps all
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_pause_ms: default_batch_pause_ms(),
            on_demand_threshold: DEFAULT_ON_DEMAND_THRESHOLD,
            precomputed_threshold: DEFAULT_PRECOMPUTED_THRESHOLD,
            fallback_max_results: DEFAULT_FALLBACK_MAX_RESULTS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl SemanticSearchConfig {
    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            on_demand_threshold: self.on_demand_threshold,
            precomputed_threshold: self.precomputed_threshold,
            fallback_max_results: self.fallback_max_results,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("on_demand_threshold", self.on_demand_threshold),
            ("precomputed_threshold", self.precomputed_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                bail!("semantic_search.{name} must be between -1.0 and 1.0, got {value}");
            }
        }

        if self.batch_size == 0 {
            bail!("semantic_search.batch_size must be greater than 0");
        }

        if self.download_timeout_secs == 0 {
            bail!("semantic_search.download_timeout_secs must be greater than 0");
        }

        if self.model.trim().is_empty() {
            bail!("semantic_search.model must not be empty");
        }

        Ok(())
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_pause_ms() -> u64 {
    DEFAULT_BATCH_PAUSE.as_millis() as u64
}

fn default_on_demand_threshold() -> f32 {
    DEFAULT_ON_DEMAND_THRESHOLD
}

fn default_precomputed_threshold() -> f32 {
    DEFAULT_PRECOMPUTED_THRESHOLD
}

fn default_fallback_max_results() -> usize {
    DEFAULT_FALLBACK_MAX_RESULTS
}

fn default_cache_max_entries() -> usize {
    DEFAULT_CACHE_MAX_ENTRIES
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    /// Load `config.yaml` from `base_path`, creating it with defaults when
    /// missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config_path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !config_path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&config_path, defaults)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.semantic_search.validate()?;

        // resave in case new fields were added
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = self.base_path.join(CONFIG_FILE);
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&config_path, config_str)
            .with_context(|| format!("failed to write {}", config_path.display()))
    }
}
