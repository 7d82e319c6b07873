//! Engine configuration loaded from an optional TOML file.

use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assets::{default_strip_suffixes, AssetOptions, DEFAULT_CATALOG_FILE, MAX_ASSET_BYTES};
use crate::error::ConfigError;
use crate::generation::{AspectRatio, GenerationParams, RetryPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Image provider endpoint and retry settings.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Candidate fan-out and feedback loop budget.
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Logo loading rules.
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
            model: None,
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:8080/v1/images".to_string()
}

fn default_api_key_env() -> String {
    "PROMPTFORGE_API_KEY".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Reinforce the file-name instruction after a leak was observed.
    #[serde(default = "default_true")]
    pub strengthen_on_retry: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            aspect_ratio: default_aspect_ratio(),
            size: default_size(),
            max_attempts: default_max_attempts(),
            strengthen_on_retry: default_true(),
        }
    }
}

fn default_count() -> usize {
    2
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}

fn default_size() -> String {
    "2K".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetsConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_catalog_file")]
    pub catalog_file: String,
    /// File name to logo name.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default = "default_strip_suffixes")]
    pub strip_suffixes: Vec<String>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            catalog_file: default_catalog_file(),
            aliases: BTreeMap::new(),
            strip_suffixes: default_strip_suffixes(),
        }
    }
}

fn default_max_bytes() -> u64 {
    MAX_ASSET_BYTES
}

fn default_catalog_file() -> String {
    DEFAULT_CATALOG_FILE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { dir: default_output_dir() }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

impl AppConfig {
    /// Load from `path`, or fall back to defaults when none is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            debug!("No configuration file given, using defaults");
            return Ok(Self::default());
        };
        info!(path = path.display().to_string(); "Loading configuration");
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation.count == 0 {
            return Err(ConfigError::Invalid {
                field: "generation.count",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.generation.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "generation.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.provider.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "provider.max_retries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.assets.max_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "assets.max_bytes",
                reason: "must be positive".to_string(),
            });
        }
        self.aspect_ratio()?;
        Ok(())
    }

    pub fn aspect_ratio(&self) -> Result<AspectRatio, ConfigError> {
        self.generation
            .aspect_ratio
            .parse()
            .map_err(|reason| ConfigError::Invalid { field: "generation.aspect_ratio", reason })
    }

    pub fn generation_params(&self) -> Result<GenerationParams, ConfigError> {
        Ok(GenerationParams {
            count: self.generation.count,
            aspect_ratio: self.aspect_ratio()?,
            size: self.generation.size.clone(),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.provider.max_retries,
            base_delay: Duration::from_millis(self.provider.retry_delay_ms),
            max_delay: Duration::from_millis(self.provider.max_retry_delay_ms),
        }
    }

    pub fn asset_options(&self) -> AssetOptions {
        AssetOptions {
            max_bytes: self.assets.max_bytes,
            catalog_file: self.assets.catalog_file.clone(),
            aliases: self.assets.aliases.clone(),
            strip_suffixes: self.assets.strip_suffixes.clone(),
        }
    }
}
