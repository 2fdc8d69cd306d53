//! Application configuration for MLS.
//!
//! User config lives at `~/.mls/mls.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{MlsError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "mls.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".mls";

// ---------------------------------------------------------------------------
// Config structs (matching mls.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Outline processing defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Gemini settings.
    #[serde(default)]
    pub gemini: GeminiConfig,

    /// Per-node generation pacing and retry.
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Addressing unit when it cannot be detected from the outline.
    #[serde(default)]
    pub granularity: crate::Granularity,

    /// What to do with gaps between sibling spans.
    #[serde(default)]
    pub gap_policy: GapPolicy,

    /// Field name the annotation is written under in the merged document.
    #[serde(default = "default_annotation_field")]
    pub annotation_field: String,

    /// Directory holding one artifact file per node.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            granularity: crate::Granularity::default(),
            gap_policy: GapPolicy::default(),
            annotation_field: default_annotation_field(),
            store_dir: default_store_dir(),
        }
    }
}

fn default_annotation_field() -> String {
    "annotation".into()
}
fn default_store_dir() -> String {
    "summaries".into()
}

/// Policy for sibling spans that leave part of the parent uncovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Gaps are span mismatches.
    #[default]
    Strict,
    /// Gaps are logged and reported as processing notes.
    Warn,
}

impl std::str::FromStr for GapPolicy {
    type Err = MlsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            other => Err(MlsError::config(format!(
                "unknown gap policy '{other}': expected 'strict' or 'warn'"
            ))),
        }
    }
}

/// `[gemini]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for node annotations.
    #[serde(default = "default_model")]
    pub model: String,

    /// REST endpoint root.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".into()
}
fn default_model() -> String {
    "gemini-2.0-flash".into()
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_temperature() -> f64 {
    0.1
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum summarizer calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay after each successful call, to stay under rate limits.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Attempts per node before it is recorded as a failure.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay; doubles on each further attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on a single retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            pacing_ms: default_pacing_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}
fn default_pacing_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.mls/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| MlsError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.mls/mls.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| MlsError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| MlsError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| MlsError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| MlsError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| MlsError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject values that would make a run misbehave rather than fail loudly.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    Url::parse(&config.gemini.base_url).map_err(|e| {
        MlsError::config(format!("invalid gemini.base_url '{}': {e}", config.gemini.base_url))
    })?;
    if config.generation.concurrency == 0 {
        return Err(MlsError::config("generation.concurrency must be at least 1"));
    }
    if config.generation.max_attempts == 0 {
        return Err(MlsError::config("generation.max_attempts must be at least 1"));
    }
    if config.defaults.annotation_field.trim().is_empty() {
        return Err(MlsError::config("defaults.annotation_field must not be empty"));
    }
    Ok(())
}

/// Read the Gemini API key from the env var named in config.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.gemini.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(MlsError::config(format!(
            "Gemini API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("store_dir"));
        assert!(toml_str.contains("GEMINI_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.generation.max_attempts, 3);
        assert_eq!(parsed.gemini.api_key_env, "GEMINI_API_KEY");
        assert_eq!(parsed.defaults.gap_policy, GapPolicy::Strict);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
granularity = "lines"
gap_policy = "warn"
annotation_field = "summary"

[generation]
concurrency = 4
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.granularity, crate::Granularity::Lines);
        assert_eq!(config.defaults.gap_policy, GapPolicy::Warn);
        assert_eq!(config.defaults.annotation_field, "summary");
        assert_eq!(config.defaults.store_dir, "summaries");
        assert_eq!(config.generation.concurrency, 4);
        assert_eq!(config.generation.pacing_ms, 1000);
        assert_eq!(config.gemini.model, "gemini-2.0-flash");
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.generation.concurrency = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn validation_rejects_bad_base_url() {
        let mut config = AppConfig::default();
        config.gemini.base_url = "not a url".into();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn api_key_resolution() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.gemini.api_key_env = "MLS_TEST_NONEXISTENT_KEY_12345".into();
        let result = resolve_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
