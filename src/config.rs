//! TOML configuration.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! See `config/shelf.example.toml` for a complete file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use shelfwise_core::dispatch::{DispatchSettings, ExhaustionPolicy};
use shelfwise_core::error::ConfigurationError;
use shelfwise_core::quality::DEFAULT_FAILURE_PHRASES;
use shelfwise_core::sanitize::DEFAULT_ROLE_MARKERS;
use shelfwise_core::schema::{BRANDS_TABLE, ITEMS_TABLE, PRODUCTS_TABLE};

/// Environment variable consulted when `[primary].url` is not set.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub primary: PrimaryConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub handlers: HandlersConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PrimaryConfig {
    /// PostgreSQL connection string. Falls back to `$DATABASE_URL`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Retries of a call that failed on connectivity, before the router
    /// gives up on the primary.
    #[serde(default = "default_primary_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further one.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            max_connections: default_max_connections(),
            max_retries: default_primary_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl PrimaryConfig {
    /// The configured url, or `$DATABASE_URL`. Blank values count as unset.
    pub fn resolved_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| std::env::var(DATABASE_URL_ENV).ok())
            .filter(|u| !u.trim().is_empty())
    }
}

fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_max_connections() -> u32 {
    5
}
fn default_primary_max_retries() -> u32 {
    2
}
fn default_retry_interval_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct MirrorConfig {
    #[serde(default)]
    pub enabled: bool,
    /// SQLite file holding the mirror.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Plain-text `pg_dump` output the mirror is rebuilt from.
    #[serde(default)]
    pub dump_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_role_markers")]
    pub role_markers: Vec<String>,
    /// Tables that must exist after a rebuild for it to be installed.
    #[serde(default = "default_required_tables")]
    pub required_tables: Vec<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            dump_path: None,
            auto_sync: true,
            sync_interval_secs: default_sync_interval_secs(),
            role_markers: default_role_markers(),
            required_tables: default_required_tables(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_sync_interval_secs() -> u64 {
    300
}
fn default_role_markers() -> Vec<String> {
    DEFAULT_ROLE_MARKERS.iter().map(|s| s.to_string()).collect()
}
fn default_required_tables() -> Vec<String> {
    [ITEMS_TABLE, PRODUCTS_TABLE, BRANDS_TABLE]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default)]
    pub score_floor: f64,
    #[serde(default = "default_on_exhaustion")]
    pub on_exhaustion: ExhaustionPolicy,
    #[serde(default = "default_failure_phrases")]
    pub failure_phrases: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: default_acceptance_threshold(),
            max_attempts: default_max_attempts(),
            score_floor: 0.0,
            on_exhaustion: default_on_exhaustion(),
            failure_phrases: default_failure_phrases(),
        }
    }
}

impl DispatchConfig {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            acceptance_threshold: self.acceptance_threshold,
            max_attempts: self.max_attempts,
            score_floor: self.score_floor,
            on_exhaustion: self.on_exhaustion,
        }
    }
}

fn default_acceptance_threshold() -> f64 {
    0.5
}
fn default_max_attempts() -> usize {
    3
}
fn default_on_exhaustion() -> ExhaustionPolicy {
    ExhaustionPolicy::Degrade
}
fn default_failure_phrases() -> Vec<String> {
    DEFAULT_FAILURE_PHRASES.iter().map(|s| s.to_string()).collect()
}

/// Tuning for the built-in handlers.
#[derive(Debug, Deserialize, Clone)]
pub struct HandlersConfig {
    /// Row cap for inventory lookups.
    #[serde(default = "default_lookup_limit")]
    pub lookup_limit: i64,
    /// Rows shown before an aggregate reply is truncated.
    #[serde(default = "default_aggregate_max_rows")]
    pub aggregate_max_rows: usize,
    /// Products returned by a semantic search.
    #[serde(default = "default_semantic_limit")]
    pub semantic_limit: usize,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            lookup_limit: default_lookup_limit(),
            aggregate_max_rows: default_aggregate_max_rows(),
            semantic_limit: default_semantic_limit(),
        }
    }
}

fn default_lookup_limit() -> i64 {
    10
}
fn default_aggregate_max_rows() -> usize {
    20
}
fn default_semantic_limit() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `disabled` or `openai` (any OpenAI-compatible endpoint).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_temperature() -> f64 {
    0.2
}
fn default_max_tokens() -> u32 {
    512
}

/// Embedding provider for semantic product search.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled` or `openai` (any OpenAI-compatible endpoint).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Vector length the model produces; must match the `embedding` column.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Texts per request when indexing.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_batch_size() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Check cross-field constraints. Any failure is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let d = &self.dispatch;
        if !(0.0..=1.0).contains(&d.acceptance_threshold) {
            return Err(ConfigurationError::new(
                "dispatch.acceptance_threshold must be in [0.0, 1.0]",
            ));
        }
        if !(0.0..1.0).contains(&d.score_floor) {
            return Err(ConfigurationError::new(
                "dispatch.score_floor must be in [0.0, 1.0)",
            ));
        }
        if d.max_attempts == 0 {
            return Err(ConfigurationError::new("dispatch.max_attempts must be > 0"));
        }

        let m = &self.mirror;
        if m.enabled && m.path.is_none() {
            return Err(ConfigurationError::new(
                "mirror.path must be set when the mirror is enabled",
            ));
        }
        if m.enabled && m.auto_sync && m.sync_interval_secs == 0 {
            return Err(ConfigurationError::new(
                "mirror.sync_interval_secs must be > 0 when auto_sync is on",
            ));
        }

        if self.primary.max_connections == 0 {
            return Err(ConfigurationError::new("primary.max_connections must be > 0"));
        }
        if self.handlers.lookup_limit < 1 {
            return Err(ConfigurationError::new("handlers.lookup_limit must be >= 1"));
        }

        match self.llm.provider.as_str() {
            "disabled" => {}
            "openai" => {
                if self.llm.model.as_deref().map_or(true, |m| m.trim().is_empty()) {
                    return Err(ConfigurationError::new(
                        "llm.model must be specified when provider is 'openai'",
                    ));
                }
            }
            other => {
                return Err(ConfigurationError::new(format!(
                    "Unknown llm provider: '{}'. Must be disabled or openai.",
                    other
                )))
            }
        }

        let e = &self.embedding;
        match e.provider.as_str() {
            "disabled" => {}
            "openai" => {
                if e.model.as_deref().map_or(true, |m| m.trim().is_empty()) {
                    return Err(ConfigurationError::new(
                        "embedding.model must be specified when provider is 'openai'",
                    ));
                }
                if e.dims.map_or(true, |d| d == 0) {
                    return Err(ConfigurationError::new(
                        "embedding.dims must be > 0 when provider is 'openai'",
                    ));
                }
            }
            other => {
                return Err(ConfigurationError::new(format!(
                    "Unknown embedding provider: '{}'. Must be disabled or openai.",
                    other
                )))
            }
        }
        if e.batch_size == 0 {
            return Err(ConfigurationError::new("embedding.batch_size must be > 0"));
        }
        if self.handlers.semantic_limit == 0 {
            return Err(ConfigurationError::new("handlers.semantic_limit must be > 0"));
        }

        if self.server.request_timeout_secs == 0 {
            return Err(ConfigurationError::new(
                "server.request_timeout_secs must be > 0",
            ));
        }

        Ok(())
    }
}

/// Parse and validate a TOML document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.dispatch.acceptance_threshold, 0.5);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.on_exhaustion, ExhaustionPolicy::Degrade);
        assert!(!config.mirror.enabled);
        assert!(config.mirror.auto_sync);
        assert_eq!(config.mirror.sync_interval_secs, 300);
        assert_eq!(config.mirror.role_markers, vec!["rds_superuser", "rdsadmin"]);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(!config.llm.is_enabled());
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.primary.max_retries, 2);
        assert_eq!(config.primary.retry_interval_ms, 200);
    }

    #[test]
    fn test_full_config_parses() {
        let config = parse_config(
            r#"
            [primary]
            url = "postgres://shelf@localhost/inventory"

            [mirror]
            enabled = true
            path = "data/mirror.sqlite"
            dump_path = "data/dump.sql"
            sync_interval_secs = 60

            [dispatch]
            acceptance_threshold = 0.7
            max_attempts = 2
            on_exhaustion = "fail"

            [llm]
            provider = "openai"
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.primary.resolved_url().as_deref(),
            Some("postgres://shelf@localhost/inventory")
        );
        assert_eq!(config.mirror.path, Some(PathBuf::from("data/mirror.sqlite")));
        assert_eq!(config.dispatch.settings().max_attempts, 2);
        assert_eq!(config.dispatch.on_exhaustion, ExhaustionPolicy::Fail);
    }

    #[test]
    fn test_enabled_mirror_requires_path() {
        let err = parse_config("[mirror]\nenabled = true\n").unwrap_err();
        assert!(format!("{:#}", err).contains("mirror.path"));
    }

    #[test]
    fn test_threshold_out_of_range() {
        let err = parse_config("[dispatch]\nacceptance_threshold = 1.5\n").unwrap_err();
        assert!(format!("{:#}", err).contains("acceptance_threshold"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(parse_config("[dispatch]\nmax_attempts = 0\n").is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse_config("[llm]\nprovider = \"bedrock\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("Unknown llm provider"));
    }

    #[test]
    fn test_openai_requires_model() {
        assert!(parse_config("[llm]\nprovider = \"openai\"\n").is_err());
    }

    #[test]
    fn test_primary_retry_settings() {
        let config = parse_config("[primary]\nmax_retries = 0\nretry_interval_ms = 50\n").unwrap();
        assert_eq!(config.primary.max_retries, 0);
        assert_eq!(config.primary.retry_interval_ms, 50);
    }

    #[test]
    fn test_openai_embedding_requires_model_and_dims() {
        let err = parse_config("[embedding]\nprovider = \"openai\"\ndims = 3\n").unwrap_err();
        assert!(format!("{:#}", err).contains("embedding.model"));
        let err = parse_config(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("embedding.dims"));
        let config = parse_config(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
        )
        .unwrap();
        assert!(config.embedding.is_enabled());
        assert_eq!(config.embedding.batch_size, 64);
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let err = parse_config("[embedding]\nprovider = \"local\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("Unknown embedding provider"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/shelf.example.toml");
        let config = load_config(&path).unwrap();
        assert!(config.mirror.enabled);
        assert_eq!(config.handlers.lookup_limit, 10);
        assert_eq!(config.llm.provider, "disabled");
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_config(Path::new("/nonexistent/shelf.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }

    #[test]
    fn test_unknown_exhaustion_policy_rejected() {
        assert!(parse_config("[dispatch]\non_exhaustion = \"panic\"\n").is_err());
    }
}
