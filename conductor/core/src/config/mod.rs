//! TOML Configuration File Support
//!
//! Centralized configuration loading for the conversation engine, supporting
//! a TOML file at `~/.config/palaver/palaver.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! Configuration is resolved once at startup and is read-only afterwards.
//!
//! # Example Configuration
//!
//! ```toml
//! [endpoints.default]
//! base_url = "http://localhost:11434"
//! model = "llama3.1:8b"
//!
//! [endpoints.Cheap]
//! base_url = "http://localhost:11434"
//! model = "llama3.2:1b"
//!
//! [pool]
//! max_concurrent = 2
//! wait_timeout_secs = 90
//!
//! [image]
//! endpoint = "http://localhost:7860"
//! steps = 5
//! wait_timeout_secs = 200
//!
//! [fetch]
//! timeout_secs = 30
//!
//! [conversation]
//! persona = "Generalbot"
//! classifier = "structured"
//! max_output_tokens = 4000
//! keepalive_interval_secs = 240
//! ```
//!
//! The `default` endpoint key maps to the empty endpoint prefix; every other
//! key is used verbatim as a prefix (e.g. `"Cheap"`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Endpoint prefix of the full-quality model.
pub const DEFAULT_ENDPOINT_PREFIX: &str = "";

/// Endpoint prefix of the cheaper model used for bulk text work.
pub const CHEAP_ENDPOINT_PREFIX: &str = "Cheap";

/// Base URL of a local Ollama server.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// TOML key standing for [`DEFAULT_ENDPOINT_PREFIX`].
const DEFAULT_ENDPOINT_KEY: &str = "default";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// One `[endpoints.<prefix>]` table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointToml {
    /// Base URL of the model server
    pub base_url: Option<String>,

    /// Model identifier served at that URL
    pub model: Option<String>,
}

/// Pool section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolToml {
    /// Maximum simultaneously open backend clients
    pub max_concurrent: Option<usize>,

    /// Seconds to wait for a free slot (0 = wait forever)
    pub wait_timeout_secs: Option<u64>,
}

/// Image section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageToml {
    /// Base URL of the Stable Diffusion web UI
    pub endpoint: Option<String>,

    /// Sampling steps per image
    pub steps: Option<u32>,

    /// Seconds to wait for the image backend to become free (0 = forever)
    pub wait_timeout_secs: Option<u64>,

    /// Seconds before an image request is abandoned
    pub request_timeout_secs: Option<u64>,
}

/// Fetch section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchToml {
    /// Seconds before a web page fetch is abandoned
    pub timeout_secs: Option<u64>,
}

/// Conversation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationToml {
    /// Persona name (`Generalbot` or `Salesbot`)
    pub persona: Option<String>,

    /// Classifier strategy (`structured` or `letter`)
    pub classifier: Option<ClassifierStrategy>,

    /// Cap on generated tokens per completion
    pub max_output_tokens: Option<u32>,

    /// Seconds between keepalive pings (0 = disabled)
    pub keepalive_interval_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PalaverToml {
    /// Model endpoints keyed by prefix (`default` = empty prefix)
    pub endpoints: HashMap<String, EndpointToml>,

    /// Connection pool section
    pub pool: PoolToml,

    /// Image backend section
    pub image: ImageToml,

    /// Web fetch section
    pub fetch: FetchToml,

    /// Conversation section
    pub conversation: ConversationToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Which intent classifier drives routing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierStrategy {
    /// Rewrite + JSON intent extraction
    #[default]
    Structured,
    /// Single-letter category with majority vote
    Letter,
}

impl std::str::FromStr for ClassifierStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "structured" => Ok(Self::Structured),
            "letter" | "single-letter" | "legacy" => Ok(Self::Letter),
            other => Err(ConfigError::ValidationError(format!(
                "unknown classifier strategy: {other}"
            ))),
        }
    }
}

/// A model server and the model to request from it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Base URL, e.g. `http://localhost:11434`
    pub base_url: String,
    /// Model identifier
    pub model: String,
}

impl EndpointConfig {
    /// Create an endpoint
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

/// Connection pool settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum simultaneously open backend clients (at least 1)
    pub max_concurrent: usize,
    /// Default wait for a slot; `Duration::ZERO` waits forever
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            wait_timeout: Duration::from_secs(90),
        }
    }
}

/// Image backend settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageConfig {
    /// Base URL of the Stable Diffusion web UI
    pub endpoint: String,
    /// Sampling steps per image
    pub steps: u32,
    /// Wait for the single image slot; `Duration::ZERO` waits forever
    pub wait_timeout: Duration,
    /// HTTP timeout for one generation request
    pub request_timeout: Duration,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:7860".to_string(),
            steps: 5,
            wait_timeout: Duration::from_secs(200),
            request_timeout: Duration::from_secs(200),
        }
    }
}

/// Web fetch settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchConfig {
    /// Timeout for one page fetch
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Conversation behaviour settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationConfig {
    /// Persona name
    pub persona: String,
    /// Classifier strategy
    pub classifier: ClassifierStrategy,
    /// Cap on generated tokens per completion
    pub max_output_tokens: u32,
    /// Keepalive period, `None` disables the keepalive task
    pub keepalive_interval: Option<Duration>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            persona: "Generalbot".to_string(),
            classifier: ClassifierStrategy::Structured,
            max_output_tokens: crate::completion::DEFAULT_MAX_OUTPUT_TOKENS,
            keepalive_interval: Some(Duration::from_secs(240)),
        }
    }
}

/// Centralized configuration for the engine
///
/// Use [`load_config`] to load it with proper priority handling.
#[derive(Clone, Debug)]
pub struct PalaverConfig {
    /// Model endpoints keyed by prefix
    pub endpoints: HashMap<String, EndpointConfig>,
    /// Pool settings
    pub pool: PoolConfig,
    /// Image backend settings
    pub image: ImageConfig,
    /// Web fetch settings
    pub fetch: FetchConfig,
    /// Conversation settings
    pub conversation: ConversationConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for PalaverConfig {
    fn default() -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            DEFAULT_ENDPOINT_PREFIX.to_string(),
            EndpointConfig::new(DEFAULT_OLLAMA_URL, "llama3.1:8b"),
        );
        endpoints.insert(
            CHEAP_ENDPOINT_PREFIX.to_string(),
            EndpointConfig::new(DEFAULT_OLLAMA_URL, "llama3.2:1b"),
        );

        Self {
            endpoints,
            pool: PoolConfig::default(),
            image: ImageConfig::default(),
            fetch: FetchConfig::default(),
            conversation: ConversationConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl PalaverConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Endpoint registered for `prefix`
    #[must_use]
    pub fn endpoint(&self, prefix: &str) -> Option<&EndpointConfig> {
        self.endpoints.get(prefix)
    }

    /// Check invariants the engine relies on
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when the pool has no slots or
    /// the default endpoint is missing or blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "pool.max_concurrent must be at least 1".to_string(),
            ));
        }
        match self.endpoint(DEFAULT_ENDPOINT_PREFIX) {
            Some(endpoint) if !endpoint.base_url.trim().is_empty() && !endpoint.model.trim().is_empty() => {}
            _ => {
                return Err(ConfigError::ValidationError(
                    "a default endpoint with base_url and model is required".to_string(),
                ))
            }
        }
        if self.conversation.max_output_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "conversation.max_output_tokens must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/palaver/palaver.toml` or
/// `~/.config/palaver/palaver.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("palaver").join("palaver.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<PalaverConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<PalaverConfig, ConfigError> {
    let mut config = PalaverConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: PalaverToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut PalaverConfig, toml: &PalaverToml) {
    for (key, endpoint) in &toml.endpoints {
        let prefix = if key == DEFAULT_ENDPOINT_KEY {
            DEFAULT_ENDPOINT_PREFIX
        } else {
            key.as_str()
        };
        let entry = config
            .endpoints
            .entry(prefix.to_string())
            .or_insert_with(|| EndpointConfig::new("", ""));
        if let Some(ref base_url) = endpoint.base_url {
            entry.base_url.clone_from(base_url);
        }
        if let Some(ref model) = endpoint.model {
            entry.model.clone_from(model);
        }
    }

    if let Some(max) = toml.pool.max_concurrent {
        config.pool.max_concurrent = max;
    }
    if let Some(secs) = toml.pool.wait_timeout_secs {
        config.pool.wait_timeout = Duration::from_secs(secs);
    }

    if let Some(ref endpoint) = toml.image.endpoint {
        config.image.endpoint.clone_from(endpoint);
    }
    if let Some(steps) = toml.image.steps {
        config.image.steps = steps;
    }
    if let Some(secs) = toml.image.wait_timeout_secs {
        config.image.wait_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.image.request_timeout_secs {
        config.image.request_timeout = Duration::from_secs(secs);
    }

    if let Some(secs) = toml.fetch.timeout_secs {
        config.fetch.timeout = Duration::from_secs(secs);
    }

    if let Some(ref persona) = toml.conversation.persona {
        config.conversation.persona.clone_from(persona);
    }
    if let Some(strategy) = toml.conversation.classifier {
        config.conversation.classifier = strategy;
    }
    if let Some(tokens) = toml.conversation.max_output_tokens {
        config.conversation.max_output_tokens = tokens;
    }
    if let Some(secs) = toml.conversation.keepalive_interval_secs {
        config.conversation.keepalive_interval = (secs > 0).then(|| Duration::from_secs(secs));
    }
}

/// Apply environment variable overrides to the config
///
/// `lookup` resolves a variable name; production passes `std::env::var`.
fn apply_env_config(config: &mut PalaverConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("OLLAMA_HOST") {
        let base_url = if host.contains("://") {
            host
        } else {
            format!("http://{host}")
        };
        // Endpoints configured with another host keep it
        for endpoint in config
            .endpoints
            .values_mut()
            .filter(|e| e.base_url == DEFAULT_OLLAMA_URL)
        {
            endpoint.base_url.clone_from(&base_url);
        }
        config.source = ConfigSource::Env;
    }
    if let Some(model) = lookup("PALAVER_MODEL") {
        if let Some(endpoint) = config.endpoints.get_mut(DEFAULT_ENDPOINT_PREFIX) {
            endpoint.model = model;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(model) = lookup("PALAVER_CHEAP_MODEL") {
        if let Some(endpoint) = config.endpoints.get_mut(CHEAP_ENDPOINT_PREFIX) {
            endpoint.model = model;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(max) = lookup("PALAVER_MAX_CONCURRENT") {
        match max.parse::<usize>() {
            Ok(n) => {
                config.pool.max_concurrent = n;
                config.source = ConfigSource::Env;
            }
            Err(e) => {
                tracing::warn!(
                    value = %max,
                    error = %e,
                    "Ignoring invalid PALAVER_MAX_CONCURRENT"
                );
            }
        }
    }
    if let Some(endpoint) = lookup("PALAVER_IMAGE_ENDPOINT") {
        config.image.endpoint = endpoint;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Persona override
    pub persona: Option<String>,

    /// Classifier strategy override
    pub classifier: Option<ClassifierStrategy>,

    /// Default model override
    pub default_model: Option<String>,

    /// Max concurrent connections override
    pub max_concurrent: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set persona override
    #[must_use]
    pub fn with_persona(mut self, persona: String) -> Self {
        self.persona = Some(persona);
        self
    }

    /// Set classifier override
    #[must_use]
    pub fn with_classifier(mut self, classifier: ClassifierStrategy) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Set max concurrent override
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut PalaverConfig) {
        if self.persona.is_some()
            || self.classifier.is_some()
            || self.default_model.is_some()
            || self.max_concurrent.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref persona) = self.persona {
            config.conversation.persona.clone_from(persona);
        }
        if let Some(classifier) = self.classifier {
            config.conversation.classifier = classifier;
        }
        if let Some(ref model) = self.default_model {
            if let Some(endpoint) = config.endpoints.get_mut(DEFAULT_ENDPOINT_PREFIX) {
                endpoint.model.clone_from(model);
            }
        }
        if let Some(max) = self.max_concurrent {
            config.pool.max_concurrent = max;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
