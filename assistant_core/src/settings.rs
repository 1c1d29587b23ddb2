//! Configuration management with environment variable support and validation.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Assistant identity and request ceiling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub request_timeout_ms: u64,
    /// User id used by the interactive CLI when none is given
    pub default_user: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "assistant".to_string(),
            request_timeout_ms: 30_000,
            default_user: "local".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Provider errors are retried at most this many times per handler.
pub const MAX_PROVIDER_RETRIES: u32 = 1;

/// Handler selection and invocation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Intents below this confidence are served by the top two handlers
    pub confidence_threshold: f32,
    pub handler_timeout_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub max_call_depth: usize,
    /// Extra attempts on the same handler after a provider error
    pub provider_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            handler_timeout_ms: 5_000,
            dispatch_timeout_ms: 15_000,
            max_call_depth: 4,
            provider_retries: 1,
        }
    }
}

impl DispatchConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

/// Event bus queueing and circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    pub queue_capacity: usize,
    pub delivery_timeout_ms: u64,
    pub failure_threshold: u32,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            delivery_timeout_ms: 2_000,
            failure_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub sweep_interval_seconds: u64,
    /// sled directory; storage and context stay in memory when unset
    pub persistence_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 60,
            persistence_path: None,
        }
    }
}

impl StorageConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub max_history: usize,
    pub relevant_limit: usize,
    pub embedding_dimensions: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_history: 10,
            relevant_limit: 5,
            embedding_dimensions: 256,
        }
    }
}

/// Native plugin loading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub directory: PathBuf,
    pub autoload: bool,
    pub allowed_extensions: Vec<String>,
    pub require_signatures: bool,
    pub allowlist_hashes: Vec<String>,
    pub max_plugin_size_mb: usize,
    pub enable_hot_reload: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("plugins"),
            autoload: false,
            allowed_extensions: vec![".so".to_string(), ".dll".to_string(), ".dylib".to_string()],
            require_signatures: true,
            allowlist_hashes: vec![],
            max_plugin_size_mb: 10,
            enable_hot_reload: false,
        }
    }
}

/// Grants installed at startup, written as `name` or `name:scope`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Granted to every user the first time they make a request
    pub default_user_grants: Vec<String>,
    /// Per-plugin grants, used for plugin-to-plugin calls
    #[serde(default)]
    pub plugin_grants: HashMap<String, Vec<String>>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            default_user_grants: vec!["file_read".to_string()],
            plugin_grants: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_thread_ids: bool,
    pub enable_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_thread_ids: false,
            enable_target: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub enable_tracing: bool,
    pub otlp_endpoint: Option<String>,
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub agent: AgentConfig,
    pub dispatch: DispatchConfig,
    pub events: EventsConfig,
    pub storage: StorageConfig,
    pub context: ContextConfig,
    pub plugins: PluginConfig,
    pub permissions: PermissionsConfig,
    pub logging: LoggingConfig,
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, `assistant.toml` and the
    /// environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like [`Settings::load`], with an extra file layered over the local one
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(File::with_name("assistant").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            // ASSISTANT_DISPATCH__HANDLER_TIMEOUT_MS=2000
            .add_source(
                Environment::with_prefix("ASSISTANT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("plugins.allowlist_hashes")
                    .with_list_parse_key("permissions.default_user_grants")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        let mut settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize settings")?;

        Self::apply_env_overrides(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    /// Short aliases for the most commonly overridden settings
    fn apply_env_overrides(settings: &mut Settings) {
        if let Ok(plugin_dir) = std::env::var("ASSISTANT_PLUGIN_DIR") {
            settings.plugins.directory = PathBuf::from(plugin_dir);
        }
        if let Ok(otlp_endpoint) = std::env::var("ASSISTANT_OTLP_ENDPOINT") {
            settings.observability.otlp_endpoint = Some(otlp_endpoint);
        }
        if let Ok(level) = std::env::var("ASSISTANT_LOG_LEVEL") {
            settings.logging.level = level;
        }
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if !(0.0..=1.0).contains(&d.confidence_threshold) {
            return Err(anyhow!(
                "dispatch.confidence_threshold must be within [0, 1], got {}",
                d.confidence_threshold
            ));
        }
        if d.handler_timeout_ms == 0 {
            return Err(anyhow!("dispatch.handler_timeout_ms cannot be 0"));
        }
        if d.handler_timeout_ms >= d.dispatch_timeout_ms {
            return Err(anyhow!(
                "dispatch.handler_timeout_ms ({}) must be shorter than dispatch.dispatch_timeout_ms ({})",
                d.handler_timeout_ms,
                d.dispatch_timeout_ms
            ));
        }
        if d.dispatch_timeout_ms > self.agent.request_timeout_ms {
            return Err(anyhow!(
                "dispatch.dispatch_timeout_ms ({}) cannot exceed agent.request_timeout_ms ({})",
                d.dispatch_timeout_ms,
                self.agent.request_timeout_ms
            ));
        }
        if d.max_call_depth == 0 {
            return Err(anyhow!("dispatch.max_call_depth cannot be 0"));
        }
        if d.provider_retries > MAX_PROVIDER_RETRIES {
            return Err(anyhow!(
                "dispatch.provider_retries ({}) cannot exceed {}",
                d.provider_retries,
                MAX_PROVIDER_RETRIES
            ));
        }

        if self.events.queue_capacity == 0 {
            return Err(anyhow!("events.queue_capacity cannot be 0"));
        }
        if self.events.failure_threshold == 0 {
            return Err(anyhow!("events.failure_threshold cannot be 0"));
        }
        if self.events.delivery_timeout_ms == 0 {
            return Err(anyhow!("events.delivery_timeout_ms cannot be 0"));
        }

        if self.storage.sweep_interval_seconds == 0 {
            return Err(anyhow!("storage.sweep_interval_seconds cannot be 0"));
        }
        if self.context.max_history == 0 {
            return Err(anyhow!("context.max_history cannot be 0"));
        }
        if self.context.relevant_limit == 0 {
            return Err(anyhow!("context.relevant_limit cannot be 0"));
        }

        if self.plugins.autoload && !self.plugins.directory.exists() {
            warn!("Plugin directory does not exist: {:?}", self.plugins.directory);
        }
        if self.plugins.require_signatures && self.plugins.autoload && self.plugins.allowlist_hashes.is_empty() {
            warn!("Plugin signatures are required but the allowlist is empty; no native plugin will load");
        }

        Ok(())
    }

    /// Check if a feature is enabled
    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        match feature {
            "hot_reload" => self.plugins.enable_hot_reload,
            "autoload" => self.plugins.autoload,
            "signatures" => self.plugins.require_signatures,
            "persistence" => self.storage.persistence_path.is_some(),
            "tracing" => self.observability.enable_tracing,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Settings {
        Settings::default()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_embedded_config_parses() {
        let settings = Settings::load().unwrap();
        assert_eq!(settings.dispatch.max_call_depth, 4);
        assert!(settings.dispatch.handler_timeout() < settings.dispatch.dispatch_timeout());
    }

    #[test]
    fn test_handler_timeout_must_be_shorter_than_dispatch_timeout() {
        let mut s = valid();
        s.dispatch.handler_timeout_ms = s.dispatch.dispatch_timeout_ms;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_dispatch_timeout_bounded_by_request_timeout() {
        let mut s = valid();
        s.agent.request_timeout_ms = s.dispatch.dispatch_timeout_ms - 1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_provider_retries_capped_at_one() {
        let mut s = valid();
        s.dispatch.provider_retries = 0;
        assert!(s.validate().is_ok());
        s.dispatch.provider_retries = 1;
        assert!(s.validate().is_ok());
        s.dispatch.provider_retries = 5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_threshold_and_capacities_are_checked() {
        let mut s = valid();
        s.dispatch.confidence_threshold = 1.5;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.events.queue_capacity = 0;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.context.max_history = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[context]\nmax_history = 3").unwrap();

        let settings = Settings::load_from(Some(&path)).unwrap();
        assert_eq!(settings.context.max_history, 3);
        assert_eq!(settings.context.relevant_limit, 5);
    }
}
