use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    broker_datastore::{BrokerConfig, DatastoreConfig},
    coordinator_worker::{CoordinatorConfig, WorkerConfig},
    observability::{LoggingConfig, ObservabilityConfig},
};

/// Prefix of environment variable overrides, e.g.
/// `ORCHESTRATOR__BROKER__TYPE=rabbitmq`.
pub const ENV_PREFIX: &str = "ORCHESTRATOR";
pub const ENV_SEPARATOR: &str = "__";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub datastore: DatastoreConfig,
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format), when given or found at a default path
    /// 3. Environment variable overrides (prefix: `ORCHESTRATOR__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("failed to build defaults")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("config file does not exist: {path}"));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/orchestrator.toml", "orchestrator.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration to TOML")
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate().context("invalid broker configuration")?;
        self.datastore
            .validate()
            .context("invalid datastore configuration")?;
        self.coordinator
            .validate()
            .context("invalid coordinator configuration")?;
        self.worker.validate().context("invalid worker configuration")?;
        self.logging
            .validate()
            .context("invalid logging configuration")?;
        self.observability
            .validate()
            .context("invalid observability configuration")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueuePolicyKind, RuntimeType};
    use crate::traits::HandlerErrorPolicy;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.r#type, "inmemory");
        assert_eq!(config.datastore.r#type, "inmemory");
        assert_eq!(config.worker.queues.get("default"), Some(&1));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [broker]
            type = "rabbitmq"
            error_policy = "drop"

            [coordinator]
            queue_policy = "capability"

            [coordinator.retry]
            default_limit = 2

            [worker.queues]
            gpu = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.r#type, "rabbitmq");
        assert_eq!(config.broker.error_policy, HandlerErrorPolicy::Drop);
        assert_eq!(config.broker.max_redeliveries, 3);
        assert_eq!(config.coordinator.queue_policy, QueuePolicyKind::Capability);
        assert_eq!(config.coordinator.retry.default_limit, 2);
        assert!(config.coordinator.retry.retry_on_timeout);
        assert_eq!(config.worker.queues.get("gpu"), Some(&4));
        assert_eq!(config.worker.runtime, RuntimeType::Shell);
    }

    #[test]
    fn test_invalid_log_format_is_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [logging]
            format = "xml"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [worker]
            name = "node-a"
            heartbeat_interval_seconds = 5
            "#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.worker.name.as_deref(), Some("node-a"));
        assert_eq!(config.worker.heartbeat_interval_seconds, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/orchestrator.toml")).is_err());
    }

    #[test]
    fn test_toml_roundtrip_for_print_config() {
        let config = AppConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[broker]"));
        let parsed = AppConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.coordinator.default_queue, config.coordinator.default_queue);
    }
}
