use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!(
                "invalid log level: {}, expected one of {:?}",
                self.level,
                valid_levels
            ));
        }
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(anyhow::anyhow!(
                "invalid log format: {}, expected one of {:?}",
                self.format,
                valid_formats
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Prometheus scrape address, e.g. `0.0.0.0:9000`. Metrics are not
    /// exported when unset.
    pub metrics_address: Option<String>,
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(address) = &self.metrics_address {
            address
                .parse::<std::net::SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid metrics address {address}: {e}"))?;
        }
        Ok(())
    }
}
