//! chemist.toml configuration parser.
//!
//! Keys are kebab-case. Durations are strings ("500ms", "2s", "2m") parsed
//! by [`crate::duration::parse_duration`]; they are validated at load time so
//! a malformed file fails the bootstrap instead of a background loop.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::duration::parse_duration;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_INVESTIGATION_BASE: Duration = Duration::from_millis(500);
const DEFAULT_INVESTIGATION_CAP: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChemistConfig {
    pub network: NetworkConfig,
    /// Which placement strategy assigns targets to flasks.
    pub sharding_strategy: StrategyKind,
    /// Upper bound on every outbound HTTP request to a flask.
    pub command_timeout: String,
    /// Consecutive failed probes before a flask is declared lost.
    pub max_investigating_retries: u32,
    /// First investigation back-off delay.
    pub investigation_base_delay: String,
    /// Ceiling for investigation back-off delays.
    pub investigation_max_delay: String,
    /// URI templates expanded against a discovered instance's host/port.
    pub target_resource_templates: Vec<String>,
    /// Static seed targets, keyed by instance id.
    pub instances: HashMap<String, InstanceSeed>,
    /// Static seed flasks, keyed by flask id.
    pub flasks: HashMap<String, FlaskSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NetworkConfig {
    /// Bind host for the admin HTTP server.
    pub host: String,
    /// Bind port for the admin HTTP server.
    pub port: u16,
    /// Telemetry port assumed for flasks discovered from the cloud.
    pub funnel_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Random,
    #[default]
    LeastLoaded,
}

/// A statically configured target.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct InstanceSeed {
    pub cluster_name: String,
    pub uris: Vec<String>,
}

/// A statically configured flask.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FlaskSeed {
    pub location: LocationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LocationConfig {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub datacenter: String,
    pub intent: String,
    pub target_resource_templates: Vec<String>,
}

impl Default for ChemistConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            sharding_strategy: StrategyKind::default(),
            command_timeout: "2s".to_string(),
            max_investigating_retries: 11,
            investigation_base_delay: "500ms".to_string(),
            investigation_max_delay: "2m".to_string(),
            target_resource_templates: Vec::new(),
            instances: HashMap::new(),
            flasks: HashMap::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 64529,
            funnel_port: 5775,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5775,
            protocol: "http".to_string(),
            datacenter: "unknown".to_string(),
            intent: "mirroring".to_string(),
            target_resource_templates: Vec::new(),
        }
    }
}

impl ChemistConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: ChemistConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would otherwise fail deep inside a background loop.
    fn validate(&self) -> anyhow::Result<()> {
        for (field, value) in [
            ("command-timeout", &self.command_timeout),
            ("investigation-base-delay", &self.investigation_base_delay),
            ("investigation-max-delay", &self.investigation_max_delay),
        ] {
            if parse_duration(value).is_none() {
                anyhow::bail!("invalid duration for {field}: {value:?}");
            }
        }
        if self.max_investigating_retries == 0 {
            anyhow::bail!("max-investigating-retries must be at least 1");
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        parse_duration(&self.command_timeout).unwrap_or(DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn investigation_base_delay(&self) -> Duration {
        parse_duration(&self.investigation_base_delay).unwrap_or(DEFAULT_INVESTIGATION_BASE)
    }

    pub fn investigation_max_delay(&self) -> Duration {
        parse_duration(&self.investigation_max_delay).unwrap_or(DEFAULT_INVESTIGATION_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ChemistConfig::default();
        assert_eq!(config.sharding_strategy, StrategyKind::LeastLoaded);
        assert_eq!(config.command_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_investigating_retries, 11);
        assert_eq!(config.network.funnel_port, 5775);
        assert_eq!(config.investigation_base_delay(), Duration::from_millis(500));
        assert_eq!(config.investigation_max_delay(), Duration::from_secs(120));
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
sharding-strategy = "random"
command-timeout = "5s"
max-investigating-retries = 3
target-resource-templates = ["http://@host:@port/stream/previous"]

[network]
host = "127.0.0.1"
port = 9000
funnel-port = 7000

[instances.i-target1]
cluster-name = "web"
uris = ["http://10.0.0.2:1234/stream/previous"]

[flasks.f1.location]
host = "10.0.0.1"
port = 5775
protocol = "http"
datacenter = "us-east-1a"
intent = "mirroring"
target-resource-templates = ["http://@host:@port/stream/previous"]
"#;
        let config = ChemistConfig::from_str(toml_str).unwrap();
        assert_eq!(config.sharding_strategy, StrategyKind::Random);
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_investigating_retries, 3);
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.instances["i-target1"].cluster_name, "web");
        assert_eq!(config.flasks["f1"].location.host, "10.0.0.1");
        assert_eq!(
            config.flasks["f1"].location.target_resource_templates,
            vec!["http://@host:@port/stream/previous"]
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = ChemistConfig::from_str("").unwrap();
        assert!(config.flasks.is_empty());
        assert!(config.instances.is_empty());
        assert_eq!(config.network.port, 64529);
    }

    #[test]
    fn rejects_bad_duration() {
        let result = ChemistConfig::from_str(r#"command-timeout = "eventually""#);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_retries() {
        let result = ChemistConfig::from_str("max-investigating-retries = 0");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_strategy() {
        let result = ChemistConfig::from_str(r#"sharding-strategy = "round-robin""#);
        assert!(result.is_err());
    }
}
