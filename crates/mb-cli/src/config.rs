//! Configuration loading for the misp-bridge CLI.
//!
//! Recognized keys, all under `misp`:
//! - `misp.interval_secs`: seconds between synchronization ticks, default 3600
//! - `misp.case_template`: optional global default case template
//! - `misp.tags`: tags inherited by instances that declare none
//! - `misp.instances.<name>.url` / `.key`: required per instance
//! - `misp.instances.<name>.tags` / `.case_template`: optional overrides

use anyhow::{bail, Context, Result};
use mb_misp::{ApiKey, InstanceConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub misp: MispSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// The `misp` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MispSection {
    /// Seconds between synchronization ticks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Global default case template.
    #[serde(default)]
    pub case_template: Option<String>,
    /// Tags inherited by instances without their own.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Configured instances by name.
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceSection>,
}

impl Default for MispSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            case_template: None,
            tags: Vec::new(),
            instances: BTreeMap::new(),
        }
    }
}

/// One configured instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSection {
    pub url: String,
    pub key: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub case_template: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// The `logging` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json: false,
            level: default_log_level(),
        }
    }
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, instance) in &self.misp.instances {
            if instance.url.is_empty() {
                bail!("misp.instances.{name}.url is required");
            }
            if instance.key.is_empty() {
                bail!("misp.instances.{name}.key is required");
            }
        }
        Ok(())
    }

    /// Time between synchronization ticks.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.misp.interval_secs)
    }

    /// Resolves the instance sections into connector configurations,
    /// applying the tag and case-template inheritance rules.
    pub fn instance_configs(&self) -> Vec<InstanceConfig> {
        self.misp
            .instances
            .iter()
            .map(|(name, instance)| InstanceConfig {
                name: name.clone(),
                base_url: instance.url.clone(),
                api_key: ApiKey::new(instance.key.clone()),
                case_template: instance
                    .case_template
                    .clone()
                    .or_else(|| self.misp.case_template.clone()),
                artifact_tags: instance
                    .tags
                    .clone()
                    .unwrap_or_else(|| self.misp.tags.clone()),
                timeout_secs: instance.timeout_secs,
                max_retries: instance.max_retries,
            })
            .collect()
    }

    /// A copy safe to print: API keys are replaced.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for instance in config.misp.instances.values_mut() {
            if !instance.key.is_empty() {
                instance.key = "***REDACTED***".to_string();
            }
        }
        config
    }
}
