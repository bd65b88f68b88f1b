//! Configured MISP instances.
//!
//! The registry owns every [`InstanceConfig`] for the process lifetime and
//! pairs each with its API client. Instance names are stable; credentials
//! never appear in logs (see [`crate::secret::ApiKey`]).

use crate::client::{MispApi, MispClient};
use crate::error::{SyncError, SyncResult};
use crate::secret::ApiKey;
use mb_core::TempStore;
use std::sync::Arc;

/// A configured MISP server.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Unique instance name; used as the alert `source`.
    pub name: String,
    pub base_url: String,
    pub api_key: ApiKey,
    /// Case template applied to alerts from this instance.
    pub case_template: Option<String>,
    /// Tags stamped onto every observable ingested from this instance.
    pub artifact_tags: Vec<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// One configured instance together with its API client.
#[derive(Clone)]
pub struct MispInstance {
    pub config: InstanceConfig,
    pub api: Arc<dyn MispApi>,
}

impl std::fmt::Debug for MispInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MispInstance")
            .field("config", &self.config)
            .finish()
    }
}

/// Holds the set of configured MISP instances.
#[derive(Debug)]
pub struct InstanceRegistry {
    instances: Vec<MispInstance>,
}

impl InstanceRegistry {
    /// Builds HTTP clients for every configuration. Fails on the first
    /// invalid configuration; a partially usable registry is worse than a
    /// startup error.
    pub fn from_configs(
        configs: Vec<InstanceConfig>,
        temp: Arc<TempStore>,
    ) -> SyncResult<Self> {
        let mut instances = Vec::with_capacity(configs.len());
        for config in configs {
            if config.name.is_empty() || config.base_url.is_empty() {
                return Err(SyncError::Config(
                    "instance name and url are required".to_string(),
                ));
            }
            let api: Arc<dyn MispApi> = Arc::new(MispClient::new(&config, Arc::clone(&temp))?);
            instances.push(MispInstance { config, api });
        }
        Ok(Self { instances })
    }

    /// Assembles a registry from pre-built instances (tests inject scripted
    /// servers here).
    pub fn with_instances(instances: Vec<MispInstance>) -> Self {
        Self { instances }
    }

    /// Looks up an instance by name.
    pub fn get(&self, name: &str) -> SyncResult<&MispInstance> {
        self.instances
            .iter()
            .find(|i| i.config.name == name)
            .ok_or_else(|| SyncError::Config(format!("unknown MISP instance: {name}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MispInstance> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
