use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::engine::processor::DEFAULT_COMMAND_WORKERS;
use crate::s3::redirect::partition_suffix;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ssm-agent/config.yaml";
pub const DEFAULT_DATA_ROOT: &str = "/var/lib/ssm-agent";
const DEFAULT_HEALTH_INTERVAL_MINUTES: u64 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file `{0}`: {1}")]
    Read(PathBuf, io::Error),
    #[error("could not parse config file `{0}`: {1}")]
    Parse(PathBuf, serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Overrides the region from the registration record.
    #[serde(default)]
    pub region: Option<String>,

    /// Overrides the instance id from the registration record.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Message-service endpoint; defaults to the regional endpoint.
    #[serde(default)]
    pub message_service_endpoint: Option<Url>,

    /// Custom object-storage endpoint; never overwritten by the
    /// bucket-region resolver.
    #[serde(default)]
    pub object_storage_endpoint: Option<Url>,

    /// Clamped to [5, 60] by the health checker.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_minutes: u64,

    #[serde(default = "default_command_workers")]
    pub command_workers: usize,
}

fn default_data_root() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_ROOT)
}

fn default_health_interval() -> u64 {
    DEFAULT_HEALTH_INTERVAL_MINUTES
}

fn default_command_workers() -> usize {
    DEFAULT_COMMAND_WORKERS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            region: None,
            instance_id: None,
            message_service_endpoint: None,
            object_storage_endpoint: None,
            health_check_interval_minutes: default_health_interval(),
            command_workers: default_command_workers(),
        }
    }
}

impl AgentConfig {
    /// Loads the YAML config; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(ConfigError::Read(path.to_path_buf(), err)),
        };
        serde_yaml::from_str(&contents).map_err(|err| ConfigError::Parse(path.to_path_buf(), err))
    }

    /// The message-service endpoint for a region, partition-aware, unless an
    /// explicit endpoint is configured.
    pub fn message_service_endpoint(&self, region: &str) -> Url {
        if let Some(endpoint) = &self.message_service_endpoint {
            return endpoint.clone();
        }
        let suffix = partition_suffix(region);
        Url::parse(&format!("https://ssmmds.{region}.{suffix}/"))
            .expect("regional endpoint components are valid")
    }
}
