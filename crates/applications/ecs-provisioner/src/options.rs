//! Operator options
//!
//! Layered, lowest priority first:
//! 1. Built-in defaults
//! 2. An optional options file (any format the `config` crate understands)
//! 3. Environment variables prefixed `ECS_PROVISIONER_` (e.g. `ECS_PROVISIONER_CLUSTER_ID`)

use config::{Config, ConfigError, Environment, File, Source};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ECS_PROVISIONER";

/// Default launch rate limiter burst
pub const DEFAULT_PROVISIONING_QPS: u32 = 200;

/// Default bound on one cloud API call outside `create`
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;

/// Options errors
#[derive(Error, Debug)]
pub enum OptionsError {
    /// File or environment could not be read or deserialized
    #[error("loading options: {0}")]
    Load(#[from] ConfigError),

    /// Values out of range
    #[error("invalid options: {0}")]
    Invalid(String),
}

/// Provider options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Managed cluster id; scopes the ownership tag
    pub cluster_id: String,

    /// Region all API calls target
    pub region: String,

    /// Launch rate limiter burst
    #[serde(default = "default_provisioning_qps")]
    pub provisioning_qps: u32,

    /// Seconds allowed for one API call in get/list/delete/tag
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
}

fn default_provisioning_qps() -> u32 {
    DEFAULT_PROVISIONING_QPS
}

fn default_api_timeout_secs() -> u64 {
    DEFAULT_API_TIMEOUT_SECS
}

impl Options {
    /// Options with defaults for everything but the cluster and region
    pub fn new(cluster_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            region: region.into(),
            provisioning_qps: DEFAULT_PROVISIONING_QPS,
            api_timeout_secs: DEFAULT_API_TIMEOUT_SECS,
        }
    }

    /// Load from defaults, an optional file and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, OptionsError> {
        if let Some(path) = path {
            info!("Loading options from {}", path.display());
        }
        Self::from_source(path.map(File::from))
    }

    /// Load with an explicit file-like source in place of a path
    pub fn from_source<S>(source: Option<S>) -> Result<Self, OptionsError>
    where
        S: Source + Send + Sync + 'static,
    {
        let mut builder = Config::builder()
            .set_default("provisioning_qps", i64::from(DEFAULT_PROVISIONING_QPS))?
            .set_default("api_timeout_secs", DEFAULT_API_TIMEOUT_SECS as i64)?;

        if let Some(source) = source {
            builder = builder.add_source(source);
        }

        let options: Options = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        options.validate()?;
        Ok(options)
    }

    /// Reject options the provider cannot run with
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.cluster_id.is_empty() {
            return Err(OptionsError::Invalid("cluster_id is required".to_string()));
        }
        if self.region.is_empty() {
            return Err(OptionsError::Invalid("region is required".to_string()));
        }
        if self.provisioning_qps == 0 {
            return Err(OptionsError::Invalid(
                "provisioning_qps must be greater than zero".to_string(),
            ));
        }
        if self.api_timeout_secs == 0 {
            return Err(OptionsError::Invalid(
                "api_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-call API bound
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}
