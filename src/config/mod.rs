pub mod timing;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument};

pub use self::timing::TimingConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/errand-operator/config.yaml";

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("max_workers must be at least 1")]
    NoWorkers,
}

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct OperatorConfig {
    /// Image of the output sidecar, normally this operator's own image
    #[serde(default = "default_operator_image")]
    pub operator_image: String,

    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    /// Service account used when the namespace does not name one
    #[serde(default = "default_service_account")]
    pub service_account: String,

    /// Only namespaces labeled with this id are reconciled
    #[serde(default = "default_monitored_id")]
    pub monitored_id: String,

    /// Restrict watches to a single namespace
    #[serde(default)]
    pub watch_namespace: Option<String>,

    #[serde(default = "default_max_workers")]
    pub max_workers: u16,

    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_image: default_operator_image(),
            image_pull_policy: default_image_pull_policy(),
            service_account: default_service_account(),
            monitored_id: default_monitored_id(),
            watch_namespace: None,
            max_workers: default_max_workers(),
            timing: TimingConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Loads the config file at `path`.
    ///
    /// When `path` is `None` the default location is tried and a missing
    /// file yields the defaults. An explicitly given file must exist.
    #[instrument("config/load", level = "trace")]
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound && !required => {
                info!(
                    "No config file at '{}', using defaults.",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigLoadError::Read { path, source }),
        };

        let config = Self::from_yaml(&contents)
            .map_err(|source| ConfigLoadError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.max_workers == 0 {
            return Err(ConfigLoadError::NoWorkers);
        }
        Ok(())
    }
}

fn default_operator_image() -> String {
    "errand-operator:latest".to_string()
}
fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}
fn default_service_account() -> String {
    "persist-output-service-account".to_string()
}
fn default_monitored_id() -> String {
    "default".to_string()
}
const fn default_max_workers() -> u16 {
    1
}
