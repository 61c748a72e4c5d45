//! Where backend definitions and measurement shard assignments come from.
use std::{collections::BTreeMap, fmt::Debug, path::PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read cluster config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse cluster config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cluster config unavailable: {0}")]
    Unavailable(String),
}

/// Backend name to connection settings.
pub type BackendMap = BTreeMap<String, BackendConfig>;

/// Measurement prefix to its shard groups, each a list of backend names.
pub type MeasurementMap = BTreeMap<String, Vec<Vec<String>>>;

/// The cluster configuration document.
///
/// ```json
/// {
///   "backends": {
///     "b1": { "url": "http://10.0.0.1:8086", "db": "telegraf", "zone": "sh" },
///     "b2": { "url": "http://10.0.0.2:8086", "db": "telegraf", "zone": "bj" }
///   },
///   "measurements": {
///     "cpu": [["b1"], ["b2"]],
///     "mem": [["b1", "b2"]]
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDocument {
    #[serde(default)]
    pub backends: BackendMap,

    #[serde(default)]
    pub measurements: MeasurementMap,
}

/// Supplies the cluster layout on every (re)load.
#[async_trait]
pub trait ConfigSource: Debug + Send + Sync {
    async fn load_backends(&self) -> Result<BackendMap, ConfigError>;

    async fn load_measurements(&self) -> Result<MeasurementMap, ConfigError>;
}

/// Reads a JSON [`ClusterDocument`] from disk, re-reading it on every load.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read(&self) -> Result<ClusterDocument, ConfigError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load_backends(&self) -> Result<BackendMap, ConfigError> {
        Ok(self.read().await?.backends)
    }

    async fn load_measurements(&self) -> Result<MeasurementMap, ConfigError> {
        Ok(self.read().await?.measurements)
    }
}

/// An in-memory [`ConfigSource`] whose contents can be swapped at runtime.
#[derive(Debug)]
pub struct StaticConfigSource {
    document: RwLock<Result<ClusterDocument, String>>,
}

impl Default for StaticConfigSource {
    fn default() -> Self {
        Self::new(ClusterDocument::default())
    }
}

impl StaticConfigSource {
    pub fn new(document: ClusterDocument) -> Self {
        Self {
            document: RwLock::new(Ok(document)),
        }
    }

    /// Serve `document` from now on.
    pub fn replace(&self, document: ClusterDocument) {
        *self.document.write() = Ok(document);
    }

    /// Fail every load with [`ConfigError::Unavailable`] until the next [`Self::replace`].
    pub fn set_unavailable(&self, reason: impl Into<String>) {
        *self.document.write() = Err(reason.into());
    }

    fn snapshot(&self) -> Result<ClusterDocument, ConfigError> {
        self.document
            .read()
            .clone()
            .map_err(ConfigError::Unavailable)
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load_backends(&self) -> Result<BackendMap, ConfigError> {
        Ok(self.snapshot()?.backends)
    }

    async fn load_measurements(&self) -> Result<MeasurementMap, ConfigError> {
        Ok(self.snapshot()?.measurements)
    }
}
