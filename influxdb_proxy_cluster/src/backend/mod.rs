//! Backend handles: the storage nodes writes are routed to and queries are sent to.
use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use influxdb_proxy_client::{Precision, QueryMethod};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod http;
pub mod mock;

pub use self::http::{HttpBackend, HttpBackendFactory};

/// Errors returned by a [`Backend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend {0} is closed")]
    Closed(String),

    #[error("backend {name} request failed: {source}")]
    Client {
        name: String,
        #[source]
        source: influxdb_proxy_client::Error,
    },

    #[error("backend {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("invalid configuration for backend {name}: {source}")]
    Config {
        name: String,
        #[source]
        source: influxdb_proxy_client::Error,
    },
}

/// A `/query` request as received from a client: the HTTP method and its form parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    method: QueryMethod,
    params: Vec<(String, String)>,
}

impl QueryRequest {
    pub fn new(method: QueryMethod, params: Vec<(String, String)>) -> Self {
        Self { method, params }
    }

    /// Convenience constructor for a `GET` request.
    pub fn get<K, V>(params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            QueryMethod::Get,
            params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn method(&self) -> QueryMethod {
        self.method
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// The first value of parameter `name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The InfluxQL text in `q`.
    pub fn query_text(&self) -> Option<&str> {
        self.param("q")
    }

    /// A copy of this request with `q` replaced by `query`.
    pub fn with_query(&self, query: impl Into<String>) -> Self {
        let query = query.into();
        let mut params: Vec<_> = self
            .params
            .iter()
            .filter(|(k, _)| k != "q")
            .cloned()
            .collect();
        params.push(("q".to_string(), query));
        Self {
            method: self.method,
            params,
        }
    }
}

/// A handle to one storage node.
///
/// Handles are shared: several rings and the next tier may hold the same handle.
#[async_trait]
pub trait Backend: Debug + Send + Sync {
    /// Name the handle was configured under.
    fn name(&self) -> &str;

    /// Zone label used to prefer nearby replicas for reads.
    fn zone(&self) -> &str;

    /// Whether the node is currently considered healthy.
    fn is_active(&self) -> bool;

    /// Write-only nodes never serve queries.
    fn is_write_only(&self) -> bool;

    /// Write newline delimited line protocol with the given timestamp precision.
    async fn write(&self, lines: Bytes, precision: Precision) -> Result<(), BackendError>;

    /// Run a query and return the raw response body.
    async fn query(&self, request: &QueryRequest) -> Result<Bytes, BackendError>;

    /// Stop background work and flush anything buffered.
    async fn close(&self) -> Result<(), BackendError>;
}

/// Whether `backend` may serve reads.
pub(crate) fn is_readable(backend: &dyn Backend) -> bool {
    backend.is_active() && !backend.is_write_only()
}

/// How to reach one backend, as found in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the node, e.g. `http://10.0.0.1:8086`.
    pub url: String,

    /// Database routed writes are stored in.
    pub db: String,

    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub write_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Per request timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How often `/ping` is polled to update the active flag.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// How often buffered writes are flushed.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Buffered writes are flushed early once they reach this size.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_batch_bytes() -> usize {
    512 * 1024
}

impl BackendConfig {
    /// A config for `url`/`db` with every other setting at its default.
    pub fn new(url: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            db: db.into(),
            zone: String::new(),
            write_only: false,
            username: None,
            password: None,
            timeout: default_timeout(),
            check_interval: default_check_interval(),
            flush_interval: default_flush_interval(),
            max_batch_bytes: default_max_batch_bytes(),
        }
    }
}

/// Builds backend handles from configuration.
pub trait BackendFactory: Debug + Send + Sync {
    fn create(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError>;
}
