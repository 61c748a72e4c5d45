//! A scriptable [`Backend`] for tests.

#![allow(missing_docs)]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use influxdb_proxy_client::Precision;
use parking_lot::Mutex;

use super::{Backend, BackendConfig, BackendError, BackendFactory, QueryRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBackendCall {
    Write { lines: Bytes, precision: Precision },
    Query(QueryRequest),
    Close,
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<MockBackendCall>,
    query_ret: VecDeque<Result<Bytes, String>>,
    write_ret: VecDeque<Result<(), String>>,
    query_delay: Option<Duration>,
    write_delay: Option<Duration>,
}

#[derive(Debug)]
pub struct MockBackend {
    name: String,
    zone: String,
    write_only: bool,
    active: AtomicBool,
    state: Mutex<Inner>,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: String::new(),
            write_only: false,
            active: AtomicBool::new(true),
            state: Default::default(),
        }
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn with_write_only(mut self, write_only: bool) -> Self {
        self.write_only = write_only;
        self
    }

    pub fn with_active(self, active: bool) -> Self {
        self.set_active(active);
        self
    }

    /// Responses returned by successive `query` calls, starting from the front. `Err`
    /// entries fail the call with a `503 Service Unavailable` [`BackendError::Client`].
    ///
    /// Once exhausted, `query` fails.
    pub fn with_query_ret(self, ret: impl IntoIterator<Item = Result<Bytes, String>>) -> Self {
        self.state.lock().query_ret.extend(ret);
        self
    }

    /// Results of successive `write` calls. Writes succeed once exhausted.
    pub fn with_write_ret(self, ret: impl IntoIterator<Item = Result<(), String>>) -> Self {
        self.state.lock().write_ret.extend(ret);
        self
    }

    /// Sleep for `delay` before answering each query.
    pub fn with_query_delay(self, delay: Duration) -> Self {
        self.state.lock().query_delay = Some(delay);
        self
    }

    /// Sleep for `delay` before accepting each write.
    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.state.lock().write_delay = Some(delay);
        self
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<MockBackendCall> {
        self.state.lock().calls.clone()
    }

    /// Every successfully written line, in order.
    pub fn written(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockBackendCall::Write { lines, .. } => Some(lines),
                _ => None,
            })
            .flat_map(|lines| {
                String::from_utf8_lossy(lines)
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// The `q` parameter of every query received, in order.
    pub fn queries(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockBackendCall::Query(req) => req.query_text().map(str::to_string),
                _ => None,
            })
            .collect()
    }

    fn unavailable(&self, message: String) -> BackendError {
        unavailable(&self.name, message)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn zone(&self) -> &str {
        &self.zone
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn is_write_only(&self) -> bool {
        self.write_only
    }

    async fn write(&self, lines: Bytes, precision: Precision) -> Result<(), BackendError> {
        let delay = self.state.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        match state.write_ret.pop_front() {
            Some(Err(message)) => Err(self.unavailable(message)),
            _ => {
                state
                    .calls
                    .push(MockBackendCall::Write { lines, precision });
                Ok(())
            }
        }
    }

    async fn query(&self, request: &QueryRequest) -> Result<Bytes, BackendError> {
        let (ret, delay) = {
            let mut state = self.state.lock();
            state.calls.push(MockBackendCall::Query(request.clone()));
            (state.query_ret.pop_front(), state.query_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match ret {
            Some(Ok(body)) => Ok(body),
            Some(Err(message)) => Err(self.unavailable(message)),
            None => Err(self.unavailable("no mock query response".to_string())),
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.state.lock().calls.push(MockBackendCall::Close);
        Ok(())
    }
}

fn unavailable(name: &str, message: String) -> BackendError {
    BackendError::Client {
        name: name.to_string(),
        source: influxdb_proxy_client::Error::ApiError {
            code: http::StatusCode::SERVICE_UNAVAILABLE,
            message,
        },
    }
}

/// A [`BackendFactory`] handing out pre-registered [`MockBackend`]s by name.
///
/// Names that were not registered get a fresh default mock whose zone and write-only flag
/// are taken from the [`BackendConfig`].
#[derive(Debug, Default)]
pub struct MockBackendFactory {
    backends: Mutex<BTreeMap<String, Arc<MockBackend>>>,
    fail: Mutex<Vec<String>>,
}

impl MockBackendFactory {
    pub fn with_backend(self, backend: MockBackend) -> Self {
        self.backends
            .lock()
            .insert(backend.name.clone(), Arc::new(backend));
        self
    }

    /// Make `create` fail for `name`.
    pub fn with_failure(self, name: impl Into<String>) -> Self {
        self.fail.lock().push(name.into());
        self
    }

    /// The mock created or registered under `name`.
    pub fn backend(&self, name: &str) -> Option<Arc<MockBackend>> {
        self.backends.lock().get(name).map(Arc::clone)
    }
}

impl BackendFactory for MockBackendFactory {
    fn create(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
        if self.fail.lock().iter().any(|n| n == name) {
            return Err(unavailable(name, "mock factory failure".to_string()));
        }

        let backend = Arc::clone(self.backends.lock().entry(name.to_string()).or_insert_with(|| {
            Arc::new(
                MockBackend::new(name)
                    .with_zone(config.zone.clone())
                    .with_write_only(config.write_only),
            )
        }));
        Ok(backend as Arc<dyn Backend>)
    }
}
