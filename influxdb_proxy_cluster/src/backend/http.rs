use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use influxdb_proxy_client::{Client, Precision};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use super::{Backend, BackendConfig, BackendError, BackendFactory, QueryRequest};

/// A [`Backend`] speaking the InfluxDB 1.x HTTP API.
///
/// Nanosecond precision writes are buffered and flushed every `flush_interval`, or as soon
/// as the buffer reaches `max_batch_bytes`. Writes in any other precision go out
/// immediately since a batch carries a single precision. A background loop pings the node
/// every `check_interval` to maintain the active flag.
#[derive(Debug)]
pub struct HttpBackend {
    name: String,
    zone: String,
    write_only: bool,
    timeout: Duration,
    client: Client,
    active: Arc<AtomicBool>,
    batch: Arc<Mutex<BytesMut>>,
    max_batch_bytes: usize,
    closed: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl HttpBackend {
    /// Build the backend and start its flush and health check loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, config: &BackendConfig) -> Result<Self, BackendError> {
        let name = name.into();
        let config_err = |source| BackendError::Config {
            name: name.clone(),
            source,
        };

        let mut client = Client::new(config.url.as_str(), config.db.as_str())
            .and_then(|c| c.with_timeout(config.timeout))
            .map_err(config_err)?;
        if let Some(username) = &config.username {
            client = client.with_basic_auth(
                username.as_str(),
                config.password.clone().unwrap_or_default(),
            );
        }

        let backend = Self {
            name,
            zone: config.zone.clone(),
            write_only: config.write_only,
            timeout: config.timeout,
            client,
            active: Arc::new(AtomicBool::new(true)),
            batch: Arc::new(Mutex::new(BytesMut::new())),
            max_batch_bytes: config.max_batch_bytes,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        backend.spawn_flush_loop(config.flush_interval);
        backend.spawn_health_check(config.check_interval);
        Ok(backend)
    }

    fn spawn_flush_loop(&self, every: Duration) {
        let name = self.name.clone();
        let client = self.client.clone();
        let batch = Arc::clone(&self.batch);
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let pending = take_batch(&batch);
                if let Err(e) = send_batch(&client, pending).await {
                    warn!(backend = %name, error = %e, "failed to flush buffered writes");
                }
            }
        });
    }

    fn spawn_health_check(&self, every: Duration) {
        let name = self.name.clone();
        let client = self.client.clone();
        let active = Arc::clone(&self.active);
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let healthy = match client.ping().await {
                    Ok(_) => true,
                    Err(e) => {
                        debug!(backend = %name, error = %e, "ping failed");
                        false
                    }
                };
                let was = active.swap(healthy, Ordering::Relaxed);
                match (was, healthy) {
                    (true, false) => warn!(backend = %name, "backend is inactive"),
                    (false, true) => info!(backend = %name, "backend is active again"),
                    _ => {}
                }
            }
        });
    }

    fn client_error(&self, source: influxdb_proxy_client::Error) -> BackendError {
        if source.is_timeout() {
            BackendError::Timeout {
                name: self.name.clone(),
                timeout: self.timeout,
            }
        } else {
            BackendError::Client {
                name: self.name.clone(),
                source,
            }
        }
    }

    fn check_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed(self.name.clone()));
        }
        Ok(())
    }
}

fn take_batch(batch: &Mutex<BytesMut>) -> Bytes {
    batch.lock().split().freeze()
}

async fn send_batch(client: &Client, pending: Bytes) -> Result<(), influxdb_proxy_client::Error> {
    if pending.is_empty() {
        return Ok(());
    }
    client.write_lp(pending, Precision::Nanosecond).await
}

#[async_trait]
impl Backend for HttpBackend {
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
        self.check_open()?;

        if precision != Precision::Nanosecond {
            return self
                .client
                .write_lp(lines, precision)
                .await
                .map_err(|e| self.client_error(e));
        }

        let full = {
            let mut batch = self.batch.lock();
            batch.extend_from_slice(&lines);
            if !lines.ends_with(b"\n") {
                batch.extend_from_slice(b"\n");
            }
            (batch.len() >= self.max_batch_bytes).then(|| batch.split().freeze())
        };

        match full {
            Some(pending) => send_batch(&self.client, pending)
                .await
                .map_err(|e| self.client_error(e)),
            None => Ok(()),
        }
    }

    async fn query(&self, request: &QueryRequest) -> Result<Bytes, BackendError> {
        self.check_open()?;
        self.client
            .query(request.method(), request.params())
            .await
            .map_err(|e| self.client_error(e))
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let pending = take_batch(&self.batch);
        debug!(backend = %self.name, bytes = pending.len(), "flushing on close");
        send_batch(&self.client, pending)
            .await
            .map_err(|e| self.client_error(e))
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Builds an [`HttpBackend`] per configured node.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpBackendFactory;

impl BackendFactory for HttpBackendFactory {
    fn create(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
        Ok(Arc::new(HttpBackend::new(name, config)?))
    }
}
