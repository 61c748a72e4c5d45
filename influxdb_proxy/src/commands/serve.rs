//! Entrypoint for the proxy server
use std::{path::PathBuf, sync::Arc, time::Duration};

use hyper::server::conn::AddrIncoming;
use influxdb_proxy_clap_blocks::{logging::LoggingConfig, socket_addr::SocketAddr};
use influxdb_proxy_cluster::{
    Cluster, ClusterConfig, ClusterError, VERSION, backend::HttpBackendFactory,
    config::FileConfigSource, ring::DEFAULT_REPLICAS, stats::UNKNOWN_HOST,
};
use influxdb_proxy_server::{HttpDelegate, serve};
use influxdb_proxy_shutdown::{ShutdownManager, wait_for_signal};
use sysinfo::System;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The default bind address for the HTTP API.
pub(crate) const DEFAULT_HTTP_BIND_ADDR: &str = "0.0.0.0:7076";

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("cannot create cluster: {0}")]
    Cluster(#[source] ClusterError),

    #[error("cannot load cluster config: {0}")]
    LoadConfig(#[source] ClusterError),

    #[error("cannot bind HTTP listener to {addr}: {source}")]
    BindAddress {
        addr: std::net::SocketAddr,
        #[source]
        source: hyper::Error,
    },

    #[error("HTTP server error: {0}")]
    Server(#[from] hyper::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// The address on which the proxy serves HTTP API requests.
    #[clap(
        long = "http-bind",
        env = "INFLUXDB_PROXY_HTTP_BIND_ADDR",
        default_value = DEFAULT_HTTP_BIND_ADDR,
        action,
    )]
    pub(crate) http_bind_address: SocketAddr,

    /// JSON file describing the backends and the shard groups of every measurement prefix.
    ///
    /// Re-read on every `POST /reload`.
    #[clap(
        long = "config-file",
        env = "INFLUXDB_PROXY_CONFIG_FILE",
        default_value = "proxy.json",
        action
    )]
    pub(crate) config_file: PathBuf,

    /// Zone whose backends are preferred when answering queries.
    #[clap(long = "zone", env = "INFLUXDB_PROXY_ZONE", default_value = "", action)]
    pub(crate) zone: String,

    /// Comma separated backend names from the config file that receive a copy of every
    /// write.
    #[clap(
        long = "nexts",
        env = "INFLUXDB_PROXY_NEXTS",
        value_delimiter = ',',
        action
    )]
    pub(crate) nexts: Vec<String>,

    /// Virtual nodes per shard group on each hash ring.
    ///
    /// Changing this moves series between shard groups.
    #[clap(
        long = "replicas",
        env = "INFLUXDB_PROXY_REPLICAS",
        default_value_t = DEFAULT_REPLICAS,
        action
    )]
    pub(crate) replicas: usize,

    /// Bound on each backend query.
    #[clap(
        long = "query-timeout",
        env = "INFLUXDB_PROXY_QUERY_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    pub(crate) query_timeout: Duration,

    /// How often the proxy writes its own statistics.
    #[clap(
        long = "stats-interval",
        env = "INFLUXDB_PROXY_STATS_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub(crate) stats_interval: Duration,

    /// Log every accepted write.
    #[clap(long = "write-tracing", env = "INFLUXDB_PROXY_WRITE_TRACING", action)]
    pub(crate) write_tracing: bool,

    /// Log every query.
    #[clap(long = "query-tracing", env = "INFLUXDB_PROXY_QUERY_TRACING", action)]
    pub(crate) query_tracing: bool,

    /// Maximum size of HTTP requests.
    #[clap(
        long = "max-http-request-size",
        env = "INFLUXDB_PROXY_MAX_HTTP_REQUEST_SIZE",
        default_value = "10485760", // 10 MiB
        action,
    )]
    pub(crate) max_http_request_size: usize,
}

impl Config {
    fn cluster_config(&self, host: String) -> ClusterConfig {
        ClusterConfig {
            zone: self.zone.clone(),
            listen_addr: self.http_bind_address.to_string(),
            host,
            nexts: self.nexts.clone(),
            replicas: self.replicas,
            query_timeout: self.query_timeout,
            stats_interval: self.stats_interval,
            write_tracing: self.write_tracing,
            query_tracing: self.query_tracing,
        }
    }
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let host = System::host_name()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string());
    info!(
        version = VERSION,
        %host,
        config_file = %config.config_file.display(),
        "InfluxDB proxy starting",
    );

    let cluster = Cluster::new(
        config.cluster_config(host),
        Arc::new(FileConfigSource::new(&config.config_file)),
        Arc::new(HttpBackendFactory),
    )
    .map_err(Error::Cluster)?;
    cluster.load_config().await.map_err(Error::LoadConfig)?;
    let cluster = Arc::new(cluster);

    let addr = *config.http_bind_address;
    let incoming =
        AddrIncoming::bind(&addr).map_err(|source| Error::BindAddress { addr, source })?;
    info!(addr = %incoming.local_addr(), "listening for HTTP requests");

    let frontend_shutdown = CancellationToken::new();
    let shutdown_manager = Arc::new(ShutdownManager::new(frontend_shutdown.clone()));

    // The statistics loop stops and accepted writes are routed before the frontend stops.
    let stats_stop = CancellationToken::new();
    let stats_loop = tokio::spawn({
        let cluster = Arc::clone(&cluster);
        let stop = stats_stop.clone();
        async move { cluster.run_statistics(stop).await }
    });
    let drain_token = shutdown_manager.register();
    tokio::spawn({
        let cluster = Arc::clone(&cluster);
        async move {
            drain_token.wait_for_shutdown().await;
            stats_stop.cancel();
            if let Err(e) = stats_loop.await {
                error!(error = %e, "statistics loop panicked");
            }
            cluster.wait_for_pending_writes().await;
            drain_token.complete();
        }
    });

    tokio::spawn({
        let shutdown_manager = Arc::clone(&shutdown_manager);
        async move {
            if let Err(e) = wait_for_signal().await {
                error!(error = %e, "cannot listen for shutdown signals, shutting down");
            }
            shutdown_manager.shutdown();
            shutdown_manager.join().await;
        }
    });

    let delegate = Arc::new(HttpDelegate::new(
        config.max_http_request_size,
        Arc::clone(&cluster),
    ));
    serve(incoming, delegate, frontend_shutdown).await?;

    cluster.close().await;
    info!("InfluxDB proxy stopped");
    Ok(())
}
