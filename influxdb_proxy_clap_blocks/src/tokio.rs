//! Config for the tokio IO runtime that drives the proxy.
use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Tokio runtime type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TokioRuntimeType {
    /// Current-thread runtime.
    CurrentThread,

    /// Multi-thread runtime.
    #[default]
    MultiThread,
}

/// CLI config for the tokio IO runtime.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct TokioIoConfig {
    /// Set the maximum number of IO runtime threads to use.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(long = "num-io-threads", env = "INFLUXDB_PROXY_NUM_IO_THREADS", action)]
    pub num_threads: Option<NonZeroUsize>,

    /// IO tokio runtime type.
    #[clap(
        long = "io-runtime-type",
        env = "INFLUXDB_PROXY_IO_RUNTIME_TYPE",
        default_value_t = TokioRuntimeType::default(),
        value_enum,
        action
    )]
    pub runtime_type: TokioRuntimeType,

    /// Specifies the limit for additional threads spawned by the IO runtime.
    #[clap(
        long = "io-runtime-max-blocking-threads",
        env = "INFLUXDB_PROXY_IO_RUNTIME_MAX_BLOCKING_THREADS",
        action
    )]
    pub max_blocking_threads: Option<NonZeroUsize>,

    /// Sets a custom timeout for a thread in the blocking pool of the IO runtime.
    #[clap(
        long = "io-runtime-thread-keep-alive",
        env = "INFLUXDB_PROXY_IO_RUNTIME_THREAD_KEEP_ALIVE",
        value_parser = humantime::parse_duration
    )]
    pub thread_keep_alive: Option<Duration>,
}

impl TokioIoConfig {
    /// Creates the tokio runtime builder.
    pub fn builder(&self) -> Result<tokio::runtime::Builder, std::io::Error> {
        // Logging is not installed yet, so nothing here may use tracing macros.
        let mut builder = match self.runtime_type {
            TokioRuntimeType::CurrentThread => tokio::runtime::Builder::new_current_thread(),
            TokioRuntimeType::MultiThread => tokio::runtime::Builder::new_multi_thread(),
        };
        builder.enable_all();

        let thread_counter = Arc::new(AtomicUsize::new(1));
        builder.thread_name_fn(move || {
            format!(
                "InfluxDB Proxy Tokio IO {}",
                thread_counter.fetch_add(1, Ordering::SeqCst)
            )
        });

        if self.runtime_type == TokioRuntimeType::MultiThread {
            let num_threads = match self.num_threads {
                None => std::thread::available_parallelism()?,
                Some(n) => n,
            };
            builder.worker_threads(num_threads.get());
        }

        if let Some(max) = self.max_blocking_threads {
            builder.max_blocking_threads(max.get());
        }

        if let Some(keep_alive) = self.thread_keep_alive {
            builder.thread_keep_alive(keep_alive);
        }

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_to_multi_thread() {
        let config = TokioIoConfig::try_parse_from(["prog"]).unwrap();
        assert_eq!(config.runtime_type, TokioRuntimeType::MultiThread);

        let rt = config.builder().unwrap().build().unwrap();
        let name = rt
            .block_on(async { tokio::spawn(async { std::thread::current().name().map(str::to_owned) }).await })
            .unwrap();
        assert!(name.unwrap().starts_with("InfluxDB Proxy Tokio IO"));
    }

    #[test]
    fn current_thread_runtime() {
        let config = TokioIoConfig::try_parse_from([
            "prog",
            "--io-runtime-type",
            "current-thread",
            "--io-runtime-thread-keep-alive",
            "5s",
        ])
        .unwrap();
        assert_eq!(config.runtime_type, TokioRuntimeType::CurrentThread);
        assert_eq!(config.thread_keep_alive, Some(Duration::from_secs(5)));

        let rt = config.builder().unwrap().build().unwrap();
        assert_eq!(rt.block_on(async { 1 + 1 }), 2);
    }
}
