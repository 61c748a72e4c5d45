//! Sharding and query fan-out for a cluster of InfluxDB 1.x nodes.
//!
//! Every measurement prefix in the cluster configuration owns a consistent hash [`Ring`]
//! over one or more shard groups, and every shard group is a list of replica backends.
//! Writes are split into rows and each row is written to all replicas of the group its
//! series hashes to. Queries are answered by one replica of one group when the measurement
//! has a single group, and otherwise run on every group and merged by the [`aggregate`]
//! module.
//!
//! [`Cluster`] owns the current [`Topology`] and swaps in a new one on every
//! [`Cluster::load_config`].

pub mod aggregate;
pub mod backend;
mod cluster;
pub mod config;
pub mod filter;
pub mod query;
pub mod ring;
pub mod stats;
pub mod topology;
pub mod write;

pub use cluster::{Cluster, ClusterConfig, ClusterError, LOCAL_EXECUTOR, QueryError, WriteError};
pub use ring::Ring;
pub use topology::Topology;

/// Reported by `/ping` and in the `X-Influxdb-Version` header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wall clock time in nanoseconds since the epoch.
pub(crate) fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}
