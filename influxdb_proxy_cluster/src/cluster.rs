//! The cluster coordinator: owns the current topology and runs every client request.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::Method;
use influxdb_proxy_client::{Precision, QueryMethod};
use influxdb_proxy_influxql::{
    ParseError, SelectStatement, StatementKind, parse_statements, rewrite_mean,
};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    VERSION,
    aggregate::{AggregateError, MergePlan, Response, Series, StatementResult},
    backend::{Backend, BackendFactory, QueryRequest},
    config::{ConfigError, ConfigSource},
    filter::{QueryFilters, Rejection},
    now_nanos,
    query::{GroupError, fan_out, query_group},
    ring::{DEFAULT_REPLICAS, Ring},
    stats::{Counter, StatsRecorder},
    topology::{ResolveError, Topology},
    write::{RowError, parse_rows, route_rows},
};

/// Statements the proxy answers itself instead of routing them.
pub const LOCAL_EXECUTOR: &str = r"(?i:show.*measurements)";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid query filter: {0}")]
    Filter(#[from] regex::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("unable to parse points: {0}")]
    ParseLineProtocol(#[source] RowError),
}

/// Why a query was not answered. The display strings are returned to clients as is.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("illegal method")]
    IllegalMethod,

    #[error("empty query")]
    EmptyQuery,

    #[error("query forbidden")]
    Forbidden(Rejection),

    #[error("can't get measurement")]
    Measurement(#[source] ParseError),

    #[error("unknown measurement")]
    UnknownMeasurement(#[source] ResolveError),

    #[error("parse query error: {0}")]
    Parse(ParseError),

    #[error("not support multiple query")]
    MultipleStatements,

    #[error("not support: {0}")]
    Unsupported(String),

    #[error("query error")]
    Backend(#[source] GroupError),

    #[error("query error: {0}")]
    Aggregate(#[from] AggregateError),
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Zone whose backends are preferred for queries.
    pub zone: String,
    /// Reported as the `addr` tag of the statistics line.
    pub listen_addr: String,
    /// Reported as the `host` tag of the statistics line.
    pub host: String,
    /// Backends, by configured name, that receive a verbatim copy of every write.
    pub nexts: Vec<String>,
    /// Virtual nodes per shard group on each ring.
    pub replicas: usize,
    /// Bound on each backend query call.
    pub query_timeout: Duration,
    pub stats_interval: Duration,
    pub write_tracing: bool,
    pub query_tracing: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            zone: String::new(),
            listen_addr: String::new(),
            host: String::new(),
            nexts: Vec::new(),
            replicas: DEFAULT_REPLICAS,
            query_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(10),
            write_tracing: false,
            query_tracing: false,
        }
    }
}

#[derive(Debug)]
struct State {
    topology: Arc<Topology>,
    /// Rows still being routed on `topology`.
    routing: TaskTracker,
    filters: QueryFilters,
    /// Added through [`Cluster::add_next`]; kept across reloads.
    registered_nexts: Vec<Arc<dyn Backend>>,
}

#[derive(Debug)]
pub struct Cluster {
    config: ClusterConfig,
    source: Arc<dyn ConfigSource>,
    factory: Arc<dyn BackendFactory>,
    state: RwLock<State>,
    stats: Arc<StatsRecorder>,
    pending_writes: TaskTracker,
    local_executor: Regex,
}

impl Cluster {
    /// A cluster with the default query filters and an empty topology. Call
    /// [`Self::load_config`] before serving.
    pub fn new(
        config: ClusterConfig,
        source: Arc<dyn ConfigSource>,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self, ClusterError> {
        Ok(Self {
            config,
            source,
            factory,
            state: RwLock::new(State {
                topology: Default::default(),
                routing: TaskTracker::new(),
                filters: QueryFilters::with_defaults()?,
                registered_nexts: Vec::new(),
            }),
            stats: Arc::new(StatsRecorder::new()),
            pending_writes: TaskTracker::new(),
            local_executor: Regex::new(LOCAL_EXECUTOR)?,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn stats(&self) -> &StatsRecorder {
        &self.stats
    }

    /// Build a new topology from the config source and swap it in.
    ///
    /// The current topology stays in place when the source can't be read. The replaced
    /// backends are closed in the background once every row already routed on them is
    /// written.
    pub async fn load_config(&self) -> Result<(), ClusterError> {
        let backends = self.source.load_backends().await?;
        let measurements = self.source.load_measurements().await?;

        let topology = Arc::new(Topology::build(
            &backends,
            &measurements,
            &self.config.nexts,
            self.config.replicas,
            self.factory.as_ref(),
        ));
        let (previous, routing) = {
            let mut state = self.state.write();
            (
                std::mem::replace(&mut state.topology, topology),
                std::mem::replace(&mut state.routing, TaskTracker::new()),
            )
        };

        tokio::spawn(async move {
            routing.close();
            routing.wait().await;
            previous.close_backends().await;
        });
        info!("cluster config loaded");
        Ok(())
    }

    pub fn resolve_ring(&self, key: &str) -> Result<Arc<Ring>, ResolveError> {
        self.state.read().topology.resolve_ring(key).map(Arc::clone)
    }

    /// Configured measurement prefixes, sorted.
    pub fn measurements(&self) -> Vec<String> {
        self.state
            .read()
            .topology
            .measurements()
            .map(str::to_string)
            .collect()
    }

    pub fn check_query(&self, query: &str) -> Result<(), Rejection> {
        self.state.read().filters.check(query)
    }

    pub fn forbid_query(&self, pattern: &str) -> Result<(), regex::Error> {
        self.state.write().filters.forbid(pattern)
    }

    pub fn ensure_query(&self, pattern: &str) -> Result<(), regex::Error> {
        self.state.write().filters.ensure(pattern)
    }

    /// Copy every write to `backend` in addition to the configured next tier.
    pub fn add_next(&self, backend: Arc<dyn Backend>) {
        self.state.write().registered_nexts.push(backend);
    }

    pub fn ping(&self) -> &'static str {
        self.stats.incr(Counter::PingRequests);
        VERSION
    }

    /// Route every point of `body` to its shard group and forward `body` unchanged to the
    /// next tier.
    ///
    /// Row routing runs in the background; the next tier has been written to when this
    /// returns. Only a payload with no parsable point fails.
    pub async fn write(&self, body: Bytes, precision: Precision) -> Result<(), WriteError> {
        self.stats.incr(Counter::WriteRequests);
        let start = Instant::now();

        let result = self.do_write(body, precision).await;

        self.stats
            .add(Counter::WriteRequestDuration, elapsed_nanos(start));
        if let Err(e) = &result {
            warn!(error = %e, "write failed");
            self.stats.incr(Counter::WriteRequestsFail);
        }
        result
    }

    async fn do_write(&self, body: Bytes, precision: Precision) -> Result<(), WriteError> {
        let text = std::str::from_utf8(&body)?;
        if self.config.write_tracing {
            info!(bytes = body.len(), %precision, "write");
        }

        let (rows, mut errors) = parse_rows(text, precision, now_nanos());
        if rows.is_empty() {
            if errors.is_empty() {
                return Ok(());
            }
            return Err(WriteError::ParseLineProtocol(errors.swap_remove(0)));
        }
        for e in &errors {
            warn!(error = %e, "dropping unparsable line");
            self.stats.incr(Counter::PointsWrittenFail);
        }

        let (topology, routing, nexts) = {
            let state = self.state.read();
            let nexts = state
                .topology
                .nexts()
                .iter()
                .chain(&state.registered_nexts)
                .map(Arc::clone)
                .collect::<Vec<_>>();
            (Arc::clone(&state.topology), state.routing.token(), nexts)
        };

        let stats = Arc::clone(&self.stats);
        self.pending_writes.spawn(async move {
            route_rows(rows, topology, stats).await;
            drop(routing);
        });

        for next in nexts {
            if let Err(e) = next.write(body.clone(), precision).await {
                warn!(backend = %next.name(), error = %e, "next tier write failed");
                self.stats.incr(Counter::WriteRequestsFail);
            }
        }
        Ok(())
    }

    /// Answer a `/query` request given its method and form parameters.
    pub async fn query(
        &self,
        method: &Method,
        params: Vec<(String, String)>,
    ) -> Result<Bytes, QueryError> {
        self.stats.incr(Counter::QueryRequests);
        let start = Instant::now();

        let result = self.do_query(method, params).await;

        self.stats
            .add(Counter::QueryRequestDuration, elapsed_nanos(start));
        if let Err(e) = &result {
            warn!(error = %e, "query failed");
            self.stats.incr(Counter::QueryRequestsFail);
        }
        result
    }

    async fn do_query(
        &self,
        method: &Method,
        params: Vec<(String, String)>,
    ) -> Result<Bytes, QueryError> {
        let method = match *method {
            Method::GET => QueryMethod::Get,
            Method::POST => QueryMethod::Post,
            _ => return Err(QueryError::IllegalMethod),
        };
        let request = QueryRequest::new(method, params);
        let q = request.query_text().map(str::trim).unwrap_or_default();
        if q.is_empty() {
            return Err(QueryError::EmptyQuery);
        }
        if self.config.query_tracing {
            info!(query = %q, "query");
        }

        if self.local_executor.is_match(q) {
            return self.show_measurements();
        }

        let topology = {
            let state = self.state.read();
            state.filters.check(q).map_err(QueryError::Forbidden)?;
            Arc::clone(&state.topology)
        };

        let statements = parse_statements(q).map_err(QueryError::Measurement)?;
        let statement = statements.first().ok_or(QueryError::EmptyQuery)?;
        let measurement = statement.measurement().map_err(QueryError::Measurement)?;
        let ring = topology
            .resolve_ring(&measurement)
            .map_err(QueryError::UnknownMeasurement)?;

        let zone = self.config.zone.as_str();
        let timeout = self.config.query_timeout;
        let groups = ring.shard_groups();
        if let [group] = groups {
            return query_group(group, zone, &request, timeout)
                .await
                .map_err(QueryError::Backend);
        }

        if statements.len() > 1 {
            return Err(QueryError::MultipleStatements);
        }

        match statement.kind() {
            StatementKind::ShowFieldKeys | StatementKind::ShowTagKeys => {
                query_group(&groups[0], zone, &request, timeout)
                    .await
                    .map_err(QueryError::Backend)
            }
            StatementKind::Select => {
                let select = SelectStatement::try_from(statement).map_err(QueryError::Parse)?;
                let distributed = rewrite_mean(&select);
                let plan = MergePlan::try_new(&distributed).map_err(|e| match e {
                    AggregateError::Unsupported(what) => QueryError::Unsupported(what),
                    e => QueryError::Aggregate(e),
                })?;

                debug!(query = %distributed.text(), groups = groups.len(), "fanning out");
                let partials = fan_out(groups, zone, &request.with_query(distributed.text()), timeout)
                    .await
                    .map_err(|(group, e)| {
                        warn!(%measurement, group, error = %e, "shard group query failed");
                        QueryError::Backend(e)
                    })?;
                Ok(plan.merge(&partials)?)
            }
            StatementKind::ShowTagValues => Err(QueryError::Unsupported(
                "SHOW TAG VALUES across shard groups".to_string(),
            )),
            kind => Err(QueryError::Unsupported(format!("{kind:?} across shard groups"))),
        }
    }

    fn show_measurements(&self) -> Result<Bytes, QueryError> {
        let values = self
            .measurements()
            .into_iter()
            .map(|m| vec![Value::from(m)])
            .collect::<Vec<_>>();
        let mut series = Vec::new();
        if !values.is_empty() {
            series.push(Series {
                name: "measurements".to_string(),
                columns: vec!["name".to_string()],
                values,
                ..Default::default()
            });
        }
        let response = Response {
            results: vec![StatementResult {
                statement_id: 0,
                series,
                ..Default::default()
            }],
            error: None,
        };
        let body = serde_json::to_vec(&response).map_err(AggregateError::from)?;
        Ok(Bytes::from(body))
    }

    /// Swap the statistics buffers and write the closed one through [`Self::write`].
    pub async fn flush_statistics(&self) -> Result<(), WriteError> {
        let line = self.stats.swap_and_take().to_line_protocol(
            &self.config.listen_addr,
            &self.config.host,
            now_nanos(),
        );
        self.write(Bytes::from(line), Precision::Nanosecond).await
    }

    /// Flush statistics every `stats_interval` until `shutdown` is cancelled.
    pub async fn run_statistics(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.stats_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("statistics loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.flush_statistics().await {
                        warn!(error = %e, "failed to write statistics");
                    }
                }
            }
        }
    }

    /// Wait for the rows of every accepted write to be routed.
    pub async fn wait_for_pending_writes(&self) {
        self.pending_writes.close();
        self.pending_writes.wait().await;
        self.pending_writes.reopen();
    }

    /// Finish routing accepted writes, then close every backend.
    pub async fn close(&self) {
        self.pending_writes.close();
        self.pending_writes.wait().await;

        let topology = Arc::clone(&self.state.read().topology);
        topology.close_backends().await;
        info!("cluster closed");
    }
}

fn elapsed_nanos(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_nanos()).unwrap_or(i64::MAX)
}
