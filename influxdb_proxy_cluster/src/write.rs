//! Splitting a line protocol payload into rows and routing each row to its shard group.
use std::sync::Arc;

use bytes::Bytes;
use influxdb_line_protocol::{FieldValue, LineProtocolBuilder, ParsedLine, parse_lines};
use influxdb_proxy_client::Precision;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    stats::{Counter, StatsRecorder},
    topology::Topology,
};

/// Tag whose value joins the measurement name in the ring selection key.
pub const ROUTING_TAG: &str = "host";

#[derive(Debug, Error)]
pub enum RowError {
    #[error(transparent)]
    Parse(#[from] influxdb_line_protocol::Error),

    #[error("timestamp {timestamp} overflows nanoseconds at precision {precision}")]
    TimestampOverflow { timestamp: i64, precision: Precision },
}

/// One point, ready to be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Selects the ring: the measurement name followed by the `host` tag value, if any.
    pub routing_key: String,
    /// Selects the shard group within the ring: measurement and tags sorted by key.
    pub series_key: String,
    /// The point as newline terminated line protocol with a nanosecond timestamp.
    pub line: Bytes,
}

/// Parse `text` into rows, collecting the lines that failed to parse.
///
/// Points without a timestamp are stamped with `now_ns`.
pub fn parse_rows(text: &str, precision: Precision, now_ns: i64) -> (Vec<Row>, Vec<RowError>) {
    let mut rows = Vec::new();
    let mut errors = Vec::new();

    for line in parse_lines(text) {
        match line
            .map_err(RowError::from)
            .and_then(|line| Row::new(line, precision, now_ns))
        {
            Ok(row) => rows.push(row),
            Err(e) => errors.push(e),
        }
    }

    (rows, errors)
}

impl Row {
    fn new(mut line: ParsedLine<'_>, precision: Precision, now_ns: i64) -> Result<Self, RowError> {
        let timestamp = match line.timestamp {
            Some(timestamp) => timestamp.checked_mul(precision.multiplier()).ok_or(
                RowError::TimestampOverflow {
                    timestamp,
                    precision,
                },
            )?,
            None => now_ns,
        };
        line.timestamp = Some(timestamp);

        if let Some(tags) = line.series.tag_set.as_mut() {
            tags.sort_by(|a, b| a.0.cmp(&b.0));
        }

        let measurement = line.series.measurement.as_str();
        let routing_key = match line.tag_value(ROUTING_TAG) {
            Some(host) => format!("{measurement}{}", host.as_str()),
            None => measurement.to_string(),
        };

        Ok(Self {
            routing_key,
            series_key: line.series.to_string(),
            line: encode(&line, timestamp),
        })
    }
}

fn encode(line: &ParsedLine<'_>, timestamp: i64) -> Bytes {
    let mut builder = LineProtocolBuilder::new().measurement(line.series.measurement.as_str());
    for (key, value) in line.series.tag_set.iter().flatten() {
        builder = builder.tag(key.as_str(), value.as_str());
    }

    let mut fields = line.field_set.iter();
    // the parser rejects lines without fields
    let Some((key, value)) = fields.next() else {
        return Bytes::new();
    };
    let mut builder = match value {
        FieldValue::I64(v) => builder.field(key.as_str(), *v),
        FieldValue::U64(v) => builder.field(key.as_str(), *v),
        FieldValue::F64(v) => builder.field(key.as_str(), *v),
        FieldValue::String(v) => builder.field(key.as_str(), v.as_str()),
        FieldValue::Boolean(v) => builder.field(key.as_str(), *v),
    };
    for (key, value) in fields {
        builder = match value {
            FieldValue::I64(v) => builder.field(key.as_str(), *v),
            FieldValue::U64(v) => builder.field(key.as_str(), *v),
            FieldValue::F64(v) => builder.field(key.as_str(), *v),
            FieldValue::String(v) => builder.field(key.as_str(), v.as_str()),
            FieldValue::Boolean(v) => builder.field(key.as_str(), *v),
        };
    }

    Bytes::from(builder.timestamp(timestamp).close_line().build())
}

/// Route every row, counting the outcome of each.
pub(crate) async fn route_rows(rows: Vec<Row>, topology: Arc<Topology>, stats: Arc<StatsRecorder>) {
    for row in rows {
        let counter = if route_row(&row, &topology).await {
            Counter::PointsWritten
        } else {
            Counter::PointsWrittenFail
        };
        stats.incr(counter);
    }
}

/// Write `row` to every replica of its shard group, in order, stopping at the first failure.
///
/// Returns whether every replica accepted the row.
pub(crate) async fn route_row(row: &Row, topology: &Topology) -> bool {
    if row.line.is_empty() {
        return false;
    }

    let ring = match topology.resolve_ring(&row.routing_key) {
        Ok(ring) => ring,
        Err(e) => {
            warn!(key = %row.routing_key, error = %e, "new measurement");
            return false;
        }
    };

    let group = ring.resolve(&row.series_key);
    let replicas = &ring.shard_groups()[group];
    if replicas.is_empty() {
        warn!(key = %row.routing_key, group, "shard group has no backends");
        return false;
    }
    for backend in replicas {
        if let Err(e) = backend.write(row.line.clone(), Precision::Nanosecond).await {
            warn!(
                key = %row.routing_key,
                backend = %backend.name(),
                error = %e,
                "cluster write fail"
            );
            return false;
        }
    }
    debug!(key = %row.routing_key, group, "row routed");
    true
}
