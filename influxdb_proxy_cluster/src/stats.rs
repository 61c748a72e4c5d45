//! Request counters, double buffered so they can be flushed without stopping writers.
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use influxdb_line_protocol::LineProtocolBuilder;

/// Measurement the proxy reports its own statistics under.
pub const STATISTICS_MEASUREMENT: &str = "influxdb.cluster";

/// Tag value reported when the host name is unknown.
pub const UNKNOWN_HOST: &str = "unknown";

const COUNTERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    QueryRequests,
    QueryRequestsFail,
    WriteRequests,
    WriteRequestsFail,
    PingRequests,
    PingRequestsFail,
    PointsWritten,
    PointsWrittenFail,
    /// Nanoseconds.
    QueryRequestDuration,
    /// Nanoseconds.
    WriteRequestDuration,
}

impl Counter {
    pub const ALL: [Self; COUNTERS] = [
        Self::QueryRequests,
        Self::QueryRequestsFail,
        Self::WriteRequests,
        Self::WriteRequestsFail,
        Self::PingRequests,
        Self::PingRequestsFail,
        Self::PointsWritten,
        Self::PointsWrittenFail,
        Self::QueryRequestDuration,
        Self::WriteRequestDuration,
    ];

    /// Field name in the emitted statistics line.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::QueryRequests => "statQueryRequest",
            Self::QueryRequestsFail => "statQueryRequestFail",
            Self::WriteRequests => "statWriteRequest",
            Self::WriteRequestsFail => "statWriteRequestFail",
            Self::PingRequests => "statPingRequest",
            Self::PingRequestsFail => "statPingRequestFail",
            Self::PointsWritten => "statPointsWritten",
            Self::PointsWrittenFail => "statPointsWrittenFail",
            Self::QueryRequestDuration => "statQueryRequestDuration",
            Self::WriteRequestDuration => "statWriteRequestDuration",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Default)]
struct Statistics([AtomicI64; COUNTERS]);

impl Statistics {
    fn drain(&self) -> StatisticsSnapshot {
        StatisticsSnapshot(std::array::from_fn(|i| self.0[i].swap(0, Ordering::AcqRel)))
    }
}

/// Two sets of counters: writers increment the live one while the other is drained.
///
/// Increments racing with [`StatsRecorder::swap_and_take`] may land in either interval.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    buffers: [Statistics; 2],
    live: AtomicUsize,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, value: i64) {
        let live = self.live.load(Ordering::Acquire) & 1;
        self.buffers[live].0[counter.index()].fetch_add(value, Ordering::Relaxed);
    }

    /// Make the idle buffer live and drain the previously live one.
    pub fn swap_and_take(&self) -> StatisticsSnapshot {
        let closed = self.live.fetch_xor(1, Ordering::AcqRel) & 1;
        self.buffers[closed].drain()
    }

    /// Current value of `counter` in the live buffer.
    pub fn peek(&self, counter: Counter) -> i64 {
        let live = self.live.load(Ordering::Acquire) & 1;
        self.buffers[live].0[counter.index()].load(Ordering::Relaxed)
    }
}

fn or_unknown(value: &str) -> &str {
    if value.is_empty() { UNKNOWN_HOST } else { value }
}

/// Counter values for one flush interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot([i64; COUNTERS]);

impl StatisticsSnapshot {
    pub fn get(&self, counter: Counter) -> i64 {
        self.0[counter.index()]
    }

    /// Render as one line of line protocol, newline terminated.
    ///
    /// Empty tag values are not valid line protocol, so an empty `addr` or `host` is written
    /// as [`UNKNOWN_HOST`].
    pub fn to_line_protocol(&self, addr: &str, host: &str, timestamp_ns: i64) -> Vec<u8> {
        let [first, rest @ ..] = Counter::ALL;
        let mut line = LineProtocolBuilder::new()
            .measurement(STATISTICS_MEASUREMENT)
            .tag("addr", or_unknown(addr))
            .tag("host", or_unknown(host))
            .field(first.field_name(), self.get(first));
        for counter in rest {
            line = line.field(counter.field_name(), self.get(counter));
        }
        line.timestamp(timestamp_ns).close_line().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn swap_drains_the_closed_buffer() {
        let stats = StatsRecorder::new();
        stats.incr(Counter::WriteRequests);
        stats.incr(Counter::WriteRequests);
        stats.add(Counter::WriteRequestDuration, 1_500);
        assert_eq!(stats.peek(Counter::WriteRequests), 2);

        let snapshot = stats.swap_and_take();
        assert_eq!(snapshot.get(Counter::WriteRequests), 2);
        assert_eq!(snapshot.get(Counter::WriteRequestDuration), 1_500);
        assert_eq!(snapshot.get(Counter::QueryRequests), 0);
        assert_eq!(stats.peek(Counter::WriteRequests), 0);

        stats.incr(Counter::PingRequests);
        let snapshot = stats.swap_and_take();
        assert_eq!(snapshot.get(Counter::PingRequests), 1);
        assert_eq!(snapshot.get(Counter::WriteRequests), 0);

        // both buffers were reset
        assert_eq!(stats.swap_and_take(), StatisticsSnapshot::default());
        assert_eq!(stats.swap_and_take(), StatisticsSnapshot::default());
    }

    #[test]
    fn no_increments_are_lost_between_flushes() {
        let stats = Arc::new(StatsRecorder::new());
        let writers = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        stats.incr(Counter::PointsWritten);
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut total = 0;
        for _ in 0..100 {
            total += stats.swap_and_take().get(Counter::PointsWritten);
        }
        for w in writers {
            w.join().unwrap();
        }
        total += stats.swap_and_take().get(Counter::PointsWritten);
        total += stats.swap_and_take().get(Counter::PointsWritten);

        assert_eq!(total, 40_000);
    }

    #[test]
    fn line_protocol() {
        let stats = StatsRecorder::new();
        stats.incr(Counter::QueryRequests);
        stats.add(Counter::QueryRequestDuration, 42);
        let line = stats
            .swap_and_take()
            .to_line_protocol("127.0.0.1:7076", "proxy 1", 1_434_055_562_000_000_000);

        assert_eq!(
            String::from_utf8(line).unwrap(),
            "influxdb.cluster,addr=127.0.0.1:7076,host=proxy\\ 1 \
             statQueryRequest=1i,statQueryRequestFail=0i,statWriteRequest=0i,\
             statWriteRequestFail=0i,statPingRequest=0i,statPingRequestFail=0i,\
             statPointsWritten=0i,statPointsWrittenFail=0i,statQueryRequestDuration=42i,\
             statWriteRequestDuration=0i 1434055562000000000\n"
        );
    }

    #[test]
    fn empty_host_is_reported_as_unknown() {
        let line = StatsRecorder::new()
            .swap_and_take()
            .to_line_protocol("127.0.0.1:7076", "", 1);
        let line = String::from_utf8(line).unwrap();

        assert!(
            line.starts_with("influxdb.cluster,addr=127.0.0.1:7076,host=unknown statQueryRequest=0i,"),
            "{line}"
        );
        let parsed = influxdb_line_protocol::parse_lines(&line)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(parsed.len(), 1);
    }
}
