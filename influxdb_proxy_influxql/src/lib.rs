//! Just enough InfluxQL for a sharding proxy.
//!
//! The proxy never executes InfluxQL. It needs to know what kind of statement a client sent,
//! which measurement the statement reads from, and, for a `SELECT` that spans several shard
//! groups, which aggregate calls it projects so that `mean` can be split into `sum` and `count`
//! and merged afterwards. Everything else about a statement is carried through as the client
//! wrote it.
//!
//! ```
//! use influxdb_proxy_influxql::{StatementKind, parse_statements, rewrite_mean, SelectStatement};
//!
//! let statements = parse_statements("SELECT mean(usage) FROM cpu WHERE time > now() - 1m").unwrap();
//! assert_eq!(statements.len(), 1);
//! assert_eq!(statements[0].kind(), StatementKind::Select);
//! assert_eq!(statements[0].measurement().unwrap(), "cpu");
//!
//! let select = SelectStatement::try_from(&statements[0]).unwrap();
//! assert_eq!(
//!     rewrite_mean(&select).text(),
//!     "SELECT sum(usage), count(usage) FROM cpu WHERE time > now() - 1m",
//! );
//! ```

mod lexer;
mod rewrite;
mod select;
mod statement;

pub use rewrite::{DistributedSelect, rewrite_mean};
pub use select::{Call, Field, SelectStatement};
pub use statement::{Statement, StatementKind, parse_statements};

/// Errors raised while analysing InfluxQL text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A quoted identifier or string literal was never closed.
    #[error("unterminated {what} at offset {offset}")]
    Unterminated {
        /// What was left open.
        what: &'static str,
        /// Byte offset of the opening quote.
        offset: usize,
    },

    /// The statement has no top-level `FROM` clause.
    #[error("statement has no FROM clause")]
    MissingFrom,

    /// `FROM` is not followed by a measurement name.
    #[error("expected measurement name after FROM")]
    MissingMeasurement,

    /// The source is a regular expression and cannot name one measurement.
    #[error("measurement regex {0} does not name a single measurement")]
    RegexSource(String),

    /// The source is a subquery.
    #[error("subquery sources are not supported")]
    Subquery,

    /// Attempted to analyse a statement that is not a `SELECT` as one.
    #[error("not a SELECT statement")]
    NotSelect,

    /// A projection list contained an empty field, e.g. `SELECT a,, b`.
    #[error("empty field in projection")]
    EmptyField,
}

/// Result type for this crate.
pub type Result<T, E = ParseError> = std::result::Result<T, E>;
