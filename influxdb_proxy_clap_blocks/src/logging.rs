//! CLI flags for log filtering and formatting.
use tracing_subscriber::{EnvFilter, filter::ParseError};

/// Filter used when neither `--log-filter` nor `-v` is given.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, single line.
    #[default]
    Full,

    /// Human-readable, multi line.
    Pretty,

    /// Machine-parseable JSON objects, one per line.
    Json,
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,hyper::proto::h1=info` specifies debug logging for all modules
    /// except for the `hyper::proto::h1` module which will only display info
    /// level logging.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug,hyper::proto::h1=info,h2=info'
    ///
    /// -vvv 'trace,hyper::proto::h1=info,h2=info'
    #[clap(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        verbatim_doc_comment
    )]
    pub log_verbose_count: u8,

    /// Logs: message format
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value_t = LogFormat::default(),
        value_enum,
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    /// The effective filter directives, honouring `-v` over `--log-filter`.
    pub fn filter_directives(&self) -> String {
        match self.log_verbose_count {
            0 => self
                .log_filter
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            1 => "info".to_string(),
            2 => "debug,hyper::proto::h1=info,h2=info".to_string(),
            _ => "trace,hyper::proto::h1=info,h2=info".to_string(),
        }
    }

    /// Build the [`EnvFilter`] for [`Self::filter_directives`].
    pub fn env_filter(&self) -> Result<EnvFilter, ParseError> {
        EnvFilter::try_new(self.filter_directives())
    }
}
