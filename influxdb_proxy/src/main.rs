//! Entrypoint of the influxdb_proxy binary
use dotenvy::dotenv;
use influxdb_proxy_clap_blocks::{
    logging::{LogFormat, LoggingConfig},
    tokio::TokioIoConfig,
};
use influxdb_proxy_cluster::VERSION;

mod commands {
    pub(crate) mod serve;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "influxdb_proxy",
    version = VERSION,
    about = "Sharding and query fan-out proxy for InfluxDB 1.x",
    long_about = r#"Sharding and query fan-out proxy for InfluxDB 1.x

Examples:
    # Run the proxy with the cluster layout in ./proxy.json
    influxdb_proxy serve --config-file proxy.json

    # Prefer backends in zone "sh" for queries and copy every write to "backup"
    influxdb_proxy serve --config-file proxy.json --zone sh --nexts backup

    # Run with debug logging specified with LOG_FILTER
    LOG_FILTER=debug influxdb_proxy serve --config-file proxy.json
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioIoConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Run the proxy
    Serve(commands::serve::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;

    tokio_runtime.block_on(async move {
        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Serve(config)) => {
                if let Err(e) = init_logs(&config.logging_config) {
                    eprintln!("Initializing logs failed: {e}");
                    std::process::exit(ReturnCode::Failure as _);
                }
                if let Err(e) = commands::serve::command(config).await {
                    eprintln!("Serve command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct. Variables already set in the
/// environment win.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}

fn init_logs(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter()?)
        .with_writer(std::io::stderr);

    match config.log_format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}
