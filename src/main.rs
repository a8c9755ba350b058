//! speedfluxd: periodic internet speed measurements persisted to InfluxDB.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use speedfluxd::config::Config;
use speedfluxd::daemon::Daemon;
use speedfluxd::influx::InfluxSink;
use speedfluxd::logging::{init_logging, LogConfig};
use speedfluxd::speedtest::SpeedtestCli;
use std::path::PathBuf;
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "speedfluxd")]
#[command(author, version, about = "Periodic speed tests persisted to InfluxDB")]
struct Cli {
    /// Run a single measurement cycle and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Path to the speedtest CLI binary
    #[arg(long, default_value = "speedtest")]
    speedtest_bin: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info");
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = match init_logging(&log_config) {
        Ok(guards) => Some(guards),
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            None
        }
    };

    if let Err(err) = run(cli).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    debug!("Loading configuration");
    let config = Config::from_env().map_err(|err| {
        for issue in &err.errors {
            error!("{issue}");
        }
        err
    })?;
    debug!("Configuration successfully loaded");

    let sink = InfluxSink::connect(&config.influx).await?;
    let measurer = SpeedtestCli::new().with_binary(cli.speedtest_bin);
    let daemon = Daemon::new(&config, measurer, sink);

    if cli.once {
        let stats = daemon.cycle().await?;
        info!(
            published = stats.published,
            dropped = stats.dropped,
            skipped = stats.skipped,
            "Cycle complete"
        );
        Ok(())
    } else {
        daemon.run().await?;
        Ok(())
    }
}
