use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use humantime_serde::re::humantime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volley::{Engine, Metrics};

mod config;
mod monitor;
mod signal;

use monitor::Monitor;
use signal::{Outcome, Signals};

/// Volley: precisely paced load generator
///
/// Reads pool definitions from a config file (YAML, JSON or TOML) and runs
/// them until their schedules are exhausted or the process is interrupted.
/// Without a path, `load.*` is looked up in `.`, `./config` and `/etc/volley`.
/// Values may be overridden with `VOLLEY__<KEY>__<KEY>` environment variables.
///
/// Example usage:
///   volley load.yaml
///   volley --expvar --log-level debug load.yaml
///   volley --example > load.yaml
#[derive(Parser, Debug)]
#[command(name = "volley")]
#[command(version, about = "Precisely paced load generator", long_about = None)]
struct Cli {
    /// Path to the config file
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Print an example config and exit
    #[arg(long)]
    example: bool,

    /// Serve live counters on `--expvar-addr` at /debug/vars
    #[arg(long)]
    expvar: bool,

    #[arg(long, default_value = "0.0.0.0:1234")]
    expvar_addr: SocketAddr,

    /// Time pools get to stop after the first interrupt
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    interrupt_timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if cli.example {
        print!("{}", config::EXAMPLE);
        return Ok(ExitCode::SUCCESS);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = config::load(cli.config.as_deref())?;
    let metrics = Metrics::new();
    let pools = config
        .pools
        .into_iter()
        .enumerate()
        .map(|(index, pool)| pool.build(index, &metrics))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let engine = Arc::new(Engine::builder().pools(pools).metrics(metrics.clone()).build());

    let cancel = CancellationToken::new();
    let monitor_cancel = CancellationToken::new();
    let monitor = if cli.expvar {
        let monitor = Monitor::new(metrics);
        Some(tokio::spawn(
            monitor.serve(cli.expvar_addr, monitor_cancel.clone()),
        ))
    } else {
        None
    };

    let signals = Signals::new().context("failed to install signal handlers")?;
    let outcome =
        signal::run_until_signal(engine, cancel, signals, cli.interrupt_timeout).await;

    if matches!(outcome, Outcome::Timeout | Outcome::Aborted) {
        // Blocked stdin readers would keep the runtime from shutting down.
        std::process::exit(outcome.code().into());
    }

    monitor_cancel.cancel();
    if let Some(monitor) = monitor {
        match monitor.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("{err:#}"),
            Err(err) => tracing::warn!("Monitor task failed: {err}"),
        }
    }
    tracing::info!(?outcome, "Done");
    Ok(outcome.into())
}
