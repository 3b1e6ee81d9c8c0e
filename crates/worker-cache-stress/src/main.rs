use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use worker_cache::config::Config;
use worker_cache::metrics;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Hammers resource caches and the garbage collector with synthetic workloads.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Runs the tracing machinery, discarding its output.
    #[arg(long)]
    tracing: bool,

    /// Sends metrics to a local sink.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        traces_sample_rate: 1.0,
        ..Default::default()
    });

    let logging = logging::Config {
        backtraces: config.logging.enable_backtraces,
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: The runtime is not started yet, so this is still single-threaded.
    let guard = unsafe { logging::init(logging) }.context("failed to initialize logging")?;
    if !cli.tracing {
        // SAFETY: Same as above.
        unsafe { worker_cache::logging::init_logging(&config) };
    }
    if !cli.metrics {
        if let Some(ref statsd) = config.metrics.statsd {
            metrics::configure_statsd(
                &config.metrics.prefix,
                statsd.as_str(),
                config.metrics.custom_tags.clone(),
            )
            .context("failed to configure statsd")?;
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async move {
        if let Some(udp_sink) = guard.udp_sink {
            tokio::spawn(udp_sink);
        }

        perform_stresstest(config, workloads, cli.duration).await
    })
}
