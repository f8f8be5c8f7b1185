//! vpipe: run a video pipeline graph from a configuration file

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use vpipe::blocks::{self, console, null, test_pattern};
use vpipe::{BlockDef, BlockRegistry, GraphConfig, PipelineManager};

#[derive(Parser, Debug)]
#[command(author, version, about = "Graph-based video frame pipeline", long_about = None)]
struct Args {
    /// Graph description (TOML, or JSON by extension). Runs a demo graph when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to run before shutting down (0 runs until Ctrl-C)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Seconds between statistics reports
    #[arg(long, default_value = "5")]
    stats_interval: u64,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "vpipe=info")]
    log_filter: String,

    /// List registered block types and exit
    #[arg(long)]
    list_types: bool,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let subscriber = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let subscriber = subscriber.with(tracing_tracy::TracyLayer::default());
    subscriber.try_init()?;
    Ok(())
}

fn demo_graph() -> GraphConfig {
    GraphConfig::new("demo")
        .block(
            BlockDef::new("pattern", test_pattern::TYPE_NAME)
                .param("width", 320)
                .param("height", 240)
                .param("fps", 15)
                .param("pattern", "moving_box")
                .param("use_pool", true)
                .param("buffer_count", 8),
        )
        .block(BlockDef::new("console", console::TYPE_NAME).param("queue_depth", 4))
        .block(
            BlockDef::new("discard", null::TYPE_NAME)
                .param("blocking", false)
                .param("delay_ms", 5),
        )
        .connect("pattern.output", "console.input")
        .connect("pattern.output", "discard.input")
}

fn report_stats(manager: &PipelineManager) {
    for (name, stats) in manager.all_stats() {
        info!(
            block = %name,
            processed = stats.frames_processed,
            dropped = stats.frames_dropped,
            bytes = stats.bytes_processed,
            fps = (stats.avg_fps * 10.0).round() / 10.0,
            latency_ms = (stats.avg_latency_ms * 100.0).round() / 100.0,
            queue = stats.queue_depth,
            "block stats"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(&args.log_filter)?;

    info!(version = vpipe::VERSION, "vpipe launching");

    let registry = Arc::new(BlockRegistry::new());
    blocks::register_builtin(&registry);
    if args.list_types {
        for block_type in registry.registered_types() {
            println!("{block_type}");
        }
        return Ok(());
    }

    let manager = PipelineManager::new(registry);
    manager.set_error_handler(|block, message| {
        metrics::counter!("vpipe_block_errors_total", "block" => block.to_string()).increment(1);
        warn!(block, message, "pipeline degraded");
    });

    match &args.config {
        Some(path) => manager.load_file(path),
        None => manager.initialize(demo_graph()),
    }
    .map_err(|e| eyre!("failed to build pipeline: {e}"))?;
    manager
        .start()
        .map_err(|e| eyre!("failed to start pipeline: {e}"))?;
    print!("{}", manager.status());

    let run_for = async {
        match args.duration {
            0 => std::future::pending::<()>().await,
            secs => tokio::time::sleep(Duration::from_secs(secs)).await,
        }
    };
    tokio::pin!(run_for);
    let mut stats = tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));
    stats.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = &mut run_for => {
                info!(seconds = args.duration, "run time elapsed");
                break;
            }
            _ = stats.tick() => report_stats(&manager),
        }
    }

    manager.stop()?;
    report_stats(&manager);
    manager.shutdown();

    info!("vpipe shutting down");
    Ok(())
}
