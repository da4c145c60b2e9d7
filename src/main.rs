//! Skyharvest main entry point
//!
//! This is the command-line interface for the Skyharvest repository harvester.

use anyhow::Context;
use clap::Parser;
use skyharvest::config::{load_config_with_hash, Config};
use skyharvest::crawler::run_harvest;
use skyharvest::output::install_recorder;
use skyharvest::shutdown::{ShutdownReason, ShutdownSignal};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Skyharvest: a resumable AT Protocol repository harvester
///
/// Skyharvest enumerates identities from a directory snapshot, keeps those on
/// healthy hosts, streams every repository through a fetch service and stores
/// the posts and profiles it finds.
#[derive(Parser, Debug)]
#[command(name = "skyharvest")]
#[command(version)]
#[command(about = "A resumable AT Protocol repository harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and print it without harvesting
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show stored statistics and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", hash);

    if cli.dry_run {
        handle_dry_run(&config);
        Ok(())
    } else if cli.stats {
        handle_stats(&config).await
    } else {
        handle_harvest(config).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("skyharvest=info,warn"),
            1 => EnvFilter::new("skyharvest=debug,info"),
            2 => EnvFilter::new("skyharvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: prints the validated configuration
fn handle_dry_run(config: &Config) {
    println!("=== Skyharvest Dry Run ===\n");

    println!("Directory:");
    println!("  Mirror: {}", config.directory.plc_db_path);
    println!("  Pairs cache: {}", config.directory.pairs_path);
    println!("  Relay host: {}", config.directory.relay_host);
    println!(
        "  Default host markers: {}",
        config.directory.default_host_markers.join(", ")
    );

    println!("\nHealth checks:");
    println!("  Cache: {}", config.health.cache_path);
    println!("  Concurrency: {}", config.health.concurrency);
    println!("  Timeout: {}s", config.health.timeout_secs);
    println!("  Max retries: {}", config.health.max_retries);

    println!("\nCrawler:");
    println!("  Fetch URL: {}", config.crawler.fetch_url);
    println!("  Concurrency: {}", config.crawler.concurrency);
    println!("  Chunk size: {}", config.crawler.chunk_size);
    println!("  Request timeout: {}s", config.crawler.request_timeout_secs);
    println!("  Stream idle timeout: {}s", config.crawler.stream_idle_timeout_secs);
    println!("  Retry passes: {}", config.crawler.retry_passes);
    match config.crawler.max_identities {
        Some(max) => println!("  Max identities: {}", max),
        None => println!("  Max identities: unlimited"),
    }

    println!("\nPersistence:");
    println!("  Output database: {}", config.persistence.database_path);
    println!("  State database: {}", config.persistence.state_path);
    println!("  Batch size: {}", config.persistence.batch_size);
    println!("  Batch timeout: {}ms", config.persistence.batch_timeout_ms);
    println!("  Max attempts: {}", config.persistence.max_attempts);
    println!("  On exhausted: {:?}", config.persistence.on_exhausted);

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: prints counters and row totals
async fn handle_stats(config: &Config) -> anyhow::Result<()> {
    use skyharvest::output::{load_statistics, print_statistics};
    use skyharvest::storage::{open_output_database, open_state_database};

    println!("State database: {}", config.persistence.state_path);
    println!("Output database: {}\n", config.persistence.database_path);

    let state = open_state_database(Path::new(&config.persistence.state_path))?;
    let output = open_output_database(Path::new(&config.persistence.database_path))?;

    let stats = load_statistics(&state, &output, 10).await?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main harvest
async fn handle_harvest(config: Config) -> anyhow::Result<()> {
    let metrics = install_recorder().context("failed to install metrics recorder")?;
    let shutdown = ShutdownSignal::new();
    spawn_signal_listener(shutdown.clone());

    let result = run_harvest(config, shutdown).await;
    tracing::info!("Final metrics:\n{}", metrics.render());

    match result {
        Ok(report) if report.interrupted => {
            tracing::info!("Harvest interrupted; the next run resumes where this one stopped");
            Ok(())
        }
        Ok(report) => {
            tracing::info!(
                "Harvest completed: {} identities selected, {} left for retry",
                report.selected,
                report.crawl.remaining_retry()
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("Harvest failed: {}", e);
            Err(e.into())
        }
    }
}

/// Trips the shutdown signal on SIGINT or SIGTERM
fn spawn_signal_listener(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.trigger(ShutdownReason::Signal);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
