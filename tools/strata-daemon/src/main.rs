// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! strata-daemon - router and socket manager for one platform.
//!
//! Every process on the platform connects its portal to this daemon's
//! manager port, learns the router endpoints from it and exchanges
//! publications through the router.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata::{AppConfig, Daemon, InterProcessConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Run a strata router and manager.
#[derive(Parser, Debug)]
#[command(name = "strata-daemon")]
#[command(version)]
#[command(about = "strata inter-process router and socket manager")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML configuration file (uses its [interprocess] section)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Manager (control) port, 0 for an ephemeral port
    #[arg(short = 'm', long)]
    manager_port: Option<u16>,

    /// Router port for publishers
    #[arg(long)]
    publish_port: Option<u16>,

    /// Router port for subscribers
    #[arg(long)]
    subscribe_port: Option<u16>,

    /// Platform name clients must announce
    #[arg(short, long)]
    platform: Option<String>,

    /// Log filter (trace, debug, info, warn, error or a directive list)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Seconds between router statistics lines (0 disables)
    #[arg(short, long, default_value = "10")]
    stats_interval: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a configuration file with every default spelled out
    GenConfig,
    /// Check a configuration file and exit
    Validate {
        /// File to check
        path: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let result = match &args.command {
        Some(Command::GenConfig) => gen_config(),
        Some(Command::Validate { path }) => validate(path),
        None => run(&args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn gen_config() -> Result<()> {
    let config = AppConfig {
        name: "strata-daemon".to_string(),
        interprocess: Some(InterProcessConfig::default()),
        ..AppConfig::default()
    };
    print!("{}", config.to_toml()?);
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let config = AppConfig::from_file(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    let ipc = config.interprocess.unwrap_or_default();
    println!(
        "{}: ok (platform '{}', manager {})",
        path.display(),
        ipc.platform,
        ipc.manager_addr()
    );
    Ok(())
}

/// File settings first, then command-line overrides.
fn load_config(args: &Args) -> Result<(InterProcessConfig, String)> {
    let app = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AppConfig::default(),
    };
    let log_level = args.log_level.clone().unwrap_or(app.log_level);
    let mut ipc = app.interprocess.unwrap_or_default();

    if let Some(port) = args.manager_port {
        ipc.manager_port = port;
    }
    if let Some(port) = args.publish_port {
        ipc.router_publish_port = port;
    }
    if let Some(port) = args.subscribe_port {
        ipc.router_subscribe_port = port;
    }
    if let Some(platform) = &args.platform {
        ipc.platform = platform.clone();
    }
    Ok((ipc, log_level))
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level {level:?}"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let (config, log_level) = load_config(args)?;
    init_logging(&log_level)?;

    info!("strata-daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Platform: {}", config.platform);

    let mut daemon = Daemon::start(&config).context("failed to start daemon")?;
    info!("Manager:  {}", daemon.manager_addr());
    info!("Publish:  {}", daemon.router().publish_addr());
    info!("Subscribe: {}", daemon.router().subscribe_addr());

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    let interval = Duration::from_secs(args.stats_interval);
    let mut last_stats = Instant::now();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));

        if !daemon.router().is_running() {
            daemon.stop().ok();
            bail!("router thread exited unexpectedly");
        }

        if !interval.is_zero() && last_stats.elapsed() >= interval {
            last_stats = Instant::now();
            let stats = daemon.router().stats();
            info!(
                "in={} out={} dropped={} publishers={} subscribers={} prefixes={} ({:.1} msg/s)",
                stats.messages_in,
                stats.messages_out,
                stats.dropped_hwm,
                stats.publishers,
                stats.subscribers,
                stats.subscriptions,
                stats.messages_per_second()
            );
        }
    }

    info!("Shutting down");
    if let Err(e) = daemon.stop() {
        warn!("Shutdown error: {e}");
    }
    Ok(())
}
