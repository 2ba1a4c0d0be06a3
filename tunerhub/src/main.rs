//! tunerhub: share a set of tuners between concurrent stream requests.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use tunerhub::config::Config;
use tunerhub::logging;
use tunerhub::tuner::{TunerPool, TunerUser};

/// tunerhub - tuner resource manager and stream pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long, env = "TUNERHUB_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory where log files are stored (overrides the config file)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration, then print it
    Check {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stream one channel to stdout
    Stream {
        /// Channel name from the configuration
        channel: String,
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Start the pool and keep it up until Ctrl-C
    Run,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let Some(path) = Config::locate(args.config.clone()) else {
        return Err("No configuration file: pass --config or create tunerhub.toml".into());
    };
    match Config::load(&path) {
        Ok(config) => {
            eprintln!("Loaded config from: {}", path.display());
            Ok(config)
        }
        Err(e) => {
            eprintln!("Failed to load config file {}: {}", path.display(), e);
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Command line takes precedence over the config file.
    let log_dir = args.log_dir.clone().or_else(|| config.logging.log_dir.clone());
    let _log_guard = logging::init_logging(
        log_dir.as_deref(),
        config.logging.retention_days,
        args.verbose,
        &config.logging.level,
    )?;

    match args.command {
        Command::Check { json } => check(&config, json),
        Command::Stream { channel, duration } => stream(config, &channel, duration).await,
        Command::Run => run(config).await,
    }
}

fn check(config: &Config, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        let report = serde_json::json!({
            "channels": config.catalog.channels(),
            "tuners": config.tuners,
            "filters": config.filters,
            "server": {
                "grace_period_ms": config.pool.grace_period.as_millis() as u64,
                "stop_timeout_ms": config.pool.stop_timeout.as_millis() as u64,
                "stall_timeout_ms": config.pool.stall_timeout.map_or(0, |d| d.as_millis() as u64),
                "chunk_size": config.pool.chunk_size,
                "subscriber_buffer": config.pool.subscriber_buffer,
                "overflow": config.pool.overflow,
            },
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Channels ({}):", config.catalog.len());
    for channel in config.catalog.channels() {
        println!("  {:<16} {}", channel.name, channel.key());
    }
    println!("Tuners ({}):", config.tuners.len());
    for tuner in &config.tuners {
        let types: Vec<&str> = tuner.types.iter().map(|t| t.as_str()).collect();
        println!("  {:<16} [{}] {}", tuner.name, types.join(","), tuner.command);
    }
    println!("Filters ({}):", config.filters.len());
    for (index, filter) in config.filters.iter().enumerate() {
        println!("  {}: {}", index + 1, filter.command().unwrap_or("(passthrough)"));
    }
    println!("Configuration OK");
    Ok(())
}

async fn stream(
    config: Config,
    channel: &str,
    duration: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = TunerPool::new(config.tuners, config.filters, config.pool);

    let mut user = TunerUser::new("cli");
    if let Some(secs) = duration {
        user = user.with_duration(secs);
    }
    let lease = match pool.acquire_by_name(&config.catalog, channel, user).await {
        Ok(lease) => lease,
        Err(e) => {
            error!("Failed to acquire {}: {}", channel, e);
            return Err(e.into());
        }
    };
    info!("Streaming {} from {}", lease.channel(), lease.tuner_name());

    let subscription = lease.attach();
    let mut stdout = tokio::io::stdout();
    let limit = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = subscription.pipe_to(&mut stdout) => match result {
            Ok(bytes) => info!("Stream ended after {} bytes", bytes),
            Err(e) => warn!("Stream stopped: {}", e),
        },
        _ = limit => info!("Duration elapsed"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    pool.shutdown().await;
    Ok(())
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("tunerhub starting...");
    info!("  Channels: {}", config.catalog.len());
    info!("  Grace period: {} ms", config.pool.grace_period.as_millis());
    info!("  Overflow policy: {:?}", config.pool.overflow);

    let pool = TunerPool::new(config.tuners, config.filters, config.pool);
    for status in pool.status().await {
        let types: Vec<&str> = status.types.iter().map(|t| t.as_str()).collect();
        info!("  Tuner {}: {} [{}]", status.index, status.name, types.join(","));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    pool.shutdown().await;

    let stats = pool.stats();
    info!(
        "Captures spawned: {}, torn down: {}, spawn failures: {}",
        stats.captures_spawned, stats.captures_torn_down, stats.spawn_failures
    );
    Ok(())
}
