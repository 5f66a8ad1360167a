//! membroker server binary
//!
//! Runs the memory-pool broker: owns the configured pools, accepts
//! client control-channel connections, and reclaims idle or orphaned
//! ranges as demand shifts.
//!
//! # Examples
//!
//! ```bash
//! # Start with one 4 GiB pool on the default port
//! membroker serve --pool-bytes 4294967296
//!
//! # Start from a config file
//! membroker serve --config /etc/membroker.toml
//!
//! # Validate a config file without starting
//! membroker check-config --config /etc/membroker.toml
//! ```

use clap::{Args, Parser, Subcommand};
use membroker::config::{BrokerConfig, PoolConfig};
use membroker::network::{ControlServer, ServerConfig};
use membroker::Broker;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// membroker - cross-process memory pool broker
#[derive(Parser, Debug)]
#[command(name = "membroker")]
#[command(version = membroker::VERSION)]
#[command(about = "Cross-process memory pool broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "MEMBROKER_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the broker server
    Serve(ServeArgs),

    /// Validate a configuration file and print the resolved settings
    CheckConfig {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show server version
    Version,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Configuration file path
    #[arg(short, long, env = "MEMBROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Control-channel bind address (overrides config)
    #[arg(short, long, env = "MEMBROKER_BIND")]
    bind: Option<String>,

    /// Maximum concurrent client connections (overrides config)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Create a single pool of this many bytes when the config defines
    /// no pools
    #[arg(long, env = "MEMBROKER_POOL_BYTES")]
    pool_bytes: Option<u64>,

    /// Default per-session quota in bytes for clients that request none
    #[arg(long)]
    default_quota: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    match cli.command {
        Commands::Serve(args) => serve_command(args).await,
        Commands::CheckConfig { config } => check_config_command(config),
        Commands::Version => {
            println!("membroker {}", membroker::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "membroker.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

async fn serve_command(args: ServeArgs) -> anyhow::Result<()> {
    info!("membroker {} starting", membroker::VERSION);

    let mut config = BrokerConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(max) = args.max_connections {
        config.server.max_connections = max;
    }
    if let Some(quota) = args.default_quota {
        config.limits.default_quota_bytes = Some(quota);
    }
    if config.pools.is_empty() {
        if let Some(capacity) = args.pool_bytes {
            config.pools.push(PoolConfig {
                capacity_bytes: capacity,
                base_address: 0,
            });
        }
    }
    config.validate()?;

    membroker::metrics::init_metrics();

    let broker = Arc::new(Broker::from_config(&config)?);
    for pool in broker.pools() {
        info!(
            pool = pool.id(),
            capacity = pool.capacity(),
            base = format_args!("0x{:x}", pool.base_address()),
            "pool online"
        );
    }

    let sweeper = broker.spawn_liveness_sweeper();

    let server_config = ServerConfig {
        bind_addr: config.server.bind.parse()?,
        max_connections: config.server.max_connections,
    };
    let server = ControlServer::new(server_config, broker);
    let result = server.serve().await;

    sweeper.abort();
    result
}

fn check_config_command(path: PathBuf) -> anyhow::Result<()> {
    let config = BrokerConfig::load(Some(&path))?;
    config.validate()?;
    println!("configuration OK");
    println!("  bind:            {}", config.server.bind);
    println!("  max connections: {}", config.server.max_connections);
    println!(
        "  heartbeat:       {}ms interval, {}ms timeout",
        config.timing.heartbeat_interval_ms, config.timing.heartbeat_timeout_ms
    );
    println!("  release timeout: {}ms", config.timing.release_timeout_ms);
    match config.limits.default_quota_bytes {
        Some(quota) => println!("  default quota:   {} bytes", quota),
        None => println!("  default quota:   unlimited"),
    }
    for (i, pool) in config.pools.iter().enumerate() {
        println!(
            "  pool {}:          {} bytes @ 0x{:x}",
            i, pool.capacity_bytes, pool.base_address
        );
    }
    Ok(())
}
