use anyhow::Context;
use clap::{Parser, Subcommand};
use compuerta::config::Config;
use compuerta::core::NodeRole;
use compuerta::Proxy;
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "compuerta")]
#[command(
    about = "A transparent PostgreSQL cluster proxy with read/write query routing and transaction-aware backend pinning"
)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Compuerta Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_proxy(config),
        Commands::Config { output } => generate_config(output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn run_proxy(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    info!("Starting compuerta v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Listening on: {}", config.server.listen_addr);
    info!(
        "Backend nodes: {} ({} per-node pool capacity)",
        config.nodes.len(),
        config.pool.capacity
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.server.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let runtime = builder.build().context("Failed to build runtime")?;

    let proxy = Proxy::new(config);
    runtime
        .block_on(proxy.run())
        .context("Failed to run compuerta")
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating example configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your cluster and run:");
    println!("  compuerta run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = Config::load_from_file(&config_path).map_err(|e| {
        eprintln!("✗ Configuration file validation failed:");
        eprintln!("  {}", e);
        anyhow::Error::new(e)
    })?;

    println!("✓ Configuration file is valid");
    println!("  Listen address: {}", config.server.listen_addr);
    println!("  Pool capacity: {} per node", config.pool.capacity);
    println!("  Database: {}", config.credentials.database);
    println!(
        "  SSL: {}",
        if config.credentials.ssl.enable {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  Backend nodes: {} instances", config.nodes.len());
    for (name, node) in &config.nodes {
        let role = match node.role {
            NodeRole::Primary => "primary",
            NodeRole::Replica => "replica",
        };
        println!("    {} ({}): {}", name, role, node.host_port);
    }

    Ok(())
}

fn show_version() {
    println!("compuerta v{}", env!("CARGO_PKG_VERSION"));
    println!("A transparent PostgreSQL cluster proxy");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Read/write query routing via query annotations");
    println!("  • Transaction-block pinning to a single backend");
    println!("  • Warm, role-partitioned backend connection pools");
    println!("  • Optional SSL negotiation on both sides of the relay");
    println!("  • Per-node query statistics");
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let log_level = match config.logging.level.as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    // library internals log through tracing; honor RUST_LOG when set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    info!("Logging initialized at level: {:?}", log_level);
    Ok(())
}
