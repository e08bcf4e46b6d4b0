use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nodegate_core::config::{Config, LoggingConfig, StoreKind};
use nodegate_core::file_store::FileStore;
use nodegate_core::store::{MemoryStore, RecordStore};
use nodegate_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "nodegate",
    about = "Gateway for fleets of node agents: liveness, telemetry, and remote commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Gateway {
        /// Port to listen on (default: 8470)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show gateway status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate the configuration file
    Check,
}

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    for directive in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring invalid log filter '{directive}': {e}"),
        }
    }

    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

fn open_store(config: &Config) -> Arc<dyn RecordStore> {
    match config.store_kind() {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => {
            let dir = config.store_dir();
            tracing::info!(dir = %dir.display(), "Using file store");
            Arc::new(FileStore::new(dir))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);

    let mut config = Config::load(&config_path)?;

    // Initialize logging
    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Gateway { port, bind } => {
            if let Some(bind) = bind {
                config.gateway.get_or_insert_with(Default::default).bind = Some(bind);
            }
            let port = port.unwrap_or_else(|| config.gateway_port());

            let (warnings, errors) = config.validate();
            for w in &warnings {
                tracing::warn!("{w}");
            }
            for e in &errors {
                tracing::error!("{e}");
            }
            if !errors.is_empty() {
                anyhow::bail!(
                    "{} config error(s) in {}; run `nodegate config check`",
                    errors.len(),
                    config_path.display()
                );
            }

            tracing::info!("Starting nodegate on port {port}");
            let store = open_store(&config);
            let state = GatewayState::new(Arc::new(config), store);

            #[cfg(feature = "metrics")]
            let state = state.with_metrics(nodegate_gateway::metrics::install_prometheus_recorder()?);

            nodegate_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Status => {
            let port = config.gateway_port();
            println!("nodegate v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway port: {port}");
            println!("Store: {:?}", config.store_kind());

            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()?;
            match client.get(format!("http://127.0.0.1:{port}/health")).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    println!("Status: running ({} nodes connected)", body["nodes"]);
                }
                _ => println!("Status: not running"),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Check => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}
