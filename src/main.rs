//! Injector - per-host service injection agent
//!
//! Makes one fronted service reachable on tenant networks by running an
//! isolated HAProxy per cloud network and relaying its traffic upstream.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use injector_agent::{Agent, AgentConfig};
use injector_haproxy::ProxyConfig;
use injector_proto::{Protocol, RuntimeLayout};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Injector - expose a service on tenant networks through isolated proxies
#[derive(Parser, Debug)]
#[command(name = "injector")]
#[command(about = "Expose a service on tenant networks through namespace-isolated proxies")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "INJECTOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database URL (overrides the config file)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent until interrupted
    #[command(long_about = r#"
Register the configured service, then reconcile its endpoints: every
tenant network with an endpoint gets a namespace-isolated HAProxy that
forwards the service ports to the upstream host.

EXAMPLES:
  # Run with a config file
  injector run --config /etc/injector/agent.yaml

  # Override the database and host name
  injector run -c agent.yaml \
    --database-url "postgres://injector@db/injector" \
    --host node-07

ENVIRONMENT VARIABLES:
  INJECTOR_CONFIG   Configuration file
  DATABASE_URL      Database URL
  INJECTOR_HOST     Host name the service is registered under
    "#)]
    Run {
        /// Host name the service is registered under
        #[arg(long, env = "INJECTOR_HOST")]
        host: Option<String>,

        /// Availability zone the service is registered under
        #[arg(long, env = "INJECTOR_AVAILABILITY_ZONE")]
        availability_zone: Option<String>,

        /// Directory for proxy configs, pidfiles, logs and sockets
        #[arg(long)]
        runtime_dir: Option<PathBuf>,
    },

    /// Apply database migrations and exit
    Migrate,

    /// Print the proxy configuration for a network
    RenderConfig {
        /// Cloud network ID
        #[arg(long)]
        network_id: String,

        /// Service ports (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        ports: Vec<u16>,

        /// Service protocol (tcp or http)
        #[arg(long, default_value = "tcp")]
        protocol: Protocol,

        /// Upstream host
        #[arg(long)]
        upstream_host: String,

        /// Directory the socket and pidfile paths are rendered under
        #[arg(long, default_value = "/var/run/injector")]
        runtime_dir: PathBuf,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load the config file and apply CLI overrides
fn build_agent_config(
    config_path: Option<&PathBuf>,
    database_url: Option<String>,
    host: Option<String>,
    availability_zone: Option<String>,
    runtime_dir: Option<PathBuf>,
) -> Result<AgentConfig> {
    let path = config_path
        .context("A configuration file is required (use --config or INJECTOR_CONFIG)")?;
    info!("Loading configuration from: {}", path.display());
    let mut config = AgentConfig::load(path)?;

    // CLI args override config file
    if let Some(url) = database_url {
        config.database_url = url;
    }
    if let Some(host) = host {
        config.host = host;
    }
    if availability_zone.is_some() {
        config.availability_zone = availability_zone;
    }
    if let Some(dir) = runtime_dir {
        config.runtime_dir = dir;
    }

    config.validate()?;
    Ok(config)
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    info!("Injector starting...");
    info!("Service: {}", config.service.name);
    info!("Host: {}", config.host);
    info!("Upstream: {} ports {:?}", config.service.upstream_host, config.service.ports);
    info!("Runtime directory: {}", config.runtime_dir.display());

    let db = injector_db::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    injector_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;

    let agent = Agent::bootstrap(config, db)
        .await
        .context("Failed to start agent")?;

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(agent.run(shutdown.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
    shutdown.cancel();

    if let Err(e) = running.await {
        error!("Agent task panicked: {}", e);
        return Err(e.into());
    }

    info!("Injector stopped");
    Ok(())
}

async fn migrate(config_path: Option<&PathBuf>, database_url: Option<String>) -> Result<()> {
    let database_url = match database_url {
        Some(url) => url,
        None => {
            let path = config_path
                .context("Database URL is required (use --database-url or config file)")?;
            AgentConfig::load(path)?.database_url
        }
    };

    let db = injector_db::connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    injector_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;

    Ok(())
}

fn render_config(
    network_id: &str,
    ports: &[u16],
    protocol: Protocol,
    upstream_host: &str,
    runtime_dir: PathBuf,
) -> Result<()> {
    let layout = RuntimeLayout::new(runtime_dir);
    let rendered = ProxyConfig {
        network_id,
        upstream_host,
        ports,
        protocol,
        layout: &layout,
        user: None,
        group: None,
    }
    .render()
    .context("Failed to render proxy configuration")?;

    print!("{}", rendered);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Run {
            host,
            availability_zone,
            runtime_dir,
        } => {
            let config = build_agent_config(
                cli.config.as_ref(),
                cli.database_url,
                host,
                availability_zone,
                runtime_dir,
            )?;
            run_agent(config).await
        }
        Commands::Migrate => migrate(cli.config.as_ref(), cli.database_url).await,
        Commands::RenderConfig {
            network_id,
            ports,
            protocol,
            upstream_host,
            runtime_dir,
        } => render_config(&network_id, &ports, protocol, &upstream_host, runtime_dir),
    }
}
