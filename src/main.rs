//! mcp-router - Local MCP router
//!
//! A long-running service that multiplexes HTTP clients onto a pool of
//! locally supervised MCP server subprocesses speaking JSON-RPC over stdio.
//!
//! # Features
//!
//! - **Managed lifecycle**: spawn, stop, and monitor stdio servers with
//!   supervised auto-restart
//! - **Resilient routing**: per-server circuit breaking on the dispatch path
//! - **Prompt enhancement**: optional rewrite stage backed by a local LLM
//!   with caching and graceful degradation

use clap::{Parser, Subcommand};
use mcp_router::enhancement::{EnhancementService, EnhancementSettings};
use mcp_router::http::{self, AppState};
use mcp_router::llm::LlmConfig;
use mcp_router::process::{EnvCredentials, ProcessManager};
use mcp_router::proxy::Dispatcher;
use mcp_router::registry::ServerRegistry;
use mcp_router::resilience::CircuitBreakerRegistry;
use mcp_router::supervisor::{Supervisor, DEFAULT_CHECK_INTERVAL};
use mcp_router::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "mcp-router")]
#[command(about = "Local MCP router with supervised stdio servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the servers config file
    #[arg(short, long, env = "MCP_ROUTER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MCP_ROUTER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the router
    Start {
        /// Server host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port
        #[arg(long, default_value = "9090")]
        port: u16,

        /// Path to the enhancement rules file
        #[arg(long, env = "MCP_ROUTER_ENHANCEMENT_RULES")]
        enhancement_rules: Option<PathBuf>,

        /// Base URL of the local LLM daemon
        #[arg(
            long,
            env = "MCP_ROUTER_LLM_URL",
            default_value = "http://localhost:11434"
        )]
        llm_url: String,
    },

    /// Validate a servers config file
    Validate {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// List configured servers
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Start {
            host,
            port,
            enhancement_rules,
            llm_url,
        } => {
            start(cli.config, host, port, enhancement_rules, llm_url).await?;
        },

        Commands::Validate { config } => {
            let registry = ServerRegistry::new(&config);
            match registry.load() {
                Ok(()) => {
                    println!(
                        "Configuration valid: {} server(s)",
                        registry.list_names().len()
                    );
                },
                Err(e) => {
                    eprintln!("Configuration errors found:");
                    eprintln!("{}", e);
                    std::process::exit(1);
                },
            }
        },

        Commands::List => {
            let registry = ServerRegistry::new(cli.config.unwrap_or_else(default_config_path));
            registry.load()?;

            println!("Configured MCP servers:");
            for state in registry.list_all() {
                println!(
                    "  - {} ({}): {:?}",
                    state.config.name, state.config.package, state.config.transport
                );
            }
        },
    }

    Ok(())
}

async fn start(
    config: Option<PathBuf>,
    host: String,
    port: u16,
    enhancement_rules: Option<PathBuf>,
    llm_url: String,
) -> Result<()> {
    info!("mcp-router v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = config.unwrap_or_else(default_config_path);
    info!("Using config: {}", config_path.display());

    let registry = Arc::new(ServerRegistry::new(&config_path));
    registry.load()?;

    let process_manager = Arc::new(ProcessManager::new(
        registry.clone(),
        Arc::new(EnvCredentials),
    ));
    let supervisor = Arc::new(Supervisor::new(
        registry.clone(),
        process_manager,
        DEFAULT_CHECK_INTERVAL,
    ));
    supervisor.start().await;

    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        supervisor.clone(),
        breakers.clone(),
    ));

    let enhancement = Arc::new(EnhancementService::new(EnhancementSettings {
        rules_path: enhancement_rules,
        llm: LlmConfig {
            base_url: llm_url,
            ..Default::default()
        },
        ..Default::default()
    }));
    enhancement.initialize().await;

    let state = AppState {
        registry,
        supervisor: supervisor.clone(),
        dispatcher,
        breakers,
        enhancement: enhancement.clone(),
    };

    http::serve(state, &host, port).await?;

    enhancement.close().await;
    supervisor.stop().await;
    info!("Router stopped");
    Ok(())
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".mcp-router").join("mcp-servers.json"))
        .unwrap_or_else(|| PathBuf::from("mcp-servers.json"))
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}
