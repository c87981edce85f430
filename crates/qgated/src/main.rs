//! qgated — the qgate daemon.
//!
//! Assembles the gateway:
//! - Config (`qgate.toml`)
//! - Token issuer for service-principal logins
//! - PostgreSQL connector + session pool
//! - REST API
//!
//! # Usage
//!
//! ```text
//! qgated serve --config qgate.toml --listen 0.0.0.0:8080
//! qgated check --config qgate.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use qgate_api::{ApiState, build_router, pool_config};
use qgate_auth::{AadTokenIssuer, CachingTokenIssuer, TokenIssuer};
use qgate_core::GatewayConfig;
use qgate_core::config::ASAZURE_RESOURCE;
use qgate_pg::PgConnector;
use qgate_pool::SessionPool;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,qgated=debug,qgate=debug";

#[derive(Parser)]
#[command(name = "qgated", about = "qgate query gateway daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        /// Path to qgate.toml.
        #[arg(long, default_value = "qgate.toml")]
        config: PathBuf,

        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Override `backend.server`.
        #[arg(long)]
        server: Option<String>,

        /// Override `backend.database`.
        #[arg(long)]
        database: Option<String>,
    },

    /// Validate a config file and print the resolved settings.
    Check {
        #[arg(long, default_value = "qgate.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            config,
            listen,
            server,
            database,
        } => {
            let mut config = load_config(&config)?;
            if let Some(server) = server {
                config.backend.server = server;
            }
            if let Some(database) = database {
                config.backend.database = Some(database);
            }
            config.validate()?;
            serve(config, listen).await
        }
        Command::Check { config } => check(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    GatewayConfig::from_file(path).with_context(|| format!("failed to load config from {}", path.display()))
}

/// The resource service-principal tokens are requested for.
fn token_resource(config: &GatewayConfig) -> anyhow::Result<String> {
    let target = config.target()?;
    Ok(target
        .resource()
        .map(str::to_string)
        .or_else(|| config.auth.resource.clone())
        .unwrap_or_else(|| ASAZURE_RESOURCE.to_string()))
}

async fn serve(config: GatewayConfig, listen: SocketAddr) -> anyhow::Result<()> {
    let target = config.target()?;
    info!(
        server = %config.backend.server,
        database = ?config.default_database(),
        cloud = target.is_cloud(),
        "qgate daemon starting"
    );

    let resource = token_resource(&config)?;
    let issuer = AadTokenIssuer::new(&config.auth.authority, &resource)?;
    let issuer: Arc<dyn TokenIssuer> = Arc::new(CachingTokenIssuer::new(Arc::new(issuer)));
    info!(authority = %config.auth.authority, %resource, "token issuer initialized");

    let connector = Arc::new(PgConnector::new(config.backend.default_user.clone()));
    let pool = Arc::new(SessionPool::new(pool_config(&config)?, connector));
    info!(
        guard_window = ?pool.config().guard_window,
        default_validity = ?pool.config().default_validity,
        "session pool initialized"
    );

    let state = ApiState::new(config, issuer, Arc::clone(&pool))?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown signal received");
        })
        .await?;

    let drained = pool.drain().await;
    info!(drained, "qgate daemon stopped");
    Ok(())
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let target = config.target()?;
    let summary = serde_json::json!({
        "server": config.backend.server,
        "database": config.default_database(),
        "cloud": target.is_cloud(),
        "resource": token_resource(&config)?,
        "allow_anonymous": config.allow_anonymous(),
        "guard_window": format!("{:?}", config.guard_window()?),
        "default_validity": format!("{:?}", config.default_validity()?),
        "command_timeout": format!("{:?}", config.command_timeout()?),
        "result_mode": config.query.result_mode,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
