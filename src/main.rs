use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use git_auth_proxy::config;
use git_auth_proxy::error::{ConfigError, ProxyError, Result};
use git_auth_proxy::gate::DecisionContext;
use git_auth_proxy::health;
use git_auth_proxy::proxy::tls::TlsHandler;
use git_auth_proxy::proxy::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "git-auth-proxy")]
#[command(about = "Credential-injecting forward proxy for a single git repository", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("git_auth_proxy={log_level}").parse().unwrap()),
        )
        .init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)?
        }
        None => config::load()?,
    };

    // Configuration errors are fatal before any socket is bound.
    let gate = Arc::new(DecisionContext::from_config(&config)?);
    let tls = Arc::new(TlsHandler::new(
        config.ca_cert_path.clone(),
        config.ca_key_path.clone(),
    )?);

    let proxy_addr: SocketAddr = parse_addr(&config.host, config.port)?;
    let health_addr: SocketAddr = parse_addr(&config.host, config.health_port)?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let health_shutdown = shutdown_tx.subscribe();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health::serve(health_addr, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    let proxy = ProxyServer::bind(proxy_addr, gate, tls).await?;
    info!("Git proxy active on {}", proxy.local_addr()?);
    info!(
        "Repository URL: {}, anonymous session: {}, policy: {:?}",
        config.repository_url, config.anonymous, config.policy
    );

    let proxy_shutdown = shutdown_tx.subscribe();
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run(proxy_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    shutdown_signal().await;
    info!("Shutting down git proxy");
    let _ = shutdown_tx.send(());

    let drained = tokio::time::timeout(tokio::time::Duration::from_secs(30), async {
        let _ = tokio::join!(proxy_handle, health_handle);
    })
    .await;

    match drained {
        Ok(_) => info!("Graceful shutdown completed"),
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| ProxyError::Config(ConfigError::Parse(format!("invalid listen address: {e}"))))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
