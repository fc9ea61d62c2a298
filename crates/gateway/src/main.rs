use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use leon_gateway::api;
use leon_gateway::bootstrap;
use leon_gateway::cli::{run_client_command, Cli, Client, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            serve().await
        }
        Some(command) => {
            let base = match cli.url {
                Some(url) => url,
                None => default_base_url()?,
            };
            if let Err(e) = run_client_command(Client::new(base), command).await {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,leon_gateway=debug")),
        )
        .init();
}

fn default_base_url() -> anyhow::Result<String> {
    let home = bootstrap::leon_home();
    let config = bootstrap::load_config(&home).context("loading config")?;
    Ok(format!("http://{}:{}", config.server.host, config.server.port))
}

async fn serve() -> anyhow::Result<()> {
    let home = bootstrap::leon_home();
    std::fs::create_dir_all(&home)
        .with_context(|| format!("creating {}", home.display()))?;
    let config = Arc::new(bootstrap::load_config(&home).context("loading config")?);

    tracing::info!(home = %home.display(), "leon starting");
    let state = bootstrap::build_state(config.clone(), &home).context("assembling runtime")?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    let app = api::router().with_state(state.clone());
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested, draining producers");
            shutdown_state.supervisor.shutdown().await;
        })
        .await
        .context("server error")?;

    Ok(())
}
