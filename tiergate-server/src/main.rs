use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tiergate_core::config::load_from_path;
use tiergate_core::Gateway;
use tiergate_server::{router, AppState};
use tracing::info;

#[derive(Parser)]
#[command(name = "tiergate", version, about = "Messages-API gateway with tiered provider fallback")]
struct Cli {
    /// Gateway configuration document (.json, .yaml or .yml)
    #[arg(long, env = "TIERGATE_CONFIG")]
    config: PathBuf,

    /// Listen address; overrides `server.bind` from the configuration
    #[arg(long)]
    bind: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    if let Err(err) = run(cli).await {
        eprintln!("tiergate failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_from_path(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let bind = cli.bind.unwrap_or_else(|| config.server.bind.clone());

    let gateway = Arc::new(Gateway::from_config(config).context("assembling gateway")?);
    let app = router(AppState::new(gateway));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!(addr = %bind, version = tiergate_core::version(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shut down");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tiergate=info,tiergate_core=info,tiergate_server=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
