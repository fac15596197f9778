use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

use ferrodoc::config::{Config, Mode};
use ferrodoc::listener::Listener;
use ferrodoc::store::PgStore;

#[derive(Parser)]
#[command(name = "ferrodoc")]
#[command(about = "MongoDB wire protocol proxy backed by PostgreSQL")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "FERRODOC_CONFIG")]
    config: Option<PathBuf>,

    /// Operation mode: normal, proxy, diff-normal or diff-proxy
    #[arg(long, env = "FERRODOC_MODE")]
    mode: Option<Mode>,

    /// Listen address
    #[arg(long, env = "FERRODOC_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// PostgreSQL connection URL
    #[arg(long = "postgresql-url", env = "FERRODOC_POSTGRES_URL")]
    postgres_url: Option<String>,

    /// Upstream MongoDB address for proxy and diff modes
    #[arg(long, env = "FERRODOC_SHADOW_ADDR")]
    shadow_addr: Option<String>,
}

impl Cli {
    fn apply(self, cfg: &mut Config) {
        if let Some(mode) = self.mode {
            cfg.mode = mode;
        }
        if let Some(addr) = self.listen_addr {
            cfg.listen_addr = addr;
        }
        if let Some(url) = self.postgres_url {
            cfg.postgres_url = url;
        }
        if let Some(addr) = self.shadow_addr {
            cfg.shadow.addr = addr;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize logging with env filter, e.g.: RUST_LOG=info,ferrodoc=debug
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config.as_deref())?;
    cli.apply(&mut cfg);
    cfg.validate()?;

    tracing::info!(
        listen_addr = %cfg.listen_addr,
        mode = %cfg.mode,
        version = env!("CARGO_PKG_VERSION"),
        "starting ferrodoc"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = serve(cfg, shutdown_rx).await {
        tracing::error!(error = %format!("{e:?}"), "server terminated with error");
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(cfg: Config, shutdown: watch::Receiver<bool>) -> ferrodoc::error::Result<()> {
    let store = PgStore::connect(&cfg.postgres_url, cfg.pool_size).await?;
    let listener = Listener::bind(cfg, Arc::new(store)).await?;
    listener.run(shutdown).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
