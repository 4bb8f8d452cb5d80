use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use clashgate_config::{Config, ConfigWatcher};
use clashgate_pool::{KeyPool, RateLimiter, Refresher, acquire_with_retry};
use clashgate_portal::PortalSource;
use clashgate_proxy::{AppState, Forwarder};
use clashgate_types::{CredentialSource, StaticSource};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Portal provisioning attempts before startup gives up.
const STARTUP_ATTEMPTS: u32 = 5;

#[derive(Parser, Debug)]
#[command(
    name = "clashgate",
    version,
    about = "clashgate: key-pooling proxy for the Clash of Clans API"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the proxy server.
    Serve {
        /// Path to the YAML configuration file.
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Override the listening port (default: 8011).
        #[arg(short, long)]
        port: Option<u16>,
        /// Override the listening address (default: 0.0.0.0).
        #[arg(long)]
        host: Option<String>,
    },
    /// Provision keys through the developer portal once and report the count.
    Provision {
        /// Path to the YAML configuration file with a `portal` section.
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Load and validate the configuration, then exit.
    Check {
        /// Path to the YAML configuration file.
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, host } => cmd_serve(config, port, host).await,
        Commands::Provision { config } => cmd_provision(&config).await,
        Commands::Check { config } => cmd_check(config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).map_err(|e| anyhow::anyhow!("config error: {e}"))
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Static keys win; the portal is used only when none are configured.
fn credential_source(config: &Config) -> Result<Arc<dyn CredentialSource>> {
    let keys = config.credentials();
    if !keys.is_empty() {
        return Ok(Arc::new(StaticSource::new(keys)));
    }
    let portal = config
        .portal
        .clone()
        .context("no API keys configured and no portal section")?;
    Ok(Arc::new(PortalSource::new(portal)))
}

async fn cmd_serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    host: Option<String>,
) -> Result<()> {
    let mut config = load_config(config_path.as_deref())?;
    if let Some(p) = port {
        config.port = p;
    }
    if let Some(h) = host {
        config.host = h;
    }
    config.validate()?;
    init_tracing(&config);

    let source = credential_source(&config)?;
    let attempts = if source.name() == "static" { 1 } else { STARTUP_ATTEMPTS };
    let keys = acquire_with_retry(source.as_ref(), attempts)
        .await
        .context("no usable API keys, refusing to start")?;
    let pool = Arc::new(KeyPool::from_credentials(keys)?);

    let limiter = if config.rate_limit.enabled {
        Some(Arc::new(RateLimiter::new(
            config.rate_limit.per_key_rps,
            pool.len(),
            config.rate_limit.acquire_timeout(),
        )?))
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = match config.refresh_interval() {
        Some(interval) if source.name() != "static" => Some(
            Refresher::new(
                Arc::clone(&pool),
                limiter.clone(),
                Arc::clone(&source),
                interval,
            )
            .spawn(shutdown_rx),
        ),
        _ => None,
    };

    if let Some(path) = config_path
        && source.name() == "static"
    {
        let watcher = Arc::new(ConfigWatcher::with_config(path, config.clone()));
        let pool = Arc::clone(&pool);
        let limiter = limiter.clone();
        watcher.watch(move |cfg| match pool.refresh(cfg.credentials()) {
            Ok(size) => {
                if let Some(limiter) = &limiter
                    && let Err(e) = limiter.resize(size)
                {
                    tracing::warn!(error = %e, "rate limiter not resized");
                }
                tracing::info!(keys = size, "key pool reloaded");
            }
            Err(e) => tracing::warn!(error = %e, "reloaded key list rejected, keeping previous keys"),
        });
    }

    let forwarder = Forwarder::new(&config)?;
    let state = AppState::new(
        Arc::clone(&pool),
        limiter,
        forwarder,
        config.compress_responses,
    );
    let app = clashgate_proxy::make_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!(
        %addr,
        keys = pool.len(),
        source = source.name(),
        rate_limit = config.rate_limit.enabled,
        "clashgate listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = refresher {
        let _ = handle.await;
    }
    tracing::info!("clashgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn cmd_provision(config_path: &Path) -> Result<()> {
    let config = load_config(Some(config_path))?;
    config.validate()?;
    init_tracing(&config);
    let portal = config
        .portal
        .clone()
        .context("configuration has no `portal` section")?;
    let keys = PortalSource::new(portal)
        .acquire()
        .await
        .context("provisioning failed")?;
    println!("provisioned {} keys", keys.len());
    Ok(())
}

fn cmd_check(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    println!(
        "configuration OK: {} static keys, portal {}, listening on {}",
        config.credentials().len(),
        if config.portal.is_some() { "enabled" } else { "disabled" },
        config.addr()
    );
    Ok(())
}
