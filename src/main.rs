use anyhow::{Context, Result};
use nova_plugins::backend::DefaultBackendProvider;
use nova_plugins::plugins::InstallLedger;
use nova_plugins::{CallContext, NovaConfig, PluginHost};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env for local dev (if present)
    let dotenv = dotenvy::dotenv().is_ok();

    let config = match std::env::var("NOVA_PLUGINS_CONFIG") {
        Ok(path) => NovaConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        Err(_) => NovaConfig::from_env().context("failed to load config from environment")?,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if dotenv {
        tracing::info!("Loaded .env");
    }
    tracing::info!("Starting Nova plugin host");
    tracing::info!(
        "Configuration loaded: plugins_dir={}, repository={}",
        config.plugins.plugins_dir.display(),
        config.plugins.repository_url
    );

    let sled_db = sled::open(&config.plugins.database_path).context("failed to open sled database")?;
    let install_tree = sled_db
        .open_tree("plugin_installs")
        .context("failed to open plugin_installs tree")?;

    let provider = Arc::new(DefaultBackendProvider::new(config.backend.start_timeout()));
    let host = PluginHost::from_config(&config, provider, InstallLedger::new(install_tree));

    let ctx = CallContext::new();
    let manager = host.manager().clone();
    let run_ctx = ctx.clone();
    let running = tokio::spawn(async move { manager.run(&run_ctx).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");
    ctx.cancel();

    running
        .await
        .context("plugin manager task panicked")?
        .context("plugin manager failed")?;
    sled_db.flush_async().await.context("failed to flush sled database")?;

    tracing::info!("Nova plugin host stopped");
    Ok(())
}
