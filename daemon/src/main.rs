use anyhow::{Context, Result};
use clap::Parser;
use keymirror_common::config::VERSION;
use keymirror_daemon::{
    config::{NodeConfig, DEFAULT_POOL_SIZE, DEFAULT_RPC_TIMEOUT_MS},
    core::{
        chain::{ContractFetcher, JsonRpcClient},
        diff::KeyScope,
        reconciler::Reconciler,
        store::Store,
        updater::Updater,
    },
    rpc::ApiServer,
};
use log::{info, warn};
use std::{str::FromStr, sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::parse();

    let level = log::LevelFilter::from_str(&config.log_level)
        .map_err(|_| anyhow::anyhow!("Invalid log level: {}", config.log_level))?;
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    config.validate().map_err(anyhow::Error::msg)?;

    info!("keymirror daemon {}", VERSION);

    let store = Store::open(&config.db_path, DEFAULT_POOL_SIZE)
        .await
        .with_context(|| format!("Failed to open mirror database at {}", config.db_path))?;

    let api = ApiServer::start(
        &config.bind_address,
        store.clone(),
        config.module_addresses.clone(),
    )
    .await?;

    let updater = if config.no_sync {
        warn!("Update loop is disabled, serving mirrored state only");
        None
    } else {
        let rpc_url = config.rpc_url.clone().context("RPC endpoint is required")?;
        let rpc = Arc::new(
            JsonRpcClient::new(rpc_url, Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS))
                .context("Failed to create the chain RPC client")?,
        );

        let scope = if config.used_keys_only {
            KeyScope::UsedOnly
        } else {
            KeyScope::All
        };

        let reconcilers = config
            .module_addresses
            .iter()
            .map(|module| {
                Reconciler::new(
                    store.clone(),
                    ContractFetcher::new(Arc::clone(&rpc), *module),
                    *module,
                    scope,
                )
            })
            .collect();

        let updater = Updater::new(
            reconcilers,
            Duration::from_millis(config.update_interval_ms),
            Duration::from_millis(config.update_timeout_ms),
        );
        updater.start().await?;
        Some(updater)
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Shutting down...");

    if let Some(updater) = updater {
        if let Err(e) = updater.stop().await {
            warn!("Error while stopping the update loop: {}", e);
        }
    }
    api.stop(true).await;

    Ok(())
}
