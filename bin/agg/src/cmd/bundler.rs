use crate::config::Config;
use agg_bundler_rs::{
    api,
    chain::EthAdapter,
    BundleService, BundleTable,
};
use clap::Args;
use eyre::{eyre, Result, WrapErr};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[derive(Debug, Args)]
#[clap(about = "🔗 aggregating signed bundles into on-chain submissions")]
pub struct Command {
    #[clap(env, default_value = "config.toml")]
    config_file: String,
}

impl Command {
    pub async fn execute(self) -> Result<()> {
        let config_file = &self.config_file;

        let config = Config::from_toml_file(config_file)?;
        let config = config.bundler.ok_or_else(|| eyre!("missing bundler config from file provided"))?;

        let table = BundleTable::open(&config.db_path)
            .wrap_err_with(|| format!("could not open bundle table at {:?}", config.db_path))?;
        let chain = EthAdapter::new(&config.chain, config.aggregation.rewards.token)
            .wrap_err("could not construct chain adapter")?;
        info!(rpc = %config.chain.rpc_url, gateway = ?config.chain.verification_gateway, "connected");

        let service = BundleService::spawn(Arc::new(chain), table, config.aggregation.clone());
        let api = api::Server::new(config.host, config.port, service.clone());
        let api_handle = api.spawn();

        signal::ctrl_c().await?;
        info!("shutting down...");
        service.stop().await;
        api_handle.abort();
        Ok(())
    }
}
