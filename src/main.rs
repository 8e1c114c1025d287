use std::sync::Arc;

use clap::Parser;
use tracing::info;

use corral::config::{Args, Config};
use corral::gateway::Gateway;
use corral::lifecycle::{HttpHealthProbe, VllmLauncher};
use corral::storage::JsonFileStore;
use corral::switcher::InMemoryHistory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    corral::telemetry::init()?;

    let config = Config::load(&args)?;
    if args.validate {
        println!("configuration OK: {}", args.config);
        return Ok(());
    }

    let store = Arc::new(JsonFileStore::open(&config.storage.path).await?);
    let launcher = Arc::new(VllmLauncher::new(config.lifecycle.work_dir.clone()));
    let health = Arc::new(HttpHealthProbe::new());
    // The request log is written by the API layer in front of this core; a
    // fresh process starts with an empty view.
    let history = Arc::new(InMemoryHistory::new());

    let gateway = Gateway::new(config, store, launcher, health, history)?;
    gateway.start().await?;
    info!("corral gateway running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    gateway.shutdown().await;

    Ok(())
}
