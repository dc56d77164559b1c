use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use raidboard::{
    config::{ConfigUpdate, load_or_default},
    observability, server,
};

use crate::logging;

#[derive(Args, Clone, Default)]
pub struct StartArgs {
    /// Override the configured server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the configured data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

pub async fn execute(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;
    config.apply_update(ConfigUpdate {
        port: args.port,
        data_dir: args.data_dir,
        ..ConfigUpdate::default()
    });
    config.ensure_data_dir()?;

    logging::init(&config.resolved_log_dir())?;
    observability::init()?;
    tracing::info!(
        "loaded configuration from {} (data dir {})",
        path.display(),
        config.data_dir.display()
    );

    server::run(config).await?;
    Ok(())
}
