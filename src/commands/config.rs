use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use raidboard::config::{ConfigUpdate, load_or_default};

#[derive(Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the game API
    #[arg(long)]
    pub api_base_url: Option<String>,

    /// Realm to ingest; repeat to track several
    #[arg(long = "realm")]
    pub realms: Vec<String>,

    #[arg(long)]
    pub update_interval_secs: Option<u64>,

    #[arg(long)]
    pub guild_refresh_interval_secs: Option<u64>,

    /// Logs merged per transaction; 0 merges a whole fetch at once
    #[arg(long)]
    pub chunk_size: Option<usize>,
}

pub fn execute(config_path: Option<PathBuf>, args: ConfigArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;

    let ConfigArgs {
        port,
        data_dir,
        api_base_url,
        realms,
        update_interval_secs,
        guild_refresh_interval_secs,
        chunk_size,
    } = args;

    config.apply_update(ConfigUpdate {
        port,
        data_dir,
        api_base_url: normalize_value(api_base_url),
        realms: (!realms.is_empty()).then_some(realms),
        update_interval_secs,
        guild_refresh_interval_secs,
        chunk_size,
    });

    config.validate()?;
    config.ensure_data_dir()?;
    config.save(&path)?;

    tracing::info!("Configuration saved to {}", path.display());
    Ok(())
}

fn normalize_value(input: Option<String>) -> Option<String> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
