use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use raidboard::{
    StatsContext,
    config::{Config, load_or_default},
};

pub mod config;
pub mod maintenance;
pub mod query;
pub mod start;

/// Loads the configuration and opens the store it points at. Fails while a
/// server holds the database open.
pub(crate) async fn open_context(config_path: Option<PathBuf>) -> Result<(Config, StatsContext)> {
    let (config, _) = load_or_default(config_path)?;
    let ctx = StatsContext::open(&config).with_context(|| {
        format!(
            "failed to open {} (is `raidboard start` running?)",
            config.store_path().display()
        )
    })?;
    ctx.coordinator().load_state().await?;
    Ok((config, ctx))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
