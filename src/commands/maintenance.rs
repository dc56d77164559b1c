use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use raidboard::{UpdateStatus, documents::MaintenanceDocument, store::StoreCounts};

use super::{open_context, print_json};

#[derive(Args)]
pub struct InitArgs {
    /// Delete every stored document before initializing
    #[arg(long, default_value_t = false)]
    pub reset: bool,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Emit JSON instead of a summary
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct ResetCharacterArgs {
    pub name: String,
    pub realm: String,
}

#[derive(Serialize)]
struct StatusReport {
    status: UpdateStatus,
    maintenance: MaintenanceDocument,
    counts: StoreCounts,
}

pub async fn init(config_path: Option<PathBuf>, args: InitArgs) -> Result<()> {
    let (_, ctx) = open_context(config_path).await?;
    let coordinator = ctx.coordinator();
    let created = if args.reset {
        coordinator.reinitialize().await?
    } else {
        coordinator.initialize(false).await?
    };
    println!("initialized: {created} raid boss documents created");
    Ok(())
}

pub async fn update(config_path: Option<PathBuf>) -> Result<()> {
    let (_, ctx) = open_context(config_path).await?;
    let report = ctx.coordinator().run_update().await?;
    print_json(&report)
}

pub async fn refresh_guilds(config_path: Option<PathBuf>) -> Result<()> {
    let (_, ctx) = open_context(config_path).await?;
    let report = ctx.coordinator().refresh_guilds().await?;
    print_json(&report)
}

pub async fn status(config_path: Option<PathBuf>, args: StatusArgs) -> Result<()> {
    let (_, ctx) = open_context(config_path).await?;
    let report = StatusReport {
        status: ctx.get_update_status(),
        maintenance: ctx.store().maintenance()?,
        counts: ctx.counts().await?,
    };
    if args.json {
        return print_json(&report);
    }

    let format_time = |time: Option<chrono::DateTime<chrono::Utc>>| {
        time.map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    };
    println!("initialized:        {}", report.maintenance.is_initialized);
    println!("last update:        {}", format_time(report.status.last_updated));
    println!(
        "last guild refresh: {}",
        format_time(report.status.last_guilds_update)
    );
    for (realm, id) in &report.maintenance.last_log_ids {
        println!("watermark {realm}: {id}");
    }
    println!(
        "documents:          {} bosses, {} guilds, {} characters, {} leaderboard rows",
        report.counts.raid_bosses,
        report.counts.guilds,
        report.counts.characters,
        report.counts.leaderboard_entries
    );
    Ok(())
}

pub async fn reset_character(config_path: Option<PathBuf>, args: ResetCharacterArgs) -> Result<()> {
    let (_, ctx) = open_context(config_path).await?;
    let removed = ctx
        .coordinator()
        .reset_character(&args.name, &args.realm)
        .await?;
    println!("removed {removed} rankings for {} ({})", args.name, args.realm);
    Ok(())
}
