use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use raidboard::{documents::CombatMetric, rank::LeaderboardFilter};

use super::{open_context, print_json};

#[derive(Args)]
pub struct LeaderboardArgs {
    /// Raid name, e.g. "Throne of Thunder"
    pub raid: String,
    /// `dps` or `hps`
    pub metric: CombatMetric,
    #[arg(long)]
    pub class: Option<u8>,
    #[arg(long)]
    pub spec: Option<u16>,
    #[arg(long)]
    pub realm: Option<String>,
    #[arg(long)]
    pub faction: Option<u8>,
    #[arg(long, default_value_t = 1)]
    pub page: usize,
    #[arg(long, default_value_t = 20)]
    pub size: usize,
}

#[derive(Args)]
pub struct BossArgs {
    /// Boss id in `<ingame id>-<difficulty>` form
    pub id: String,
}

pub async fn leaderboard(config_path: Option<PathBuf>, args: LeaderboardArgs) -> Result<()> {
    let (_, ctx) = open_context(config_path).await?;
    let filter = LeaderboardFilter {
        class: args.class,
        spec: args.spec,
        realm: args.realm,
        faction: args.faction,
    };
    let board = ctx
        .get_character_leaderboard(&args.raid, args.metric, filter, args.page, args.size)
        .await?;
    print_json(&board)
}

pub async fn boss(config_path: Option<PathBuf>, args: BossArgs) -> Result<()> {
    let (_, ctx) = open_context(config_path).await?;
    ctx.coordinator().warm_caches().await?;
    let doc = ctx.get_raid_boss(&args.id).await?;
    print_json(&doc)
}
