mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{
    config::ConfigArgs,
    maintenance::{InitArgs, ResetCharacterArgs, StatusArgs},
    query::{BossArgs, LeaderboardArgs},
    start::StartArgs,
};

#[derive(Parser)]
#[command(author, version, about = "Raid log ranking and leaderboard engine")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.raidboard/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run scheduled updates
    Start(StartArgs),
    /// Create the raid boss documents (or wipe and recreate them with --reset)
    Init(InitArgs),
    /// Run one update cycle now
    Update,
    /// Refetch every known guild from the game API
    RefreshGuilds,
    /// Show maintenance state and document counts
    Status(StatusArgs),
    /// Print a leaderboard page
    Leaderboard(LeaderboardArgs),
    /// Print one raid boss document
    Boss(BossArgs),
    /// Remove every ranking of one character
    ResetCharacter(ResetCharacterArgs),
    /// Update system configuration
    Config(ConfigArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    if !matches!(command, Commands::Start(_)) {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_target(false)
            .init();
    }

    match command {
        Commands::Start(args) => commands::start::execute(config, args).await?,
        Commands::Init(args) => commands::maintenance::init(config, args).await?,
        Commands::Update => commands::maintenance::update(config).await?,
        Commands::RefreshGuilds => commands::maintenance::refresh_guilds(config).await?,
        Commands::Status(args) => commands::maintenance::status(config, args).await?,
        Commands::Leaderboard(args) => commands::query::leaderboard(config, args).await?,
        Commands::Boss(args) => commands::query::boss(config, args).await?,
        Commands::ResetCharacter(args) => {
            commands::maintenance::reset_character(config, args).await?
        }
        Commands::Config(args) => commands::config::execute(config, args)?,
    }

    Ok(())
}
