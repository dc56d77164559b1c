use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    catalog::{RaidCatalog, RaidDefinition, default_raids},
    error::{Result, StatsError},
};

pub const DEFAULT_PORT: u16 = 7171;
pub const DEFAULT_CHUNK_SIZE: usize = 10;
pub const DEFAULT_BEST_LIST_SIZE: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_realms")]
    pub realms: Vec<String>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for GameApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            api_key: None,
            realms: default_realms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl GameApiConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_update_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_guild_refresh_interval_secs")]
    pub guild_refresh_interval_secs: u64,
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    /// Logs per merge transaction. Zero merges a whole fetch in one
    /// transaction.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_update_interval_secs(),
            guild_refresh_interval_secs: default_guild_refresh_interval_secs(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default = "default_best_list_size")]
    pub best_list_size: usize,
    #[serde(default = "default_recent_kills")]
    pub recent_kills: usize,
    #[serde(default = "default_fastest_kills")]
    pub fastest_kills: usize,
    #[serde(default = "default_leaderboard_page_limit")]
    pub leaderboard_page_limit: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            best_list_size: default_best_list_size(),
            recent_kills: default_recent_kills(),
            fastest_kills: default_fastest_kills(),
            leaderboard_page_limit: default_leaderboard_page_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_summary_ttl_secs")]
    pub raid_summary_ttl_secs: u64,
    #[serde(default = "default_character_ttl_secs")]
    pub character_ttl_secs: u64,
    #[serde(default = "default_guild_list_ttl_secs")]
    pub guild_list_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            raid_summary_ttl_secs: default_summary_ttl_secs(),
            character_ttl_secs: default_character_ttl_secs(),
            guild_list_ttl_secs: default_guild_list_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageConfig {
    /// fsync every transaction commit.
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sync_writes: default_sync_writes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownCorruptLog {
    pub realm: String,
    pub log_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugFilterConfig {
    #[serde(default = "default_max_fight_secs")]
    pub max_fight_secs: u64,
    #[serde(default)]
    pub corrupt_logs: Vec<KnownCorruptLog>,
}

impl Default for BugFilterConfig {
    fn default() -> Self {
        Self {
            max_fight_secs: default_max_fight_secs(),
            corrupt_logs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub game_api: GameApiConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bug_filter: BugFilterConfig,
    #[serde(default = "default_raids")]
    pub raids: Vec<RaidDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            log_dir: None,
            created_at: now,
            updated_at: now,
            game_api: GameApiConfig::default(),
            update: UpdateConfig::default(),
            ranking: RankingConfig::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig::default(),
            bug_filter: BugFilterConfig::default(),
            raids: default_raids(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub api_base_url: Option<String>,
    pub realms: Option<Vec<String>>,
    pub update_interval_secs: Option<u64>,
    pub guild_refresh_interval_secs: Option<u64>,
    pub chunk_size: Option<usize>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = default_config_root()?;
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.validate()?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(data_dir) = update.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(base_url) = update.api_base_url {
            self.game_api.base_url = base_url;
        }
        if let Some(realms) = update.realms {
            self.game_api.realms = realms;
        }
        if let Some(interval) = update.update_interval_secs {
            self.update.interval_secs = interval;
        }
        if let Some(interval) = update.guild_refresh_interval_secs {
            self.update.guild_refresh_interval_secs = interval;
        }
        if let Some(chunk_size) = update.chunk_size {
            self.update.chunk_size = chunk_size;
        }
        self.updated_at = Utc::now();
    }

    pub fn validate(&self) -> Result<()> {
        if self.ranking.best_list_size == 0 {
            return Err(StatsError::Config(
                "ranking.best_list_size must be greater than zero".to_string(),
            ));
        }
        if self.ranking.leaderboard_page_limit == 0 {
            return Err(StatsError::Config(
                "ranking.leaderboard_page_limit must be greater than zero".to_string(),
            ));
        }
        if self.update.scheduler_tick_secs == 0 {
            return Err(StatsError::Config(
                "update.scheduler_tick_secs must be greater than zero".to_string(),
            ));
        }
        self.catalog().map(|_| ())
    }

    pub fn catalog(&self) -> Result<RaidCatalog> {
        RaidCatalog::new(self.raids.clone())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("documents")
    }

    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update.interval_secs)
    }

    pub fn guild_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.update.guild_refresh_interval_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.update.scheduler_tick_secs.max(1))
    }
}

fn default_config_root() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        Ok(home.join(".raidboard"))
    } else {
        env::current_dir()
            .map(|dir| dir.join(".raidboard"))
            .map_err(|err| StatsError::Config(err.to_string()))
    }
}

fn default_data_dir() -> PathBuf {
    default_config_root().unwrap_or_else(|_| PathBuf::from(".raidboard"))
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}

fn default_realms() -> Vec<String> {
    vec!["Tauri".to_string(), "Evermoon".to_string()]
}

fn default_fetch_timeout_secs() -> u64 {
    120
}

fn default_update_interval_secs() -> u64 {
    30 * 60
}

fn default_guild_refresh_interval_secs() -> u64 {
    36 * 60 * 60
}

fn default_scheduler_tick_secs() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_best_list_size() -> usize {
    DEFAULT_BEST_LIST_SIZE
}

fn default_recent_kills() -> usize {
    50
}

fn default_fastest_kills() -> usize {
    10
}

fn default_leaderboard_page_limit() -> usize {
    100
}

fn default_cache_capacity() -> usize {
    1_000
}

fn default_summary_ttl_secs() -> u64 {
    5 * 60
}

fn default_character_ttl_secs() -> u64 {
    60
}

fn default_guild_list_ttl_secs() -> u64 {
    10 * 60
}

fn default_sync_writes() -> bool {
    true
}

fn default_max_fight_secs() -> u64 {
    2 * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: Config = toml::from_str(
            r#"
port = 9000
data_dir = "/tmp/raidboard"
created_at = "2025-01-01T00:00:00Z"
updated_at = "2025-01-01T00:00:00Z"

[update]
chunk_size = 25
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.update.chunk_size, 25);
        assert_eq!(cfg.update.interval_secs, default_update_interval_secs());
        assert_eq!(cfg.ranking.best_list_size, DEFAULT_BEST_LIST_SIZE);
        assert_eq!(cfg.raids, default_raids());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn applies_updates() {
        let mut config = Config::default();
        config.apply_update(ConfigUpdate {
            chunk_size: Some(0),
            realms: Some(vec!["Stormforge".into()]),
            ..ConfigUpdate::default()
        });
        assert_eq!(config.update.chunk_size, 0);
        assert_eq!(config.game_api.realms, vec!["Stormforge".to_string()]);
    }

    #[test]
    fn rejects_zero_best_list_size() {
        let mut config = Config::default();
        config.ranking.best_list_size = 0;
        assert!(matches!(config.validate(), Err(StatsError::Config(_))));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.save(&path).unwrap();

        let (loaded, loaded_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(loaded_path, path);
        assert_eq!(loaded.data_dir, config.data_dir);
        assert!(loaded.data_dir.exists());
    }
}
