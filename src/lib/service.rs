use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    cache::Caches,
    catalog::{RaidCatalog, RaidDefinition},
    config::Config,
    coordinator::{UpdateCoordinator, UpdateState, UpdateStatus, blocking},
    documents::{CombatMetric, GuildDocument, LeaderboardCharacterDocument, RaidBossDocument},
    error::{Result, StatsError},
    game_api::{GameApi, HttpGameApi},
    keys,
    rank::LeaderboardFilter,
    store::{DocumentStore, StoreCounts},
    summary::{
        self, CharacterPerformance, GuildListEntry, RaidSummary, boss_performance,
        character_performance,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardResponse {
    pub raid_name: String,
    pub metric: CombatMetric,
    pub page: usize,
    pub size: usize,
    pub total: usize,
    pub entries: Vec<LeaderboardCharacterDocument>,
}

/// Shared read/trigger surface over the store, the caches and the update
/// coordinator. Cheap to clone; every surface (HTTP, CLI) goes through it.
#[derive(Clone)]
pub struct StatsContext {
    store: Arc<DocumentStore>,
    caches: Arc<Caches>,
    coordinator: Arc<UpdateCoordinator>,
    state: Arc<UpdateState>,
    catalog: Arc<RaidCatalog>,
    page_limit: usize,
    summary_lock: Arc<AsyncMutex<()>>,
}

impl StatsContext {
    pub fn new(config: &Config, store: Arc<DocumentStore>, api: Arc<dyn GameApi>) -> Result<Self> {
        let encounters = config.catalog()?.encounters().count();
        let caches = Arc::new(Caches::new(&config.cache, encounters));
        let coordinator = Arc::new(UpdateCoordinator::new(
            config,
            Arc::clone(&store),
            api,
            Arc::clone(&caches),
        )?);
        Ok(Self {
            state: coordinator.state(),
            catalog: coordinator.catalog(),
            store,
            caches,
            coordinator,
            page_limit: config.ranking.leaderboard_page_limit.max(1),
            summary_lock: Arc::new(AsyncMutex::new(())),
        })
    }

    /// Opens the document store and the HTTP game API client described by
    /// `config`.
    pub fn open(config: &Config) -> Result<Self> {
        config.ensure_data_dir()?;
        let store = Arc::new(DocumentStore::open(
            config.store_path(),
            config.storage.sync_writes,
        )?);
        let api: Arc<dyn GameApi> = Arc::new(HttpGameApi::new(&config.game_api)?);
        Self::new(config, store, api)
    }

    pub fn store(&self) -> Arc<DocumentStore> {
        Arc::clone(&self.store)
    }

    pub fn coordinator(&self) -> Arc<UpdateCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn catalog(&self) -> Arc<RaidCatalog> {
        Arc::clone(&self.catalog)
    }

    pub fn page_limit(&self) -> usize {
        self.page_limit
    }

    /// Waits for the first full cache load, then serves from the cache.
    /// Documents missing from the cache are read through from the store.
    pub async fn get_raid_boss(&self, id: &str) -> Result<Arc<RaidBossDocument>> {
        let (ingame_boss_id, difficulty) = keys::deconstruct_raid_boss_id(id)?;
        let id = keys::raid_boss_id(ingame_boss_id, difficulty);
        self.caches.raid_bosses.wait_loaded().await;
        if let Some(doc) = self.caches.raid_bosses.get(&id) {
            return Ok(doc);
        }

        let store = Arc::clone(&self.store);
        let lookup = id.clone();
        let doc = blocking("load raid boss", move || store.raid_boss(&lookup))
            .await?
            .ok_or_else(|| StatsError::RaidBossNotFound(id.clone()))?;
        self.caches.raid_bosses.set(doc);
        self.caches
            .raid_bosses
            .get(&id)
            .ok_or(StatsError::RaidBossNotFound(id))
    }

    pub async fn get_raid_summary(&self, raid_id: u32) -> Result<Arc<RaidSummary>> {
        let key = raid_id.to_string();
        if let Some(summary) = self.caches.raid_summaries.get(&key) {
            return Ok(summary);
        }

        let _guard = self.summary_lock.lock().await;
        if let Some(summary) = self.caches.raid_summaries.get(&key) {
            return Ok(summary);
        }

        let raid = self
            .catalog
            .raid(raid_id)
            .cloned()
            .ok_or(StatsError::RaidNotFound(key.clone()))?;
        let docs = self.raid_boss_documents(&raid).await?;
        let summary = Arc::new(summary::raid_summary(&raid, &docs));
        self.caches.raid_summaries.set(key, Arc::clone(&summary));
        Ok(summary)
    }

    async fn raid_boss_documents(&self, raid: &RaidDefinition) -> Result<Vec<Arc<RaidBossDocument>>> {
        let mut docs = Vec::with_capacity(raid.bosses.len() * raid.difficulties.len());
        for difficulty in &raid.difficulties {
            for boss in &raid.bosses {
                match self
                    .get_raid_boss(&keys::raid_boss_id(boss.ingame_id, *difficulty))
                    .await
                {
                    Ok(doc) => docs.push(doc),
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(docs)
    }

    pub async fn get_character_performance(
        &self,
        name: &str,
        class: u8,
        realm: &str,
        raid_name: &str,
    ) -> Result<Arc<CharacterPerformance>> {
        let raid = self
            .catalog
            .raid_by_name(raid_name)
            .cloned()
            .ok_or_else(|| StatsError::RaidNotFound(raid_name.to_string()))?;
        let key = keys::character_performance_cache_key(name, realm, class, &raid.name);
        if let Some(performance) = self.caches.character_performance.get(&key) {
            return Ok(performance);
        }

        let store = Arc::clone(&self.store);
        let (name, realm) = (name.to_string(), realm.to_string());
        let performance = blocking("character performance", move || {
            let mut bosses = Vec::new();
            for difficulty in &raid.difficulties {
                for boss in &raid.bosses {
                    for metric in CombatMetric::ALL {
                        let collection =
                            keys::character_collection(boss.ingame_id, *difficulty, metric);
                        let rows = store.character_variants(&collection, &name, &realm)?;
                        let rows: Vec<_> = rows.into_iter().filter(|row| row.class == class).collect();
                        if rows.is_empty() {
                            continue;
                        }
                        let stats = store.collection_stats(&collection)?;
                        bosses.extend(rows.iter().map(|row| boss_performance(row, &boss.name, &stats)));
                    }
                }
            }
            if bosses.is_empty() {
                return Err(StatsError::CharacterNotFound(format!(
                    "{name} ({realm}) in {}",
                    raid.name
                )));
            }
            Ok(character_performance(&name, &realm, class, &raid.name, bosses))
        })
        .await?;

        let performance = Arc::new(performance);
        self.caches
            .character_performance
            .set(key, Arc::clone(&performance));
        Ok(performance)
    }

    /// `page` starts at 1; `size` is capped by the configured page limit.
    pub async fn get_character_leaderboard(
        &self,
        raid_name: &str,
        metric: CombatMetric,
        filter: LeaderboardFilter,
        page: usize,
        size: usize,
    ) -> Result<LeaderboardResponse> {
        let raid = self
            .catalog
            .raid_by_name(raid_name)
            .ok_or_else(|| StatsError::RaidNotFound(raid_name.to_string()))?;
        let raid_name = raid.name.clone();
        let page = page.max(1);
        let size = size.clamp(1, self.page_limit);
        let skip = (page - 1).saturating_mul(size);

        let store = Arc::clone(&self.store);
        let lookup = raid_name.clone();
        let result = blocking("leaderboard", move || {
            store.leaderboard_page(metric, &lookup, |row| filter.matches(row), skip, size)
        })
        .await?;

        Ok(LeaderboardResponse {
            raid_name,
            metric,
            page,
            size,
            total: result.total,
            entries: result.entries,
        })
    }

    pub async fn get_guild(&self, id: &str) -> Result<GuildDocument> {
        let store = Arc::clone(&self.store);
        let lookup = id.to_string();
        blocking("load guild", move || store.guild(&lookup))
            .await?
            .ok_or_else(|| StatsError::GuildNotFound(id.to_string()))
    }

    pub async fn get_guild_list(&self) -> Result<Arc<Vec<GuildListEntry>>> {
        if let Some(guilds) = self.caches.guild_list() {
            return Ok(guilds);
        }
        let store = Arc::clone(&self.store);
        let guilds = blocking("list guilds", move || store.guilds()).await?;
        let list = Arc::new(summary::guild_list(&guilds));
        self.caches.set_guild_list(Arc::clone(&list));
        Ok(list)
    }

    pub fn list_raids(&self) -> Vec<RaidDefinition> {
        self.catalog.raids().to_vec()
    }

    /// Starts an update cycle in the background; fails fast while another
    /// cycle holds the guard.
    pub fn trigger_update(&self) -> Result<()> {
        self.coordinator.trigger()
    }

    pub fn get_update_status(&self) -> UpdateStatus {
        self.state.status()
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let store = Arc::clone(&self.store);
        blocking("count documents", move || store.counts()).await
    }
}
