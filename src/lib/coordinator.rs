use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    task::{JoinHandle, spawn_blocking},
    time::{MissedTickBehavior, interval, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    aggregate::{self, Aggregation},
    cache::Caches,
    catalog::RaidCatalog,
    config::{Config, RankingConfig},
    documents::{CombatMetric, RaidBossDocument},
    error::{ErrorKind, Result, StatsError},
    game_api::{GameApi, GuildFetch},
    keys,
    merge::{
        apply_guild_update, merge_character, merge_guild_snapshot, merge_raid_boss,
        remove_characters,
    },
    normalize::{BugFilterRegistry, NormalizedLog, normalize_logs},
    rank::{recompute_collections, upsert_leaderboard},
    store::{DocumentStore, Transaction},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Initializing,
    Fetching,
    Merging,
    RankRecompute,
    CacheInvalidate,
    GuildRefresh,
    CharacterReset,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Initializing => "initializing",
            UpdatePhase::Fetching => "fetching",
            UpdatePhase::Merging => "merging",
            UpdatePhase::RankRecompute => "rank_recompute",
            UpdatePhase::CacheInvalidate => "cache_invalidate",
            UpdatePhase::GuildRefresh => "guild_refresh",
            UpdatePhase::CharacterReset => "character_reset",
        };
        f.write_str(name)
    }
}

/// Engine state shared with readers. Only the coordinator mutates it.
#[derive(Debug)]
pub struct UpdateState {
    updating: AtomicBool,
    phase: Mutex<UpdatePhase>,
    last_updated: Mutex<Option<DateTime<Utc>>>,
    last_guilds_update: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateStatus {
    pub is_updating: bool,
    pub phase: UpdatePhase,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_guilds_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            updating: AtomicBool::new(false),
            phase: Mutex::new(UpdatePhase::Idle),
            last_updated: Mutex::new(None),
            last_guilds_update: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }
}

impl UpdateState {
    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> UpdatePhase {
        *self.phase.lock()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        *self.last_updated.lock()
    }

    pub fn last_guilds_update(&self) -> Option<DateTime<Utc>> {
        *self.last_guilds_update.lock()
    }

    pub fn status(&self) -> UpdateStatus {
        UpdateStatus {
            is_updating: self.is_updating(),
            phase: self.phase(),
            last_updated: self.last_updated(),
            last_guilds_update: self.last_guilds_update(),
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Claims the single-writer slot.
    pub(crate) fn try_begin(self: &Arc<Self>) -> Result<UpdateGuard> {
        self.updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| StatsError::AlreadyUpdating)?;
        Ok(UpdateGuard {
            state: Arc::clone(self),
        })
    }

    fn set_phase(&self, phase: UpdatePhase) {
        let previous = std::mem::replace(&mut *self.phase.lock(), phase);
        if previous != phase {
            info!(from = %previous, to = %phase, "update phase changed");
        }
    }
}

/// Releases the single-writer slot when dropped, on success, error or panic.
pub(crate) struct UpdateGuard {
    state: Arc<UpdateState>,
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        *self.state.phase.lock() = UpdatePhase::Idle;
        self.state.updating.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub normalized: usize,
    pub dropped: usize,
    pub chunks: usize,
    pub bosses_updated: usize,
    pub guilds_updated: usize,
    pub characters_written: usize,
    pub collections_ranked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuildRefreshReport {
    pub refreshed: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct MergeOutcome {
    chunks: usize,
    touched_bosses: BTreeSet<String>,
    touched_collections: BTreeSet<String>,
    guilds_updated: usize,
    characters_written: usize,
}

impl MergeOutcome {
    fn absorb(&mut self, other: MergeOutcome) {
        self.chunks += other.chunks;
        self.touched_bosses.extend(other.touched_bosses);
        self.touched_collections.extend(other.touched_collections);
        self.guilds_updated += other.guilds_updated;
        self.characters_written += other.characters_written;
    }
}

#[derive(Debug, Clone)]
struct Settings {
    chunk_size: usize,
    fetch_timeout: Duration,
    update_interval: Duration,
    guild_refresh_interval: Duration,
    scheduler_tick: Duration,
    limits: RankingConfig,
}

/// Runs at most one update, guild refresh, initialization or character reset
/// at a time; a second caller gets [`StatsError::AlreadyUpdating`].
pub struct UpdateCoordinator {
    store: Arc<DocumentStore>,
    api: Arc<dyn GameApi>,
    caches: Arc<Caches>,
    catalog: Arc<RaidCatalog>,
    filters: Arc<BugFilterRegistry>,
    state: Arc<UpdateState>,
    settings: Settings,
}

pub(crate) async fn blocking<T, F>(task: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|err| StatsError::Storage(format!("{task} task failed: {err}")))?
}

fn record_cycle(kind: &'static str, outcome: &'static str, started: Instant) {
    let labels = [("kind", kind), ("outcome", outcome)];
    counter!("raidboard_update_cycles_total", &labels).increment(1);
    histogram!("raidboard_update_cycle_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());
}

fn outcome_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(err) => match err.kind() {
            ErrorKind::AlreadyUpdating => "already_updating",
            ErrorKind::Transaction => "transaction_error",
            ErrorKind::ExternalFetch => "fetch_error",
            _ => "error",
        },
    }
}

impl UpdateCoordinator {
    pub fn new(
        config: &Config,
        store: Arc<DocumentStore>,
        api: Arc<dyn GameApi>,
        caches: Arc<Caches>,
    ) -> Result<Self> {
        let catalog = config.catalog()?;
        let filters = BugFilterRegistry::new(&config.bug_filter, &catalog);
        Ok(Self {
            store,
            api,
            caches,
            catalog: Arc::new(catalog),
            filters: Arc::new(filters),
            state: Arc::new(UpdateState::default()),
            settings: Settings {
                chunk_size: config.update.chunk_size,
                fetch_timeout: config.game_api.fetch_timeout(),
                update_interval: config.update_interval(),
                guild_refresh_interval: config.guild_refresh_interval(),
                scheduler_tick: config.scheduler_tick(),
                limits: config.ranking,
            },
        })
    }

    pub fn state(&self) -> Arc<UpdateState> {
        Arc::clone(&self.state)
    }

    pub fn catalog(&self) -> Arc<RaidCatalog> {
        Arc::clone(&self.catalog)
    }

    /// Seeds the in-memory status from the persisted maintenance record.
    pub async fn load_state(&self) -> Result<()> {
        let store = Arc::clone(&self.store);
        let maintenance = blocking("load maintenance", move || store.maintenance()).await?;
        *self.state.last_updated.lock() = maintenance.last_updated;
        *self.state.last_guilds_update.lock() = maintenance.last_guilds_update;
        Ok(())
    }

    /// Loads every raid boss document into the cache and releases readers
    /// waiting for the first load.
    pub async fn warm_caches(&self) -> Result<usize> {
        let store = Arc::clone(&self.store);
        let docs = blocking("warm caches", move || store.raid_bosses()).await?;
        let count = docs.len();
        for doc in docs {
            self.caches.raid_bosses.set(doc);
        }
        self.caches.raid_bosses.mark_loaded();
        info!(bosses = count, "raid boss cache loaded");
        Ok(count)
    }

    /// Creates an empty document for every boss and difficulty of the
    /// catalog. With `reset`, all persisted data is wiped first.
    pub async fn initialize(&self, reset: bool) -> Result<usize> {
        let guard = self.state.try_begin()?;
        let started = Instant::now();
        self.state.set_phase(UpdatePhase::Initializing);

        let store = Arc::clone(&self.store);
        let catalog = Arc::clone(&self.catalog);
        let result = blocking("initialize", move || {
            if reset {
                store.clear_all()?;
            }
            let mut tx = store.transaction();
            let mut created = 0;
            for (raid, boss, difficulty) in catalog.encounters() {
                let id = keys::raid_boss_id(boss.ingame_id, difficulty);
                if tx.raid_boss(&id)?.is_none() {
                    tx.put_raid_boss(&RaidBossDocument::new(raid, boss, difficulty))?;
                    created += 1;
                }
            }
            let mut maintenance = tx.maintenance()?;
            if !maintenance.is_initialized {
                maintenance.is_initialized = true;
                tx.put_maintenance(&maintenance)?;
            }
            tx.commit()?;
            Ok(created)
        })
        .await;

        record_cycle(
            if reset { "reinitialize" } else { "initialize" },
            outcome_label(&result),
            started,
        );
        let created = result?;
        self.caches.raid_bosses.clear();
        self.caches.clear_derived();
        self.caches.guild_list.clear();
        if reset {
            *self.state.last_updated.lock() = None;
            *self.state.last_guilds_update.lock() = None;
        }
        drop(guard);

        self.warm_caches().await?;
        info!(created, reset, "database initialized");
        Ok(created)
    }

    /// Wipes every persisted document, then initializes from scratch.
    pub async fn reinitialize(&self) -> Result<usize> {
        self.initialize(true).await
    }

    pub async fn run_update(&self) -> Result<CycleReport> {
        let guard = self.state.try_begin()?;
        self.update_with_guard(guard).await
    }

    /// Starts a cycle in the background. Fails fast if one is running.
    pub fn trigger(self: &Arc<Self>) -> Result<()> {
        let guard = self.state.try_begin()?;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = coordinator.update_with_guard(guard).await {
                error!("triggered update failed: {err}");
            }
        });
        Ok(())
    }

    async fn update_with_guard(&self, guard: UpdateGuard) -> Result<CycleReport> {
        let started = Instant::now();
        let result = self.update_cycle().await;
        record_cycle("update", outcome_label(&result), started);
        match &result {
            Ok(report) => {
                *self.state.last_error.lock() = None;
                info!(
                    fetched = report.fetched,
                    merged = report.normalized,
                    characters = report.characters_written,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "update cycle finished"
                );
            }
            Err(err) => {
                *self.state.last_error.lock() = Some(err.to_string());
                warn!("update cycle aborted: {err}");
            }
        }
        drop(guard);
        result
    }

    async fn update_cycle(&self) -> Result<CycleReport> {
        let store = Arc::clone(&self.store);
        let maintenance = blocking("read maintenance", move || store.maintenance()).await?;
        if !maintenance.is_initialized {
            return Err(StatsError::NotInitialized);
        }

        self.state.set_phase(UpdatePhase::Fetching);
        let batch = timeout(
            self.settings.fetch_timeout,
            self.api.fetch_raid_logs(&maintenance.last_log_ids),
        )
        .await
        .map_err(|_| StatsError::Timeout(self.settings.fetch_timeout))??;

        let fetched = batch.logs.len();
        let mut final_ids: BTreeMap<String, u64> = BTreeMap::new();
        for (realm, id) in batch.last_log_ids {
            let entry = final_ids.entry(keys::realm_key(&realm)).or_insert(0);
            *entry = (*entry).max(id);
        }
        let normalized = normalize_logs(
            batch.logs,
            &maintenance.last_log_ids,
            &self.filters,
            &self.catalog,
        );
        for (realm, id) in normalized.last_log_ids.iter() {
            let entry = final_ids.entry(realm.clone()).or_insert(0);
            *entry = (*entry).max(*id);
        }
        debug!(fetched, kept = normalized.logs.len(), dropped = normalized.dropped, "normalized logs");

        let mut report = CycleReport {
            fetched,
            normalized: normalized.logs.len(),
            dropped: normalized.dropped,
            ..CycleReport::default()
        };

        self.state.set_phase(UpdatePhase::Merging);
        let store = Arc::clone(&self.store);
        let catalog = Arc::clone(&self.catalog);
        let chunk_size = self.settings.chunk_size;
        let limits = self.settings.limits;
        let logs = normalized.logs;
        let (outcome, merged) = blocking("merge", move || {
            Ok(merge_logs(&store, &catalog, &limits, logs, &final_ids, chunk_size))
        })
        .await?;
        report.chunks = outcome.chunks;
        report.bosses_updated = outcome.touched_bosses.len();
        report.guilds_updated = outcome.guilds_updated;
        report.characters_written = outcome.characters_written;

        self.state.set_phase(UpdatePhase::RankRecompute);
        let store = Arc::clone(&self.store);
        let collections = outcome.touched_collections;
        report.collections_ranked =
            blocking("rank", move || Ok(recompute_collections(&store, collections))).await?;

        self.state.set_phase(UpdatePhase::CacheInvalidate);
        self.refresh_bosses(outcome.touched_bosses).await?;
        self.caches.clear_derived();
        if report.guilds_updated > 0 {
            self.caches.guild_list.clear();
        }

        // Committed chunks are ranked and cached before a failed one surfaces.
        merged?;
        *self.state.last_updated.lock() = Some(Utc::now());
        Ok(report)
    }

    async fn refresh_bosses(&self, ids: BTreeSet<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        let docs = blocking("refresh bosses", move || {
            ids.iter()
                .filter_map(|id| store.raid_boss(id).transpose())
                .collect::<Result<Vec<_>>>()
        })
        .await?;
        for doc in docs {
            self.caches.raid_bosses.set(doc);
        }
        Ok(())
    }

    /// Refetches every known guild. Guilds the game API no longer knows are
    /// deleted; other per-guild failures are logged and skipped.
    pub async fn refresh_guilds(&self) -> Result<GuildRefreshReport> {
        let guard = self.state.try_begin()?;
        let started = Instant::now();
        let result = self.guild_refresh_cycle().await;
        record_cycle("guild_refresh", outcome_label(&result), started);
        if let Err(err) = &result {
            *self.state.last_error.lock() = Some(err.to_string());
            warn!("guild refresh aborted: {err}");
        }
        drop(guard);
        result
    }

    async fn guild_refresh_cycle(&self) -> Result<GuildRefreshReport> {
        self.state.set_phase(UpdatePhase::GuildRefresh);
        let store = Arc::clone(&self.store);
        let guilds = blocking("list guilds", move || store.guilds()).await?;
        let mut report = GuildRefreshReport::default();

        for guild in guilds {
            let fetched = timeout(
                self.settings.fetch_timeout,
                self.api.fetch_guild_data(&guild.name, &guild.realm),
            )
            .await
            .map_err(|_| StatsError::Timeout(self.settings.fetch_timeout))
            .and_then(|result| result);

            let fetched = match fetched {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(guild = %guild.id, "guild refresh failed: {err}");
                    report.failed += 1;
                    continue;
                }
            };

            let store = Arc::clone(&self.store);
            let catalog = Arc::clone(&self.catalog);
            let limits = self.settings.limits;
            let id = guild.id.clone();
            let removed = blocking("refresh guild", move || {
                let mut tx = store.transaction();
                let removed = match fetched {
                    GuildFetch::Found(snapshot) => {
                        let current = tx.guild(&id)?;
                        let merged = merge_guild_snapshot(
                            current.as_ref(),
                            &snapshot,
                            &catalog,
                            &limits,
                            Utc::now(),
                        );
                        tx.put_guild(&merged)?;
                        false
                    }
                    GuildFetch::NotFound => {
                        tx.delete_guild(&id);
                        true
                    }
                };
                tx.commit()?;
                Ok(removed)
            })
            .await?;

            if removed {
                info!(guild = %guild.id, "guild no longer exists, removed");
                report.removed += 1;
            } else {
                report.refreshed += 1;
            }
        }

        let store = Arc::clone(&self.store);
        let now = Utc::now();
        blocking("guild maintenance", move || {
            let mut tx = store.transaction();
            let mut maintenance = tx.maintenance()?;
            maintenance.last_guilds_update = Some(now);
            tx.put_maintenance(&maintenance)?;
            tx.commit()
        })
        .await?;
        *self.state.last_guilds_update.lock() = Some(now);
        self.caches.guild_list.clear();

        info!(
            refreshed = report.refreshed,
            removed = report.removed,
            failed = report.failed,
            "guild refresh finished"
        );
        Ok(report)
    }

    /// Removes every row of one character (all specs) from the character
    /// collections, the leaderboards and the best lists, then re-ranks.
    pub async fn reset_character(&self, name: &str, realm: &str) -> Result<usize> {
        let guard = self.state.try_begin()?;
        self.state.set_phase(UpdatePhase::CharacterReset);

        let store = Arc::clone(&self.store);
        let catalog = Arc::clone(&self.catalog);
        let (name, realm) = (name.to_string(), realm.to_string());
        let (removed, collections, bosses) = blocking("reset character", move || {
            let mut variants: BTreeMap<String, Vec<String>> = BTreeMap::new();
            let mut character_ids: BTreeSet<String> = BTreeSet::new();
            let mut tx = store.transaction();
            for (raid, boss, difficulty) in catalog.encounters() {
                for metric in CombatMetric::ALL {
                    let collection = keys::character_collection(boss.ingame_id, difficulty, metric);
                    for doc in store.character_variants(&collection, &name, &realm)? {
                        tx.delete_character(&collection, &doc.id);
                        tx.delete_leaderboard_entry(metric, &raid.name, &doc.id)?;
                        character_ids.insert(doc.id.clone());
                        variants.entry(collection.clone()).or_default().push(doc.id);
                    }
                }
            }

            let ids: Vec<String> = character_ids.into_iter().collect();
            let mut bosses = BTreeSet::new();
            if !ids.is_empty() {
                for doc in store.raid_bosses()? {
                    if let Some(updated) = remove_characters(&doc, &ids) {
                        tx.put_raid_boss(&updated)?;
                        bosses.insert(updated.id);
                    }
                }
            }
            tx.commit()?;

            let removed = variants.values().map(Vec::len).sum::<usize>();
            let collections: Vec<String> = variants.into_keys().collect();
            recompute_collections(&store, collections.iter().cloned());
            Ok((removed, collections, bosses))
        })
        .await?;

        self.refresh_bosses(bosses).await?;
        self.caches.clear_derived();
        drop(guard);
        info!(removed, collections = collections.len(), "character reset");
        Ok(removed)
    }

    fn update_due(&self) -> bool {
        is_due(self.state.last_updated(), self.settings.update_interval)
    }

    fn guild_refresh_due(&self) -> bool {
        is_due(
            self.state.last_guilds_update(),
            self.settings.guild_refresh_interval,
        )
    }

    /// Ticks at the configured period and runs whichever cycle is due.
    pub fn spawn_scheduler(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.settings.scheduler_tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if self.update_due() {
                    match self.run_update().await {
                        Ok(_) => {}
                        Err(StatsError::AlreadyUpdating) => debug!("update already running"),
                        Err(StatsError::NotInitialized) => {
                            warn!("database not initialized; run `raidboard init`")
                        }
                        Err(_) => {}
                    }
                }
                if self.guild_refresh_due() {
                    match self.refresh_guilds().await {
                        Ok(_) | Err(StatsError::AlreadyUpdating) => {}
                        Err(err) => debug!("guild refresh will retry next tick: {err}"),
                    }
                }
            }
        })
    }
}

fn is_due(last: Option<DateTime<Utc>>, period: Duration) -> bool {
    match last {
        None => true,
        Some(last) => {
            let elapsed = Utc::now().signed_duration_since(last);
            elapsed.to_std().map(|elapsed| elapsed >= period).unwrap_or(false)
        }
    }
}

/// Merges logs in ascending chunks, one transaction per chunk. Each chunk
/// advances the watermark only to the highest id it contains; the last chunk
/// advances it to what the fetch reported.
///
/// Stops at the first failing chunk. The returned outcome covers exactly the
/// chunks that were committed before it.
fn merge_logs(
    store: &DocumentStore,
    catalog: &RaidCatalog,
    limits: &RankingConfig,
    logs: Vec<NormalizedLog>,
    final_ids: &BTreeMap<String, u64>,
    chunk_size: usize,
) -> (MergeOutcome, Result<()>) {
    let mut outcome = MergeOutcome::default();
    let chunk_size = if chunk_size == 0 { logs.len().max(1) } else { chunk_size };
    let chunks: Vec<&[NormalizedLog]> = if logs.is_empty() {
        vec![&logs[..0]]
    } else {
        logs.chunks(chunk_size).collect()
    };
    let last = chunks.len() - 1;

    for (index, chunk) in chunks.into_iter().enumerate() {
        let ids = if index == last { None } else { Some(chunk_watermark(chunk)) };
        match merge_chunk(store, catalog, limits, chunk, ids.as_ref().unwrap_or(final_ids)) {
            Ok(committed) => {
                outcome.absorb(committed);
                debug!(chunk = index, logs = chunk.len(), "merged chunk");
            }
            Err(err) => {
                warn!(chunk = index, "chunk merge failed: {err}");
                return (outcome, Err(err));
            }
        }
    }
    (outcome, Ok(()))
}

fn chunk_watermark(chunk: &[NormalizedLog]) -> BTreeMap<String, u64> {
    let mut ids: BTreeMap<String, u64> = BTreeMap::new();
    for log in chunk {
        let entry = ids.entry(keys::realm_key(&log.realm)).or_insert(0);
        *entry = (*entry).max(log.log_id);
    }
    ids
}

fn merge_chunk(
    store: &DocumentStore,
    catalog: &RaidCatalog,
    limits: &RankingConfig,
    chunk: &[NormalizedLog],
    watermark: &BTreeMap<String, u64>,
) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();
    let aggregation = aggregate::build(chunk);
    let mut tx = store.transaction();
    apply_aggregation(&mut tx, catalog, limits, &aggregation, &mut outcome)?;

    let mut maintenance = tx.maintenance()?;
    maintenance.advance_watermark(watermark);
    maintenance.last_updated = Some(Utc::now());
    tx.put_maintenance(&maintenance)?;
    tx.commit()?;
    outcome.chunks = 1;
    Ok(outcome)
}

fn apply_aggregation(
    tx: &mut Transaction<'_>,
    catalog: &RaidCatalog,
    limits: &RankingConfig,
    aggregation: &Aggregation,
    outcome: &mut MergeOutcome,
) -> Result<()> {
    for (boss_id, update) in &aggregation.bosses {
        let current = match tx.raid_boss(boss_id)? {
            Some(doc) => doc,
            None => match catalog.find_boss(update.ingame_boss_id) {
                Some((raid, boss)) => RaidBossDocument::new(raid, boss, update.difficulty),
                None => continue,
            },
        };
        if let Some(doc) = merge_raid_boss(&current, update, limits) {
            tx.put_raid_boss(&doc)?;
            outcome.touched_bosses.insert(boss_id.clone());
        }
    }

    for (guild_id, update) in &aggregation.guilds {
        let current = tx.guild(guild_id)?;
        if let Some(doc) = apply_guild_update(current.as_ref(), update, catalog, limits) {
            tx.put_guild(&doc)?;
            outcome.guilds_updated += 1;
        }
    }

    for (boss_id, by_metric) in &aggregation.characters {
        let Some(raid_name) = aggregation.bosses.get(boss_id).map(|boss| boss.raid_name.as_str())
        else {
            continue;
        };
        for rows in by_metric.values() {
            for candidate in rows.values() {
                let collection = candidate.collection();
                let current = tx.character(&collection, &candidate.id)?;
                if let Some(doc) = merge_character(current.as_ref(), candidate) {
                    tx.put_character(&doc)?;
                    upsert_leaderboard(tx, &doc, raid_name)?;
                    outcome.touched_collections.insert(collection);
                    outcome.characters_written += 1;
                }
            }
        }
    }
    Ok(())
}
