use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::Instant,
};

use metrics::{counter, histogram};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    documents::{
        CharacterDocument, CollectionStats, CombatMetric, GuildDocument,
        LeaderboardCharacterDocument, MaintenanceDocument, RaidBossDocument,
    },
    error::{Result, StatsError},
    keys,
};

const SEP: u8 = 0x1F;
const PREFIX_MAINTENANCE: &str = "maint";
const PREFIX_BOSS: &str = "boss";
const PREFIX_GUILD: &str = "guild";
const PREFIX_CHARACTER: &str = "char";
const PREFIX_RANK: &str = "rank";
const PREFIX_COLLECTION_META: &str = "cmeta";
const PREFIX_LEADERBOARD: &str = "lb";
const PREFIX_LEADERBOARD_INDEX: &str = "lbi";

/// Rank fields of one character row, stored apart from the row itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankPosition {
    pub rank: u32,
    pub class_rank: u32,
    pub spec_rank: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub raid_bosses: usize,
    pub guilds: usize,
    pub characters: usize,
    pub leaderboard_entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaderboardPage {
    /// Rows matching the filter, before pagination.
    pub total: usize,
    pub entries: Vec<LeaderboardCharacterDocument>,
}

pub struct DocumentStore {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Mutex<()>,
    sync_writes: bool,
    #[cfg(test)]
    fail_after_commits: Mutex<Option<usize>>,
}

/// Buffered multi-document write. Reads inside the transaction observe its
/// own pending writes; nothing reaches disk until [`Transaction::commit`],
/// which applies everything as one atomic batch.
pub struct Transaction<'a> {
    store: &'a DocumentStore,
    _guard: MutexGuard<'a, ()>,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Transaction<'a> {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(value) => Ok(value.clone()),
            None => self.store.get_raw(key),
        }
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        self.get_raw(key)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StatsError::from))
            .transpose()
    }

    fn put<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<()> {
        self.pending.insert(key, Some(serde_json::to_vec(value)?));
        Ok(())
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.pending.insert(key, None);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn maintenance(&self) -> Result<MaintenanceDocument> {
        Ok(self.get(&maintenance_key())?.unwrap_or_default())
    }

    pub fn put_maintenance(&mut self, doc: &MaintenanceDocument) -> Result<()> {
        self.put(maintenance_key(), doc)
    }

    pub fn raid_boss(&self, id: &str) -> Result<Option<RaidBossDocument>> {
        self.get(&boss_key(id))
    }

    pub fn put_raid_boss(&mut self, doc: &RaidBossDocument) -> Result<()> {
        self.put(boss_key(&doc.id), doc)
    }

    pub fn guild(&self, id: &str) -> Result<Option<GuildDocument>> {
        self.get(&guild_key(id))
    }

    pub fn put_guild(&mut self, doc: &GuildDocument) -> Result<()> {
        self.put(guild_key(&doc.id), doc)
    }

    pub fn delete_guild(&mut self, id: &str) {
        self.delete(guild_key(id));
    }

    pub fn character(&self, collection: &str, id: &str) -> Result<Option<CharacterDocument>> {
        self.get(&character_key(collection, id))
    }

    pub fn put_character(&mut self, doc: &CharacterDocument) -> Result<()> {
        let mut stored = doc.clone();
        stored.rank = 0;
        stored.class_rank = 0;
        stored.spec_rank = 0;
        self.put(character_key(&doc.collection(), &doc.id), &stored)
    }

    pub fn delete_character(&mut self, collection: &str, id: &str) {
        self.delete(character_key(collection, id));
        self.delete(rank_key(collection, id));
    }

    pub fn leaderboard_entry(
        &self,
        metric: CombatMetric,
        raid_name: &str,
        character_id: &str,
    ) -> Result<Option<LeaderboardCharacterDocument>> {
        self.get(&leaderboard_key(metric, raid_name, character_id))
    }

    /// Replaces the row and moves its index entry to the new value.
    pub fn put_leaderboard_entry(&mut self, doc: &LeaderboardCharacterDocument) -> Result<()> {
        if let Some(previous) = self.leaderboard_entry(doc.metric, &doc.raid_name, &doc.character_id)? {
            self.delete(leaderboard_index_key(
                previous.metric,
                &previous.raid_name,
                previous.value,
                &previous.character_id,
            ));
        }
        self.put(
            leaderboard_key(doc.metric, &doc.raid_name, &doc.character_id),
            doc,
        )?;
        self.put(
            leaderboard_index_key(doc.metric, &doc.raid_name, doc.value, &doc.character_id),
            doc,
        )
    }

    pub fn delete_leaderboard_entry(
        &mut self,
        metric: CombatMetric,
        raid_name: &str,
        character_id: &str,
    ) -> Result<()> {
        if let Some(previous) = self.leaderboard_entry(metric, raid_name, character_id)? {
            self.delete(leaderboard_index_key(
                metric,
                raid_name,
                previous.value,
                character_id,
            ));
        }
        self.delete(leaderboard_key(metric, raid_name, character_id));
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        #[cfg(test)]
        self.store.check_injected_failure()?;

        let pending = std::mem::take(&mut self.pending);
        let mut batch = WriteBatch::default();
        for (key, value) in pending {
            match value {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }
        self.store
            .write_batch(batch)
            .map_err(|err| StatsError::Transaction(err.to_string()))
    }
}

impl DocumentStore {
    pub fn open(path: PathBuf, sync_writes: bool) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, &path).map_err(|err| {
            StatsError::Connection(format!("failed to open {}: {err}", path.display()))
        })?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            sync_writes,
            #[cfg(test)]
            fail_after_commits: Mutex::new(None),
        })
    }

    /// Lets `successful` more non-empty commits through, then fails the next
    /// one before anything is written.
    #[cfg(test)]
    pub(crate) fn fail_after_commits(&self, successful: usize) {
        *self.fail_after_commits.lock() = Some(successful);
    }

    #[cfg(test)]
    pub(crate) fn fail_next_commit(&self) {
        self.fail_after_commits(0);
    }

    #[cfg(test)]
    fn check_injected_failure(&self) -> Result<()> {
        let mut guard = self.fail_after_commits.lock();
        match *guard {
            Some(0) => {
                *guard = None;
                Err(StatsError::Transaction("injected commit failure".into()))
            }
            Some(remaining) => {
                *guard = Some(remaining - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn transaction(&self) -> Transaction<'_> {
        let guard = self.write_lock.lock();
        Transaction {
            store: self,
            _guard: guard,
            pending: BTreeMap::new(),
        }
    }

    pub fn maintenance(&self) -> Result<MaintenanceDocument> {
        Ok(self.get(&maintenance_key())?.unwrap_or_default())
    }

    pub fn raid_boss(&self, id: &str) -> Result<Option<RaidBossDocument>> {
        self.get(&boss_key(id))
    }

    pub fn raid_bosses(&self) -> Result<Vec<RaidBossDocument>> {
        self.scan(&key_with_segments(&[PREFIX_BOSS, ""]), "rocksdb_iter_bosses")
    }

    pub fn guild(&self, id: &str) -> Result<Option<GuildDocument>> {
        self.get(&guild_key(id))
    }

    pub fn guilds(&self) -> Result<Vec<GuildDocument>> {
        self.scan(&key_with_segments(&[PREFIX_GUILD, ""]), "rocksdb_iter_guilds")
    }

    /// The stored row joined with its rank record.
    pub fn character(&self, collection: &str, id: &str) -> Result<Option<CharacterDocument>> {
        let Some(mut doc) = self.get::<CharacterDocument>(&character_key(collection, id))? else {
            return Ok(None);
        };
        if let Some(position) = self.get::<RankPosition>(&rank_key(collection, id))? {
            apply_position(&mut doc, position);
        }
        Ok(Some(doc))
    }

    /// Every spec of one character in a collection, ranks joined.
    pub fn character_variants(
        &self,
        collection: &str,
        name: &str,
        realm: &str,
    ) -> Result<Vec<CharacterDocument>> {
        let mut prefix = key_with_segments(&[PREFIX_CHARACTER, collection, ""]);
        prefix.extend_from_slice(keys::character_prefix(name, realm).as_bytes());
        let mut docs: Vec<CharacterDocument> = self.scan(&prefix, "rocksdb_iter_character")?;
        for doc in &mut docs {
            if let Some(position) = self.get::<RankPosition>(&rank_key(collection, &doc.id))? {
                apply_position(doc, position);
            }
        }
        Ok(docs)
    }

    /// Rows of one collection in key order, without ranks.
    pub fn characters(&self, collection: &str) -> Result<Vec<CharacterDocument>> {
        self.scan(
            &key_with_segments(&[PREFIX_CHARACTER, collection, ""]),
            "rocksdb_iter_collection",
        )
    }

    pub fn rank_position(&self, collection: &str, id: &str) -> Result<Option<RankPosition>> {
        self.get(&rank_key(collection, id))
    }

    pub fn collection_stats(&self, collection: &str) -> Result<CollectionStats> {
        Ok(self
            .get(&key_with_segments(&[PREFIX_COLLECTION_META, collection]))?
            .unwrap_or_default())
    }

    /// Writes every rank record of a collection plus its stats in one batch.
    /// Character rows are not rewritten.
    pub fn write_ranks(
        &self,
        collection: &str,
        positions: &[(String, RankPosition)],
        stats: &CollectionStats,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        for (id, position) in positions {
            batch.put(rank_key(collection, id), serde_json::to_vec(position)?);
        }
        batch.put(
            key_with_segments(&[PREFIX_COLLECTION_META, collection]),
            serde_json::to_vec(stats)?,
        );
        self.write_batch(batch)
    }

    pub fn leaderboard_entry(
        &self,
        metric: CombatMetric,
        raid_name: &str,
        character_id: &str,
    ) -> Result<Option<LeaderboardCharacterDocument>> {
        self.get(&leaderboard_key(metric, raid_name, character_id))
    }

    /// Walks the descending value index, keeping rows accepted by `filter`.
    pub fn leaderboard_page<F>(
        &self,
        metric: CombatMetric,
        raid_name: &str,
        filter: F,
        skip: usize,
        take: usize,
    ) -> Result<LeaderboardPage>
    where
        F: Fn(&LeaderboardCharacterDocument) -> bool,
    {
        let start = Instant::now();
        let result = (|| {
            let prefix = key_with_segments(&[
                PREFIX_LEADERBOARD_INDEX,
                metric.as_str(),
                &keys::normalize_component(raid_name),
                "",
            ]);
            let iter = self
                .db
                .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));
            let mut page = LeaderboardPage::default();
            for item in iter {
                let (key, value) = item?;
                if !key.starts_with(prefix.as_slice()) {
                    break;
                }
                let doc: LeaderboardCharacterDocument = serde_json::from_slice(&value)?;
                if !filter(&doc) {
                    continue;
                }
                if page.total >= skip && page.entries.len() < take {
                    page.entries.push(doc);
                }
                page.total += 1;
            }
            Ok(page)
        })();
        record_store_op(
            "rocksdb_iter_leaderboard",
            if result.is_ok() { "ok" } else { "err" },
            start.elapsed().as_secs_f64(),
        );
        result
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        Ok(StoreCounts {
            raid_bosses: self.count_prefix(&key_with_segments(&[PREFIX_BOSS, ""]))?,
            guilds: self.count_prefix(&key_with_segments(&[PREFIX_GUILD, ""]))?,
            characters: self.count_prefix(&key_with_segments(&[PREFIX_CHARACTER, ""]))?,
            leaderboard_entries: self
                .count_prefix(&key_with_segments(&[PREFIX_LEADERBOARD, ""]))?,
        })
    }

    /// Deletes every persisted document.
    pub fn clear_all(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete(key);
        }
        self.write_batch(batch)
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let start = Instant::now();
        let result = self.db.get(key).map_err(StatsError::from);
        record_store_op(
            "rocksdb_get",
            if result.is_ok() { "ok" } else { "err" },
            start.elapsed().as_secs_f64(),
        );
        result
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        self.get_raw(key)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StatsError::from))
            .transpose()
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &[u8], operation: &'static str) -> Result<Vec<T>> {
        let start = Instant::now();
        let result = (|| {
            let iter = self
                .db
                .iterator(IteratorMode::From(prefix, Direction::Forward));
            let mut items = Vec::new();
            for item in iter {
                let (key, value) = item?;
                if !key.starts_with(prefix) {
                    break;
                }
                items.push(serde_json::from_slice(&value)?);
            }
            Ok(items)
        })();
        record_store_op(
            operation,
            if result.is_ok() { "ok" } else { "err" },
            start.elapsed().as_secs_f64(),
        );
        result
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut count = 0;
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let start = Instant::now();
        let mut options = WriteOptions::default();
        options.set_sync(self.sync_writes);
        let result = self
            .db
            .write_opt(batch, &options)
            .map_err(|err| StatsError::Storage(err.to_string()));
        record_store_op(
            "rocksdb_write",
            if result.is_ok() { "ok" } else { "err" },
            start.elapsed().as_secs_f64(),
        );
        result
    }
}

fn apply_position(doc: &mut CharacterDocument, position: RankPosition) {
    doc.rank = position.rank;
    doc.class_rank = position.class_rank;
    doc.spec_rank = position.spec_rank;
}

fn maintenance_key() -> Vec<u8> {
    PREFIX_MAINTENANCE.as_bytes().to_vec()
}

fn boss_key(id: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_BOSS, id])
}

fn guild_key(id: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_GUILD, id])
}

fn character_key(collection: &str, id: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_CHARACTER, collection, id])
}

fn rank_key(collection: &str, id: &str) -> Vec<u8> {
    key_with_segments(&[PREFIX_RANK, collection, id])
}

fn leaderboard_key(metric: CombatMetric, raid_name: &str, character_id: &str) -> Vec<u8> {
    key_with_segments(&[
        PREFIX_LEADERBOARD,
        metric.as_str(),
        &keys::normalize_component(raid_name),
        character_id,
    ])
}

/// Orders rows by descending value: metric values are positive, so their bit
/// patterns sort like the values and the complement reverses that order.
fn leaderboard_index_key(
    metric: CombatMetric,
    raid_name: &str,
    value: f64,
    character_id: &str,
) -> Vec<u8> {
    let inverted = hex::encode((u64::MAX - value.max(0.0).to_bits()).to_be_bytes());
    key_with_segments(&[
        PREFIX_LEADERBOARD_INDEX,
        metric.as_str(),
        &keys::normalize_component(raid_name),
        &inverted,
        character_id,
    ])
}

fn key_with_segments(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    let mut iter = parts.iter();
    if let Some(first) = iter.next() {
        key.extend_from_slice(first.as_bytes());
    }
    for part in iter {
        key.push(SEP);
        key.extend_from_slice(part.as_bytes());
    }
    key
}

fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("raidboard_store_operations_total", &labels).increment(1);
    histogram!("raidboard_store_operation_duration_seconds", &labels).record(duration);
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{TimeZone, Utc};

    use super::*;

    pub fn character(name: &str, spec: u16, class: u8, value: f64) -> CharacterDocument {
        CharacterDocument {
            id: keys::character_id(name, "Tauri", spec),
            name: name.to_string(),
            realm: "Tauri".to_string(),
            class,
            spec,
            race: 2,
            faction: 1,
            ingame_boss_id: 1577,
            difficulty: 5,
            metric: CombatMetric::Dps,
            value,
            ilvl: 522.0,
            date: Utc.with_ymd_and_hms(2025, 3, 1, 20, 0, 0).unwrap(),
            log_id: 1,
            guild: None,
            rank: 0,
            class_rank: 0,
            spec_rank: 0,
        }
    }
}
