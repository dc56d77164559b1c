use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use lru::LruCache;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    config::CacheConfig,
    documents::RaidBossDocument,
    summary::{CharacterPerformance, GuildListEntry, RaidSummary},
};

const GUILD_LIST_KEY: &str = "guilds";

struct Entry<V> {
    value: Arc<V>,
    inserted: Instant,
}

/// Bounded LRU whose entries expire after `ttl`; `None` never expires.
/// Values are shared, so callers replace an entry instead of mutating it.
pub struct TtlCache<V> {
    name: &'static str,
    ttl: Option<Duration>,
    inner: Mutex<LruCache<String, Entry<V>>>,
}

impl<V> TtlCache<V> {
    pub fn new(name: &'static str, capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            ttl,
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let mut guard = self.inner.lock();
        let found = guard.get(key).map(|entry| {
            let fresh = self.ttl.is_none_or(|ttl| entry.inserted.elapsed() < ttl);
            (fresh, Arc::clone(&entry.value))
        });
        let hit = match found {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                guard.pop(key);
                None
            }
            None => None,
        };
        let labels = [
            ("cache", self.name),
            ("result", if hit.is_some() { "hit" } else { "miss" }),
        ];
        counter!("raidboard_cache_requests_total", &labels).increment(1);
        hit
    }

    pub fn set(&self, key: impl Into<String>, value: Arc<V>) {
        let mut guard = self.inner.lock();
        guard.put(
            key.into(),
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        let mut guard = self.inner.lock();
        guard.pop(key);
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raid boss documents never expire; the coordinator refreshes touched
/// bosses after each cycle. Reads wait for the first full load.
pub struct RaidBossCache {
    cache: TtlCache<RaidBossDocument>,
    loaded: watch::Sender<bool>,
}

impl RaidBossCache {
    pub fn new(capacity: usize) -> Self {
        let (loaded, _) = watch::channel(false);
        Self {
            cache: TtlCache::new("raid_boss", capacity, None),
            loaded,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<RaidBossDocument>> {
        self.cache.get(id)
    }

    pub fn set(&self, doc: RaidBossDocument) {
        let id = doc.id.clone();
        self.cache.set(id, Arc::new(doc));
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn mark_loaded(&self) {
        self.loaded.send_replace(true);
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Resolves once the first full load has completed.
    pub async fn wait_loaded(&self) {
        let mut receiver = self.loaded.subscribe();
        let _ = receiver.wait_for(|loaded| *loaded).await;
    }
}

pub struct Caches {
    pub raid_bosses: RaidBossCache,
    pub raid_summaries: TtlCache<RaidSummary>,
    pub character_performance: TtlCache<CharacterPerformance>,
    pub guild_list: TtlCache<Vec<GuildListEntry>>,
}

impl Caches {
    pub fn new(config: &CacheConfig, encounter_count: usize) -> Self {
        Self {
            raid_bosses: RaidBossCache::new(encounter_count.max(1)),
            raid_summaries: TtlCache::new(
                "raid_summary",
                config.capacity,
                Some(Duration::from_secs(config.raid_summary_ttl_secs)),
            ),
            character_performance: TtlCache::new(
                "character_performance",
                config.capacity,
                Some(Duration::from_secs(config.character_ttl_secs)),
            ),
            guild_list: TtlCache::new(
                "guild_list",
                1,
                Some(Duration::from_secs(config.guild_list_ttl_secs)),
            ),
        }
    }

    pub fn guild_list(&self) -> Option<Arc<Vec<GuildListEntry>>> {
        self.guild_list.get(GUILD_LIST_KEY)
    }

    pub fn set_guild_list(&self, guilds: Arc<Vec<GuildListEntry>>) {
        self.guild_list.set(GUILD_LIST_KEY, guilds);
    }

    /// Drops every derived view that is cheap to rebuild lazily.
    pub fn clear_derived(&self) {
        self.raid_summaries.clear();
        self.character_performance.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::default_raids;

    #[test]
    fn entries_expire_after_ttl() {
        let cache: TtlCache<u32> = TtlCache::new("test", 4, Some(Duration::from_millis(0)));
        cache.set("a", Arc::new(1));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn values_are_shared_not_cloned() {
        let cache: TtlCache<Vec<u8>> = TtlCache::new("test", 4, None);
        let value = Arc::new(vec![1, 2, 3]);
        cache.set("a", Arc::clone(&value));
        let fetched = cache.get("a").unwrap();
        assert!(Arc::ptr_eq(&value, &fetched));
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache: TtlCache<u32> = TtlCache::new("test", 2, None);
        cache.set("a", Arc::new(1));
        cache.set("b", Arc::new(2));
        cache.set("c", Arc::new(3));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c").as_deref(), Some(&3));
    }

    #[tokio::test]
    async fn readers_wait_for_first_load() {
        let cache = Arc::new(RaidBossCache::new(8));
        assert!(!cache.is_loaded());

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache.wait_loaded().await;
                cache.get("1577-5").map(|doc| doc.name.clone())
            })
        };

        let raids = default_raids();
        cache.set(RaidBossDocument::new(&raids[0], &raids[0].bosses[0], 5));
        cache.mark_loaded();

        assert_eq!(waiter.await.unwrap().as_deref(), Some("Jin'rokh the Breaker"));
        cache.wait_loaded().await;
    }
}
