use std::time::Instant;

use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    documents::{CharacterDocument, CollectionStats, LeaderboardCharacterDocument},
    error::Result,
    keys,
    store::{DocumentStore, RankPosition, Transaction},
};

/// Ranks every row of a collection. Rows are ordered by value descending;
/// equal values keep their input order so repeated runs agree.
pub fn compute_ranks(rows: &[CharacterDocument]) -> (Vec<(String, RankPosition)>, CollectionStats) {
    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_by(|a, b| rows[*b].value.total_cmp(&rows[*a].value));

    let mut stats = CollectionStats::default();
    let mut positions = Vec::with_capacity(rows.len());
    for (index, row_index) in order.into_iter().enumerate() {
        let row = &rows[row_index];
        let class_rank = stats.classes.entry(row.class).or_insert(0);
        *class_rank += 1;
        let spec_rank = stats.specs.entry(row.spec).or_insert(0);
        *spec_rank += 1;
        positions.push((
            row.id.clone(),
            RankPosition {
                rank: index as u32 + 1,
                class_rank: *class_rank as u32,
                spec_rank: *spec_rank as u32,
            },
        ));
    }
    stats.total = rows.len() as u64;
    (positions, stats)
}

pub fn recompute_collection(store: &DocumentStore, collection: &str) -> Result<usize> {
    let start = Instant::now();
    let rows = store.characters(collection)?;
    let (positions, stats) = compute_ranks(&rows);
    store.write_ranks(collection, &positions, &stats)?;
    let labels = [("collection_kind", collection_kind(collection))];
    histogram!("raidboard_rank_recompute_seconds", &labels).record(start.elapsed().as_secs_f64());
    debug!(collection, rows = rows.len(), "recomputed ranks");
    Ok(rows.len())
}

/// Recomputes each collection in turn. A failing collection is logged and
/// skipped; the rest still run.
pub fn recompute_collections<I>(store: &DocumentStore, collections: I) -> usize
where
    I: IntoIterator<Item = String>,
{
    let mut recomputed = 0;
    for collection in collections {
        match recompute_collection(store, &collection) {
            Ok(_) => recomputed += 1,
            Err(err) => warn!(collection = %collection, "failed to recompute ranks: {err}"),
        }
    }
    recomputed
}

fn collection_kind(collection: &str) -> &'static str {
    if collection.ends_with("hps") { "hps" } else { "dps" }
}

/// Share of the collection at or below `rank`, in percent. Rank 1 is 100.
pub fn percentile(rank: u32, total: u64) -> f64 {
    if rank == 0 || total == 0 || u64::from(rank) > total {
        return 0.0;
    }
    100.0 * (total - u64::from(rank) + 1) as f64 / total as f64
}

pub fn leaderboard_row(doc: &CharacterDocument, raid_name: &str) -> LeaderboardCharacterDocument {
    LeaderboardCharacterDocument {
        character_id: doc.id.clone(),
        name: doc.name.clone(),
        realm: doc.realm.clone(),
        class: doc.class,
        spec: doc.spec,
        race: doc.race,
        faction: doc.faction,
        metric: doc.metric,
        value: doc.value,
        ilvl: doc.ilvl,
        date: doc.date,
        log_id: doc.log_id,
        ingame_boss_id: doc.ingame_boss_id,
        difficulty: doc.difficulty,
        raid_name: raid_name.to_string(),
    }
}

/// Keeps only the best value per character id. Returns whether the row was
/// written.
pub fn upsert_leaderboard(
    tx: &mut Transaction<'_>,
    doc: &CharacterDocument,
    raid_name: &str,
) -> Result<bool> {
    let existing = tx.leaderboard_entry(doc.metric, raid_name, &doc.id)?;
    if existing.is_some_and(|row| row.value >= doc.value) {
        return Ok(false);
    }
    tx.put_leaderboard_entry(&leaderboard_row(doc, raid_name))?;
    Ok(true)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardFilter {
    #[serde(default)]
    pub class: Option<u8>,
    #[serde(default)]
    pub spec: Option<u16>,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub faction: Option<u8>,
}

impl LeaderboardFilter {
    pub fn matches(&self, row: &LeaderboardCharacterDocument) -> bool {
        self.class.is_none_or(|class| row.class == class)
            && self.spec.is_none_or(|spec| row.spec == spec)
            && self.faction.is_none_or(|faction| row.faction == faction)
            && self.realm.as_ref().is_none_or(|realm| {
                keys::normalize_component(realm) == keys::normalize_component(&row.realm)
            })
    }
}

/// Class/spec totals of a collection, keyed for percentile lookups.
pub fn class_total(stats: &CollectionStats, class: u8) -> u64 {
    stats.classes.get(&class).copied().unwrap_or(0)
}

pub fn spec_total(stats: &CollectionStats, spec: u16) -> u64 {
    stats.specs.get(&spec).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::store::fixtures::character;

    fn rows() -> Vec<CharacterDocument> {
        vec![
            character("A", 262, 7, 100.0),
            character("B", 64, 8, 300.0),
            character("C", 262, 7, 300.0),
            character("D", 263, 7, 200.0),
        ]
    }

    #[test]
    fn assigns_overall_class_and_spec_ranks() {
        let (positions, stats) = compute_ranks(&rows());
        let table: BTreeMap<String, RankPosition> = positions.into_iter().collect();
        let b = &table[&keys::character_id("B", "Tauri", 64)];
        let c = &table[&keys::character_id("C", "Tauri", 262)];
        let d = &table[&keys::character_id("D", "Tauri", 263)];
        let a = &table[&keys::character_id("A", "Tauri", 262)];

        assert_eq!((b.rank, b.class_rank, b.spec_rank), (1, 1, 1));
        assert_eq!((c.rank, c.class_rank, c.spec_rank), (2, 1, 1));
        assert_eq!((d.rank, d.class_rank, d.spec_rank), (3, 2, 1));
        assert_eq!((a.rank, a.class_rank, a.spec_rank), (4, 3, 2));
        assert_eq!(stats.total, 4);
        assert_eq!(class_total(&stats, 7), 3);
        assert_eq!(spec_total(&stats, 262), 2);
    }

    #[test]
    fn recomputing_twice_is_stable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = DocumentStore::open(dir.path().join("documents"), false)?;
        let mut tx = store.transaction();
        for row in rows() {
            tx.put_character(&row)?;
        }
        tx.commit()?;
        let collection = rows()[0].collection();

        recompute_collection(&store, &collection)?;
        let first: Vec<_> = store
            .characters(&collection)?
            .iter()
            .map(|row| store.rank_position(&collection, &row.id))
            .collect::<Result<_>>()?;
        recompute_collection(&store, &collection)?;
        let second: Vec<_> = store
            .characters(&collection)?
            .iter()
            .map(|row| store.rank_position(&collection, &row.id))
            .collect::<Result<_>>()?;
        assert_eq!(first, second);
        assert_eq!(store.collection_stats(&collection)?.total, 4);
        Ok(())
    }

    #[test]
    fn percentile_bounds() {
        assert_eq!(percentile(1, 4), 100.0);
        assert_eq!(percentile(4, 4), 25.0);
        assert_eq!(percentile(0, 4), 0.0);
        assert_eq!(percentile(5, 4), 0.0);
    }

    #[test]
    fn leaderboard_keeps_best_value() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = DocumentStore::open(dir.path().join("documents"), false)?;
        let raid = "Throne of Thunder";

        let mut tx = store.transaction();
        assert!(upsert_leaderboard(&mut tx, &character("A", 262, 7, 500.0), raid)?);
        assert!(!upsert_leaderboard(&mut tx, &character("A", 262, 7, 400.0), raid)?);
        tx.commit()?;

        let page = store.leaderboard_page(
            crate::documents::CombatMetric::Dps,
            raid,
            |row| LeaderboardFilter::default().matches(row),
            0,
            10,
        )?;
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].value, 500.0);
        Ok(())
    }

    #[test]
    fn filter_matches_normalized_realm() {
        let row = leaderboard_row(&character("A", 262, 7, 1.0), "Throne of Thunder");
        let filter = LeaderboardFilter {
            realm: Some(" TAURI ".into()),
            class: Some(7),
            ..LeaderboardFilter::default()
        };
        assert!(filter.matches(&row));
        assert!(!LeaderboardFilter {
            spec: Some(1),
            ..LeaderboardFilter::default()
        }
        .matches(&row));
    }
}
