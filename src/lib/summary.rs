use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    catalog::RaidDefinition,
    documents::{
        CharacterDocument, CharacterSnapshot, CollectionStats, CombatMetric, GuildDocument,
        LogSnapshot, RaidBossDocument,
    },
    keys,
    rank::{class_total, percentile, spec_total},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BossSummary {
    pub id: String,
    pub ingame_boss_id: u32,
    pub name: String,
    pub difficulty: u8,
    pub kill_count: u64,
    pub fastest_kill: Option<LogSnapshot>,
    pub latest_kill: Option<LogSnapshot>,
    pub best_dps: Option<CharacterSnapshot>,
    pub best_hps: Option<CharacterSnapshot>,
}

impl From<&RaidBossDocument> for BossSummary {
    fn from(doc: &RaidBossDocument) -> Self {
        Self {
            id: doc.id.clone(),
            ingame_boss_id: doc.ingame_boss_id,
            name: doc.name.clone(),
            difficulty: doc.difficulty,
            kill_count: doc.kill_count,
            fastest_kill: doc.fastest_kill().cloned(),
            latest_kill: doc.recent_kills.first().cloned(),
            best_dps: doc.dps.best_overall.clone(),
            best_hps: doc.hps.best_overall.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaidSummary {
    pub raid_id: u32,
    pub raid_name: String,
    pub total_kills: u64,
    pub bosses: Vec<BossSummary>,
}

/// Summaries in catalog order (difficulty, then boss). Bosses without a
/// document are skipped.
pub fn raid_summary(raid: &RaidDefinition, docs: &[Arc<RaidBossDocument>]) -> RaidSummary {
    let by_id: BTreeMap<&str, &RaidBossDocument> =
        docs.iter().map(|doc| (doc.id.as_str(), doc.as_ref())).collect();
    let mut bosses = Vec::new();
    for difficulty in &raid.difficulties {
        for boss in &raid.bosses {
            if let Some(doc) = by_id.get(keys::raid_boss_id(boss.ingame_id, *difficulty).as_str()) {
                bosses.push(BossSummary::from(*doc));
            }
        }
    }
    RaidSummary {
        raid_id: raid.id,
        raid_name: raid.name.clone(),
        total_kills: bosses.iter().map(|boss| boss.kill_count).sum(),
        bosses,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BossPerformance {
    pub boss_id: String,
    pub boss_name: String,
    pub difficulty: u8,
    pub metric: CombatMetric,
    pub character_id: String,
    pub spec: u16,
    pub value: f64,
    pub ilvl: f64,
    pub date: DateTime<Utc>,
    pub log_id: u64,
    pub rank: u32,
    pub class_rank: u32,
    pub spec_rank: u32,
    pub total: u64,
    pub percentile: f64,
    pub class_percentile: f64,
    pub spec_percentile: f64,
}

pub fn boss_performance(
    doc: &CharacterDocument,
    boss_name: &str,
    stats: &CollectionStats,
) -> BossPerformance {
    BossPerformance {
        boss_id: doc.boss_id(),
        boss_name: boss_name.to_string(),
        difficulty: doc.difficulty,
        metric: doc.metric,
        character_id: doc.id.clone(),
        spec: doc.spec,
        value: doc.value,
        ilvl: doc.ilvl,
        date: doc.date,
        log_id: doc.log_id,
        rank: doc.rank,
        class_rank: doc.class_rank,
        spec_rank: doc.spec_rank,
        total: stats.total,
        percentile: percentile(doc.rank, stats.total),
        class_percentile: percentile(doc.class_rank, class_total(stats, doc.class)),
        spec_percentile: percentile(doc.spec_rank, spec_total(stats, doc.spec)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacterPerformance {
    pub name: String,
    pub realm: String,
    pub class: u8,
    pub raid_name: String,
    pub bosses: Vec<BossPerformance>,
    /// Mean class percentile per difficulty and metric.
    pub average_class_percentile: BTreeMap<u8, BTreeMap<CombatMetric, f64>>,
}

pub fn character_performance(
    name: &str,
    realm: &str,
    class: u8,
    raid_name: &str,
    bosses: Vec<BossPerformance>,
) -> CharacterPerformance {
    let mut sums: BTreeMap<u8, BTreeMap<CombatMetric, (f64, usize)>> = BTreeMap::new();
    for boss in &bosses {
        let entry = sums
            .entry(boss.difficulty)
            .or_default()
            .entry(boss.metric)
            .or_insert((0.0, 0));
        entry.0 += boss.class_percentile;
        entry.1 += 1;
    }
    let average_class_percentile = sums
        .into_iter()
        .map(|(difficulty, metrics)| {
            let averages = metrics
                .into_iter()
                .map(|(metric, (sum, count))| (metric, sum / count as f64))
                .collect();
            (difficulty, averages)
        })
        .collect();

    CharacterPerformance {
        name: keys::normalize_display(name),
        realm: keys::normalize_display(realm),
        class,
        raid_name: raid_name.to_string(),
        bosses,
        average_class_percentile,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuildProgressSummary {
    pub raid_id: u32,
    pub raid_name: String,
    pub difficulty: u8,
    pub bosses_killed: usize,
    pub difficulty_cleared: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuildListEntry {
    pub id: String,
    pub name: String,
    pub realm: String,
    pub faction: u8,
    pub member_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub progression: Vec<GuildProgressSummary>,
}

impl From<&GuildDocument> for GuildListEntry {
    fn from(doc: &GuildDocument) -> Self {
        Self {
            id: doc.id.clone(),
            name: doc.name.clone(),
            realm: doc.realm.clone(),
            faction: doc.faction,
            member_count: doc.members.len(),
            last_activity: doc.last_activity,
            progression: doc
                .progression
                .iter()
                .map(|(key, progress)| GuildProgressSummary {
                    raid_id: key.raid_id,
                    raid_name: progress.raid_name.clone(),
                    difficulty: key.difficulty,
                    bosses_killed: progress
                        .bosses
                        .values()
                        .filter(|boss| boss.kills > 0)
                        .count(),
                    difficulty_cleared: progress.difficulty_cleared,
                })
                .collect(),
        }
    }
}

/// Most recently active guilds first.
pub fn guild_list(guilds: &[GuildDocument]) -> Vec<GuildListEntry> {
    let mut entries: Vec<GuildListEntry> = guilds.iter().map(GuildListEntry::from).collect();
    entries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity).then_with(|| a.id.cmp(&b.id)));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::default_raids, store::fixtures::character};

    #[test]
    fn raid_summary_follows_catalog_order() {
        let raids = default_raids();
        let raid = &raids[0];
        let mut second = RaidBossDocument::new(raid, &raid.bosses[1], 5);
        second.kill_count = 3;
        let first = RaidBossDocument::new(raid, &raid.bosses[0], 5);
        let heroic = RaidBossDocument::new(raid, &raid.bosses[0], 6);

        let docs = vec![Arc::new(heroic), Arc::new(second), Arc::new(first)];
        let summary = raid_summary(raid, &docs);
        let ids: Vec<_> = summary.bosses.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["1577-5", "1575-5", "1577-6"]);
        assert_eq!(summary.total_kills, 3);
    }

    #[test]
    fn performance_averages_class_percentiles() {
        let mut top = character("Thrall", 262, 7, 100.0);
        top.rank = 1;
        top.class_rank = 1;
        top.spec_rank = 1;
        let mut other = top.clone();
        other.ingame_boss_id = 1575;
        other.class_rank = 4;
        let stats = CollectionStats {
            total: 4,
            classes: BTreeMap::from([(7, 4)]),
            specs: BTreeMap::from([(262, 4)]),
        };

        let perf = character_performance(
            " thrall ",
            "Tauri",
            7,
            "Throne of Thunder",
            vec![
                boss_performance(&top, "Jin'rokh the Breaker", &stats),
                boss_performance(&other, "Horridon", &stats),
            ],
        );
        assert_eq!(perf.name, "thrall");
        assert_eq!(perf.bosses[0].percentile, 100.0);
        assert_eq!(perf.bosses[1].class_percentile, 25.0);
        assert_eq!(perf.average_class_percentile[&5][&CombatMetric::Dps], 62.5);
    }
}
