use std::{cmp::Ordering, collections::BTreeMap};

use chrono::{DateTime, Utc};

use crate::{
    aggregate::{BossUpdate, GuildUpdate},
    catalog::RaidCatalog,
    config::RankingConfig,
    documents::{
        BestTable, BossProgress, CharacterDocument, CharacterSnapshot, GuildDocument, LogSnapshot,
        ProgressKey, RaidBossDocument, RaidProgress,
    },
    game_api::GuildSnapshot,
    keys,
};

fn by_value_desc(a: &CharacterSnapshot, b: &CharacterSnapshot) -> Ordering {
    b.value.total_cmp(&a.value)
}

/// Insert-if-absent, update-if-strictly-greater.
pub fn merge_character(
    old: Option<&CharacterDocument>,
    candidate: &CharacterDocument,
) -> Option<CharacterDocument> {
    match old {
        Some(old) if candidate.value <= old.value => None,
        _ => {
            let mut doc = candidate.clone();
            doc.rank = 0;
            doc.class_rank = 0;
            doc.spec_rank = 0;
            Some(doc)
        }
    }
}

/// Folds candidates into their category buckets, keeping each bucket sorted
/// descending and at most `limit` long. Returns whether anything changed.
pub fn merge_best_table<I>(table: &mut BestTable, candidates: I, limit: usize) -> bool
where
    I: IntoIterator<Item = CharacterSnapshot>,
{
    let mut changed = false;
    for candidate in candidates {
        let bucket = table.buckets.entry(candidate.category()).or_default();
        if let Some(existing) = bucket
            .characters
            .iter_mut()
            .find(|entry| entry.character_id == candidate.character_id)
        {
            if candidate.value <= existing.value {
                continue;
            }
            *existing = candidate;
        } else {
            if bucket.characters.len() >= limit
                && bucket
                    .characters
                    .last()
                    .is_some_and(|last| candidate.value <= last.value)
            {
                continue;
            }
            bucket.characters.push(candidate);
        }
        bucket.characters.sort_by(by_value_desc);
        bucket.characters.truncate(limit);
        bucket.top = bucket.characters.first().map(|c| c.value).unwrap_or(0.0);
        changed = true;
    }
    table.buckets.retain(|_, bucket| !bucket.characters.is_empty());
    if changed {
        recompute_best_overall(table);
    }
    changed
}

fn recompute_best_overall(table: &mut BestTable) {
    let mut best: Option<&CharacterSnapshot> = None;
    for bucket in table.buckets.values() {
        if let Some(first) = bucket.characters.first() {
            if best.is_none_or(|current| first.value > current.value) {
                best = Some(first);
            }
        }
    }
    table.best_overall = best.cloned();
}

fn insert_fastest(kills: &mut Vec<LogSnapshot>, kill: &LogSnapshot, limit: usize) {
    if kills.len() >= limit
        && kills
            .last()
            .is_some_and(|slowest| kill.fight_time_ms >= slowest.fight_time_ms)
    {
        return;
    }
    kills.push(kill.clone());
    kills.sort_by_key(|entry| entry.fight_time_ms);
    kills.truncate(limit);
}

pub fn merge_raid_boss(
    old: &RaidBossDocument,
    update: &BossUpdate,
    limits: &RankingConfig,
) -> Option<RaidBossDocument> {
    let mut doc = old.clone();

    for kill in &update.kills {
        let realm = keys::realm_key(&kill.realm);
        let watermark = doc.last_log_ids.get(&realm).copied().unwrap_or(0);
        if kill.log_id <= watermark {
            continue;
        }
        doc.last_log_ids.insert(realm, kill.log_id);
        doc.kill_count += 1;
        doc.recent_kills.insert(0, kill.clone());
        insert_fastest(
            doc.fastest_kills.entry(kill.fastest_key()).or_default(),
            kill,
            limits.fastest_kills,
        );
    }
    doc.recent_kills.sort_by(|a, b| b.date.cmp(&a.date));
    doc.recent_kills.truncate(limits.recent_kills);

    for (metric, candidates) in &update.best {
        merge_best_table(
            doc.best_mut(*metric),
            candidates.values().cloned(),
            limits.best_list_size,
        );
    }

    (doc != *old).then_some(doc)
}

/// Drops every snapshot of `character_ids` from the best tables.
pub fn remove_characters(doc: &RaidBossDocument, character_ids: &[String]) -> Option<RaidBossDocument> {
    let mut updated = doc.clone();
    for table in [&mut updated.dps, &mut updated.hps] {
        let mut changed = false;
        for bucket in table.buckets.values_mut() {
            let before = bucket.characters.len();
            bucket
                .characters
                .retain(|entry| !character_ids.contains(&entry.character_id));
            if bucket.characters.len() != before {
                bucket.top = bucket.characters.first().map(|c| c.value).unwrap_or(0.0);
                changed = true;
            }
        }
        if changed {
            table.buckets.retain(|_, bucket| !bucket.characters.is_empty());
            recompute_best_overall(table);
        }
    }
    (updated != *doc).then_some(updated)
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn merge_boss_progress(into: &mut BossProgress, from: &BossProgress) {
    into.kills = into.kills.max(from.kills);
    into.first_kill = earliest(into.first_kill, from.first_kill);
    into.last_kill = latest(into.last_kill, from.last_kill);
    into.fastest_kill_ms = match (into.fastest_kill_ms, from.fastest_kill_ms) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
}

/// Field-wise progression merge: counters take the max, first-seen dates
/// the min, and a cleared flag never reverts.
pub fn merge_progression(
    into: &mut BTreeMap<ProgressKey, RaidProgress>,
    from: &BTreeMap<ProgressKey, RaidProgress>,
    catalog: &RaidCatalog,
    recent_limit: usize,
) {
    for (key, incoming) in from {
        let progress = into.entry(*key).or_insert_with(|| RaidProgress {
            raid_name: incoming.raid_name.clone(),
            ..RaidProgress::default()
        });
        for (boss, boss_progress) in &incoming.bosses {
            merge_boss_progress(progress.bosses.entry(*boss).or_default(), boss_progress);
        }
        progress.cleared_at = earliest(progress.cleared_at, incoming.cleared_at);
        progress.difficulty_cleared |= incoming.difficulty_cleared;

        let mut recent = progress.recent_kills.clone();
        recent.extend(incoming.recent_kills.iter().copied());
        recent.sort_by(|a, b| b.cmp(a));
        recent.dedup();
        recent.truncate(recent_limit);
        progress.recent_kills = recent;
    }

    for (key, progress) in into.iter_mut() {
        if progress.difficulty_cleared {
            continue;
        }
        let Some(raid) = catalog.raid(key.raid_id) else {
            continue;
        };
        let all_killed = !raid.bosses.is_empty()
            && raid.bosses.iter().all(|boss| {
                progress
                    .bosses
                    .get(&boss.ingame_id)
                    .is_some_and(|entry| entry.kills > 0)
            });
        if all_killed {
            progress.difficulty_cleared = true;
            // The moment the last boss first went down.
            progress.cleared_at = raid
                .bosses
                .iter()
                .filter_map(|boss| progress.bosses.get(&boss.ingame_id)?.first_kill)
                .max();
        }
    }
}

/// Applies one batch's kills to a guild. Kills at or below the guild's last
/// absorbed log id are ignored.
pub fn apply_guild_update(
    old: Option<&GuildDocument>,
    update: &GuildUpdate,
    catalog: &RaidCatalog,
    limits: &RankingConfig,
) -> Option<GuildDocument> {
    let mut doc = match old {
        Some(old) => old.clone(),
        None => {
            let mut doc = GuildDocument::new(&update.name, &update.realm, update.faction);
            doc.updated_at = update.last_activity;
            doc
        }
    };

    let mut delta = doc.progression.clone();
    let mut last_log_id = doc.last_log_id;
    for kill in update.kills.iter().filter(|kill| kill.log_id > doc.last_log_id) {
        let progress = delta
            .entry(ProgressKey {
                raid_id: kill.raid_id,
                difficulty: kill.difficulty,
            })
            .or_insert_with(|| RaidProgress {
                raid_name: kill.raid_name.clone(),
                ..RaidProgress::default()
            });
        let boss = progress.bosses.entry(kill.ingame_boss_id).or_default();
        boss.kills += 1;
        boss.first_kill = earliest(boss.first_kill, Some(kill.date));
        boss.last_kill = latest(boss.last_kill, Some(kill.date));
        boss.fastest_kill_ms = Some(
            boss.fastest_kill_ms
                .map_or(kill.fight_time_ms, |fastest| fastest.min(kill.fight_time_ms)),
        );
        progress.recent_kills.push(kill.date);
        last_log_id = last_log_id.max(kill.log_id);
    }

    merge_progression(&mut doc.progression, &delta, catalog, limits.recent_kills);
    doc.last_log_id = last_log_id;
    doc.last_activity = latest(doc.last_activity, Some(update.last_activity));

    match old {
        Some(old) if *old == doc => None,
        _ => Some(doc),
    }
}

/// Merges a guild fetched from the game API. Roster and activity come from
/// the fetch; progression is merged so it never regresses.
pub fn merge_guild_snapshot(
    old: Option<&GuildDocument>,
    snapshot: &GuildSnapshot,
    catalog: &RaidCatalog,
    limits: &RankingConfig,
    fetched_at: DateTime<Utc>,
) -> GuildDocument {
    let mut doc = match old {
        Some(old) => old.clone(),
        None => GuildDocument::new(&snapshot.name, &snapshot.realm, snapshot.faction),
    };
    doc.name = keys::normalize_display(&snapshot.name);
    doc.faction = snapshot.faction;
    doc.members = snapshot.members.clone();
    if snapshot.last_activity.is_some() {
        doc.last_activity = snapshot.last_activity;
    }
    merge_progression(
        &mut doc.progression,
        &snapshot.progression,
        catalog,
        limits.recent_kills,
    );
    doc.updated_at = fetched_at;
    doc
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        aggregate::GuildKill,
        catalog::default_raids,
        documents::{CombatMetric, FACTION_HORDE, FastestKey},
        store::fixtures::character,
    };

    fn limits() -> RankingConfig {
        RankingConfig {
            best_list_size: 10,
            recent_kills: 5,
            fastest_kills: 3,
            leaderboard_page_limit: 100,
        }
    }

    fn date(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 20, minute, 0).unwrap()
    }

    fn boss_doc() -> RaidBossDocument {
        let raids = default_raids();
        RaidBossDocument::new(&raids[0], &raids[0].bosses[0], 5)
    }

    fn kill(log_id: u64, fight_time_ms: u64) -> LogSnapshot {
        LogSnapshot {
            log_id,
            realm: "Tauri".into(),
            faction: FACTION_HORDE,
            fight_time_ms,
            date: date(log_id as u32 % 60),
            member_count: 10,
            guild: None,
        }
    }

    #[test]
    fn stored_value_is_the_order_independent_maximum() {
        let values = [4500.0, 4200.0, 4800.0, 100.0];
        let mut forward: Option<CharacterDocument> = None;
        for value in values {
            let candidate = character("Thrall", 262, 7, value);
            if let Some(next) = merge_character(forward.as_ref(), &candidate) {
                forward = Some(next);
            }
        }
        let mut backward: Option<CharacterDocument> = None;
        for value in values.iter().rev() {
            let candidate = character("Thrall", 262, 7, *value);
            if let Some(next) = merge_character(backward.as_ref(), &candidate) {
                backward = Some(next);
            }
        }
        assert_eq!(forward.map(|d| d.value), Some(4800.0));
        assert_eq!(backward.map(|d| d.value), Some(4800.0));
    }

    #[test]
    fn lower_observation_keeps_stored_value() {
        let stored = character("Thrall", 262, 7, 4500.0);
        assert!(merge_character(Some(&stored), &character("Thrall", 262, 7, 4200.0)).is_none());
        assert!(merge_character(Some(&stored), &character("Thrall", 262, 7, 4500.0)).is_none());
    }

    #[test]
    fn full_bucket_rejects_a_lower_candidate() {
        let mut table = BestTable::default();
        let entries = (0..10).map(|i| character(&format!("P{i}"), 262, 7, 1000.0 + i as f64).snapshot());
        assert!(merge_best_table(&mut table, entries, 10));
        let before = table.clone();

        let low = character("Late", 262, 7, 10.0).snapshot();
        assert!(!merge_best_table(&mut table, [low], 10));
        assert_eq!(table, before);
    }

    #[test]
    fn buckets_stay_sorted_and_bounded() {
        let mut table = BestTable::default();
        let entries = (0..25).map(|i| character(&format!("P{i}"), 262, 7, ((i * 37) % 25) as f64 + 1.0).snapshot());
        merge_best_table(&mut table, entries, 10);

        for bucket in table.buckets.values() {
            assert!(bucket.characters.len() <= 10);
            assert!(bucket.characters.windows(2).all(|w| w[0].value >= w[1].value));
            assert_eq!(bucket.top, bucket.characters[0].value);
        }
        assert_eq!(table.best_overall.as_ref().map(|b| b.value), Some(25.0));
    }

    #[test]
    fn character_occupies_one_position_per_bucket() {
        let mut table = BestTable::default();
        merge_best_table(&mut table, [character("Thrall", 262, 7, 10.0).snapshot()], 10);
        merge_best_table(&mut table, [character("Thrall", 262, 7, 20.0).snapshot()], 10);
        merge_best_table(&mut table, [character("Thrall", 262, 7, 15.0).snapshot()], 10);
        let bucket = table.buckets.values().next().unwrap();
        assert_eq!(bucket.characters.len(), 1);
        assert_eq!(bucket.top, 20.0);
    }

    #[test]
    fn raid_boss_merge_is_idempotent() {
        let mut update = BossUpdate {
            boss_id: "1577-5".into(),
            ingame_boss_id: 1577,
            difficulty: 5,
            raid_name: "Throne of Thunder".into(),
            kills: vec![kill(1, 300_000), kill(2, 200_000)],
            best: BTreeMap::new(),
        };
        update.best.insert(
            CombatMetric::Dps,
            BTreeMap::from([(
                "thrall,tauri,262".to_string(),
                character("Thrall", 262, 7, 4500.0).snapshot(),
            )]),
        );

        let once = merge_raid_boss(&boss_doc(), &update, &limits()).unwrap();
        assert_eq!(once.kill_count, 2);
        assert_eq!(once.recent_kills[0].log_id, 2);
        assert_eq!(once.fastest_kill().map(|k| k.log_id), Some(2));
        assert_eq!(once.dps.best_overall.as_ref().map(|b| b.value), Some(4500.0));

        assert!(merge_raid_boss(&once, &update, &limits()).is_none());
    }

    #[test]
    fn fastest_kills_keep_top_n_ascending() {
        let update = BossUpdate {
            boss_id: "1577-5".into(),
            ingame_boss_id: 1577,
            difficulty: 5,
            raid_name: "Throne of Thunder".into(),
            kills: vec![
                kill(1, 500),
                kill(2, 400),
                kill(3, 300),
                kill(4, 600),
                kill(5, 100),
            ],
            best: BTreeMap::new(),
        };
        let doc = merge_raid_boss(&boss_doc(), &update, &limits()).unwrap();
        let bucket = &doc.fastest_kills[&FastestKey {
            realm: "Tauri".into(),
            faction: FACTION_HORDE,
        }];
        let times: Vec<_> = bucket.iter().map(|k| k.fight_time_ms).collect();
        assert_eq!(times, vec![100, 300, 400]);
        assert_eq!(doc.recent_kills.len(), 5);
    }

    #[test]
    fn removing_a_character_recomputes_best_overall() {
        let mut doc = boss_doc();
        merge_best_table(
            &mut doc.dps,
            [
                character("Thrall", 262, 7, 50.0).snapshot(),
                character("Jaina", 64, 8, 40.0).snapshot(),
            ],
            10,
        );
        let updated = remove_characters(&doc, &[keys::character_id("Thrall", "Tauri", 262)]).unwrap();
        assert_eq!(updated.dps.best_overall.as_ref().map(|b| b.name.as_str()), Some("Jaina"));
        assert_eq!(updated.dps.buckets.len(), 1);
        assert!(remove_characters(&updated, &["nobody,tauri,1".into()]).is_none());
    }

    fn guild_update(kills: Vec<GuildKill>) -> GuildUpdate {
        GuildUpdate {
            guild_id: keys::guild_id("Exorsus", "Tauri"),
            name: "Exorsus".into(),
            realm: "Tauri".into(),
            faction: FACTION_HORDE,
            last_activity: kills.iter().map(|k| k.date).max().unwrap(),
            kills,
        }
    }

    fn guild_kill(log_id: u64, boss: u32) -> GuildKill {
        GuildKill {
            log_id,
            raid_id: 1098,
            raid_name: "Throne of Thunder".into(),
            ingame_boss_id: boss,
            difficulty: 5,
            date: date(log_id as u32),
            fight_time_ms: 1_000 * log_id,
        }
    }

    #[test]
    fn guild_clears_difficulty_when_every_boss_dies() {
        let catalog = RaidCatalog::new(default_raids()).unwrap();
        let bosses: Vec<u32> = catalog.raids()[0].bosses.iter().map(|b| b.ingame_id).collect();
        let kills = bosses
            .iter()
            .enumerate()
            .map(|(i, boss)| guild_kill(i as u64 + 1, *boss))
            .collect();

        let doc = apply_guild_update(None, &guild_update(kills), &catalog, &limits()).unwrap();
        let progress = &doc.progression[&ProgressKey {
            raid_id: 1098,
            difficulty: 5,
        }];
        assert!(progress.difficulty_cleared);
        assert_eq!(progress.cleared_at, Some(date(bosses.len() as u32)));
        assert_eq!(doc.last_log_id, bosses.len() as u64);
        assert_eq!(progress.recent_kills.len(), 5);

        let replay = guild_update(vec![guild_kill(1, bosses[0])]);
        assert!(apply_guild_update(Some(&doc), &replay, &catalog, &limits()).is_none());
    }

    #[test]
    fn stale_snapshot_never_regresses_progression() {
        let catalog = RaidCatalog::new(default_raids()).unwrap();
        let key = ProgressKey {
            raid_id: 1098,
            difficulty: 5,
        };
        let mut stored = GuildDocument::new("Exorsus", "Tauri", FACTION_HORDE);
        stored.progression.insert(
            key,
            RaidProgress {
                raid_name: "Throne of Thunder".into(),
                bosses: BTreeMap::from([(
                    1577,
                    BossProgress {
                        kills: 4,
                        first_kill: Some(date(1)),
                        last_kill: Some(date(9)),
                        fastest_kill_ms: Some(100),
                    },
                )]),
                difficulty_cleared: true,
                cleared_at: Some(date(9)),
                recent_kills: vec![date(9)],
            },
        );

        let stale = GuildSnapshot {
            name: "Exorsus".into(),
            realm: "Tauri".into(),
            faction: FACTION_HORDE,
            members: Vec::new(),
            progression: BTreeMap::from([(
                key,
                RaidProgress {
                    raid_name: "Throne of Thunder".into(),
                    bosses: BTreeMap::from([(
                        1577,
                        BossProgress {
                            kills: 2,
                            first_kill: Some(date(0)),
                            last_kill: Some(date(3)),
                            fastest_kill_ms: Some(200),
                        },
                    )]),
                    difficulty_cleared: false,
                    cleared_at: None,
                    recent_kills: Vec::new(),
                },
            )]),
            last_activity: None,
        };

        let merged = merge_guild_snapshot(Some(&stored), &stale, &catalog, &limits(), date(30));
        let progress = &merged.progression[&key];
        assert!(progress.difficulty_cleared);
        let boss = &progress.bosses[&1577];
        assert_eq!(boss.kills, 4);
        assert_eq!(boss.first_kill, Some(date(0)));
        assert_eq!(boss.last_kill, Some(date(9)));
        assert_eq!(boss.fastest_kill_ms, Some(100));
        assert_eq!(merged.updated_at, date(30));
    }
}
