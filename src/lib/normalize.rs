use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::debug;

use crate::{
    catalog::RaidCatalog,
    config::BugFilterConfig,
    error::StatsError,
    documents::{FACTION_ALLIANCE, FACTION_HORDE, faction_of_race},
    game_api::{RawGuild, RawLog, RawMember},
    keys,
};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    Keep(RawLog),
    Drop,
}

pub trait BugFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, log: RawLog) -> FilterOutcome;
}

/// Records missing their realm, encounter or members cannot be attributed.
struct BlankIdentity;

impl BugFilter for BlankIdentity {
    fn name(&self) -> &'static str {
        "blank-identity"
    }

    fn apply(&self, mut log: RawLog) -> FilterOutcome {
        if log.realm.trim().is_empty() || log.encounter_id == 0 || log.members.is_empty() {
            return FilterOutcome::Drop;
        }
        log.realm = keys::normalize_display(&log.realm);
        log.encounter_name = keys::normalize_display(&log.encounter_name);
        log.guild = log
            .guild
            .take()
            .map(|guild| RawGuild {
                name: keys::normalize_display(&guild.name),
                faction: guild.faction,
            })
            .filter(|guild| !guild.name.is_empty());
        FilterOutcome::Keep(log)
    }
}

struct KnownCorruptLog {
    logs: BTreeSet<(String, u64)>,
}

impl BugFilter for KnownCorruptLog {
    fn name(&self) -> &'static str {
        "known-corrupt-log"
    }

    fn apply(&self, log: RawLog) -> FilterOutcome {
        if self
            .logs
            .contains(&(keys::realm_key(&log.realm), log.log_id))
        {
            FilterOutcome::Drop
        } else {
            FilterOutcome::Keep(log)
        }
    }
}

struct UnknownEncounter {
    catalog: RaidCatalog,
}

impl BugFilter for UnknownEncounter {
    fn name(&self) -> &'static str {
        "unknown-encounter"
    }

    fn apply(&self, log: RawLog) -> FilterOutcome {
        if self.catalog.supports(log.encounter_id, log.difficulty) {
            FilterOutcome::Keep(log)
        } else {
            FilterOutcome::Drop
        }
    }
}

struct ImpossibleFightLength {
    max_ms: u64,
}

impl BugFilter for ImpossibleFightLength {
    fn name(&self) -> &'static str {
        "impossible-fight-length"
    }

    fn apply(&self, log: RawLog) -> FilterOutcome {
        if log.fight_time_ms == 0 || log.fight_time_ms > self.max_ms {
            FilterOutcome::Drop
        } else {
            FilterOutcome::Keep(log)
        }
    }
}

struct MemberWhitespace;

impl BugFilter for MemberWhitespace {
    fn name(&self) -> &'static str {
        "member-whitespace"
    }

    fn apply(&self, mut log: RawLog) -> FilterOutcome {
        for member in &mut log.members {
            member.name = keys::normalize_display(&member.name);
        }
        log.members.retain(|member| !member.name.is_empty());
        if log.members.is_empty() {
            FilterOutcome::Drop
        } else {
            FilterOutcome::Keep(log)
        }
    }
}

/// Some logs report the same member twice; keep the row with the larger totals.
struct DuplicateMembers;

impl BugFilter for DuplicateMembers {
    fn name(&self) -> &'static str {
        "duplicate-members"
    }

    fn apply(&self, mut log: RawLog) -> FilterOutcome {
        let mut seen: BTreeMap<(String, u16), usize> = BTreeMap::new();
        let mut members: Vec<RawMember> = Vec::with_capacity(log.members.len());
        for member in log.members.drain(..) {
            let identity = (keys::normalize_component(&member.name), member.spec);
            match seen.get(&identity) {
                Some(&index) => {
                    if member_total(&member) > member_total(&members[index]) {
                        members[index] = member;
                    }
                }
                None => {
                    seen.insert(identity, members.len());
                    members.push(member);
                }
            }
        }
        log.members = members;
        FilterOutcome::Keep(log)
    }
}

fn member_total(member: &RawMember) -> u64 {
    member
        .damage_done
        .saturating_add(member.healing_done)
        .saturating_add(member.absorb_done)
}

pub struct BugFilterRegistry {
    filters: Vec<Box<dyn BugFilter>>,
}

impl BugFilterRegistry {
    pub fn new(config: &BugFilterConfig, catalog: &RaidCatalog) -> Self {
        let corrupt = config
            .corrupt_logs
            .iter()
            .map(|entry| (keys::realm_key(&entry.realm), entry.log_id))
            .collect();
        Self {
            filters: vec![
                Box::new(BlankIdentity),
                Box::new(KnownCorruptLog { logs: corrupt }),
                Box::new(UnknownEncounter {
                    catalog: catalog.clone(),
                }),
                Box::new(ImpossibleFightLength {
                    max_ms: config.max_fight_secs.saturating_mul(1_000),
                }),
                Box::new(MemberWhitespace),
                Box::new(DuplicateMembers),
            ],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    /// Runs every filter in order; `Err` carries the name of the filter that
    /// dropped the record.
    pub fn apply(&self, log: RawLog) -> Result<RawLog, &'static str> {
        let mut current = log;
        for filter in &self.filters {
            match filter.apply(current) {
                FilterOutcome::Keep(next) => current = next,
                FilterOutcome::Drop => return Err(filter.name()),
            }
        }
        Ok(current)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLog {
    pub log_id: u64,
    pub realm: String,
    pub ingame_boss_id: u32,
    pub difficulty: u8,
    pub boss_name: String,
    pub raid_id: u32,
    pub raid_name: String,
    pub fight_time_ms: u64,
    pub date: DateTime<Utc>,
    pub guild: Option<RawGuild>,
    pub members: Vec<RawMember>,
}

impl NormalizedLog {
    /// The guild's faction when known, otherwise the majority faction of the
    /// members' races.
    pub fn faction(&self) -> u8 {
        if let Some(guild) = &self.guild {
            return guild.faction;
        }
        let (mut alliance, mut horde) = (0usize, 0usize);
        for member in &self.members {
            match faction_of_race(member.race) {
                Some(FACTION_HORDE) => horde += 1,
                Some(_) => alliance += 1,
                None => {}
            }
        }
        if horde > alliance {
            FACTION_HORDE
        } else {
            FACTION_ALLIANCE
        }
    }

    pub fn guild_id(&self) -> Option<String> {
        self.guild
            .as_ref()
            .map(|guild| keys::guild_id(&guild.name, &self.realm))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    /// Ascending by log id.
    pub logs: Vec<NormalizedLog>,
    pub last_log_ids: BTreeMap<String, u64>,
    pub dropped: usize,
}

pub fn normalize_logs(
    raw: Vec<RawLog>,
    last_log_ids: &BTreeMap<String, u64>,
    registry: &BugFilterRegistry,
    catalog: &RaidCatalog,
) -> NormalizedBatch {
    let mut batch = NormalizedBatch {
        logs: Vec::with_capacity(raw.len()),
        last_log_ids: last_log_ids.clone(),
        dropped: 0,
    };

    for log in raw {
        let realm_key = keys::realm_key(&log.realm);
        let watermark = last_log_ids.get(&realm_key).copied().unwrap_or(0);
        if log.log_id <= watermark {
            debug!(log_id = log.log_id, realm = %realm_key, "skipping already ingested log");
            batch.dropped += 1;
            continue;
        }
        if !realm_key.is_empty() {
            let entry = batch.last_log_ids.entry(realm_key).or_insert(0);
            *entry = (*entry).max(log.log_id);
        }

        let log_id = log.log_id;
        let cleaned = match registry.apply(log) {
            Ok(cleaned) => cleaned,
            Err(filter) => {
                let err = StatsError::MalformedLog {
                    log_id,
                    reason: filter,
                };
                debug!(%err, "bug filter dropped log");
                let labels = [("filter", filter)];
                counter!("raidboard_bug_filter_drops_total", &labels).increment(1);
                batch.dropped += 1;
                continue;
            }
        };

        let Some((raid, boss)) = catalog.find_boss(cleaned.encounter_id) else {
            batch.dropped += 1;
            continue;
        };
        batch.logs.push(NormalizedLog {
            log_id: cleaned.log_id,
            realm: cleaned.realm,
            ingame_boss_id: boss.ingame_id,
            difficulty: cleaned.difficulty,
            boss_name: boss.name.clone(),
            raid_id: raid.id,
            raid_name: raid.name.clone(),
            fight_time_ms: cleaned.fight_time_ms,
            date: cleaned.killtime,
            guild: cleaned.guild,
            members: cleaned.members,
        });
    }

    batch.logs.sort_by_key(|log| log.log_id);
    batch
}


#[cfg(test)]
mod tests {
    use super::{fixtures::*, *};
    use crate::{catalog::default_raids, config::KnownCorruptLog as CorruptEntry};

    fn registry() -> (BugFilterRegistry, RaidCatalog) {
        let catalog = RaidCatalog::new(default_raids()).unwrap();
        let config = BugFilterConfig {
            max_fight_secs: 3_600,
            corrupt_logs: vec![CorruptEntry {
                realm: "Tauri".into(),
                log_id: 13,
            }],
        };
        (BugFilterRegistry::new(&config, &catalog), catalog)
    }

    #[test]
    fn filters_run_in_registration_order() {
        let (registry, _) = registry();
        assert_eq!(
            registry.names(),
            vec![
                "blank-identity",
                "known-corrupt-log",
                "unknown-encounter",
                "impossible-fight-length",
                "member-whitespace",
                "duplicate-members",
            ]
        );
    }

    #[test]
    fn drops_bad_records_and_still_advances_watermark() {
        let (registry, catalog) = registry();
        let mut long_fight = raw_log(11, 1577, 5, vec![member("Thrall", 262, 10, 0)]);
        long_fight.fight_time_ms = 4_000_000;
        let logs = vec![
            raw_log(10, 1577, 5, vec![member("Thrall", 262, 10, 0)]),
            long_fight,
            raw_log(12, 9999, 5, vec![member("Thrall", 262, 10, 0)]),
            raw_log(13, 1577, 5, vec![member("Thrall", 262, 10, 0)]),
            raw_log(14, 1577, 5, Vec::new()),
            raw_log(3, 1577, 5, vec![member("Thrall", 262, 10, 0)]),
        ];
        let watermark = BTreeMap::from([("tauri".to_string(), 5)]);

        let batch = normalize_logs(logs, &watermark, &registry, &catalog);
        assert_eq!(batch.logs.len(), 1);
        assert_eq!(batch.logs[0].log_id, 10);
        assert_eq!(batch.logs[0].boss_name, "Jin'rokh the Breaker");
        assert_eq!(batch.dropped, 5);
        assert_eq!(batch.last_log_ids["tauri"], 14);
    }

    #[test]
    fn duplicate_members_keep_largest_row() {
        let (registry, _) = registry();
        let log = raw_log(
            20,
            1577,
            5,
            vec![
                member(" Thrall ", 262, 100, 0),
                member("thrall", 262, 500, 0),
                member("Jaina", 64, 50, 0),
            ],
        );
        let cleaned = registry.apply(log).unwrap();
        assert_eq!(cleaned.members.len(), 2);
        assert_eq!(cleaned.members[0].damage_done, 500);
    }

    #[test]
    fn filtering_is_idempotent() {
        let (registry, _) = registry();
        let mut log = raw_log(21, 1577, 5, vec![member("  Jaina   Proudmoore ", 64, 5, 0)]);
        log.realm = " Tauri ".into();
        let once = registry.apply(log).unwrap();
        let twice = registry.apply(once.clone()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.members[0].name, "Jaina Proudmoore");
    }

    #[test]
    fn realm_spellings_share_one_watermark() {
        let (registry, catalog) = registry();
        let mut shouting = raw_log(40, 1577, 5, vec![member("Thrall", 262, 10, 0)]);
        shouting.realm = "TAURI ".into();
        let logs = vec![
            raw_log(7, 1577, 5, vec![member("Thrall", 262, 10, 0)]),
            shouting,
        ];
        let watermark = BTreeMap::from([("tauri".to_string(), 8)]);

        let batch = normalize_logs(logs, &watermark, &registry, &catalog);
        assert_eq!(batch.logs.len(), 1);
        assert_eq!(batch.logs[0].log_id, 40);
        assert_eq!(batch.last_log_ids, BTreeMap::from([("tauri".to_string(), 40)]));
    }

    #[test]
    fn faction_falls_back_to_member_majority() {
        let (registry, catalog) = registry();
        let mut log = raw_log(30, 1577, 5, vec![member("A", 262, 1, 0), member("B", 262, 1, 0)]);
        log.guild = None;
        log.members[0].race = 1;
        log.members[1].race = 1;
        let batch = normalize_logs(vec![log], &BTreeMap::new(), &registry, &catalog);
        assert_eq!(batch.logs[0].faction(), FACTION_ALLIANCE);
        assert!(batch.logs[0].guild_id().is_none());
    }
}
