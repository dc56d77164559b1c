use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::{
    documents::{
        CharacterDocument, CharacterSnapshot, CombatMetric, GuildRef, LogSnapshot, faction_of_race,
    },
    game_api::RawMember,
    keys,
    normalize::NormalizedLog,
};

/// Everything one batch contributes to a single raid boss document.
#[derive(Debug, Clone, PartialEq)]
pub struct BossUpdate {
    pub boss_id: String,
    pub ingame_boss_id: u32,
    pub difficulty: u8,
    pub raid_name: String,
    /// Ascending by log id.
    pub kills: Vec<LogSnapshot>,
    /// Batch-best snapshot per character id, per metric.
    pub best: BTreeMap<CombatMetric, BTreeMap<String, CharacterSnapshot>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuildKill {
    pub log_id: u64,
    pub raid_id: u32,
    pub raid_name: String,
    pub ingame_boss_id: u32,
    pub difficulty: u8,
    pub date: DateTime<Utc>,
    pub fight_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuildUpdate {
    pub guild_id: String,
    pub name: String,
    pub realm: String,
    pub faction: u8,
    /// Ascending by log id.
    pub kills: Vec<GuildKill>,
    pub last_activity: DateTime<Utc>,
}

pub type CharacterCandidates = BTreeMap<String, BTreeMap<CombatMetric, BTreeMap<String, CharacterDocument>>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub bosses: BTreeMap<String, BossUpdate>,
    pub guilds: BTreeMap<String, GuildUpdate>,
    /// boss id → metric → character id → candidate.
    pub characters: CharacterCandidates,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.bosses.is_empty() && self.guilds.is_empty() && self.characters.is_empty()
    }

    pub fn character_count(&self) -> usize {
        self.characters
            .values()
            .flat_map(|metrics| metrics.values())
            .map(|rows| rows.len())
            .sum()
    }
}

/// Damage (or healing plus absorbs) per second of fight time.
pub fn member_metric(member: &RawMember, metric: CombatMetric, fight_time_ms: u64) -> f64 {
    if fight_time_ms == 0 {
        return 0.0;
    }
    let total = match metric {
        CombatMetric::Dps => member.damage_done,
        CombatMetric::Hps => member.healing_done.saturating_add(member.absorb_done),
    };
    total as f64 / (fight_time_ms as f64 / 1_000.0)
}

pub fn build(logs: &[NormalizedLog]) -> Aggregation {
    let mut aggregation = Aggregation::default();
    for log in logs {
        add_log(&mut aggregation, log);
    }
    aggregation
}

fn add_log(aggregation: &mut Aggregation, log: &NormalizedLog) {
    let boss_id = keys::raid_boss_id(log.ingame_boss_id, log.difficulty);
    let log_faction = log.faction();
    let guild_id = log.guild_id();

    let boss = aggregation
        .bosses
        .entry(boss_id.clone())
        .or_insert_with(|| BossUpdate {
            boss_id: boss_id.clone(),
            ingame_boss_id: log.ingame_boss_id,
            difficulty: log.difficulty,
            raid_name: log.raid_name.clone(),
            kills: Vec::new(),
            best: BTreeMap::new(),
        });
    boss.kills.push(LogSnapshot {
        log_id: log.log_id,
        realm: log.realm.clone(),
        faction: log_faction,
        fight_time_ms: log.fight_time_ms,
        date: log.date,
        member_count: log.members.len(),
        guild: log.guild.as_ref().zip(guild_id.as_ref()).map(|(guild, id)| GuildRef {
            id: id.clone(),
            name: guild.name.clone(),
            faction: guild.faction,
        }),
    });

    for member in &log.members {
        let faction = faction_of_race(member.race).unwrap_or(log_faction);
        let character_id = keys::character_id(&member.name, &log.realm, member.spec);
        for metric in CombatMetric::ALL {
            let value = member_metric(member, metric, log.fight_time_ms);
            if value <= 0.0 {
                continue;
            }
            let candidate = CharacterDocument {
                id: character_id.clone(),
                name: member.name.clone(),
                realm: log.realm.clone(),
                class: member.class,
                spec: member.spec,
                race: member.race,
                faction,
                ingame_boss_id: log.ingame_boss_id,
                difficulty: log.difficulty,
                metric,
                value,
                ilvl: member.ilvl,
                date: log.date,
                log_id: log.log_id,
                guild: log.guild.as_ref().map(|guild| guild.name.clone()),
                rank: 0,
                class_rank: 0,
                spec_rank: 0,
            };

            let best = boss.best.entry(metric).or_default();
            if best
                .get(&character_id)
                .is_none_or(|existing| value > existing.value)
            {
                best.insert(character_id.clone(), candidate.snapshot());
            }

            let rows = aggregation
                .characters
                .entry(boss_id.clone())
                .or_default()
                .entry(metric)
                .or_default();
            if rows
                .get(&character_id)
                .is_none_or(|existing| value > existing.value)
            {
                rows.insert(character_id.clone(), candidate);
            }
        }
    }

    if let (Some(guild), Some(guild_id)) = (&log.guild, guild_id) {
        let update = aggregation
            .guilds
            .entry(guild_id.clone())
            .or_insert_with(|| GuildUpdate {
                guild_id,
                name: guild.name.clone(),
                realm: log.realm.clone(),
                faction: guild.faction,
                kills: Vec::new(),
                last_activity: log.date,
            });
        update.kills.push(GuildKill {
            log_id: log.log_id,
            raid_id: log.raid_id,
            raid_name: log.raid_name.clone(),
            ingame_boss_id: log.ingame_boss_id,
            difficulty: log.difficulty,
            date: log.date,
            fight_time_ms: log.fight_time_ms,
        });
        if log.date > update.last_activity {
            update.last_activity = log.date;
        }
    }
}
