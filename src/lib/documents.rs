use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{BossDefinition, RaidDefinition},
    error::StatsError,
    keys,
};

pub const FACTION_ALLIANCE: u8 = 0;
pub const FACTION_HORDE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombatMetric {
    Dps,
    Hps,
}

impl CombatMetric {
    pub const ALL: [CombatMetric; 2] = [CombatMetric::Dps, CombatMetric::Hps];

    pub fn as_str(self) -> &'static str {
        match self {
            CombatMetric::Dps => "dps",
            CombatMetric::Hps => "hps",
        }
    }
}

impl fmt::Display for CombatMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CombatMetric {
    type Err = StatsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dps" => Ok(CombatMetric::Dps),
            "hps" => Ok(CombatMetric::Hps),
            other => Err(StatsError::InvalidRequest(format!(
                "unsupported combat metric '{other}'"
            ))),
        }
    }
}

/// Playable race ids mapped to their faction. Pandaren (24) is neutral and
/// resolves to `None`.
pub fn faction_of_race(race: u8) -> Option<u8> {
    match race {
        1 | 3 | 4 | 7 | 11 | 22 | 25 => Some(FACTION_ALLIANCE),
        2 | 5 | 6 | 8 | 9 | 10 | 26 => Some(FACTION_HORDE),
        _ => None,
    }
}

/// Bucket identity of a best-performance list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CategoryKey {
    pub realm: String,
    pub faction: u8,
    pub class: u8,
    pub spec: u16,
}

/// Bucket identity of a fastest-kills list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FastestKey {
    pub realm: String,
    pub faction: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildRef {
    pub id: String,
    pub name: String,
    pub faction: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSnapshot {
    pub character_id: String,
    pub name: String,
    pub realm: String,
    pub class: u8,
    pub spec: u16,
    pub race: u8,
    pub faction: u8,
    pub value: f64,
    pub ilvl: f64,
    pub date: DateTime<Utc>,
    pub log_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild: Option<String>,
}

impl CharacterSnapshot {
    pub fn category(&self) -> CategoryKey {
        CategoryKey {
            realm: self.realm.clone(),
            faction: self.faction,
            class: self.class,
            spec: self.spec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub log_id: u64,
    pub realm: String,
    pub faction: u8,
    pub fight_time_ms: u64,
    pub date: DateTime<Utc>,
    pub member_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild: Option<GuildRef>,
}

impl LogSnapshot {
    pub fn fastest_key(&self) -> FastestKey {
        FastestKey {
            realm: self.realm.clone(),
            faction: self.faction,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BestBucket {
    pub top: f64,
    pub characters: Vec<CharacterSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BestTable {
    #[serde(with = "entries")]
    pub buckets: BTreeMap<CategoryKey, BestBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_overall: Option<CharacterSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaidBossDocument {
    pub id: String,
    pub ingame_boss_id: u32,
    pub difficulty: u8,
    pub name: String,
    pub raid_id: u32,
    pub raid_name: String,
    pub kill_count: u64,
    #[serde(default)]
    pub last_log_ids: BTreeMap<String, u64>,
    #[serde(default)]
    pub recent_kills: Vec<LogSnapshot>,
    #[serde(default, with = "entries")]
    pub fastest_kills: BTreeMap<FastestKey, Vec<LogSnapshot>>,
    #[serde(default)]
    pub dps: BestTable,
    #[serde(default)]
    pub hps: BestTable,
}

impl RaidBossDocument {
    pub fn new(raid: &RaidDefinition, boss: &BossDefinition, difficulty: u8) -> Self {
        Self {
            id: keys::raid_boss_id(boss.ingame_id, difficulty),
            ingame_boss_id: boss.ingame_id,
            difficulty,
            name: boss.name.clone(),
            raid_id: raid.id,
            raid_name: raid.name.clone(),
            kill_count: 0,
            last_log_ids: BTreeMap::new(),
            recent_kills: Vec::new(),
            fastest_kills: BTreeMap::new(),
            dps: BestTable::default(),
            hps: BestTable::default(),
        }
    }

    pub fn best(&self, metric: CombatMetric) -> &BestTable {
        match metric {
            CombatMetric::Dps => &self.dps,
            CombatMetric::Hps => &self.hps,
        }
    }

    pub fn best_mut(&mut self, metric: CombatMetric) -> &mut BestTable {
        match metric {
            CombatMetric::Dps => &mut self.dps,
            CombatMetric::Hps => &mut self.hps,
        }
    }

    /// Fastest kill across every realm/faction bucket.
    pub fn fastest_kill(&self) -> Option<&LogSnapshot> {
        self.fastest_kills
            .values()
            .filter_map(|kills| kills.first())
            .min_by_key(|kill| kill.fight_time_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterDocument {
    pub id: String,
    pub name: String,
    pub realm: String,
    pub class: u8,
    pub spec: u16,
    pub race: u8,
    pub faction: u8,
    pub ingame_boss_id: u32,
    pub difficulty: u8,
    pub metric: CombatMetric,
    pub value: f64,
    pub ilvl: f64,
    pub date: DateTime<Utc>,
    pub log_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild: Option<String>,
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub class_rank: u32,
    #[serde(default)]
    pub spec_rank: u32,
}

impl CharacterDocument {
    pub fn collection(&self) -> String {
        keys::character_collection(self.ingame_boss_id, self.difficulty, self.metric)
    }

    pub fn boss_id(&self) -> String {
        keys::raid_boss_id(self.ingame_boss_id, self.difficulty)
    }

    pub fn snapshot(&self) -> CharacterSnapshot {
        CharacterSnapshot {
            character_id: self.id.clone(),
            name: self.name.clone(),
            realm: self.realm.clone(),
            class: self.class,
            spec: self.spec,
            race: self.race,
            faction: self.faction,
            value: self.value,
            ilvl: self.ilvl,
            date: self.date,
            log_id: self.log_id,
            guild: self.guild.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildMember {
    pub name: String,
    pub class: u8,
    pub race: u8,
    pub level: u8,
    pub guild_rank: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProgressKey {
    pub raid_id: u32,
    pub difficulty: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BossProgress {
    pub kills: u64,
    #[serde(default)]
    pub first_kill: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_kill: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fastest_kill_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidProgress {
    pub raid_name: String,
    pub bosses: BTreeMap<u32, BossProgress>,
    #[serde(default)]
    pub difficulty_cleared: bool,
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
    /// Newest first.
    #[serde(default)]
    pub recent_kills: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildDocument {
    pub id: String,
    pub name: String,
    pub realm: String,
    pub faction: u8,
    #[serde(default)]
    pub members: Vec<GuildMember>,
    #[serde(default, with = "entries")]
    pub progression: BTreeMap<ProgressKey, RaidProgress>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_log_id: u64,
    pub updated_at: DateTime<Utc>,
}

impl GuildDocument {
    pub fn new(name: &str, realm: &str, faction: u8) -> Self {
        Self {
            id: keys::guild_id(name, realm),
            name: keys::normalize_display(name),
            realm: keys::normalize_display(realm),
            faction,
            members: Vec::new(),
            progression: BTreeMap::new(),
            last_activity: None,
            last_log_id: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceDocument {
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_guilds_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_log_ids: BTreeMap<String, u64>,
    #[serde(default)]
    pub is_initialized: bool,
}

impl MaintenanceDocument {
    /// Moves each realm's watermark forward; lower ids are ignored.
    pub fn advance_watermark(&mut self, ids: &BTreeMap<String, u64>) {
        for (realm, id) in ids {
            let entry = self.last_log_ids.entry(realm.clone()).or_insert(0);
            if *id > *entry {
                *entry = *id;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardCharacterDocument {
    pub character_id: String,
    pub name: String,
    pub realm: String,
    pub class: u8,
    pub spec: u16,
    pub race: u8,
    pub faction: u8,
    pub metric: CombatMetric,
    pub value: f64,
    pub ilvl: f64,
    pub date: DateTime<Utc>,
    pub log_id: u64,
    pub ingame_boss_id: u32,
    pub difficulty: u8,
    pub raid_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total: u64,
    pub classes: BTreeMap<u8, u64>,
    pub specs: BTreeMap<u16, u64>,
}

/// Serializes maps with composite keys as a sequence of `[key, value]`
/// pairs, since JSON objects only allow string keys.
pub(crate) mod entries {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let pairs: Vec<(K, V)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
