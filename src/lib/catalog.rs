use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, StatsError},
    keys,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BossDefinition {
    pub ingame_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidDefinition {
    pub id: u32,
    pub name: String,
    pub difficulties: Vec<u8>,
    pub bosses: Vec<BossDefinition>,
}

/// The raids, bosses and difficulties the engine tracks.
#[derive(Debug, Clone, Default)]
pub struct RaidCatalog {
    raids: Vec<RaidDefinition>,
}

impl RaidCatalog {
    pub fn new(raids: Vec<RaidDefinition>) -> Result<Self> {
        let mut seen = std::collections::BTreeSet::new();
        for raid in &raids {
            for boss in &raid.bosses {
                if !seen.insert(boss.ingame_id) {
                    return Err(StatsError::Config(format!(
                        "boss {} is listed in more than one raid",
                        boss.ingame_id
                    )));
                }
            }
        }
        Ok(Self { raids })
    }

    pub fn raids(&self) -> &[RaidDefinition] {
        &self.raids
    }

    pub fn raid(&self, raid_id: u32) -> Option<&RaidDefinition> {
        self.raids.iter().find(|raid| raid.id == raid_id)
    }

    pub fn raid_by_name(&self, name: &str) -> Option<&RaidDefinition> {
        let wanted = keys::normalize_component(name);
        self.raids
            .iter()
            .find(|raid| keys::normalize_component(&raid.name) == wanted)
    }

    pub fn find_boss(&self, ingame_boss_id: u32) -> Option<(&RaidDefinition, &BossDefinition)> {
        self.raids.iter().find_map(|raid| {
            raid.bosses
                .iter()
                .find(|boss| boss.ingame_id == ingame_boss_id)
                .map(|boss| (raid, boss))
        })
    }

    pub fn supports(&self, ingame_boss_id: u32, difficulty: u8) -> bool {
        self.find_boss(ingame_boss_id)
            .map(|(raid, _)| raid.difficulties.contains(&difficulty))
            .unwrap_or(false)
    }

    /// Every `(raid, boss, difficulty)` combination, in catalog order.
    pub fn encounters(&self) -> impl Iterator<Item = (&RaidDefinition, &BossDefinition, u8)> {
        self.raids.iter().flat_map(|raid| {
            raid.difficulties.iter().flat_map(move |difficulty| {
                raid.bosses.iter().map(move |boss| (raid, boss, *difficulty))
            })
        })
    }
}

pub fn default_raids() -> Vec<RaidDefinition> {
    let bosses = [
        (1577, "Jin'rokh the Breaker"),
        (1575, "Horridon"),
        (1570, "Council of Elders"),
        (1565, "Tortos"),
        (1578, "Megaera"),
        (1573, "Ji-Kun"),
        (1572, "Durumu the Forgotten"),
        (1574, "Primordius"),
        (1576, "Dark Animus"),
        (1559, "Iron Qon"),
        (1560, "Twin Consorts"),
        (1579, "Lei Shen"),
        (1580, "Ra-den"),
    ];
    vec![RaidDefinition {
        id: 1098,
        name: "Throne of Thunder".to_string(),
        difficulties: vec![3, 4, 5, 6],
        bosses: bosses
            .into_iter()
            .map(|(ingame_id, name)| BossDefinition {
                ingame_id,
                name: name.to_string(),
            })
            .collect(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_resolves_bosses() {
        let catalog = RaidCatalog::new(default_raids()).unwrap();
        let (raid, boss) = catalog.find_boss(1579).unwrap();
        assert_eq!(raid.name, "Throne of Thunder");
        assert_eq!(boss.name, "Lei Shen");
        assert!(catalog.supports(1579, 6));
        assert!(!catalog.supports(1579, 7));
        assert_eq!(catalog.encounters().count(), 13 * 4);
        assert!(catalog.raid_by_name("throne  of THUNDER").is_some());
    }

    #[test]
    fn rejects_duplicate_bosses() {
        let mut raids = default_raids();
        let mut copy = raids[0].clone();
        copy.id = 1;
        raids.push(copy);
        assert!(RaidCatalog::new(raids).is_err());
    }
}
