use crate::{
    documents::CombatMetric,
    error::{Result, StatsError},
};

/// Separates textual key components. Stripped from inputs during
/// normalization, which keeps composite keys injective.
pub const FIELD_SEPARATOR: char = ',';
const NUMERIC_SEPARATOR: char = '-';

/// Trims, collapses internal whitespace, lowercases and removes the field
/// separator.
pub fn normalize_component(value: &str) -> String {
    let mut normalized = String::with_capacity(value.len());
    for word in value.split_whitespace() {
        if !normalized.is_empty() {
            normalized.push(' ');
        }
        for ch in word.chars() {
            if ch == FIELD_SEPARATOR {
                continue;
            }
            normalized.extend(ch.to_lowercase());
        }
    }
    normalized
}

/// Collapses whitespace without changing case; used for display names.
pub fn normalize_display(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(FIELD_SEPARATOR, "")
}

/// Key for per-realm watermarks.
pub fn realm_key(realm: &str) -> String {
    normalize_component(realm)
}

pub fn raid_boss_id(ingame_boss_id: u32, difficulty: u8) -> String {
    format!("{ingame_boss_id}{NUMERIC_SEPARATOR}{difficulty}")
}

pub fn deconstruct_raid_boss_id(id: &str) -> Result<(u32, u8)> {
    let (boss, difficulty) = id
        .split_once(NUMERIC_SEPARATOR)
        .ok_or_else(|| StatsError::InvalidRequest(format!("malformed raid boss id '{id}'")))?;
    let boss = boss
        .parse::<u32>()
        .map_err(|_| StatsError::InvalidRequest(format!("malformed raid boss id '{id}'")))?;
    let difficulty = difficulty
        .parse::<u8>()
        .map_err(|_| StatsError::InvalidRequest(format!("malformed raid boss id '{id}'")))?;
    Ok((boss, difficulty))
}

pub fn character_id(name: &str, realm: &str, spec: u16) -> String {
    format!(
        "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{spec}",
        normalize_component(name),
        normalize_component(realm)
    )
}

/// Prefix shared by every spec of one character, used for range scans.
pub fn character_prefix(name: &str, realm: &str) -> String {
    format!(
        "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}",
        normalize_component(name),
        normalize_component(realm)
    )
}

pub fn deconstruct_character_id(id: &str) -> Result<(String, String, u16)> {
    let mut parts = id.split(FIELD_SEPARATOR);
    let (Some(name), Some(realm), Some(spec), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(StatsError::InvalidRequest(format!(
            "malformed character id '{id}'"
        )));
    };
    let spec = spec
        .parse::<u16>()
        .map_err(|_| StatsError::InvalidRequest(format!("malformed character id '{id}'")))?;
    Ok((name.to_string(), realm.to_string(), spec))
}

pub fn guild_id(name: &str, realm: &str) -> String {
    format!(
        "{}{FIELD_SEPARATOR}{}",
        normalize_component(name),
        normalize_component(realm)
    )
}

pub fn deconstruct_guild_id(id: &str) -> Result<(String, String)> {
    id.split_once(FIELD_SEPARATOR)
        .filter(|(name, realm)| !name.is_empty() && !realm.is_empty())
        .map(|(name, realm)| (name.to_string(), realm.to_string()))
        .ok_or_else(|| StatsError::InvalidRequest(format!("malformed guild id '{id}'")))
}

/// Name of the physical collection holding one metric's character rows for
/// one boss and difficulty.
pub fn character_collection(ingame_boss_id: u32, difficulty: u8, metric: CombatMetric) -> String {
    format!(
        "{}{NUMERIC_SEPARATOR}{}",
        raid_boss_id(ingame_boss_id, difficulty),
        metric.as_str()
    )
}

pub fn deconstruct_character_collection(name: &str) -> Result<(u32, u8, CombatMetric)> {
    let (boss_id, metric) = name
        .rsplit_once(NUMERIC_SEPARATOR)
        .ok_or_else(|| StatsError::InvalidRequest(format!("malformed collection '{name}'")))?;
    let metric = metric.parse::<CombatMetric>()?;
    let (boss, difficulty) = deconstruct_raid_boss_id(boss_id)?;
    Ok((boss, difficulty, metric))
}

pub fn character_performance_cache_key(name: &str, realm: &str, class: u8, raid_name: &str) -> String {
    format!(
        "{}{class}{FIELD_SEPARATOR}{}",
        character_prefix(name, realm),
        normalize_component(raid_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_merges_case_and_whitespace_variants() {
        assert_eq!(
            character_id("  Thrall ", "Tauri   WoW", 71),
            character_id("thrall", "tauri wow", 71)
        );
        assert_eq!(guild_id("Exorsus", " Evermoon"), "exorsus,evermoon");
    }

    #[test]
    fn separator_is_stripped_so_keys_stay_injective() {
        let id = character_id("a,b", "realm", 1);
        assert_eq!(id, "ab,realm,1");
        let (name, realm, spec) = deconstruct_character_id(&id).unwrap();
        assert_eq!((name.as_str(), realm.as_str(), spec), ("ab", "realm", 1));
    }

    #[test]
    fn realm_keys_ignore_case_and_spacing() {
        assert_eq!(realm_key(" Tauri  WoW "), realm_key("tauri wow"));
        assert_eq!(realm_key("Evermoon"), "evermoon");
    }

    #[test]
    fn collection_names_deconstruct() {
        let name = character_collection(1577, 5, CombatMetric::Hps);
        assert_eq!(name, "1577-5-hps");
        assert_eq!(
            deconstruct_character_collection(&name).unwrap(),
            (1577, 5, CombatMetric::Hps)
        );
        assert!(deconstruct_character_collection("1577-hps").is_err());
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(deconstruct_raid_boss_id("abc").is_err());
        assert!(deconstruct_character_id("only,two").is_err());
        assert!(deconstruct_guild_id("noseparator").is_err());
    }

    #[test]
    fn display_normalization_keeps_case() {
        assert_eq!(normalize_display("  Lei   Shen "), "Lei Shen");
    }
}
