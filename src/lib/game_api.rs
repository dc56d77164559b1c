use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, header::ACCEPT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::GameApiConfig,
    documents::{GuildMember, ProgressKey, RaidProgress, entries},
    error::{Result, StatsError},
    keys,
    observability::record_game_api_request,
};

const USER_AGENT: &str = concat!("raidboard/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMember {
    pub name: String,
    pub class: u8,
    pub spec: u16,
    pub race: u8,
    #[serde(default)]
    pub ilvl: f64,
    #[serde(default)]
    pub damage_done: u64,
    #[serde(default)]
    pub healing_done: u64,
    #[serde(default)]
    pub absorb_done: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGuild {
    pub name: String,
    pub faction: u8,
}

/// One encounter kill as reported by the game API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLog {
    pub log_id: u64,
    pub realm: String,
    pub encounter_id: u32,
    pub difficulty: u8,
    #[serde(default)]
    pub encounter_name: String,
    pub fight_time_ms: u64,
    pub killtime: DateTime<Utc>,
    #[serde(default)]
    pub guild: Option<RawGuild>,
    #[serde(default)]
    pub members: Vec<RawMember>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaidLogBatch {
    pub logs: Vec<RawLog>,
    pub last_log_ids: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildSnapshot {
    pub name: String,
    pub realm: String,
    pub faction: u8,
    #[serde(default)]
    pub members: Vec<GuildMember>,
    #[serde(default, with = "entries")]
    pub progression: BTreeMap<ProgressKey, RaidProgress>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuildFetch {
    Found(GuildSnapshot),
    NotFound,
}

#[async_trait]
pub trait GameApi: Send + Sync {
    /// Logs strictly newer than each realm's watermark, plus the watermark the
    /// source reports after them.
    async fn fetch_raid_logs(&self, last_log_ids: &BTreeMap<String, u64>) -> Result<RaidLogBatch>;

    async fn fetch_guild_data(&self, name: &str, realm: &str) -> Result<GuildFetch>;
}

#[derive(Debug, Deserialize)]
struct RaidLogPage {
    #[serde(default)]
    logs: Vec<RawLog>,
    last_log_id: u64,
}

pub struct HttpGameApi {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    realms: Vec<String>,
}

impl HttpGameApi {
    pub fn new(config: &GameApiConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| StatsError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            realms: config.realms.clone(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(format!("{}/{path}", self.base_url))
            .header(ACCEPT, "application/json");
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl GameApi for HttpGameApi {
    async fn fetch_raid_logs(&self, last_log_ids: &BTreeMap<String, u64>) -> Result<RaidLogBatch> {
        let mut batch = RaidLogBatch::default();
        for realm in &self.realms {
            let key = keys::realm_key(realm);
            let from = last_log_ids.get(&key).copied().unwrap_or(0);
            let result: Result<RaidLogPage> = async {
                self.get("raid-logs")
                    .query(&[("realm", realm.clone()), ("from", from.to_string())])
                    .send()
                    .await
                    .map_err(|err| StatsError::ExternalFetch(format!("raid logs for {realm}: {err}")))?
                    .error_for_status()
                    .map_err(|err| StatsError::ExternalFetch(format!("raid logs for {realm}: {err}")))?
                    .json()
                    .await
                    .map_err(|err| {
                        StatsError::ExternalFetch(format!(
                            "failed to parse raid logs for {realm}: {err}"
                        ))
                    })
            }
            .await;
            record_game_api_request("raid_logs", if result.is_ok() { "ok" } else { "err" });
            let page = result?;

            debug!(realm = %realm, from, count = page.logs.len(), "fetched raid logs");
            batch.last_log_ids.insert(key, page.last_log_id.max(from));
            batch
                .logs
                .extend(page.logs.into_iter().filter(|log| log.log_id > from));
        }
        Ok(batch)
    }

    async fn fetch_guild_data(&self, name: &str, realm: &str) -> Result<GuildFetch> {
        let result = self.request_guild(name, realm).await;
        let status = match &result {
            Ok(GuildFetch::Found(_)) => "ok",
            Ok(GuildFetch::NotFound) => "not_found",
            Err(_) => "err",
        };
        record_game_api_request("guilds", status);
        result
    }
}

impl HttpGameApi {
    async fn request_guild(&self, name: &str, realm: &str) -> Result<GuildFetch> {
        let response = self
            .get("guilds")
            .query(&[("name", name), ("realm", realm)])
            .send()
            .await
            .map_err(|err| StatsError::ExternalFetch(format!("guild {name} ({realm}): {err}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(GuildFetch::NotFound);
        }
        let snapshot: GuildSnapshot = response
            .error_for_status()
            .map_err(|err| StatsError::ExternalFetch(format!("guild {name} ({realm}): {err}")))?
            .json()
            .await
            .map_err(|err| {
                StatsError::ExternalFetch(format!("failed to parse guild {name} ({realm}): {err}"))
            })?;
        Ok(GuildFetch::Found(snapshot))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_log_defaults_optional_fields() {
        let log: RawLog = serde_json::from_value(serde_json::json!({
            "log_id": 7,
            "realm": "Tauri",
            "encounter_id": 1577,
            "difficulty": 5,
            "fight_time_ms": 300000,
            "killtime": "2025-03-01T20:00:00Z",
            "members": [{ "name": "Thrall", "class": 7, "spec": 262, "race": 2, "damage_done": 100 }]
        }))
        .unwrap();
        assert!(log.guild.is_none());
        assert_eq!(log.members[0].healing_done, 0);
        assert_eq!(log.encounter_name, "");
    }

    #[test]
    fn http_client_trims_trailing_slash() {
        let api = HttpGameApi::new(&GameApiConfig {
            base_url: "http://localhost:9/api/".into(),
            ..GameApiConfig::default()
        })
        .unwrap();
        assert_eq!(api.base_url, "http://localhost:9/api");
    }
}
