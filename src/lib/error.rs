use std::{io, time::Duration};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StatsError>;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage unavailable: {0}")]
    Connection(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("an update is already in progress")]
    AlreadyUpdating,
    #[error("database has not been initialized")]
    NotInitialized,
    #[error("raid boss not found: {0}")]
    RaidBossNotFound(String),
    #[error("raid not found: {0}")]
    RaidNotFound(String),
    #[error("guild not found: {0}")]
    GuildNotFound(String),
    #[error("character not found: {0}")]
    CharacterNotFound(String),
    #[error("transaction failed: {0}")]
    Transaction(String),
    #[error("external fetch failed: {0}")]
    ExternalFetch(String),
    #[error("external fetch timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("malformed log {log_id}: {reason}")]
    MalformedLog { log_id: u64, reason: &'static str },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification used by callers that only care about how an error
/// should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    AlreadyUpdating,
    NotFound,
    Transaction,
    ExternalFetch,
    MalformedLog,
    Invalid,
    Internal,
}

impl StatsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::AlreadyUpdating => ErrorKind::AlreadyUpdating,
            Self::RaidBossNotFound(_)
            | Self::RaidNotFound(_)
            | Self::GuildNotFound(_)
            | Self::CharacterNotFound(_) => ErrorKind::NotFound,
            Self::Transaction(_) => ErrorKind::Transaction,
            Self::ExternalFetch(_) | Self::Timeout(_) => ErrorKind::ExternalFetch,
            Self::MalformedLog { .. } => ErrorKind::MalformedLog,
            Self::InvalidRequest(_) | Self::Config(_) | Self::NotInitialized => {
                ErrorKind::Invalid
            }
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<toml::de::Error> for StatsError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for StatsError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StatsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rocksdb::Error> for StatsError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    message: &'a str,
}

impl IntoResponse for StatsError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Invalid | ErrorKind::MalformedLog => StatusCode::BAD_REQUEST,
            ErrorKind::AlreadyUpdating => StatusCode::CONFLICT,
            ErrorKind::Connection => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ExternalFetch => StatusCode::BAD_GATEWAY,
            ErrorKind::Transaction | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = self.to_string();
        (
            status,
            Json(ErrorBody {
                success: false,
                message: &message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_variant() {
        assert_eq!(StatsError::AlreadyUpdating.kind(), ErrorKind::AlreadyUpdating);
        assert!(StatsError::GuildNotFound("x".into()).is_not_found());
        assert_eq!(
            StatsError::Timeout(Duration::from_secs(5)).kind(),
            ErrorKind::ExternalFetch
        );
        assert_eq!(
            StatsError::Transaction("disk full".into()).kind(),
            ErrorKind::Transaction
        );
        let malformed = StatsError::MalformedLog {
            log_id: 7,
            reason: "fight_length",
        };
        assert_eq!(malformed.kind(), ErrorKind::MalformedLog);
        assert_eq!(malformed.to_string(), "malformed log 7: fight_length");
    }

    #[test]
    fn timeout_message_reports_seconds() {
        let err = StatsError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "external fetch timed out after 30s");
    }
}
