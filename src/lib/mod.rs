pub mod aggregate;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod documents;
pub mod error;
pub mod game_api;
pub mod keys;
pub mod merge;
pub mod normalize;
pub mod observability;
pub mod rank;
pub mod server;
pub mod service;
pub mod store;
pub mod summary;

pub use config::Config;
pub use coordinator::{CycleReport, GuildRefreshReport, UpdateCoordinator, UpdateStatus};
pub use error::{Result, StatsError};
pub use service::StatsContext;
