//! Engine: the orchestrator that owns the store connection and sequences
//! the clinical and reminder pipelines, plus the async driver around it.

pub mod driver;
pub mod orchestrator;
pub mod sinks;

pub use driver::{spawn_driver, DriverHandle};
pub use orchestrator::{Collaborators, Engine, StateChange, TickReport};

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::intelligence::IntelligenceError;
use crate::reminders::ReminderError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Intelligence(#[from] IntelligenceError),

    #[error(transparent)]
    Reminder(#[from] ReminderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Engine state lock poisoned")]
    LockFailed,

    #[error("Patient {0} is handled by another shard")]
    ForeignShard(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::from(err))
    }
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => e.is_transient(),
            Self::Intelligence(e) => e.is_retryable(),
            Self::Reminder(e) => e.is_retryable(),
            Self::Config(_) | Self::LockFailed | Self::ForeignShard(_) => false,
        }
    }
}
