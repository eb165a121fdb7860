//! Cinefetch Core Library
//!
//! This crate provides source ranking, the swarm and daemon transfer
//! backends, the task registry, progress synchronization and history
//! persistence for Cinefetch. It is front-end agnostic; the CLI is one
//! consumer.

pub mod backend;
pub mod daemon;
pub mod db;
pub mod engine_adapter;
pub mod error;
pub mod ranking;
pub mod registry;
pub mod service;
pub mod swarm;
pub mod sync;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use backend::{StartRequest, TransferBackend};
pub use daemon::{DaemonClient, StatusSnapshot};
pub use db::{get_db_path, init_database, DaemonTasksDb, Database, HistoryDb, SettingsDb};
pub use engine_adapter::{settings_to_engine_config, EngineAdapter, SwarmDriver};
pub use error::{Error, Result};
pub use ranking::SourceRanker;
pub use registry::{TaskEvent, TaskRegistry};
pub use service::{DownloadService, EngineCommand, UiMessage};
pub use swarm::{SwarmEngine, SwarmEvent};
pub use sync::ProgressSynchronizer;
pub use types::*;
pub use utils::{calculate_progress, format_bytes, format_eta, format_speed};
