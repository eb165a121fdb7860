//! Database module - SQLite persistence layer

mod connection;
mod daemon_tasks;
mod history;
mod settings;

pub use connection::{get_db_path, init_database, Database};
pub use daemon_tasks::{DaemonTasksDb, MirroredTask};
pub use history::HistoryDb;
pub use settings::SettingsDb;
