//! Types module - data structures for Cinefetch
//!
//! These types define the data models shared by the ranking engine, the two
//! transfer backends, the task registry and the history store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What a task downloads; drives the destination path template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    Movie,
    TvEpisode,
    TvSeasonPack,
    #[default]
    GenericFile,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Movie => write!(f, "movie"),
            TaskKind::TvEpisode => write!(f, "tvEpisode"),
            TaskKind::TvSeasonPack => write!(f, "tvSeasonPack"),
            TaskKind::GenericFile => write!(f, "genericFile"),
        }
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "movie" => TaskKind::Movie,
            "tvepisode" | "episode" => TaskKind::TvEpisode,
            "tvseasonpack" | "season" | "pack" => TaskKind::TvSeasonPack,
            _ => TaskKind::GenericFile,
        }
    }
}

/// Which transfer backend owns a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Swarm,
    Daemon,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Swarm => write!(f, "swarm"),
            Backend::Daemon => write!(f, "daemon"),
        }
    }
}

/// Task status, independent of the backend vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states leave the registry's active set but stay in history.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the task state machine.
    ///
    /// `queued -> completed` is accepted so that a transfer finishing between
    /// two daemon polls can still be reconciled.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        if self.is_terminal() || self == next {
            return false;
        }
        match (self, next) {
            (_, Error) | (_, Cancelled) => true,
            (Queued, Downloading) | (Queued, Paused) | (Queued, Completed) => true,
            (Downloading, Paused) | (Downloading, Completed) => true,
            (Paused, Downloading) => true,
            _ => false,
        }
    }

    /// Map the daemon's status vocabulary onto task states
    pub fn from_daemon(status: &str) -> Self {
        match status {
            "active" => TaskStatus::Downloading,
            "waiting" => TaskStatus::Queued,
            "paused" => TaskStatus::Paused,
            "error" => TaskStatus::Error,
            "complete" => TaskStatus::Completed,
            "removed" => TaskStatus::Cancelled,
            other => {
                log::debug!("Unknown daemon status {:?}, treating as queued", other);
                TaskStatus::Queued
            }
        }
    }
}

impl From<&str> for TaskStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "downloading" => TaskStatus::Downloading,
            "paused" => TaskStatus::Paused,
            "completed" => TaskStatus::Completed,
            "error" => TaskStatus::Error,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Queued,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Downloading => write!(f, "downloading"),
            TaskStatus::Paused => write!(f, "paused"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a user-requested pause/resume/cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionOutcome {
    Applied(TaskStatus),
    InvalidTransition {
        from: TaskStatus,
        requested: TaskStatus,
    },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// One transfer, whichever backend runs it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    /// Daemon handle or swarm info-hash
    pub id: String,
    pub title: String,
    pub kind: TaskKind,
    pub source_descriptor: String,
    pub backend: Backend,
    pub status: TaskStatus,
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: Option<u64>,
    pub eta_seconds: Option<u64>,
    pub destination_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Last poll for this id failed or timed out
    #[serde(default)]
    pub stale: bool,
}

/// Request from the catalog layer to start a transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTaskRequest {
    pub source_uri: String,
    pub display_name: String,
    pub kind: TaskKind,
    pub backend: Backend,
    pub season: Option<u32>,
    /// Output filename hint (daemon only)
    pub filename: Option<String>,
}

/// Point-in-time view of a transfer as reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub id: String,
    pub status: TaskStatus,
    pub completed_bytes: u64,
    pub total_bytes: Option<u64>,
    pub download_speed: Option<u64>,
    pub connections: Option<u32>,
    pub error_message: Option<String>,
    pub display_name: Option<String>,
}

/// External catalog identifiers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalIds {
    pub imdb: Option<String>,
    pub tmdb: Option<u64>,
}

/// Ranking request from the catalog layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingRequest {
    pub title: String,
    pub external_ids: Option<ExternalIds>,
    pub kind: TaskKind,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub quality_hint: Option<String>,
}

/// A parsed search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCandidate {
    pub file_name: String,
    #[serde(rename = "sourceURI")]
    pub source_uri: String,
    pub size_label: String,
    pub seeders: u32,
    pub leechers: u32,
    pub inferred_quality: String,
    pub inferred_season: Option<u32>,
    pub is_likely_pack: bool,
    pub origin_site: String,
    #[serde(rename = "detailsURL")]
    pub details_url: Option<String>,
}

/// Durable outcome of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub source_identifier: String,
    pub display_name: String,
    pub added_at: String,
    pub completed_at: Option<String>,
    pub final_status: TaskStatus,
    pub size_bytes: Option<u64>,
}

/// File inside a swarm session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmFile {
    pub index: usize,
    pub path: PathBuf,
    pub length: u64,
    pub completed: u64,
}

/// Engine-side state of one peer-to-peer transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmSession {
    pub info_hash: String,
    pub source_uri: String,
    pub peer_count: u32,
    pub files: Vec<SwarmFile>,
    pub display_name: String,
    pub added_at: DateTime<Utc>,
}

/// Handle to a file the playback layer can stream from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHandle {
    pub info_hash: String,
    pub index: usize,
    pub path: PathBuf,
    pub length: u64,
}

/// Options passed to the daemon's `addUri`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DownloadOptions {
    /// Directory to save the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Output filename
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
    /// Number of connections per server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connection_per_server: Option<String>,
    /// Seed ratio for torrents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_ratio: Option<String>,
}

/// Global download statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub download_speed: u64,
    pub upload_speed: u64,
    pub num_active: u32,
    pub num_waiting: u32,
    pub num_stopped: u32,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub download_path: String,
    pub daemon_rpc_url: String,
    pub daemon_secret: Option<String>,
    pub daemon_namespace: String,
    pub search_provider_url: String,
    pub poll_interval_secs: u64,
    pub rpc_timeout_ms: u64,
    pub broad_result_limit: usize,
    pub season_result_limit: usize,
    pub max_concurrent_downloads: u32,
    pub bt_enable_dht: bool,
    pub bt_enable_pex: bool,
    pub bt_enable_lpd: bool,
    pub bt_max_peers: u32,
    pub bt_seed_ratio: f64,
    pub delete_files_on_remove: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let download_path = dirs::download_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join("Downloads"))
            .join("Cinefetch")
            .to_string_lossy()
            .to_string();

        Self {
            download_path,
            daemon_rpc_url: "http://127.0.0.1:6800/jsonrpc".to_string(),
            daemon_secret: None,
            daemon_namespace: "aria2".to_string(),
            search_provider_url: "https://torrent-search.example.org/search".to_string(),
            poll_interval_secs: 5,
            rpc_timeout_ms: 3000,
            broad_result_limit: 10,
            season_result_limit: 5,
            max_concurrent_downloads: 5,
            bt_enable_dht: true,
            bt_enable_pex: true,
            bt_enable_lpd: true,
            bt_max_peers: 55,
            bt_seed_ratio: 1.0,
            delete_files_on_remove: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_vocabulary() {
        assert_eq!(TaskStatus::from_daemon("active"), TaskStatus::Downloading);
        assert_eq!(TaskStatus::from_daemon("waiting"), TaskStatus::Queued);
        assert_eq!(TaskStatus::from_daemon("paused"), TaskStatus::Paused);
        assert_eq!(TaskStatus::from_daemon("error"), TaskStatus::Error);
        assert_eq!(TaskStatus::from_daemon("complete"), TaskStatus::Completed);
        assert_eq!(TaskStatus::from_daemon("removed"), TaskStatus::Cancelled);
    }

    #[test]
    fn test_state_machine_edges() {
        use TaskStatus::*;

        assert!(Queued.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Error));

        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Downloading));
        assert!(!Error.can_transition_to(Downloading));
        assert!(!Downloading.can_transition_to(Downloading));

        // nothing goes back to queued
        assert!(!Downloading.can_transition_to(Queued));
        assert!(!Paused.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Paused));
        assert!(Queued.can_transition_to(Completed));
    }

    #[test]
    fn test_status_round_trips_through_display() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Downloading,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Error,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from(status.to_string().as_str()), status);
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(TaskKind::from("movie"), TaskKind::Movie);
        assert_eq!(TaskKind::from("tvEpisode"), TaskKind::TvEpisode);
        assert_eq!(TaskKind::from("tvSeasonPack"), TaskKind::TvSeasonPack);
        assert_eq!(TaskKind::from("whatever"), TaskKind::GenericFile);
    }

    #[test]
    fn test_candidate_serializes_uri_fields() {
        let candidate = SourceCandidate {
            file_name: "Show.S01.1080p".into(),
            source_uri: "magnet:?xt=urn:btih:abc".into(),
            size_label: "1.5 GB".into(),
            seeders: 10,
            leechers: 2,
            inferred_quality: "1080p".into(),
            inferred_season: Some(1),
            is_likely_pack: false,
            origin_site: "example.org".into(),
            details_url: None,
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sourceURI"], "magnet:?xt=urn:btih:abc");
        assert_eq!(json["isLikelyPack"], false);
    }
}
