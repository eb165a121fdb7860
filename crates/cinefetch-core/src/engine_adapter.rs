//! Engine Adapter
//!
//! This module adapts the gosh-dl download engine to the swarm engine through
//! the [`SwarmDriver`] seam.

use crate::error::Result;
use crate::types::{GlobalStats, Settings, SwarmFile};
use crate::utils::clamp_u32;
use async_trait::async_trait;
use gosh_dl::{
    DownloadEngine, DownloadEvent, DownloadId, DownloadOptions, DownloadState as EngineState,
    DownloadStatus, EngineConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Driver-side lifecycle state
#[derive(Debug, Clone, PartialEq)]
pub enum DriverState {
    Queued,
    Connecting,
    Downloading,
    Seeding,
    Paused,
    Completed,
    Error(String),
}

/// Point-in-time status of one driver transfer
#[derive(Debug, Clone, PartialEq)]
pub struct DriverStatus {
    pub id: String,
    pub name: String,
    pub info_hash: Option<String>,
    pub state: DriverState,
    pub total_size: Option<u64>,
    pub completed_size: u64,
    pub download_speed: u64,
    pub connections: u32,
    pub peers: u32,
    /// Empty until the torrent metadata has been fetched
    pub files: Vec<SwarmFile>,
}

/// Driver notifications, keyed by driver id
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Added { id: String },
    Progress { id: String },
    Completed { id: String },
    Failed { id: String, error: String },
    Paused { id: String },
    Resumed { id: String },
    Removed { id: String },
}

/// The embedded peer-to-peer client as seen by the swarm engine
#[async_trait]
pub trait SwarmDriver: Send + Sync {
    /// Start a magnet transfer into `save_dir`; returns the driver id
    async fn add_magnet(&self, magnet_uri: &str, save_dir: &Path) -> Result<String>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn resume(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str, delete_files: bool) -> Result<()>;

    fn status(&self, id: &str) -> Option<DriverStatus>;

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;

    fn global_stats(&self) -> GlobalStats;
}

/// Adapter to convert between gosh-dl types and application types
#[derive(Clone)]
pub struct EngineAdapter {
    engine: Arc<DownloadEngine>,
}

impl EngineAdapter {
    /// Create a new adapter with the given engine
    pub fn new(engine: Arc<DownloadEngine>) -> Self {
        Self { engine }
    }

    /// Start a gosh-dl engine configured from settings
    pub async fn start(settings: &Settings) -> Result<Self> {
        let engine = DownloadEngine::new(settings_to_engine_config(settings)).await?;
        Ok(Self::new(engine))
    }

    /// Get a reference to the engine
    pub fn engine(&self) -> &Arc<DownloadEngine> {
        &self.engine
    }
}

#[async_trait]
impl SwarmDriver for EngineAdapter {
    async fn add_magnet(&self, magnet_uri: &str, save_dir: &Path) -> Result<String> {
        let options = DownloadOptions {
            save_dir: Some(save_dir.to_path_buf()),
            ..Default::default()
        };
        let id = self.engine.add_magnet(magnet_uri, options).await?;
        Ok(id.as_uuid().to_string())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.engine.pause(parse_gid(id)?).await?;
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.engine.resume(parse_gid(id)?).await?;
        Ok(())
    }

    async fn remove(&self, id: &str, delete_files: bool) -> Result<()> {
        self.engine.cancel(parse_gid(id)?, delete_files).await?;
        Ok(())
    }

    fn status(&self, id: &str) -> Option<DriverStatus> {
        let id = parse_gid(id).ok()?;
        self.engine.status(id).map(convert_status)
    }

    /// Re-broadcast engine events as driver events
    ///
    /// Each subscriber gets its own forwarding task, which ends once the
    /// receiver is dropped or the engine's channel closes.
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        let (tx, rx) = broadcast::channel(EVENT_CAPACITY);
        let mut engine_rx = self.engine.subscribe();

        tokio::spawn(async move {
            loop {
                match engine_rx.recv().await {
                    Ok(event) => {
                        if let Some(event) = convert_event(event) {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Swarm driver lagged, {} engine events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        rx
    }

    fn global_stats(&self) -> GlobalStats {
        let stats = self.engine.global_stats();
        GlobalStats {
            download_speed: stats.download_speed,
            upload_speed: stats.upload_speed,
            num_active: clamp_u32(stats.num_active),
            num_waiting: clamp_u32(stats.num_waiting),
            num_stopped: clamp_u32(stats.num_stopped),
        }
    }
}

/// Parse a GID string to a DownloadId
fn parse_gid(gid: &str) -> std::result::Result<DownloadId, gosh_dl::EngineError> {
    if let Ok(uuid) = uuid::Uuid::parse_str(gid) {
        return Ok(DownloadId::from_uuid(uuid));
    }
    DownloadId::from_gid(gid).ok_or_else(|| gosh_dl::EngineError::NotFound(format!("Invalid GID: {}", gid)))
}

fn convert_event(event: DownloadEvent) -> Option<DriverEvent> {
    let key = |id: DownloadId| id.as_uuid().to_string();
    let event = match event {
        DownloadEvent::Added { id } => DriverEvent::Added { id: key(id) },
        DownloadEvent::Started { id } | DownloadEvent::Progress { id, .. } => {
            DriverEvent::Progress { id: key(id) }
        }
        DownloadEvent::Completed { id } => DriverEvent::Completed { id: key(id) },
        DownloadEvent::Failed { id, error, .. } => DriverEvent::Failed { id: key(id), error },
        DownloadEvent::Paused { id } => DriverEvent::Paused { id: key(id) },
        DownloadEvent::Resumed { id } => DriverEvent::Resumed { id: key(id) },
        DownloadEvent::Removed { id } => DriverEvent::Removed { id: key(id) },
        _ => return None,
    };
    Some(event)
}

/// Convert gosh-dl status to a driver status
fn convert_status(status: DownloadStatus) -> DriverStatus {
    let state = match &status.state {
        EngineState::Queued => DriverState::Queued,
        EngineState::Connecting => DriverState::Connecting,
        EngineState::Downloading => DriverState::Downloading,
        EngineState::Seeding => DriverState::Seeding,
        EngineState::Paused => DriverState::Paused,
        EngineState::Completed => DriverState::Completed,
        EngineState::Error { message, .. } => DriverState::Error(message.clone()),
    };

    let files = status
        .torrent_info
        .as_ref()
        .map(|info| {
            info.files
                .iter()
                .map(|f| SwarmFile {
                    index: f.index as usize,
                    path: f.path.clone(),
                    length: f.size,
                    completed: f.completed,
                })
                .collect()
        })
        .unwrap_or_default();

    DriverStatus {
        id: status.id.as_uuid().to_string(),
        name: status.metadata.name.clone(),
        info_hash: status.metadata.info_hash.clone(),
        state,
        total_size: status.progress.total_size,
        completed_size: status.progress.completed_size,
        download_speed: status.progress.download_speed,
        connections: clamp_u32(status.progress.connections),
        peers: clamp_u32(status.progress.seeders),
        files,
    }
}

/// Convert settings to engine configuration
pub fn settings_to_engine_config(settings: &Settings) -> EngineConfig {
    let download_dir = PathBuf::from(&settings.download_path);

    if !download_dir.exists() {
        if let Err(e) = std::fs::create_dir_all(&download_dir) {
            log::warn!("Failed to create download directory {:?}: {}", download_dir, e);
        }
    }

    // Session persistence lives next to the application database
    let database_path = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("io.github.cinefetch")
        .join("engine.db");

    if let Some(parent) = database_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    EngineConfig {
        download_dir,
        max_concurrent_downloads: settings.max_concurrent_downloads as usize,
        enable_dht: settings.bt_enable_dht,
        enable_pex: settings.bt_enable_pex,
        enable_lpd: settings.bt_enable_lpd,
        max_peers: settings.bt_max_peers as usize,
        seed_ratio: settings.bt_seed_ratio,
        database_path: Some(database_path),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gid_accepts_uuid() {
        let uuid = uuid::Uuid::new_v4();
        let id = parse_gid(&uuid.to_string()).unwrap();
        assert_eq!(id.as_uuid().to_string(), uuid.to_string());
    }

    #[test]
    fn test_parse_gid_rejects_garbage() {
        assert!(parse_gid("not a gid at all").is_err());
    }

    #[test]
    fn test_engine_config_follows_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            download_path: dir.path().join("media").to_string_lossy().to_string(),
            bt_max_peers: 80,
            bt_enable_dht: false,
            max_concurrent_downloads: 3,
            ..Default::default()
        };

        let config = settings_to_engine_config(&settings);
        assert_eq!(config.download_dir, dir.path().join("media"));
        assert!(config.download_dir.exists());
        assert_eq!(config.max_peers, 80);
        assert!(!config.enable_dht);
        assert_eq!(config.max_concurrent_downloads, 3);
    }
}
