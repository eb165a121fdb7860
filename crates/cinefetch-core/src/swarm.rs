//! Swarm transfer engine
//!
//! Owns the peer-to-peer sessions, keyed by info-hash. Driver notifications
//! are turned into [`SwarmEvent`]s on one broadcast channel and recorded in
//! the history store.

use crate::backend::{StartRequest, TransferBackend};
use crate::db::{Database, HistoryDb};
use crate::engine_adapter::{DriverEvent, DriverState, DriverStatus, SwarmDriver};
use crate::error::{Error, Result};
use crate::types::{Backend, FileHandle, GlobalStats, SwarmSession, TaskStatus, TransferSnapshot};
use crate::utils::{calculate_progress, parse_magnet};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

/// Swarm-side status before mapping onto task states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmStatus {
    Connecting,
    Downloading,
    Seeding,
    Paused,
    Done,
}

impl SwarmStatus {
    pub fn to_task_status(self) -> TaskStatus {
        match self {
            SwarmStatus::Connecting => TaskStatus::Queued,
            SwarmStatus::Downloading => TaskStatus::Downloading,
            SwarmStatus::Paused => TaskStatus::Paused,
            SwarmStatus::Seeding | SwarmStatus::Done => TaskStatus::Completed,
        }
    }
}

/// Status inference, highest precedence first:
/// done, paused, downloading (partial with recent activity), seeding (full,
/// not done), connecting.
pub fn infer_status(done: bool, paused: bool, progress: f64, recently_active: bool) -> SwarmStatus {
    if done {
        SwarmStatus::Done
    } else if paused {
        SwarmStatus::Paused
    } else if progress > 0.0 && progress < 1.0 && recently_active {
        SwarmStatus::Downloading
    } else if progress >= 1.0 {
        SwarmStatus::Seeding
    } else {
        SwarmStatus::Connecting
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwarmEvent {
    Added {
        info_hash: String,
        correlation_id: String,
        display_name: String,
    },
    Progress(TransferSnapshot),
    Done {
        info_hash: String,
    },
    Error {
        info_hash: String,
        message: String,
    },
    Removed {
        info_hash: String,
    },
}

struct SessionEntry {
    session: SwarmSession,
    driver_id: String,
    correlation_id: String,
    done: bool,
    paused: bool,
    last_error: Option<String>,
    /// Terminal outcome already announced and recorded
    reported: bool,
}

#[derive(Default)]
struct Sessions {
    entries: HashMap<String, SessionEntry>,
    by_driver_id: HashMap<String, String>,
}

/// Embedded peer-to-peer transfer engine
pub struct SwarmEngine {
    driver: Arc<dyn SwarmDriver>,
    db: Database,
    sessions: Mutex<Sessions>,
    events: broadcast::Sender<SwarmEvent>,
    delete_files_on_remove: bool,
}

impl SwarmEngine {
    pub fn new(driver: Arc<dyn SwarmDriver>, db: Database, delete_files_on_remove: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            driver,
            db,
            sessions: Mutex::new(Sessions::default()),
            events,
            delete_files_on_remove,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }

    /// Pump driver events until the driver channel closes
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut rx = self.driver.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => engine.handle_driver_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Swarm engine lagged, {} driver events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        log::info!("Swarm driver event stream closed");
                        break;
                    }
                }
            }
        })
    }

    /// Add a magnet transfer, or return the session that already exists for
    /// its info-hash
    pub async fn add_swarm_task(
        &self,
        source_uri: &str,
        display_name: &str,
        correlation_id: &str,
        save_dir: &Path,
    ) -> Result<SwarmSession> {
        let magnet = parse_magnet(source_uri)
            .ok_or_else(|| Error::Validation(format!("not a magnet link: {}", source_uri)))?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.entries.get(&magnet.info_hash) {
            log::debug!("Swarm session {} already exists", magnet.info_hash);
            return Ok(existing.session.clone());
        }

        let driver_id = self.driver.add_magnet(source_uri, save_dir).await?;
        let status = self.driver.status(&driver_id);

        let session = SwarmSession {
            info_hash: magnet.info_hash.clone(),
            source_uri: source_uri.trim().to_string(),
            peer_count: status.as_ref().map(|s| s.peers).unwrap_or(0),
            files: status.map(|s| s.files).unwrap_or_default(),
            display_name: display_name.to_string(),
            added_at: Utc::now(),
        };

        sessions.by_driver_id.insert(driver_id.clone(), magnet.info_hash.clone());
        sessions.entries.insert(
            magnet.info_hash.clone(),
            SessionEntry {
                session: session.clone(),
                driver_id,
                correlation_id: correlation_id.to_string(),
                done: false,
                paused: false,
                last_error: None,
                reported: false,
            },
        );
        drop(sessions);

        log::info!("Added swarm session {} ({})", magnet.info_hash, display_name);
        HistoryDb::record_active(&self.db, &magnet.info_hash, display_name, None)?;
        let _ = self.events.send(SwarmEvent::Added {
            info_hash: magnet.info_hash,
            correlation_id: correlation_id.to_string(),
            display_name: display_name.to_string(),
        });

        Ok(session)
    }

    pub async fn pause(&self, info_hash: &str) -> Result<()> {
        let driver_id = self.driver_id(info_hash).await?;
        self.driver.pause(&driver_id).await?;
        if let Some(entry) = self.sessions.lock().await.entries.get_mut(info_hash) {
            entry.paused = true;
        }
        Ok(())
    }

    pub async fn resume(&self, info_hash: &str) -> Result<()> {
        let driver_id = self.driver_id(info_hash).await?;
        self.driver.resume(&driver_id).await?;
        if let Some(entry) = self.sessions.lock().await.entries.get_mut(info_hash) {
            entry.paused = false;
            entry.last_error = None;
            entry.reported = false;
        }
        Ok(())
    }

    /// Stop and forget a session
    ///
    /// History is finalized as cancelled unless the transfer had already
    /// completed or failed.
    pub async fn remove(&self, info_hash: &str) -> Result<()> {
        let driver_id = self.driver_id(info_hash).await?;
        match self.driver.remove(&driver_id, self.delete_files_on_remove).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let entry = {
            let mut sessions = self.sessions.lock().await;
            sessions.by_driver_id.remove(&driver_id);
            sessions.entries.remove(info_hash)
        };

        if let Some(entry) = entry {
            if !entry.done && entry.last_error.is_none() {
                HistoryDb::finalize(&self.db, info_hash, TaskStatus::Cancelled, None)?;
            }
            log::info!("Removed swarm session {} ({})", info_hash, entry.session.display_name);
        }
        let _ = self.events.send(SwarmEvent::Removed {
            info_hash: info_hash.to_string(),
        });
        Ok(())
    }

    /// Largest file of a session, once its file list is known
    pub async fn largest_file_handle(&self, info_hash: &str) -> Result<Option<FileHandle>> {
        let driver_id = self.driver_id(info_hash).await?;
        let fresh = self.driver.status(&driver_id);

        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .entries
            .get_mut(info_hash)
            .ok_or_else(|| Error::NotFound(format!("swarm session {}", info_hash)))?;
        if let Some(status) = fresh.filter(|s| !s.files.is_empty()) {
            entry.session.files = status.files;
        }

        Ok(entry
            .session
            .files
            .iter()
            .max_by_key(|f| f.length)
            .map(|f| FileHandle {
                info_hash: info_hash.to_string(),
                index: f.index,
                path: f.path.clone(),
                length: f.length,
            }))
    }

    pub async fn snapshot(&self, info_hash: &str) -> Result<TransferSnapshot> {
        let driver_id = self.driver_id(info_hash).await?;
        let status = self.driver.status(&driver_id);

        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .entries
            .get_mut(info_hash)
            .ok_or_else(|| Error::NotFound(format!("swarm session {}", info_hash)))?;
        Ok(build_snapshot(info_hash, entry, status.as_ref()))
    }

    pub async fn sessions(&self) -> Vec<SwarmSession> {
        self.sessions
            .lock()
            .await
            .entries
            .values()
            .map(|e| e.session.clone())
            .collect()
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.driver.global_stats()
    }

    async fn driver_id(&self, info_hash: &str) -> Result<String> {
        self.sessions
            .lock()
            .await
            .entries
            .get(info_hash)
            .map(|e| e.driver_id.clone())
            .ok_or_else(|| Error::NotFound(format!("swarm session {}", info_hash)))
    }

    /// Apply one driver notification
    pub async fn handle_driver_event(&self, event: DriverEvent) {
        let driver_id = match &event {
            DriverEvent::Added { id }
            | DriverEvent::Progress { id }
            | DriverEvent::Completed { id }
            | DriverEvent::Failed { id, .. }
            | DriverEvent::Paused { id }
            | DriverEvent::Resumed { id }
            | DriverEvent::Removed { id } => id.clone(),
        };
        let status = self.driver.status(&driver_id);

        let mut sessions = self.sessions.lock().await;
        let Some(info_hash) = sessions.by_driver_id.get(&driver_id).cloned() else {
            log::debug!("Ignoring event for unknown swarm transfer {}", driver_id);
            return;
        };
        let Some(entry) = sessions.entries.get_mut(&info_hash) else {
            return;
        };

        match event {
            DriverEvent::Completed { .. } => entry.done = true,
            DriverEvent::Failed { error, .. } => entry.last_error = Some(error),
            DriverEvent::Paused { .. } => entry.paused = true,
            DriverEvent::Resumed { .. } => entry.paused = false,
            DriverEvent::Added { .. } | DriverEvent::Progress { .. } | DriverEvent::Removed { .. } => {}
        }

        let snapshot = build_snapshot(&info_hash, entry, status.as_ref());
        let display_name = entry.session.display_name.clone();
        let correlation_id = entry.correlation_id.clone();
        let first_report = snapshot.status.is_terminal() && !entry.reported;
        if first_report {
            entry.reported = true;
        }
        drop(sessions);

        let outcome = match snapshot.status {
            _ if !first_report => Ok(false),
            TaskStatus::Completed => {
                log::info!("Swarm transfer completed: {} [{}]", display_name, correlation_id);
                let _ = self.events.send(SwarmEvent::Done {
                    info_hash: info_hash.clone(),
                });
                HistoryDb::finalize(&self.db, &info_hash, TaskStatus::Completed, snapshot.total_bytes)
            }
            TaskStatus::Error => {
                let message = snapshot.error_message.clone().unwrap_or_default();
                log::error!("Swarm transfer failed: {} [{}] - {}", display_name, correlation_id, message);
                let _ = self.events.send(SwarmEvent::Error {
                    info_hash: info_hash.clone(),
                    message,
                });
                HistoryDb::finalize(&self.db, &info_hash, TaskStatus::Error, snapshot.total_bytes)
            }
            _ => Ok(true),
        };
        if let Err(e) = outcome {
            log::warn!("Failed to record history for {}: {}", info_hash, e);
        }

        let _ = self.events.send(SwarmEvent::Progress(snapshot));
    }
}

fn build_snapshot(info_hash: &str, entry: &mut SessionEntry, status: Option<&DriverStatus>) -> TransferSnapshot {
    if let Some(status) = status {
        entry.session.peer_count = status.peers;
        if !status.files.is_empty() {
            entry.session.files = status.files.clone();
        }
        match &status.state {
            DriverState::Completed => entry.done = true,
            DriverState::Paused => entry.paused = true,
            DriverState::Downloading | DriverState::Connecting => entry.paused = false,
            DriverState::Error(message) if entry.last_error.is_none() => {
                entry.last_error = Some(message.clone());
            }
            _ => {}
        }
    }

    let completed = status.map(|s| s.completed_size).unwrap_or(0);
    let total = status.and_then(|s| s.total_size).filter(|t| *t > 0);
    let speed = status.map(|s| s.download_speed).unwrap_or(0);
    let recently_active = speed > 0 || status.is_some_and(|s| s.state == DriverState::Downloading);

    let inferred = infer_status(
        entry.done,
        entry.paused,
        calculate_progress(completed, total.unwrap_or(0)),
        recently_active,
    );
    let (status_out, error_message) = match &entry.last_error {
        Some(message) if !entry.done => (TaskStatus::Error, Some(message.clone())),
        _ => (inferred.to_task_status(), None),
    };

    TransferSnapshot {
        id: info_hash.to_string(),
        status: status_out,
        completed_bytes: completed,
        total_bytes: total,
        download_speed: Some(speed),
        connections: status.map(|s| s.connections),
        error_message,
        display_name: Some(entry.session.display_name.clone()),
    }
}

#[async_trait]
impl TransferBackend for SwarmEngine {
    fn kind(&self) -> Backend {
        Backend::Swarm
    }

    async fn start(&self, request: &StartRequest) -> Result<TransferSnapshot> {
        let session = self
            .add_swarm_task(
                &request.source_uri,
                &request.display_name,
                &request.correlation_id,
                &request.destination,
            )
            .await?;
        self.snapshot(&session.info_hash).await
    }

    async fn pause(&self, id: &str) -> Result<()> {
        SwarmEngine::pause(self, id).await
    }

    async fn resume(&self, id: &str) -> Result<()> {
        SwarmEngine::resume(self, id).await
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        self.remove(id).await
    }

    async fn snapshot(&self, id: &str) -> Result<TransferSnapshot> {
        SwarmEngine::snapshot(self, id).await
    }
}
