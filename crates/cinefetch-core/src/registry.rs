//! Task registry
//!
//! The one owner of [`DownloadTask`] state. Every backend snapshot, user
//! request and swarm event goes through here so that state changes for a
//! given id are serialized and checked against the state machine.

use crate::backend::{StartRequest, TransferBackend};
use crate::db::{DaemonTasksDb, Database, HistoryDb, MirroredTask};
use crate::error::{Error, Result};
use crate::swarm::SwarmEvent;
use crate::types::{AddTaskRequest, Backend, DownloadTask, TaskStatus, TransferSnapshot, TransitionOutcome};
use crate::utils::{calculate_progress, canonical_source, ensure_destination, eta_seconds};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};

const EVENT_CAPACITY: usize = 512;

/// Registry notifications
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Added(DownloadTask),
    Updated(DownloadTask),
    /// The latest poll for this id failed; its data may be out of date
    Stale { id: String, error: String },
    Transition { id: String, outcome: TransitionOutcome },
    /// Dropped from the registry; history is kept
    Removed { id: String },
}

/// Held for the duration of one serialized operation on a key
///
/// On drop the lock entry is discarded once nobody else holds or waits on it.
struct KeyGuard<'a> {
    locks: &'a StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

pub struct TaskRegistry {
    backends: HashMap<Backend, Arc<dyn TransferBackend>>,
    tasks: RwLock<HashMap<String, DownloadTask>>,
    /// Canonical source key to task id
    sources: RwLock<HashMap<String, String>>,
    /// Serializes adds per source key and every mutation per task id
    key_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    db: Database,
    download_root: PathBuf,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskRegistry {
    pub fn new(db: Database, download_root: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backends: HashMap::new(),
            tasks: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            key_locks: StdMutex::new(HashMap::new()),
            db,
            download_root: download_root.into(),
            events,
        }
    }

    /// Register a backend under its own kind
    pub fn with_backend(mut self, backend: Arc<dyn TransferBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn backend(&self, kind: Backend) -> Result<&Arc<dyn TransferBackend>> {
        self.backends
            .get(&kind)
            .ok_or_else(|| Error::Validation(format!("no {:?} backend configured", kind)))
    }

    async fn lock_key(&self, key: String) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        KeyGuard {
            locks: &self.key_locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn lock_source(&self, key: &str) -> KeyGuard<'_> {
        self.lock_key(format!("source:{}", key)).await
    }

    async fn lock_task(&self, id: &str) -> KeyGuard<'_> {
        self.lock_key(format!("task:{}", id)).await
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.key_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Start a transfer, or return the task already tracking this source
    ///
    /// Concurrent adds of the same source converge onto one task. A source
    /// whose previous task was cancelled or failed is started afresh.
    pub async fn add_task(&self, request: AddTaskRequest) -> Result<DownloadTask> {
        let key = canonical_source(&request.source_uri);
        if key.is_empty() {
            return Err(Error::Validation("source URI is empty".into()));
        }

        let _source = self.lock_source(&key).await;

        if let Some(existing) = self.task_for_source(&key).await {
            if !matches!(existing.status, TaskStatus::Cancelled | TaskStatus::Error) {
                log::debug!("Source {} already tracked as {}", key, existing.id);
                return Ok(existing);
            }
            if existing.backend == Backend::Swarm {
                // a failed session still occupies its info-hash in the engine
                self.release_backend_session(&existing).await?;
            }
        }

        let destination = ensure_destination(
            &self.download_root,
            request.kind,
            &request.display_name,
            request.season,
        )?;
        let backend = self.backend(request.backend)?;

        let start = StartRequest {
            source_uri: request.source_uri.trim().to_string(),
            display_name: request.display_name.clone(),
            destination: destination.clone(),
            filename: request.filename.clone(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        };
        let snapshot = backend.start(&start).await?;

        let now = Utc::now();
        let mut task = DownloadTask {
            id: snapshot.id.clone(),
            title: request.display_name.clone(),
            kind: request.kind,
            source_descriptor: start.source_uri.clone(),
            backend: request.backend,
            status: TaskStatus::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            speed_bytes_per_sec: None,
            eta_seconds: None,
            destination_path: destination.clone(),
            created_at: now,
            updated_at: now,
            last_error: None,
            stale: false,
        };
        task.status = snapshot.status;
        apply_numbers(&mut task, &snapshot);

        HistoryDb::record_active(&self.db, &task.id, &task.title, task.total_bytes)?;
        if task.backend == Backend::Daemon {
            DaemonTasksDb::save(
                &self.db,
                &MirroredTask {
                    id: task.id.clone(),
                    source_uri: task.source_descriptor.clone(),
                    title: task.title.clone(),
                    kind: task.kind,
                    destination,
                    created_at: now,
                },
            )?;
        }
        if task.status.is_terminal() {
            self.settle(&task);
        }

        log::info!("Added {:?} task {} for {}", task.backend, task.id, task.title);
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        self.sources.write().await.insert(key, task.id.clone());
        let _ = self.events.send(TaskEvent::Added(task.clone()));

        Ok(task)
    }

    async fn task_for_source(&self, key: &str) -> Option<DownloadTask> {
        let id = self.sources.read().await.get(key).cloned()?;
        self.tasks.read().await.get(&id).cloned()
    }

    pub async fn pause(&self, id: &str) -> Result<TransitionOutcome> {
        self.request_transition(id, TaskStatus::Paused).await
    }

    /// Resume a paused task; any other state is an invalid transition
    pub async fn resume(&self, id: &str) -> Result<TransitionOutcome> {
        self.request_transition(id, TaskStatus::Downloading).await
    }

    pub async fn cancel(&self, id: &str) -> Result<TransitionOutcome> {
        self.request_transition(id, TaskStatus::Cancelled).await
    }

    /// Drop a task from the registry
    ///
    /// A running task is cancelled first. A finished swarm task has its
    /// session stopped, which ends seeding. History keeps the final status.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _task = self.lock_task(id).await;

        let task = self
            .tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;

        if task.status.is_terminal() {
            if task.backend == Backend::Swarm {
                self.release_backend_session(&task).await?;
            }
        } else {
            self.backend(task.backend)?.cancel(id).await?;
            let mut cancelled = task.clone();
            cancelled.status = TaskStatus::Cancelled;
            self.settle(&cancelled);
        }

        self.tasks.write().await.remove(id);
        self.sources
            .write()
            .await
            .retain(|_, task_id| task_id.as_str() != id);
        log::info!("Removed task {} ({})", id, task.title);
        let _ = self.events.send(TaskEvent::Removed { id: id.to_string() });
        Ok(())
    }

    /// Stop whatever the backend still holds for a finished task
    async fn release_backend_session(&self, task: &DownloadTask) -> Result<()> {
        match self.backend(task.backend)?.cancel(&task.id).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn request_transition(&self, id: &str, requested: TaskStatus) -> Result<TransitionOutcome> {
        let _task = self.lock_task(id).await;

        let (from, backend_kind) = {
            let tasks = self.tasks.read().await;
            let task = tasks
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
            (task.status, task.backend)
        };

        let legal = match requested {
            TaskStatus::Downloading => from == TaskStatus::Paused,
            _ => from.can_transition_to(requested),
        };
        if !legal {
            let outcome = TransitionOutcome::InvalidTransition { from, requested };
            log::debug!("Rejected {} -> {} for {}", from, requested, id);
            let _ = self.events.send(TaskEvent::Transition {
                id: id.to_string(),
                outcome,
            });
            return Ok(outcome);
        }

        let backend = self.backend(backend_kind)?;
        match requested {
            TaskStatus::Paused => backend.pause(id).await?,
            TaskStatus::Downloading => backend.resume(id).await?,
            _ => backend.cancel(id).await?,
        }

        let updated = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
            if task.status.is_terminal() {
                // a poll observed a terminal state while the backend call ran
                let outcome = TransitionOutcome::InvalidTransition {
                    from: task.status,
                    requested,
                };
                return Ok(outcome);
            }
            task.status = requested;
            task.updated_at = Utc::now();
            if requested != TaskStatus::Downloading {
                task.speed_bytes_per_sec = None;
                task.eta_seconds = None;
            }
            task.clone()
        };

        if updated.status.is_terminal() {
            self.settle(&updated);
        }
        log::info!("Task {} {} -> {}", id, from, requested);

        let outcome = TransitionOutcome::Applied(requested);
        let _ = self.events.send(TaskEvent::Transition {
            id: id.to_string(),
            outcome,
        });
        let _ = self.events.send(TaskEvent::Updated(updated));
        Ok(outcome)
    }

    /// Reconcile a backend observation into the task
    ///
    /// Terminal observations are always accepted. Other observed states must
    /// be reachable from the current one; otherwise only the counters are
    /// refreshed. Returns the updated task, or `None` for unknown or
    /// already-terminal ids.
    pub async fn apply_snapshot(&self, snapshot: &TransferSnapshot) -> Option<DownloadTask> {
        let _task = self.lock_task(&snapshot.id).await;
        let updated = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(&snapshot.id)?;
            if task.status.is_terminal() {
                return None;
            }

            let observed = snapshot.status;
            if observed != task.status {
                if observed.is_terminal() || task.status.can_transition_to(observed) {
                    log::debug!("Task {} observed {} -> {}", task.id, task.status, observed);
                    task.status = observed;
                } else {
                    log::debug!("Ignoring observed {} -> {} for {}", task.status, observed, task.id);
                }
            }
            apply_numbers(task, snapshot);
            task.stale = false;
            task.updated_at = Utc::now();
            task.clone()
        };

        if updated.status.is_terminal() {
            self.settle(&updated);
        }
        let _ = self.events.send(TaskEvent::Updated(updated.clone()));
        Some(updated)
    }

    /// Flag a task whose latest poll failed
    pub async fn mark_stale(&self, id: &str, error: &str) {
        let _task = self.lock_task(id).await;
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.stale = true;
            task.updated_at = Utc::now();
        }
        drop(tasks);
        let _ = self.events.send(TaskEvent::Stale {
            id: id.to_string(),
            error: error.to_string(),
        });
    }

    pub async fn apply_swarm_event(&self, event: SwarmEvent) {
        match event {
            SwarmEvent::Progress(snapshot) => {
                self.apply_snapshot(&snapshot).await;
            }
            SwarmEvent::Removed { info_hash } => {
                let _task = self.lock_task(&info_hash).await;
                let running = self
                    .tasks
                    .read()
                    .await
                    .get(&info_hash)
                    .is_some_and(|t| !t.status.is_terminal());
                if !running {
                    return;
                }
                // a re-added source reuses the info-hash with a live session
                if let Ok(backend) = self.backend(Backend::Swarm) {
                    if backend.snapshot(&info_hash).await.is_ok() {
                        return;
                    }
                }

                let cancelled = {
                    let mut tasks = self.tasks.write().await;
                    match tasks.get_mut(&info_hash) {
                        Some(task) if !task.status.is_terminal() => {
                            task.status = TaskStatus::Cancelled;
                            task.updated_at = Utc::now();
                            Some(task.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(task) = cancelled {
                    self.settle(&task);
                    let _ = self.events.send(TaskEvent::Updated(task));
                }
            }
            SwarmEvent::Added { .. } | SwarmEvent::Done { .. } | SwarmEvent::Error { .. } => {}
        }
    }

    pub async fn get(&self, id: &str) -> Option<DownloadTask> {
        self.tasks.read().await.get(id).cloned()
    }

    /// All tasks, oldest first
    pub async fn list(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Non-terminal task ids for one backend
    pub async fn active_ids(&self, backend: Backend) -> Vec<String> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.backend == backend && !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Reload daemon tasks mirrored by a previous run
    ///
    /// Tasks whose first snapshot fails are kept and marked stale; the next
    /// poll tick reconciles them. Returns how many tasks were restored.
    pub async fn restore(&self) -> Result<usize> {
        let mirrored = DaemonTasksDb::list(&self.db)?;
        if mirrored.is_empty() {
            return Ok(0);
        }
        let backend = self.backend(Backend::Daemon)?;

        let mut restored = 0;
        for entry in mirrored {
            if self.tasks.read().await.contains_key(&entry.id) {
                continue;
            }

            let mut task = DownloadTask {
                id: entry.id.clone(),
                title: entry.title.clone(),
                kind: entry.kind,
                source_descriptor: entry.source_uri.clone(),
                backend: Backend::Daemon,
                status: TaskStatus::Queued,
                progress: 0.0,
                downloaded_bytes: 0,
                total_bytes: None,
                speed_bytes_per_sec: None,
                eta_seconds: None,
                destination_path: entry.destination.clone(),
                created_at: entry.created_at,
                updated_at: Utc::now(),
                last_error: None,
                stale: false,
            };

            match backend.snapshot(&entry.id).await {
                Ok(snapshot) => {
                    task.status = snapshot.status;
                    apply_numbers(&mut task, &snapshot);
                }
                Err(e) => {
                    log::warn!("Restored task {} could not be polled: {}", entry.id, e);
                    task.stale = true;
                    task.last_error = Some(e.to_string());
                }
            }
            if task.status.is_terminal() {
                self.settle(&task);
            }

            self.sources
                .write()
                .await
                .insert(canonical_source(&entry.source_uri), task.id.clone());
            self.tasks.write().await.insert(task.id.clone(), task.clone());
            let _ = self.events.send(TaskEvent::Added(task));
            restored += 1;
        }

        log::info!("Restored {} daemon tasks", restored);
        Ok(restored)
    }

    /// Persist a terminal state: finalize history, drop the daemon mirror
    fn settle(&self, task: &DownloadTask) {
        if let Err(e) = HistoryDb::finalize(&self.db, &task.id, task.status, task.total_bytes) {
            log::warn!("Failed to finalize history for {}: {}", task.id, e);
        }
        if task.backend == Backend::Daemon {
            if let Err(e) = DaemonTasksDb::delete(&self.db, &task.id) {
                log::warn!("Failed to drop daemon mirror for {}: {}", task.id, e);
            }
        }
    }
}

/// Copy counters from a snapshot and derive progress and ETA
fn apply_numbers(task: &mut DownloadTask, snapshot: &TransferSnapshot) {
    task.downloaded_bytes = snapshot.completed_bytes;
    if snapshot.total_bytes.is_some() {
        task.total_bytes = snapshot.total_bytes;
    }
    task.speed_bytes_per_sec = snapshot.download_speed;
    task.progress = match task.status {
        TaskStatus::Completed => 1.0,
        _ => calculate_progress(task.downloaded_bytes, task.total_bytes.unwrap_or(0)),
    };
    task.eta_seconds = eta_seconds(task.downloaded_bytes, task.total_bytes, task.speed_bytes_per_sec);
    if snapshot.error_message.is_some() {
        task.last_error = snapshot.error_message.clone();
    }
}
