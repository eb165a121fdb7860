//! Download service - bridges the tokio runtime with a front end's main loop

use crate::daemon::DaemonClient;
use crate::db::{Database, HistoryDb};
use crate::engine_adapter::{EngineAdapter, SwarmDriver};
use crate::error::Result;
use crate::ranking::SourceRanker;
use crate::registry::{TaskEvent, TaskRegistry};
use crate::swarm::SwarmEngine;
use crate::sync::ProgressSynchronizer;
use crate::types::{
    AddTaskRequest, DownloadTask, FileHandle, GlobalStats, HistoryRecord, RankingRequest, Settings,
    SourceCandidate, TransitionOutcome,
};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Commands sent from the front end to the service (via async channel)
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Rank sources for a title
    Search(RankingRequest),
    /// Rank season packs across a whole show
    SearchAllSeasons {
        request: RankingRequest,
        season_count: u32,
    },
    /// Start a transfer
    AddTask(AddTaskRequest),
    Pause(String),
    Resume(String),
    Cancel(String),
    /// Drop a task; a finished swarm task stops seeding
    Remove(String),
    /// Request the current task list
    RefreshTasks,
    /// Request the history list
    RefreshHistory,
    ClearHistory,
    RemoveHistory(String),
    /// Largest file of a swarm task
    LargestFile(String),
    /// Request global stats
    RefreshStats,
    /// Shutdown the service
    Shutdown,
}

/// Messages sent from the service to the front end (via channel)
#[derive(Debug, Clone)]
pub enum UiMessage {
    /// Service initialized and background loops running
    EngineReady,
    SearchResults(Vec<SourceCandidate>),
    TaskAdded(DownloadTask),
    TaskUpdated(DownloadTask),
    TaskStale {
        id: String,
        error: String,
    },
    Transition {
        id: String,
        outcome: TransitionOutcome,
    },
    TaskRemoved {
        id: String,
    },
    TasksList(Vec<DownloadTask>),
    History(Vec<HistoryRecord>),
    HistoryCleared(usize),
    HistoryRemoved {
        id: String,
        removed: bool,
    },
    LargestFile {
        id: String,
        file: Option<FileHandle>,
    },
    StatsUpdated(GlobalStats),
    /// Error message
    Error(String),
}

impl From<TaskEvent> for UiMessage {
    fn from(event: TaskEvent) -> Self {
        match event {
            TaskEvent::Added(task) => UiMessage::TaskAdded(task),
            TaskEvent::Updated(task) => UiMessage::TaskUpdated(task),
            TaskEvent::Stale { id, error } => UiMessage::TaskStale { id, error },
            TaskEvent::Transition { id, outcome } => UiMessage::Transition { id, outcome },
            TaskEvent::Removed { id } => UiMessage::TaskRemoved { id },
        }
    }
}

/// All engine components, wired once and shared
#[derive(Clone)]
struct Components {
    db: Database,
    ranker: SourceRanker,
    registry: Arc<TaskRegistry>,
    swarm: Arc<SwarmEngine>,
    daemon: Arc<DaemonClient>,
    synchronizer: Arc<ProgressSynchronizer>,
}

/// Download service that runs in a separate thread with tokio
pub struct DownloadService {
    components: Components,
}

impl DownloadService {
    /// Start the embedded swarm engine and wire every component
    pub async fn new_async(settings: &Settings, db: Database) -> Result<Self> {
        let adapter = EngineAdapter::start(settings).await?;
        Self::with_driver(settings, db, Arc::new(adapter))
    }

    /// Wire the service around an existing swarm driver
    pub fn with_driver(settings: &Settings, db: Database, driver: Arc<dyn SwarmDriver>) -> Result<Self> {
        let ranker = SourceRanker::from_settings(settings)?;
        let daemon = Arc::new(DaemonClient::from_settings(settings)?);
        let swarm = Arc::new(SwarmEngine::new(
            driver,
            db.clone(),
            settings.delete_files_on_remove,
        ));

        let registry = Arc::new(
            TaskRegistry::new(db.clone(), &settings.download_path)
                .with_backend(swarm.clone())
                .with_backend(daemon.clone()),
        );
        let synchronizer = Arc::new(ProgressSynchronizer::from_settings(
            registry.clone(),
            daemon.clone(),
            settings,
        ));

        Ok(Self {
            components: Components {
                db,
                ranker,
                registry,
                swarm,
                daemon,
                synchronizer,
            },
        })
    }

    /// The shared task registry
    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.components.registry.clone()
    }

    /// Spawn the service in a background thread
    /// Takes the command receiver to process commands from the front end
    pub fn spawn(
        self,
        ui_sender: async_channel::Sender<UiMessage>,
        cmd_receiver: async_channel::Receiver<EngineCommand>,
    ) -> std::thread::JoinHandle<()> {
        let components = self.components;

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to create tokio runtime: {}", e);
                    let _ = ui_sender.send_blocking(UiMessage::Error(e.to_string()));
                    return;
                }
            };

            rt.block_on(async move {
                let mut task_rx = components.registry.subscribe();

                let pump = components.swarm.start();
                let listener = ProgressSynchronizer::spawn_swarm_listener(
                    components.registry.clone(),
                    components.swarm.subscribe(),
                );
                match components.registry.restore().await {
                    Ok(0) => {}
                    Ok(n) => log::info!("Reconciled {} tasks from the previous session", n),
                    Err(e) => log::warn!("Could not restore daemon tasks: {}", e),
                }
                let poller = components.synchronizer.clone().spawn();

                // Notify the front end that the service is ready
                let _ = ui_sender.send(UiMessage::EngineReady).await;

                loop {
                    tokio::select! {
                        // Handle commands from the front end
                        cmd_result = cmd_receiver.recv() => {
                            match cmd_result {
                                Ok(EngineCommand::Shutdown) => {
                                    log::info!("Download service shutting down");
                                    break;
                                }
                                Ok(cmd) => {
                                    handle_command(&components, &ui_sender, cmd).await;
                                }
                                Err(_) => {
                                    log::warn!("Command channel closed");
                                    break;
                                }
                            }
                        }

                        // Forward registry events
                        event_result = task_rx.recv() => {
                            match event_result {
                                Ok(event) => {
                                    let _ = ui_sender.send(UiMessage::from(event)).await;
                                }
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    log::warn!("Front end lagged, {} task events dropped", skipped);
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    }
                }

                poller.abort();
                listener.abort();
                pump.abort();
            });
        })
    }
}

/// Handle a command from the front end
///
/// Added tasks and transitions reach the front end as registry events, so
/// those commands only reply on failure.
async fn handle_command(
    components: &Components,
    ui_sender: &async_channel::Sender<UiMessage>,
    cmd: EngineCommand,
) {
    let reply: Result<Option<UiMessage>> = match cmd {
        EngineCommand::Search(request) => components
            .ranker
            .search(&request)
            .await
            .map(|results| Some(UiMessage::SearchResults(results))),

        EngineCommand::SearchAllSeasons {
            request,
            season_count,
        } => components
            .ranker
            .search_all_seasons(&request, season_count)
            .await
            .map(|results| Some(UiMessage::SearchResults(results))),

        EngineCommand::AddTask(request) => components.registry.add_task(request).await.map(|_| None),
        EngineCommand::Pause(id) => components.registry.pause(&id).await.map(|_| None),
        EngineCommand::Resume(id) => components.registry.resume(&id).await.map(|_| None),
        EngineCommand::Cancel(id) => components.registry.cancel(&id).await.map(|_| None),
        EngineCommand::Remove(id) => components.registry.remove(&id).await.map(|_| None),

        EngineCommand::RefreshTasks => Ok(Some(UiMessage::TasksList(components.registry.list().await))),

        EngineCommand::RefreshHistory => {
            HistoryDb::list(&components.db).map(|records| Some(UiMessage::History(records)))
        }

        EngineCommand::ClearHistory => {
            HistoryDb::clear(&components.db).map(|n| Some(UiMessage::HistoryCleared(n)))
        }

        EngineCommand::RemoveHistory(id) => HistoryDb::remove_one(&components.db, &id)
            .map(|removed| Some(UiMessage::HistoryRemoved { id, removed })),

        EngineCommand::LargestFile(id) => components
            .swarm
            .largest_file_handle(&id)
            .await
            .map(|file| Some(UiMessage::LargestFile { id, file })),

        EngineCommand::RefreshStats => Ok(Some(UiMessage::StatsUpdated(global_stats(components).await))),

        EngineCommand::Shutdown => {
            // Handled in the main loop
            Ok(None)
        }
    };

    match reply {
        Ok(Some(message)) => {
            let _ = ui_sender.send(message).await;
        }
        Ok(None) => {}
        Err(e) => {
            log::warn!("Command failed: {}", e);
            let _ = ui_sender.send(UiMessage::Error(e.to_string())).await;
        }
    }
}

/// Swarm and daemon stats combined; an unreachable daemon counts as idle
async fn global_stats(components: &Components) -> GlobalStats {
    let mut stats = components.swarm.global_stats();
    match components.daemon.global_stats().await {
        Ok(daemon) => {
            stats.download_speed += daemon.download_speed;
            stats.upload_speed += daemon.upload_speed;
            stats.num_active += daemon.num_active;
            stats.num_waiting += daemon.num_waiting;
            stats.num_stopped += daemon.num_stopped;
        }
        Err(e) => log::debug!("Daemon stats unavailable: {}", e),
    }
    stats
}
