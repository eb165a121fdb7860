//! Progress synchronizer
//!
//! Polls the daemon on a fixed interval and feeds swarm events into the
//! registry. One slow or failing id never holds up the others.

use crate::backend::TransferBackend;
use crate::registry::TaskRegistry;
use crate::swarm::SwarmEvent;
use crate::types::Settings;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Outcome of one poll tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub updated: usize,
    pub stale: usize,
}

pub struct ProgressSynchronizer {
    registry: Arc<TaskRegistry>,
    backend: Arc<dyn TransferBackend>,
    interval: Duration,
    call_timeout: Duration,
}

impl ProgressSynchronizer {
    pub fn new(
        registry: Arc<TaskRegistry>,
        backend: Arc<dyn TransferBackend>,
        interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            interval,
            call_timeout,
        }
    }

    pub fn from_settings(
        registry: Arc<TaskRegistry>,
        backend: Arc<dyn TransferBackend>,
        settings: &Settings,
    ) -> Self {
        Self::new(
            registry,
            backend,
            Duration::from_secs(settings.poll_interval_secs.max(1)),
            Duration::from_millis(settings.rpc_timeout_ms),
        )
    }

    /// Snapshot every non-terminal id concurrently, each call bounded by the
    /// per-call timeout
    pub async fn poll_once(&self) -> PollReport {
        let ids = self.registry.active_ids(self.backend.kind()).await;
        if ids.is_empty() {
            return PollReport::default();
        }

        let polls = ids.into_iter().map(|id| async move {
            let result = tokio::time::timeout(self.call_timeout, self.backend.snapshot(&id)).await;
            (id, result)
        });

        let mut report = PollReport::default();
        for (id, result) in join_all(polls).await {
            match result {
                Ok(Ok(snapshot)) => {
                    if self.registry.apply_snapshot(&snapshot).await.is_some() {
                        report.updated += 1;
                    }
                }
                Ok(Err(e)) => {
                    log::warn!("Polling {} failed: {}", id, e);
                    self.registry.mark_stale(&id, &e.to_string()).await;
                    report.stale += 1;
                }
                Err(_) => {
                    log::warn!("Polling {} timed out after {:?}", id, self.call_timeout);
                    self.registry.mark_stale(&id, "status request timed out").await;
                    report.stale += 1;
                }
            }
        }

        log::debug!("Poll tick: {} updated, {} stale", report.updated, report.stale);
        report
    }

    /// Run `poll_once` on the configured interval until aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("Progress synchronizer polling every {:?}", self.interval);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }

    /// Forward swarm events into the registry until the channel closes
    pub fn spawn_swarm_listener(
        registry: Arc<TaskRegistry>,
        mut events: broadcast::Receiver<SwarmEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => registry.apply_swarm_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Swarm listener lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_adapter::{DriverEvent, DriverState};
    use crate::registry::tests::{registry, request, MockBackend};
    use crate::swarm::tests::{engine, magnet, HASH};
    use crate::types::{AddTaskRequest, Backend, TaskKind, TaskStatus, TransferSnapshot};

    #[tokio::test]
    async fn test_one_bad_id_does_not_block_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, backend, _) = registry(dir.path());

        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let task = registry
                .add_task(request(&format!("https://example.org/{}.mkv", name)))
                .await
                .unwrap();
            ids.push(task.id);
        }

        backend.script(TransferSnapshot {
            id: ids[0].clone(),
            status: TaskStatus::Downloading,
            completed_bytes: 500,
            total_bytes: Some(1000),
            ..Default::default()
        });
        backend.script(TransferSnapshot {
            id: ids[1].clone(),
            status: TaskStatus::Completed,
            completed_bytes: 1000,
            total_bytes: Some(1000),
            ..Default::default()
        });
        backend.hanging.lock().unwrap().insert(ids[2].clone());
        backend.failing.lock().unwrap().insert(ids[3].clone());

        let backend: Arc<dyn TransferBackend> = backend;
        let sync = ProgressSynchronizer::new(
            registry.clone(),
            backend,
            Duration::from_secs(5),
            Duration::from_millis(100),
        );

        let report = tokio::time::timeout(Duration::from_secs(2), sync.poll_once())
            .await
            .unwrap();
        assert_eq!(report, PollReport { updated: 2, stale: 2 });

        let a = registry.get(&ids[0]).await.unwrap();
        assert_eq!(a.status, TaskStatus::Downloading);
        assert_eq!(a.progress, 0.5);
        assert_eq!(registry.get(&ids[1]).await.unwrap().status, TaskStatus::Completed);
        assert!(registry.get(&ids[2]).await.unwrap().stale);
        assert!(registry.get(&ids[3]).await.unwrap().stale);

        // completed ids drop out of the next tick
        let active = registry.active_ids(Backend::Daemon).await;
        assert_eq!(active.len(), 3);
        assert!(!active.contains(&ids[1]));
    }

    #[tokio::test]
    async fn test_stale_clears_on_next_good_poll() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, backend, _) = registry(dir.path());
        let task = registry.add_task(request("https://example.org/a.mkv")).await.unwrap();
        backend.failing.lock().unwrap().insert(task.id.clone());

        let dyn_backend: Arc<dyn TransferBackend> = backend.clone();
        let sync = ProgressSynchronizer::new(
            registry.clone(),
            dyn_backend,
            Duration::from_secs(5),
            Duration::from_millis(100),
        );
        sync.poll_once().await;
        assert!(registry.get(&task.id).await.unwrap().stale);

        backend.failing.lock().unwrap().clear();
        backend.script(TransferSnapshot {
            id: task.id.clone(),
            status: TaskStatus::Downloading,
            completed_bytes: 1,
            total_bytes: Some(4),
            ..Default::default()
        });
        sync.poll_once().await;
        let task = registry.get(&task.id).await.unwrap();
        assert!(!task.stale);
        assert_eq!(task.progress, 0.25);
    }

    #[tokio::test]
    async fn test_swarm_events_drive_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (swarm, driver, db) = engine();
        let registry = Arc::new(
            TaskRegistry::new(db, dir.path()).with_backend(swarm.clone() as Arc<dyn TransferBackend>),
        );
        let listener = ProgressSynchronizer::spawn_swarm_listener(registry.clone(), swarm.subscribe());

        let task = registry
            .add_task(AddTaskRequest {
                source_uri: magnet(HASH),
                display_name: "Show".into(),
                kind: TaskKind::TvSeasonPack,
                backend: Backend::Swarm,
                season: Some(1),
                filename: None,
            })
            .await
            .unwrap();
        assert_eq!(task.id, HASH);
        assert_eq!(task.destination_path, dir.path().join("TV").join("Show").join("Season_01"));

        driver.set_status("driver-0", |s| {
            s.state = DriverState::Completed;
            s.total_size = Some(2000);
            s.completed_size = 2000;
        });
        swarm
            .handle_driver_event(DriverEvent::Completed { id: "driver-0".into() })
            .await;

        let mut done = false;
        for _ in 0..50 {
            if registry.get(HASH).await.map(|t| t.status) == Some(TaskStatus::Completed) {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(done);
        listener.abort();
    }

    #[tokio::test]
    async fn test_idle_poll_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _, _) = registry(dir.path());
        let backend: Arc<dyn TransferBackend> = Arc::new(MockBackend::new(Backend::Daemon));
        let sync = ProgressSynchronizer::new(registry, backend, Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(sync.poll_once().await, PollReport::default());
    }
}
