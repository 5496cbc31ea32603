//! Background sync worker.
//!
//! Wakes every tick, syncs the departments that are due and purges stale
//! retry state. Commands on the handle trigger on-demand runs or stop it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::{DepartmentReport, Outcome, SyncEngine, SyncError, SyncReport};
use crate::constants::{RETRY_STATE_MAX_AGE_SECS, WORKER_TICK_SECS};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub tick: Duration,
    /// Retry state idle for this long is dropped.
    pub retry_max_age: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(WORKER_TICK_SECS),
            retry_max_age: Duration::from_secs(RETRY_STATE_MAX_AGE_SECS),
        }
    }
}

pub enum WorkerCommand {
    /// Sync every department now, regardless of interval.
    SyncNow {
        reply: oneshot::Sender<anyhow::Result<SyncReport>>,
    },
    SyncDepartment {
        id: i64,
        reply: oneshot::Sender<Result<DepartmentReport, SyncError>>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    CycleComplete {
        processed: usize,
        tickets_created: Vec<String>,
    },
    DepartmentFailed {
        department_id: i64,
        name: String,
        error: String,
    },
}

/// Handle for controlling the sync worker
pub struct WorkerHandle {
    pub cmd_tx: mpsc::Sender<WorkerCommand>,
    pub event_rx: mpsc::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Run a full sync and wait for its report.
    pub async fn sync_now(&self) -> anyhow::Result<SyncReport> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::SyncNow { reply })
            .await
            .map_err(|_| anyhow::anyhow!("Sync worker is not running"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Sync worker stopped before replying"))?
    }

    pub async fn shutdown(&self) {
        if self.cmd_tx.send(WorkerCommand::Shutdown).await.is_err() {
            tracing::debug!("Sync worker already stopped");
        }
    }
}

pub fn spawn_worker(engine: Arc<SyncEngine>, settings: WorkerSettings) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);

    tokio::spawn(worker_loop(engine, settings, cmd_rx, event_tx));

    WorkerHandle { cmd_tx, event_rx }
}

/// Events are dropped when the channel is full; the worker never blocks
/// on a slow consumer.
fn emit(event_tx: &mpsc::Sender<WorkerEvent>, report: &SyncReport) {
    for dept in &report.departments {
        if let Outcome::Failed(error) = &dept.outcome
            && let Err(e) = event_tx.try_send(WorkerEvent::DepartmentFailed {
                department_id: dept.department_id,
                name: dept.name.clone(),
                error: error.clone(),
            })
        {
            tracing::debug!("Dropped DepartmentFailed event: {}", e);
        }
    }

    if let Err(e) = event_tx.try_send(WorkerEvent::CycleComplete {
        processed: report.processed,
        tickets_created: report.tickets_created.clone(),
    }) {
        tracing::debug!("Dropped CycleComplete event: {}", e);
    }
}

async fn worker_loop(
    engine: Arc<SyncEngine>,
    settings: WorkerSettings,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    event_tx: mpsc::Sender<WorkerEvent>,
) {
    let mut interval = tokio::time::interval(settings.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("Sync worker started (tick {:?})", settings.tick);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                engine.retry().cleanup(settings.retry_max_age);
                match engine.sync_due(Utc::now()).await {
                    Ok(report) => emit(&event_tx, &report),
                    Err(e) => tracing::error!("Scheduled sync failed: {:#}", e),
                }
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(WorkerCommand::SyncNow { reply }) => {
                    let result = engine.run_once().await;
                    if let Ok(report) = &result {
                        emit(&event_tx, report);
                    }
                    if reply.send(result).is_err() {
                        tracing::debug!("SyncNow requester went away");
                    }
                }
                Some(WorkerCommand::SyncDepartment { id, reply }) => {
                    let result = engine.sync_department(id).await;
                    if reply.send(result).is_err() {
                        tracing::debug!("SyncDepartment requester went away");
                    }
                }
                Some(WorkerCommand::Shutdown) | None => {
                    tracing::info!("Sync worker shutting down");
                    break;
                }
            }
        }
    }
}
