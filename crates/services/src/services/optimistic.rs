//! Optimistic task updates with snapshot rollback.
//!
//! Each mutation is a small state machine: it starts `Pending` with a
//! snapshot of the task, and settles as `Committed` (snapshot discarded, local
//! copy reconciled with the server row) or `RolledBack` (snapshot restored,
//! one alert raised). Neither outcome overwrites a newer version of the row
//! that arrived from another client while the write was in flight. At most
//! one mutation per task may be pending; a second request is rejected rather
//! than queued.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use db::{
    models::task::{Task, TaskPatch, timestamp_value},
    remote::RemoteError,
};
use parking_lot::Mutex;
use serde_json::Value;
use strum_macros::Display;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{notification::AlertSink, task_store::{TaskBoardError, TaskStore}};

pub const UPDATE_FAILED_TITLE: &str = "Update Failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MutationPhase {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub seq: u64,
    pub task_id: Uuid,
    /// Pre-mutation copy; only taken for optimistic mutations.
    pub snapshot: Option<Task>,
    pub phase: MutationPhase,
}

impl PendingMutation {
    fn settle(&mut self, phase: MutationPhase) {
        debug_assert_eq!(self.phase, MutationPhase::Pending);
        debug!(task_id = %self.task_id, seq = self.seq, from = %self.phase, to = %phase, "Mutation settled");
        self.phase = phase;
    }
}

type PendingMap = Arc<Mutex<HashMap<Uuid, PendingMutation>>>;

/// Handle to an in-flight mutation. The mutation runs to completion whether or
/// not the handle is awaited or dropped.
pub struct MutationHandle {
    task_id: Uuid,
    seq: u64,
    settle: JoinHandle<Result<Task, TaskBoardError>>,
}

impl MutationHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the remote write and the commit or rollback that follows it.
    pub async fn settled(self) -> Result<Task, TaskBoardError> {
        match self.settle.await {
            Ok(result) => result,
            Err(e) => Err(TaskBoardError::Write(RemoteError::Transport(format!(
                "mutation task ended unexpectedly: {e}"
            )))),
        }
    }
}

#[derive(Clone)]
pub struct MutationEngine {
    store: TaskStore,
    alerts: Arc<dyn AlertSink>,
    write_timeout: Option<Duration>,
    pending: PendingMap,
    next_seq: Arc<AtomicU64>,
}

impl MutationEngine {
    pub fn new(store: TaskStore, alerts: Arc<dyn AlertSink>, write_timeout: Option<Duration>) -> Self {
        Self {
            store,
            alerts,
            write_timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn is_pending(&self, task_id: Uuid) -> bool {
        self.pending.lock().contains_key(&task_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Start a mutation of `task_id`.
    ///
    /// With `optimistic` set the patch is visible in the store before this
    /// returns. Fails without touching the store when the task is unknown or
    /// already has a mutation in flight.
    pub fn mutate(
        &self,
        task_id: Uuid,
        patch: TaskPatch,
        optimistic: bool,
    ) -> Result<MutationHandle, TaskBoardError> {
        let seq = {
            let mut pending = self.pending.lock();
            if pending.contains_key(&task_id) {
                warn!(task_id = %task_id, "Rejecting concurrent mutation");
                return Err(TaskBoardError::ConcurrentMutation(task_id));
            }

            let snapshot = if optimistic {
                self.store.modify_task(task_id, |task| {
                    let before = task.clone();
                    patch.apply_to(task);
                    before
                })
            } else {
                self.store.task(task_id)
            };
            let Some(snapshot) = snapshot else {
                warn!(task_id = %task_id, "Mutation requested for a task that is not loaded");
                return Err(TaskBoardError::NotFound(task_id));
            };

            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            pending.insert(
                task_id,
                PendingMutation {
                    seq,
                    task_id,
                    snapshot: optimistic.then_some(snapshot),
                    phase: MutationPhase::Pending,
                },
            );
            seq
        };
        debug!(task_id = %task_id, seq, optimistic, "Mutation started");

        let engine = self.clone();
        let settle = tokio::spawn(async move {
            let result = engine.write(task_id, &patch).await;
            engine.finish(task_id, seq, result)
        });

        Ok(MutationHandle {
            task_id,
            seq,
            settle,
        })
    }

    async fn write(&self, task_id: Uuid, patch: &TaskPatch) -> Result<Value, RemoteError> {
        let mut fields = patch.to_wire();
        fields.insert("updated_at".into(), timestamp_value(Utc::now()));

        let write = self.store.remote().update(self.store.table(), task_id, fields);
        match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .unwrap_or(Err(RemoteError::Timeout)),
            None => write.await,
        }
    }

    fn finish(
        &self,
        task_id: Uuid,
        seq: u64,
        result: Result<Value, RemoteError>,
    ) -> Result<Task, TaskBoardError> {
        let mut pending = self.pending.lock();
        let Some(mut mutation) = pending.remove(&task_id) else {
            warn!(task_id = %task_id, seq, "Settling a mutation that is no longer tracked");
            let row = result.map_err(TaskBoardError::Write)?;
            return Ok(Task::from_wire(&row)?);
        };
        debug_assert_eq!(mutation.seq, seq);

        match result {
            Ok(row) => {
                mutation.settle(MutationPhase::Committed);
                let task = Task::from_wire(&row).inspect_err(|e| {
                    warn!(task_id = %task_id, error = %e, "Write succeeded but returned an unusable row")
                })?;
                self.store.reconcile(task.clone());
                info!(task_id = %task_id, seq, "Task update committed");
                Ok(task)
            }
            Err(e) => {
                mutation.settle(MutationPhase::RolledBack);
                if let Some(snapshot) = mutation.snapshot.take() {
                    self.store.reconcile(snapshot);
                }
                drop(pending);
                warn!(task_id = %task_id, seq, error = %e, "Task update failed, rolled back");
                self.alerts.alert(UPDATE_FAILED_TITLE, &e.to_string());
                Err(TaskBoardError::Write(e))
            }
        }
    }
}
