#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use db::{
    models::{
        session::{SessionContext, UserRole},
        task::{CreateTask, Task},
    },
    remote::{ChangeFeed, Predicate, RemoteError, RemoteQuery, RemoteStore},
    sqlite::SqliteBackend,
};
use serde_json::{Map, Value};
use services::services::{
    config::BoardConfig, notification::RecordingAlertSink, task_board::TaskBoard,
};
use tokio::sync::Notify;
use uuid::Uuid;

pub const TABLE: &str = "tasks";

/// Remote that forwards to an in-memory sqlite backend and can be told to
/// fail or stall.
pub struct FaultyRemote {
    pub backend: SqliteBackend,
    pub failing_writes: AtomicUsize,
    pub fail_queries: AtomicBool,
    pub hold_writes: AtomicBool,
    pub release: Notify,
    /// Stall each query after it has read its rows until `release_query`.
    pub hold_queries: AtomicBool,
    pub query_read: Notify,
    pub release_query: Notify,
    pub update_calls: AtomicUsize,
}

impl FaultyRemote {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            backend: SqliteBackend::in_memory().await.unwrap(),
            failing_writes: AtomicUsize::new(0),
            fail_queries: AtomicBool::new(false),
            hold_writes: AtomicBool::new(false),
            release: Notify::new(),
            hold_queries: AtomicBool::new(false),
            query_read: Notify::new(),
            release_query: Notify::new(),
            update_calls: AtomicUsize::new(0),
        })
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn updates(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Seed a row as another client would.
    pub async fn seed(&self, row: Value) -> Task {
        let fields = row.as_object().cloned().unwrap();
        let created = self.backend.insert(TABLE, fields).await.unwrap();
        Task::from_wire(&created).unwrap()
    }

    pub async fn seed_new(&self, data: CreateTask, created_by: Uuid) -> Task {
        let created = self
            .backend
            .insert(TABLE, data.to_wire(created_by))
            .await
            .unwrap();
        Task::from_wire(&created).unwrap()
    }

    async fn gate_write(&self) -> Result<(), RemoteError> {
        if self.hold_writes.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        let failing = self.failing_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::SeqCst);
            return Err(RemoteError::Transport("connection reset by peer".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FaultyRemote {
    async fn query(&self, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("network unreachable".into()));
        }
        let rows = self.backend.query(query).await;
        if self.hold_queries.load(Ordering::SeqCst) {
            self.query_read.notify_one();
            self.release_query.notified().await;
        }
        rows
    }

    async fn insert(&self, table: &str, fields: Map<String, Value>) -> Result<Value, RemoteError> {
        self.gate_write().await?;
        self.backend.insert(table, fields).await
    }

    async fn update(
        &self,
        table: &str,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> Result<Value, RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.gate_write().await?;
        self.backend.update(table, id, fields).await
    }

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), RemoteError> {
        self.gate_write().await?;
        self.backend.delete(table, id).await
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: Vec<Predicate>,
    ) -> Result<ChangeFeed, RemoteError> {
        self.backend.subscribe(table, filter).await
    }
}

pub fn admin() -> SessionContext {
    SessionContext::new(Uuid::new_v4(), UserRole::Admin)
}

pub fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

pub fn board_with(
    remote: &Arc<FaultyRemote>,
    session: SessionContext,
    config: &BoardConfig,
) -> (TaskBoard, Arc<RecordingAlertSink>) {
    let alerts = Arc::new(RecordingAlertSink::new());
    let board = TaskBoard::new(remote.clone(), session, config, alerts.clone());
    (board, alerts)
}

/// Poll `check` until it holds, giving spawned tasks a chance to run.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
