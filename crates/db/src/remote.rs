//! Contract of the remote row store: queries, writes and change subscriptions.

use async_trait::async_trait;
use serde_json::{Map, Value};
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("{table} row {id} not found")]
    NotFound { table: String, id: Uuid },
    #[error("json error: {0}")]
    Serde(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl RemoteError {
    /// Transient failures are worth a manual retry by the user.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}

/// Row predicate. A query's predicates are combined with AND.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq { field: String, value: Value },
    /// Matches rows where the field differs from `value`, including rows where it is null.
    NotEq { field: String, value: Value },
    Or(Vec<Predicate>),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn not_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::NotEq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn or(any: Vec<Predicate>) -> Self {
        Self::Or(any)
    }

    pub fn and(all: Vec<Predicate>) -> Self {
        Self::And(all)
    }

    /// Evaluate against a JSON row with the same semantics the SQL backend uses.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Self::Eq { field, value } => match row.get(field) {
                None | Some(Value::Null) => value.is_null(),
                Some(actual) => actual == value,
            },
            Self::NotEq { field, value } => !Self::Eq {
                field: field.clone(),
                value: value.clone(),
            }
            .matches(row),
            Self::Or(any) => any.iter().any(|p| p.matches(row)),
            Self::And(all) => matches_all(all, row),
        }
    }
}

pub fn matches_all(predicates: &[Predicate], row: &Value) -> bool {
    predicates.iter().all(|p| p.matches(row))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordering {
    pub field: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteQuery {
    pub table: String,
    pub predicates: Vec<Predicate>,
    pub order: Option<Ordering>,
}

impl RemoteQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicates: Vec::new(),
            order: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Ordering {
            field: field.into(),
            ascending,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Push notification describing a single row change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, new: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            new: Some(new),
            old: None,
        }
    }

    pub fn update(table: impl Into<String>, new: Value, old: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            new: Some(new),
            old: Some(old),
        }
    }

    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }

    /// A subscription sees the event if either side of the change matches its filter.
    pub fn matches(&self, predicates: &[Predicate]) -> bool {
        self.new
            .iter()
            .chain(self.old.iter())
            .any(|row| matches_all(predicates, row))
    }
}

/// Live subscription to remote changes. Events queue up until read; dropping
/// the feed releases the subscription.
pub struct ChangeFeed {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    _subscription: DropGuard,
}

impl ChangeFeed {
    /// Create a feed plus the sender side and the token a backend watches to
    /// notice the subscriber going away.
    pub fn channel() -> (mpsc::UnboundedSender<ChangeEvent>, CancellationToken, ChangeFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let feed = ChangeFeed {
            events: rx,
            _subscription: token.clone().drop_guard(),
        };
        (tx, token, feed)
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn query(&self, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError>;

    async fn insert(&self, table: &str, fields: Map<String, Value>) -> Result<Value, RemoteError>;

    async fn update(
        &self,
        table: &str,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> Result<Value, RemoteError>;

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), RemoteError>;

    async fn subscribe(
        &self,
        table: &str,
        filter: Vec<Predicate>,
    ) -> Result<ChangeFeed, RemoteError>;
}
