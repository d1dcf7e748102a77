//! Local implementation of the remote store contract on top of sqlite.
//!
//! Every table is kept as JSON documents in a single `records` table, so any
//! row shape can be stored and predicates compile to `json_extract` lookups.
//! Writes are broadcast to subscribers the way a hosted realtime channel would.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{
    Executor, QueryBuilder, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    models::task::{TaskPriority, timestamp_value},
    remote::{ChangeEvent, ChangeFeed, Predicate, RemoteError, RemoteQuery, RemoteStore},
};

const CHANGE_BUFFER: usize = 256;

#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `url` and apply migrations.
    pub async fn connect(url: &str) -> Result<Self, RemoteError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:");
        // An in-memory database lives as long as its single connection does.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;
        Self::from_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self, RemoteError> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, RemoteError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        info!("Sqlite backend ready");
        Ok(Self { pool, changes })
    }

    /// Number of live change subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    fn publish(&self, event: ChangeEvent) {
        debug!(table = %event.table, kind = %event.kind, "Publishing change");
        // No receivers just means nobody is subscribed right now.
        let _ = self.changes.send(event);
    }

    async fn load<'e, E>(&self, executor: E, table: &str, id: Uuid) -> Result<Value, RemoteError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM records WHERE tbl = $1 AND id = $2")
                .bind(table)
                .bind(id.to_string())
                .fetch_optional(executor)
                .await?;
        match body {
            Some(body) => parse_body(&body),
            None => Err(RemoteError::NotFound {
                table: table.to_string(),
                id,
            }),
        }
    }
}

#[async_trait]
impl RemoteStore for SqliteBackend {
    async fn query(&self, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT body FROM records WHERE tbl = ");
        builder.push_bind(query.table.clone());
        for predicate in &query.predicates {
            builder.push(" AND ");
            push_predicate(&mut builder, predicate);
        }
        if let Some(order) = &query.order {
            builder.push(" ORDER BY ");
            if order.field == "priority" {
                push_priority_rank(&mut builder);
            } else {
                push_extract(&mut builder, &order.field);
            }
            builder.push(if order.ascending { " ASC" } else { " DESC" });
        }

        let bodies: Vec<String> = builder
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await?;
        bodies.iter().map(|body| parse_body(body)).collect()
    }

    async fn insert(
        &self,
        table: &str,
        mut fields: Map<String, Value>,
    ) -> Result<Value, RemoteError> {
        let id = match fields.get("id") {
            Some(Value::String(raw)) => Uuid::parse_str(raw).map_err(|_| RemoteError::Rejected {
                code: "invalid_id".to_string(),
                message: format!("{raw} is not a uuid"),
            })?,
            Some(Value::Null) | None => Uuid::new_v4(),
            Some(other) => {
                return Err(RemoteError::Rejected {
                    code: "invalid_id".to_string(),
                    message: format!("{other} is not a uuid"),
                });
            }
        };
        let now = timestamp_value(Utc::now());
        fields.insert("id".into(), Value::String(id.to_string()));
        fields
            .entry("created_at")
            .or_insert_with(|| now.clone());
        fields.insert("updated_at".into(), now);
        let row = Value::Object(fields);

        sqlx::query("INSERT INTO records (tbl, id, body) VALUES ($1, $2, $3)")
            .bind(table)
            .bind(id.to_string())
            .bind(row.to_string())
            .execute(&self.pool)
            .await?;

        self.publish(ChangeEvent::insert(table, row.clone()));
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        id: Uuid,
        fields: Map<String, Value>,
    ) -> Result<Value, RemoteError> {
        let mut tx = self.pool.begin().await?;
        let old = self.load(&mut *tx, table, id).await?;

        let mut merged = old.as_object().cloned().unwrap_or_default();
        for (key, value) in fields {
            if key != "id" {
                merged.insert(key, value);
            }
        }
        merged.insert("updated_at".into(), timestamp_value(Utc::now()));
        let new = Value::Object(merged);

        sqlx::query("UPDATE records SET body = $1 WHERE tbl = $2 AND id = $3")
            .bind(new.to_string())
            .bind(table)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.publish(ChangeEvent::update(table, new.clone(), old));
        Ok(new)
    }

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), RemoteError> {
        let mut tx = self.pool.begin().await?;
        let old = self.load(&mut *tx, table, id).await?;
        sqlx::query("DELETE FROM records WHERE tbl = $1 AND id = $2")
            .bind(table)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.publish(ChangeEvent::delete(table, old));
        Ok(())
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: Vec<Predicate>,
    ) -> Result<ChangeFeed, RemoteError> {
        let mut changes = self.changes.subscribe();
        let (tx, token, feed) = ChangeFeed::channel();
        let table = table.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(event) => {
                            if event.table != table || !event.matches(&filter) {
                                continue;
                            }
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(table = %table, skipped, "Change subscription lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(table = %table, "Change subscription closed");
        });

        Ok(feed)
    }
}

fn parse_body(body: &str) -> Result<Value, RemoteError> {
    serde_json::from_str(body).map_err(|e| RemoteError::Serde(e.to_string()))
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', ""))
}

fn push_extract(builder: &mut QueryBuilder<'_, Sqlite>, field: &str) {
    builder.push("json_extract(body, ");
    builder.push_bind(json_path(field));
    builder.push(")");
}

/// Priorities sort by urgency rank, not by their names. Unknown or missing
/// values rank as NULL.
fn push_priority_rank(builder: &mut QueryBuilder<'_, Sqlite>) {
    builder.push("CASE lower(trim(");
    push_extract(builder, "priority");
    builder.push("))");
    for priority in TaskPriority::ALL {
        builder.push(" WHEN ");
        builder.push_bind(priority.to_string());
        builder.push(" THEN ");
        builder.push_bind(i64::from(priority.rank()));
    }
    builder.push(" END");
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Bool(b) => builder.push_bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => builder.push_bind(i),
            None => builder.push_bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => builder.push_bind(s.clone()),
        other => builder.push_bind(other.to_string()),
    };
}

fn push_joined(builder: &mut QueryBuilder<'_, Sqlite>, inner: &[Predicate], separator: &str) {
    builder.push("(");
    for (i, predicate) in inner.iter().enumerate() {
        if i > 0 {
            builder.push(separator);
        }
        push_predicate(builder, predicate);
    }
    builder.push(")");
}

/// Compile a predicate. Null handling mirrors [`Predicate::matches`].
fn push_predicate(builder: &mut QueryBuilder<'_, Sqlite>, predicate: &Predicate) {
    match predicate {
        Predicate::Eq { field, value } if value.is_null() => {
            push_extract(builder, field);
            builder.push(" IS NULL");
        }
        Predicate::Eq { field, value } => {
            push_extract(builder, field);
            builder.push(" = ");
            push_value(builder, value);
        }
        Predicate::NotEq { field, value } if value.is_null() => {
            push_extract(builder, field);
            builder.push(" IS NOT NULL");
        }
        Predicate::NotEq { field, value } => {
            builder.push("(");
            push_extract(builder, field);
            builder.push(" IS NULL OR ");
            push_extract(builder, field);
            builder.push(" != ");
            push_value(builder, value);
            builder.push(")");
        }
        Predicate::Or(any) if any.is_empty() => {
            builder.push("0");
        }
        Predicate::And(all) if all.is_empty() => {
            builder.push("1");
        }
        Predicate::Or(inner) => push_joined(builder, inner, " OR "),
        Predicate::And(inner) => push_joined(builder, inner, " AND "),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::remote::ChangeKind;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn seeded() -> SqliteBackend {
        let backend = SqliteBackend::in_memory().await.unwrap();
        for (title, stage, due) in [
            ("Frame walls", "in-progress", Some("2025-04-02")),
            ("Pour slab", "completed", Some("2025-03-01")),
            ("Order windows", "not-started", None),
        ] {
            backend
                .insert(
                    "tasks",
                    fields(json!({"title": title, "stage": stage, "due_date": due})),
                )
                .await
                .unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_timestamps() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let row = backend
            .insert("tasks", fields(json!({"title": "Survey lot"})))
            .await
            .unwrap();
        let id = row["id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert!(row["created_at"].is_string());
        assert!(row["updated_at"].is_string());
    }

    #[tokio::test]
    async fn test_query_filters_and_orders() {
        let backend = seeded().await;
        let rows = backend
            .query(
                &RemoteQuery::table("tasks")
                    .filter(Predicate::not_eq("stage", "completed"))
                    .order_by("title", true),
            )
            .await
            .unwrap();
        let titles: Vec<&str> = rows.iter().filter_map(|r| r["title"].as_str()).collect();
        assert_eq!(titles, vec!["Frame walls", "Order windows"]);

        let rows = backend
            .query(&RemoteQuery::table("tasks").filter(Predicate::or(vec![
                Predicate::eq("stage", "completed"),
                Predicate::eq("due_date", Value::Null),
            ])))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = backend
            .query(&RemoteQuery::table("tasks").filter(Predicate::and(vec![
                Predicate::eq("stage", "in-progress"),
                Predicate::eq("due_date", "2025-04-02"),
            ])))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let rows = backend
            .query(&RemoteQuery::table("projects"))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_priority_orders_by_rank() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        for priority in [Some("medium"), Some("low"), None, Some("High"), Some("critical")] {
            backend
                .insert(
                    "tasks",
                    fields(json!({"title": priority.unwrap_or("none"), "priority": priority})),
                )
                .await
                .unwrap();
        }

        let rows = backend
            .query(&RemoteQuery::table("tasks").order_by("priority", false))
            .await
            .unwrap();
        let titles: Vec<&str> = rows.iter().filter_map(|r| r["title"].as_str()).collect();
        assert_eq!(titles, vec!["critical", "High", "medium", "low", "none"]);

        let rows = backend
            .query(&RemoteQuery::table("tasks").order_by("priority", true))
            .await
            .unwrap();
        let titles: Vec<&str> = rows.iter().filter_map(|r| r["title"].as_str()).collect();
        assert_eq!(titles, vec!["none", "low", "medium", "High", "critical"]);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let backend = seeded().await;
        let row = backend
            .insert("tasks", fields(json!({"title": "Rough plumbing", "stage": "blocked"})))
            .await
            .unwrap();
        let id = Uuid::parse_str(row["id"].as_str().unwrap()).unwrap();

        let updated = backend
            .update("tasks", id, fields(json!({"stage": "in-progress", "id": "ignored"})))
            .await
            .unwrap();
        assert_eq!(updated["stage"], "in-progress");
        assert_eq!(updated["title"], "Rough plumbing");
        assert_eq!(updated["id"], row["id"]);

        let missing = backend
            .update("tasks", Uuid::new_v4(), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(missing, RemoteError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_changes() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let mut feed = backend
            .subscribe("tasks", vec![Predicate::eq("stage", "blocked")])
            .await
            .unwrap();
        assert_eq!(backend.subscriber_count(), 1);

        backend
            .insert("tasks", fields(json!({"title": "Ignored", "stage": "completed"})))
            .await
            .unwrap();
        let row = backend
            .insert("tasks", fields(json!({"title": "Seen", "stage": "blocked"})))
            .await
            .unwrap();
        let id = Uuid::parse_str(row["id"].as_str().unwrap()).unwrap();
        backend.delete("tasks", id).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, ChangeKind::Insert);
        assert_eq!(first.new.as_ref().unwrap()["title"], "Seen");
        let second = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.kind, ChangeKind::Delete);

        feed.unsubscribe();
        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.subscriber_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
