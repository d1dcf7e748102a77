//! Local copy of the caller's visible tasks, kept in step with the remote store
//! through explicit fetches and a pushed change feed.

use std::sync::{Arc, Weak};

use db::{
    models::{
        session::SessionContext,
        task::{CreateTask, RowError, Task, TaskFilter, TaskOrder, TaskStage},
    },
    remote::{ChangeEvent, ChangeKind, Predicate, RemoteError, RemoteQuery, RemoteStore, matches_all},
};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::drag_drop::DragError;

#[derive(Debug, Error)]
pub enum TaskBoardError {
    #[error("failed to load tasks: {0}")]
    Fetch(#[source] RemoteError),
    #[error("update failed: {0}")]
    Write(#[source] RemoteError),
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {0} already has an update in flight")]
    ConcurrentMutation(Uuid),
    #[error("failed to subscribe to task changes: {0}")]
    Subscribe(#[source] RemoteError),
    #[error("remote returned an unusable row: {0}")]
    InvalidRow(#[from] RowError),
    #[error(transparent)]
    Drag(#[from] DragError),
}

/// Build the remote query for a fetch: role based visibility first, then the
/// caller's explicit filters and ordering.
///
/// Stage selection is only narrowed remotely where the raw value is
/// unambiguous; [`TaskFilter::admits`] settles it on the normalised tasks.
pub fn build_task_query(
    table: &str,
    session: &SessionContext,
    filter: &TaskFilter,
    default_order: TaskOrder,
) -> RemoteQuery {
    let mut query = RemoteQuery::table(table);

    if session.role.is_restricted() {
        let me = session.user_id.to_string();
        let mut visible = vec![
            Predicate::eq("assigned_to", me.clone()),
            Predicate::eq("created_by", me),
        ];
        if let Some(trade) = &session.trade_specialty {
            visible.push(Predicate::and(vec![
                Predicate::eq("assigned_to", Value::Null),
                Predicate::eq("trade_required", trade.clone()),
            ]));
        }
        query = query.filter(Predicate::or(visible));
    }

    if let Some(project_id) = filter.project_id {
        query = query.filter(Predicate::eq("project_id", project_id.to_string()));
    }
    if let Some(assigned_to) = filter.assigned_to {
        query = query.filter(Predicate::eq("assigned_to", assigned_to.to_string()));
    }
    if filter.stage.is_none() && !filter.include_completed {
        query = query.filter(Predicate::not_eq(
            "stage",
            TaskStage::Completed.to_string(),
        ));
    }

    let order = filter.order.unwrap_or(default_order);
    query.order_by(order.field.to_string(), order.ascending)
}

#[derive(Debug, Default)]
struct StoreState {
    tasks: Vec<Task>,
    loading: bool,
    error: Option<String>,
    filter: TaskFilter,
    predicates: Vec<Predicate>,
    fetches_in_flight: usize,
    /// Changes seen while a fetch runs, replayed over its result.
    replay: Vec<ChangeEvent>,
}

impl StoreState {
    fn end_fetch(&mut self) -> Vec<ChangeEvent> {
        self.fetches_in_flight = self.fetches_in_flight.saturating_sub(1);
        if self.fetches_in_flight == 0 {
            std::mem::take(&mut self.replay)
        } else {
            self.replay.clone()
        }
    }
}

struct ActiveFeed {
    filter: TaskFilter,
    pump: JoinHandle<()>,
}

struct StoreShared {
    remote: Arc<dyn RemoteStore>,
    session: SessionContext,
    table: String,
    default_order: TaskOrder,
    state: Mutex<StoreState>,
    revision: watch::Sender<u64>,
    feed: Mutex<Option<ActiveFeed>>,
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.get_mut().take() {
            feed.pump.abort();
        }
    }
}

/// Cheap to clone; clones share the same task list.
#[derive(Clone)]
pub struct TaskStore {
    shared: Arc<StoreShared>,
}

impl TaskStore {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        session: SessionContext,
        table: impl Into<String>,
        default_order: TaskOrder,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(StoreShared {
                remote,
                session,
                table: table.into(),
                default_order,
                state: Mutex::new(StoreState::default()),
                revision,
                feed: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.shared.session
    }

    pub fn table(&self) -> &str {
        &self.shared.table
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.shared.remote
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.shared.state.lock().tasks.clone()
    }

    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.shared
            .state
            .lock()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn loading(&self) -> bool {
        self.shared.state.lock().loading
    }

    pub fn error(&self) -> Option<String> {
        self.shared.state.lock().error.clone()
    }

    pub fn filter(&self) -> TaskFilter {
        self.shared.state.lock().filter.clone()
    }

    /// Bumped after every local change to the task list.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared
            .feed
            .lock()
            .as_ref()
            .is_some_and(|feed| !feed.pump.is_finished())
    }

    /// Replace the local list with the tasks matching `filter` and make sure
    /// the change feed follows the same filter. On failure the previous list
    /// is kept and the error is recorded for display.
    pub async fn fetch(&self, filter: TaskFilter) -> Result<Vec<Task>, TaskBoardError> {
        self.load(filter, true).await
    }

    /// Re-run the current fetch with the loading indicator.
    pub async fn refresh(&self) -> Result<Vec<Task>, TaskBoardError> {
        self.load(self.filter(), true).await
    }

    /// Re-run the current fetch without flipping the loading indicator.
    pub async fn refresh_soft(&self) -> Result<Vec<Task>, TaskBoardError> {
        self.load(self.filter(), false).await
    }

    async fn load(&self, filter: TaskFilter, show_loading: bool) -> Result<Vec<Task>, TaskBoardError> {
        self.update_state(|state| {
            state.fetches_in_flight += 1;
            state.loading |= show_loading;
            show_loading
        });

        let query = build_task_query(
            &self.shared.table,
            &self.shared.session,
            &filter,
            self.shared.default_order,
        );
        // Subscribed before querying: anything committed while the query runs
        // arrives on the feed and is replayed over the result.
        let fetched = match self.ensure_subscription(&filter, query.predicates.clone()).await {
            Ok(()) => self
                .shared
                .remote
                .query(&query)
                .await
                .map_err(TaskBoardError::Fetch),
            Err(e) => Err(e),
        };
        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Task fetch failed, keeping previous tasks");
                self.update_state(|state| {
                    state.end_fetch();
                    state.loading = false;
                    state.error = Some(e.to_string());
                    true
                });
                return Err(e);
            }
        };

        let tasks: Vec<Task> = rows
            .iter()
            .filter_map(|row| {
                Task::from_wire(row)
                    .inspect_err(|e| warn!(error = %e, "Skipping malformed task row"))
                    .ok()
            })
            .filter(|task| filter.admits(task))
            .collect();
        info!(count = tasks.len(), role = %self.shared.session.role, "Fetched tasks");

        let mut current = Vec::new();
        self.update_state(|state| {
            state.tasks = tasks;
            state.loading = false;
            state.error = None;
            state.filter = filter;
            state.predicates = query.predicates;
            let replay = state.end_fetch();
            if !replay.is_empty() {
                debug!(count = replay.len(), "Replaying changes seen during fetch");
            }
            for event in &replay {
                apply_event(state, event);
            }
            current = state.tasks.clone();
            true
        });
        Ok(current)
    }

    /// (Re)subscribe when the filter changed or the previous feed ended.
    async fn ensure_subscription(
        &self,
        filter: &TaskFilter,
        predicates: Vec<Predicate>,
    ) -> Result<(), TaskBoardError> {
        let current = self
            .shared
            .feed
            .lock()
            .as_ref()
            .is_some_and(|feed| feed.filter == *filter && !feed.pump.is_finished());
        if current {
            return Ok(());
        }

        let mut feed = self
            .shared
            .remote
            .subscribe(&self.shared.table, predicates)
            .await
            .map_err(TaskBoardError::Subscribe)?;

        let store: Weak<StoreShared> = Arc::downgrade(&self.shared);
        let pump = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                let Some(shared) = store.upgrade() else {
                    break;
                };
                TaskStore { shared }.apply_remote_change(&event);
            }
        });

        let previous = self.shared.feed.lock().replace(ActiveFeed {
            filter: filter.clone(),
            pump,
        });
        if let Some(previous) = previous {
            previous.pump.abort();
        }
        info!(table = %self.shared.table, "Subscribed to task changes");
        Ok(())
    }

    /// Release the change subscription.
    pub fn teardown(&self) {
        if let Some(feed) = self.shared.feed.lock().take() {
            feed.pump.abort();
            info!(table = %self.shared.table, "Unsubscribed from task changes");
        }
    }

    /// Apply one pushed row change. Replaying the same event is a no-op, and a
    /// row older than the local copy is ignored. Returns whether the list changed.
    pub fn apply_remote_change(&self, event: &ChangeEvent) -> bool {
        if event.table != self.shared.table {
            return false;
        }
        self.update_state(|state| {
            if state.fetches_in_flight > 0 {
                state.replay.push(event.clone());
            }
            apply_event(state, event)
        })
    }

    /// Insert a task remotely and add the row the server returned.
    pub async fn create(&self, data: &CreateTask) -> Result<Task, TaskBoardError> {
        let row = self
            .shared
            .remote
            .insert(&self.shared.table, data.to_wire(self.shared.session.user_id))
            .await
            .map_err(TaskBoardError::Write)?;
        let task = Task::from_wire(&row)?;
        info!(task_id = %task.id, "Task created");
        let visible = {
            let state = self.shared.state.lock();
            matches_all(&state.predicates, &row) && state.filter.admits(&task)
        };
        if visible {
            self.update_state(|state| upsert(&mut state.tasks, task.clone()));
        }
        Ok(task)
    }

    /// Delete remotely, then drop the local copy once the server acknowledged it.
    pub async fn delete(&self, id: Uuid) -> Result<(), TaskBoardError> {
        if self.task(id).is_none() {
            warn!(task_id = %id, "Delete requested for unknown task");
            return Err(TaskBoardError::NotFound(id));
        }
        self.shared
            .remote
            .delete(&self.shared.table, id)
            .await
            .map_err(TaskBoardError::Write)?;
        self.update_state(|state| remove(&mut state.tasks, id).is_some());
        info!(task_id = %id, "Task deleted");
        Ok(())
    }

    /// Run `f` on the local copy of a task under the store lock.
    pub(crate) fn modify_task<R>(&self, id: Uuid, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let mut result = None;
        self.update_state(|state| match state.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                result = Some(f(task));
                true
            }
            None => false,
        });
        result
    }

    /// Overwrite the local copy of `task` if it is still present and no newer
    /// version of the row has landed in the meantime.
    pub(crate) fn reconcile(&self, task: Task) -> bool {
        self.update_state(|state| match state.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(slot) if is_stale(slot, &task) => {
                debug!(task_id = %task.id, "Keeping newer local copy");
                false
            }
            Some(slot) if *slot != task => {
                *slot = task;
                true
            }
            _ => false,
        })
    }

    fn update_state(&self, f: impl FnOnce(&mut StoreState) -> bool) -> bool {
        let changed = f(&mut self.shared.state.lock());
        if changed {
            self.shared.revision.send_modify(|rev| *rev += 1);
        }
        changed
    }
}

/// Apply one change to the local list under the store lock.
fn apply_event(state: &mut StoreState, event: &ChangeEvent) -> bool {
    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let Some(row) = event.new.as_ref() else {
                return false;
            };
            let task = match Task::from_wire(row) {
                Ok(task) => task,
                Err(e) => {
                    warn!(error = %e, kind = %event.kind, "Ignoring malformed change row");
                    return false;
                }
            };
            let task_id = task.id;
            let changed = if matches_all(&state.predicates, row) && state.filter.admits(&task) {
                upsert(&mut state.tasks, task)
            } else {
                remove(&mut state.tasks, task_id).is_some()
            };
            debug!(task_id = %task_id, kind = %event.kind, changed, "Applied remote change");
            changed
        }
        ChangeKind::Delete => {
            let Some(task_id) = event
                .old
                .as_ref()
                .and_then(|row| row.get("id"))
                .and_then(Value::as_str)
                .and_then(|raw| Uuid::parse_str(raw).ok())
            else {
                warn!("Ignoring delete event without a usable id");
                return false;
            };
            let changed = remove(&mut state.tasks, task_id).is_some();
            debug!(task_id = %task_id, changed, "Applied remote delete");
            changed
        }
    }
}

fn is_stale(local: &Task, incoming: &Task) -> bool {
    matches!(
        (local.updated_at, incoming.updated_at),
        (Some(local), Some(incoming)) if incoming < local
    )
}

fn upsert(tasks: &mut Vec<Task>, task: Task) -> bool {
    match tasks.iter_mut().find(|t| t.id == task.id) {
        Some(existing) => {
            if is_stale(existing, &task) {
                debug!(task_id = %task.id, "Ignoring stale row");
                return false;
            }
            if *existing == task {
                return false;
            }
            *existing = task;
            true
        }
        None => {
            tasks.push(task);
            true
        }
    }
}

fn remove(tasks: &mut Vec<Task>, id: Uuid) -> Option<Task> {
    let index = tasks.iter().position(|t| t.id == id)?;
    Some(tasks.remove(index))
}

#[cfg(test)]
mod tests {
    use db::models::{session::UserRole, task::TaskOrderField};
    use serde_json::json;

    use super::*;

    fn session(role: UserRole) -> SessionContext {
        SessionContext::new(Uuid::nil(), role)
    }

    #[test]
    fn test_restricted_role_sees_own_tasks_only() {
        let worker = session(UserRole::Worker).with_trade("electrical");
        let query = build_task_query("tasks", &worker, &TaskFilter::default(), TaskOrder::default());

        let mine = json!({"assigned_to": Uuid::nil().to_string(), "stage": "blocked"});
        let created = json!({"created_by": Uuid::nil().to_string(), "stage": "in-progress"});
        let trade_pool = json!({"assigned_to": null, "trade_required": "electrical"});
        let others = json!({"assigned_to": Uuid::new_v4().to_string(), "trade_required": "electrical"});
        let done = json!({"assigned_to": Uuid::nil().to_string(), "stage": "completed"});

        assert!(matches_all(&query.predicates, &mine));
        assert!(matches_all(&query.predicates, &created));
        assert!(matches_all(&query.predicates, &trade_pool));
        assert!(!matches_all(&query.predicates, &others));
        assert!(!matches_all(&query.predicates, &done));
    }

    #[test]
    fn test_elevated_role_is_scoped_by_filters_only() {
        let project = Uuid::new_v4();
        let filter = TaskFilter {
            project_id: Some(project),
            include_completed: true,
            order: Some(TaskOrder {
                field: TaskOrderField::CreatedAt,
                ascending: false,
            }),
            ..Default::default()
        };
        let query = build_task_query(
            "tasks",
            &session(UserRole::ProjectManager),
            &filter,
            TaskOrder::default(),
        );
        assert_eq!(
            query.predicates,
            vec![Predicate::eq("project_id", project.to_string())]
        );
        let order = query.order.unwrap();
        assert_eq!(order.field, "created_at");
        assert!(!order.ascending);
    }

    #[test]
    fn test_explicit_stage_filter_is_settled_locally() {
        for stage in [TaskStage::Completed, TaskStage::NotStarted] {
            let filter = TaskFilter {
                stage: Some(stage),
                ..Default::default()
            };
            let query = build_task_query("tasks", &session(UserRole::Admin), &filter, TaskOrder::default());
            // A stage-less or `in_progress` row must still reach the client.
            assert!(query.predicates.is_empty());
            assert!(matches_all(&query.predicates, &json!({"title": "no stage"})));
            assert_eq!(query.order.unwrap().field, "due_date");
        }
    }

    #[test]
    fn test_replay_buffer_survives_overlapping_fetches() {
        let mut state = StoreState {
            fetches_in_flight: 2,
            ..Default::default()
        };
        state
            .replay
            .push(ChangeEvent::delete("tasks", json!({"id": Uuid::nil().to_string()})));
        assert_eq!(state.end_fetch().len(), 1);
        assert_eq!(state.replay.len(), 1);
        assert_eq!(state.end_fetch().len(), 1);
        assert!(state.replay.is_empty());
        assert_eq!(state.fetches_in_flight, 0);
    }

    #[test]
    fn test_upsert_is_idempotent_and_ignores_stale_rows() {
        let newer = Task::from_wire(&json!({
            "id": Uuid::new_v4().to_string(),
            "title": "Hang drywall",
            "updated_at": "2025-03-02T10:00:00Z",
        }))
        .unwrap();
        let mut older = newer.clone();
        older.title = "Old title".into();
        older.updated_at = "2025-03-01T10:00:00Z".parse().ok();

        let mut tasks = Vec::new();
        assert!(upsert(&mut tasks, newer.clone()));
        assert!(!upsert(&mut tasks, newer.clone()));
        assert!(!upsert(&mut tasks, older));
        assert_eq!(tasks, vec![newer]);
    }
}
