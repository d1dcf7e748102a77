//! The surface a presentation layer binds to: task list state, lane
//! buckets, imperative task operations and drag gesture entry points.

use std::sync::Arc;

use db::{
    models::{
        session::SessionContext,
        task::{CreateTask, Task, TaskFilter, TaskPatch, TaskStage},
    },
    remote::RemoteStore,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    config::BoardConfig,
    drag_drop::{DragController, DragEnd, DragObserver, DragSession, DropOutcome, LaneLayout, Point},
    notification::AlertSink,
    optimistic::{MutationEngine, MutationHandle},
    prioritization::{TaskPrioritizer, prioritize},
    stage_lanes::{StageBuckets, classify},
    task_store::{TaskBoardError, TaskStore},
};

pub struct TaskBoard {
    store: TaskStore,
    mutations: MutationEngine,
    drag: Mutex<DragController>,
    observers: RwLock<Vec<Arc<dyn DragObserver>>>,
    alerts: Arc<dyn AlertSink>,
    prioritizer: Option<Arc<dyn TaskPrioritizer>>,
}

impl TaskBoard {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        session: SessionContext,
        config: &BoardConfig,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let store = TaskStore::new(
            remote,
            session,
            config.tasks_table.clone(),
            config.default_order,
        );
        let mutations = MutationEngine::new(store.clone(), alerts.clone(), config.write_timeout());
        Self {
            store,
            mutations,
            drag: Mutex::new(DragController::default()),
            observers: RwLock::new(Vec::new()),
            alerts,
            prioritizer: None,
        }
    }

    pub fn with_prioritizer(mut self, prioritizer: Arc<dyn TaskPrioritizer>) -> Self {
        self.prioritizer = Some(prioritizer);
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn mutations(&self) -> &MutationEngine {
        &self.mutations
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.store.tasks()
    }

    pub fn loading(&self) -> bool {
        self.store.loading()
    }

    pub fn error(&self) -> Option<String> {
        self.store.error()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.store.watch()
    }

    pub fn tasks_by_stage(&self) -> StageBuckets<Task> {
        let tasks = self.store.tasks();
        classify(&tasks).map(Clone::clone)
    }

    /// Load tasks for `filter`, moving the change subscription along with it.
    pub async fn set_filter(&self, filter: TaskFilter) -> Result<Vec<Task>, TaskBoardError> {
        self.store.fetch(filter).await
    }

    pub async fn refresh_tasks(&self) -> Result<Vec<Task>, TaskBoardError> {
        self.store.refresh().await
    }

    pub async fn refresh_tasks_soft(&self) -> Result<Vec<Task>, TaskBoardError> {
        self.store.refresh_soft().await
    }

    pub async fn create_task(&self, data: CreateTask) -> Result<Task, TaskBoardError> {
        self.store.create(&data).await.inspect_err(|e| {
            if let TaskBoardError::Write(cause) = e {
                self.alerts.alert("Create Failed", &cause.to_string());
            }
        })
    }

    /// Optimistically apply `patch`; the returned handle settles once the
    /// server accepted or the change was rolled back.
    pub fn update_task(&self, id: Uuid, patch: TaskPatch) -> Result<MutationHandle, TaskBoardError> {
        self.mutations.mutate(id, patch, true)
    }

    pub fn update_task_stage(
        &self,
        id: Uuid,
        stage: TaskStage,
    ) -> Result<MutationHandle, TaskBoardError> {
        info!(task_id = %id, stage = %stage, "Moving task");
        self.update_task(id, TaskPatch::stage(stage))
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<(), TaskBoardError> {
        if self.mutations.is_pending(id) {
            warn!(task_id = %id, "Refusing to delete a task with an update in flight");
            return Err(TaskBoardError::ConcurrentMutation(id));
        }
        self.store.delete(id).await.inspect_err(|e| {
            if let TaskBoardError::Write(cause) = e {
                self.alerts.alert("Delete Failed", &cause.to_string());
            }
        })
    }

    pub fn set_layout(&self, layout: LaneLayout) {
        self.drag.lock().set_layout(layout);
    }

    pub fn add_drag_observer(&self, observer: Arc<dyn DragObserver>) {
        self.observers.write().push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn DragObserver>> {
        self.observers.read().clone()
    }

    fn notify_end(&self, end: &DragEnd) {
        for observer in self.observers() {
            observer.on_drag_end(&end.session, &end.outcome);
        }
    }

    pub fn drag_session(&self) -> Option<DragSession> {
        self.drag.lock().session().cloned()
    }

    pub fn begin_drag(&self, task_id: Uuid, at: Point) -> Result<DragSession, TaskBoardError> {
        let task = self
            .store
            .task(task_id)
            .ok_or(TaskBoardError::NotFound(task_id))?;
        let session = self.drag.lock().begin(&task, at)?.clone();
        for observer in self.observers() {
            observer.on_drag_start(&session);
        }
        Ok(session)
    }

    pub fn drag_move(&self, at: Point) -> Result<Option<TaskStage>, TaskBoardError> {
        Ok(self.drag.lock().drag_move(at)?)
    }

    /// Finish the gesture. A drop on a lane other than the one the task is in
    /// now issues exactly one stage change; anything else issues none.
    pub fn end_drag(&self, at: Point) -> Result<Option<MutationHandle>, TaskBoardError> {
        let end = {
            let mut drag = self.drag.lock();
            let current = drag
                .session()
                .and_then(|session| self.store.task(session.task_id))
                .map(|task| task.stage);
            match current {
                Some(stage) => drag.release_from(at, stage)?,
                None => drag.release(at)?,
            }
        };
        let result = match end.outcome {
            DropOutcome::Moved { task_id, to, .. } => self.update_task_stage(task_id, to).map(Some),
            DropOutcome::SameLane | DropOutcome::NoTarget | DropOutcome::Cancelled => Ok(None),
        };
        self.notify_end(&end);
        result
    }

    pub fn cancel_drag(&self) -> Result<(), TaskBoardError> {
        let end = self.drag.lock().cancel()?;
        self.notify_end(&end);
        Ok(())
    }

    /// Open tasks in suggested working order.
    pub async fn prioritized_tasks(&self) -> Vec<Task> {
        let open: Vec<Task> = self
            .store
            .tasks()
            .into_iter()
            .filter(|t| !t.is_completed())
            .collect();
        prioritize(self.prioritizer.as_deref(), &open).await
    }

    /// Release the change subscription. In-flight mutations still settle.
    pub fn teardown(&self) {
        let cancelled = self.drag.lock().cancel();
        if let Ok(end) = cancelled {
            debug!(task_id = %end.session.task_id, "Cancelled drag on teardown");
            self.notify_end(&end);
        }
        self.store.teardown();
    }
}

impl Drop for TaskBoard {
    fn drop(&mut self) {
        self.store.teardown();
    }
}
