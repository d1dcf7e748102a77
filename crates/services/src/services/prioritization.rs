//! Best-effort AI ordering of open tasks with a deterministic fallback.
//!
//! Failures here never reach the user: whatever goes wrong, callers get the
//! fallback order (priority rank, then due date).

use std::{cmp::Reverse, collections::HashSet};

use async_trait::async_trait;
use db::models::task::Task;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ai_client::{AiClient, AiClientError},
    config::PrioritizationConfig,
    stage_lanes::compare_due,
};

const SYSTEM_PROMPT: &str = "You schedule work on a construction site. Order the given tasks \
from most to least urgent, weighing safety, due dates, declared priority, weather dependency \
and trade availability. Reply with JSON only: {\"order\": [\"<task id>\", ...]}.";

#[derive(Debug, Error)]
pub enum PrioritizationError {
    #[error("prioritisation is disabled")]
    Disabled,
    #[error("{count} tasks exceed the limit of {max}")]
    TooManyTasks { count: usize, max: usize },
    #[error(transparent)]
    Client(#[from] AiClientError),
}

#[async_trait]
pub trait TaskPrioritizer: Send + Sync {
    /// Task ids, most urgent first. May be partial or contain unknown ids;
    /// [`prioritize`] cleans the result up.
    async fn rank(&self, tasks: &[Task]) -> Result<Vec<Uuid>, PrioritizationError>;
}

#[derive(Debug, Serialize)]
struct TaskBrief<'a> {
    id: Uuid,
    title: &'a str,
    stage: String,
    priority: Option<String>,
    due_date: Option<String>,
    weather_dependent: Option<bool>,
    trade_required: Option<&'a str>,
    safety_notes: Option<&'a str>,
}

impl<'a> From<&'a Task> for TaskBrief<'a> {
    fn from(task: &'a Task) -> Self {
        Self {
            id: task.id,
            title: &task.title,
            stage: task.stage.to_string(),
            priority: task.priority.map(|p| p.to_string()),
            due_date: task.due_date.map(|d| d.to_string()),
            weather_dependent: task.metadata.weather_dependent,
            trade_required: task.metadata.trade_required.as_deref(),
            safety_notes: task.metadata.safety_notes.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RankedReply {
    order: Vec<String>,
}

pub struct ClaudePrioritizer {
    client: AiClient,
    max_tasks: usize,
}

impl ClaudePrioritizer {
    pub fn new(client: AiClient, max_tasks: usize) -> Self {
        Self { client, max_tasks }
    }

    pub fn from_config(config: &PrioritizationConfig) -> Result<Self, PrioritizationError> {
        if !config.enabled {
            return Err(PrioritizationError::Disabled);
        }
        Ok(Self::new(AiClient::from_config(config)?, config.max_tasks))
    }
}

#[async_trait]
impl TaskPrioritizer for ClaudePrioritizer {
    async fn rank(&self, tasks: &[Task]) -> Result<Vec<Uuid>, PrioritizationError> {
        if tasks.len() > self.max_tasks {
            return Err(PrioritizationError::TooManyTasks {
                count: tasks.len(),
                max: self.max_tasks,
            });
        }
        let briefs: Vec<TaskBrief<'_>> = tasks.iter().map(TaskBrief::from).collect();
        let prompt = json!({ "tasks": briefs }).to_string();
        let reply: RankedReply = self.client.ask_json(SYSTEM_PROMPT, &prompt).await?;
        debug!(model = %self.client.model(), ranked = reply.order.len(), "Model ranked tasks");
        Ok(reply
            .order
            .iter()
            .filter_map(|raw| Uuid::parse_str(raw.trim()).ok())
            .collect())
    }
}

/// Priority rank (critical first, unprioritised last), then due date with
/// undated tasks last. Ties keep input order.
pub fn fallback_order(tasks: &[Task]) -> Vec<Task> {
    let mut ordered = tasks.to_vec();
    ordered.sort_by(|a, b| {
        Reverse(a.priority.map_or(0, |p| p.rank()))
            .cmp(&Reverse(b.priority.map_or(0, |p| p.rank())))
            .then_with(|| compare_due(a, b))
    });
    ordered
}

/// Order `tasks` using `prioritizer` when one is available.
///
/// Ids the prioritiser invents are dropped, repeats are ignored, and tasks it
/// leaves out are appended in fallback order. Any error yields the fallback.
pub async fn prioritize(prioritizer: Option<&dyn TaskPrioritizer>, tasks: &[Task]) -> Vec<Task> {
    let fallback = fallback_order(tasks);
    let Some(prioritizer) = prioritizer else {
        return fallback;
    };
    if tasks.len() < 2 {
        return fallback;
    }

    let ranked = match prioritizer.rank(tasks).await {
        Ok(ranked) => ranked,
        Err(e) => {
            warn!(error = %e, "AI prioritisation unavailable, using fallback order");
            return fallback;
        }
    };

    let mut placed = HashSet::with_capacity(tasks.len());
    let mut ordered: Vec<Task> = Vec::with_capacity(tasks.len());
    for id in ranked {
        if placed.contains(&id) {
            continue;
        }
        match tasks.iter().find(|t| t.id == id) {
            Some(task) => {
                placed.insert(id);
                ordered.push(task.clone());
            }
            None => debug!(task_id = %id, "Dropping unknown id from ranking"),
        }
    }
    let missing = tasks.len() - ordered.len();
    ordered.extend(fallback.into_iter().filter(|t| !placed.contains(&t.id)));
    info!(total = ordered.len(), appended = missing, "Tasks prioritised");
    ordered
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn task(title: &str, priority: Option<&str>, due: Option<&str>) -> Task {
        Task::from_wire(&json!({
            "id": Uuid::new_v4().to_string(),
            "title": title,
            "priority": priority,
            "due_date": due,
        }))
        .unwrap()
    }

    fn titles(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.title.as_str()).collect()
    }

    struct Fixed(Vec<Uuid>);

    #[async_trait]
    impl TaskPrioritizer for Fixed {
        async fn rank(&self, _tasks: &[Task]) -> Result<Vec<Uuid>, PrioritizationError> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl TaskPrioritizer for Broken {
        async fn rank(&self, _tasks: &[Task]) -> Result<Vec<Uuid>, PrioritizationError> {
            Err(AiClientError::RateLimited.into())
        }
    }

    fn sample() -> Vec<Task> {
        vec![
            task("paint", None, Some("2025-01-01")),
            task("wiring", Some("high"), Some("2025-03-01")),
            task("scaffold", Some("critical"), None),
            task("roof", Some("high"), Some("2025-02-01")),
            task("cleanup", Some("low"), None),
        ]
    }

    #[test]
    fn test_fallback_orders_by_rank_then_due_date() {
        let ordered = fallback_order(&sample());
        assert_eq!(
            titles(&ordered),
            vec!["scaffold", "roof", "wiring", "cleanup", "paint"]
        );
    }

    #[tokio::test]
    async fn test_errors_fall_back_silently() {
        let tasks = sample();
        let ordered = prioritize(Some(&Broken), &tasks).await;
        assert_eq!(ordered, fallback_order(&tasks));
        assert_eq!(prioritize(None, &tasks).await, fallback_order(&tasks));
    }

    #[tokio::test]
    async fn test_ranking_is_validated() {
        let tasks = sample();
        let ranking = Fixed(vec![
            tasks[4].id,
            Uuid::new_v4(),
            tasks[0].id,
            tasks[4].id,
        ]);
        let ordered = prioritize(Some(&ranking), &tasks).await;
        assert_eq!(
            titles(&ordered),
            vec!["cleanup", "paint", "scaffold", "roof", "wiring"]
        );
    }

    #[test]
    fn test_brief_carries_site_metadata() {
        let mut t = task("pour slab", Some("medium"), Some("2025-05-05"));
        t.metadata.weather_dependent = Some(true);
        let brief = serde_json::to_value(TaskBrief::from(&t)).unwrap();
        assert_eq!(brief["priority"], "medium");
        assert_eq!(brief["due_date"], "2025-05-05");
        assert_eq!(brief["weather_dependent"], Value::Bool(true));
    }

    #[test]
    fn test_disabled_config_refuses_to_build() {
        let config = PrioritizationConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(matches!(
            ClaudePrioritizer::from_config(&config),
            Err(PrioritizationError::Disabled)
        ));
    }
}
