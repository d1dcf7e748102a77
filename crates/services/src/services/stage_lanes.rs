//! Partition of a task list into the four stage lanes.

use std::cmp::Ordering;

use db::models::task::{Task, TaskStage};
use serde::Serialize;

/// Tasks grouped by stage. Derived from the store, never mutated on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageBuckets<T> {
    pub not_started: Vec<T>,
    pub in_progress: Vec<T>,
    pub completed: Vec<T>,
    pub blocked: Vec<T>,
}

impl<T> Default for StageBuckets<T> {
    fn default() -> Self {
        Self {
            not_started: Vec::new(),
            in_progress: Vec::new(),
            completed: Vec::new(),
            blocked: Vec::new(),
        }
    }
}

impl<T> StageBuckets<T> {
    pub fn get(&self, stage: TaskStage) -> &[T] {
        match stage {
            TaskStage::NotStarted => &self.not_started,
            TaskStage::InProgress => &self.in_progress,
            TaskStage::Completed => &self.completed,
            TaskStage::Blocked => &self.blocked,
        }
    }

    fn get_mut(&mut self, stage: TaskStage) -> &mut Vec<T> {
        match stage {
            TaskStage::NotStarted => &mut self.not_started,
            TaskStage::InProgress => &mut self.in_progress,
            TaskStage::Completed => &mut self.completed,
            TaskStage::Blocked => &mut self.blocked,
        }
    }

    /// Lanes in presentation order.
    pub fn iter(&self) -> impl Iterator<Item = (TaskStage, &[T])> {
        TaskStage::ALL.into_iter().map(move |stage| (stage, self.get(stage)))
    }

    pub fn total(&self) -> usize {
        TaskStage::ALL.iter().map(|stage| self.get(*stage).len()).sum()
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> StageBuckets<U> {
        StageBuckets {
            not_started: self.not_started.into_iter().map(&mut f).collect(),
            in_progress: self.in_progress.into_iter().map(&mut f).collect(),
            completed: self.completed.into_iter().map(&mut f).collect(),
            blocked: self.blocked.into_iter().map(&mut f).collect(),
        }
    }
}

/// Due date ordering: earliest first, tasks without a due date last.
pub fn compare_due(a: &Task, b: &Task) -> Ordering {
    match (a.due_date, b.due_date) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Group tasks by stage, each lane sorted by due date. Ties keep input order.
pub fn classify(tasks: &[Task]) -> StageBuckets<&Task> {
    let mut buckets = StageBuckets::default();
    for task in tasks {
        buckets.get_mut(task.stage).push(task);
    }
    for stage in TaskStage::ALL {
        buckets.get_mut(stage).sort_by(|a, b| compare_due(a, b));
    }
    buckets
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn task(title: &str, stage: &str, due: Option<&str>) -> Task {
        Task::from_wire(&json!({
            "id": Uuid::new_v4().to_string(),
            "title": title,
            "stage": stage,
            "due_date": due,
        }))
        .unwrap()
    }

    #[test]
    fn test_every_task_lands_in_exactly_one_lane() {
        let tasks = vec![
            task("a", "not-started", Some("2025-05-01")),
            task("b", "in-progress", None),
            task("c", "completed", Some("2025-01-01")),
            task("d", "blocked", Some("2025-02-01")),
            task("e", "in-progress", Some("2025-03-01")),
            task("f", "not-started", None),
            task("g", "bogus", Some("2025-04-01")),
        ];
        let buckets = classify(&tasks);
        assert_eq!(buckets.total(), tasks.len());

        let mut seen: Vec<Uuid> = buckets
            .iter()
            .flat_map(|(_, lane)| lane.iter().map(|t| t.id))
            .collect();
        seen.sort();
        let mut expected: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        expected.sort();
        assert_eq!(seen, expected);

        for (stage, lane) in buckets.iter() {
            assert!(lane.iter().all(|t| t.stage == stage));
        }
    }

    #[test]
    fn test_lanes_sort_by_due_date_with_missing_dates_last() {
        let tasks = vec![
            task("late", "not-started", Some("2025-06-01")),
            task("undated-1", "not-started", None),
            task("early", "not-started", Some("2025-01-15")),
            task("undated-2", "not-started", None),
        ];
        let buckets = classify(&tasks);
        let titles: Vec<&str> = buckets
            .get(TaskStage::NotStarted)
            .iter()
            .map(|t| t.title.as_str())
            .collect();
        assert_eq!(titles, vec!["early", "late", "undated-1", "undated-2"]);
        assert!(buckets.get(TaskStage::Blocked).is_empty());
    }

    #[test]
    fn test_unknown_stage_is_not_started() {
        let tasks = vec![task("mystery", "on-hold", None)];
        let buckets = classify(&tasks);
        assert_eq!(buckets.not_started.len(), 1);
    }

    #[test]
    fn test_classify_leaves_input_untouched() {
        let tasks = vec![
            task("b", "blocked", Some("2025-02-02")),
            task("a", "blocked", Some("2025-01-01")),
        ];
        let before = tasks.clone();
        let owned = classify(&tasks).map(Clone::clone);
        assert_eq!(tasks, before);
        assert_eq!(
            owned.blocked[0].due_date,
            NaiveDate::from_ymd_opt(2025, 1, 1)
        );
    }
}
