use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Lifecycle lane of a task. The set is closed: anything else read off the
/// wire is normalised to `NotStarted`.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumString,
    Display,
    Default,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TaskStage {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStage {
    /// Lane order used for presentation.
    pub const ALL: [TaskStage; 4] = [
        TaskStage::NotStarted,
        TaskStage::InProgress,
        TaskStage::Completed,
        TaskStage::Blocked,
    ];

    /// Fixed mapping onto the legacy `status` column.
    pub fn legacy_status(self) -> LegacyStatus {
        match self {
            TaskStage::NotStarted => LegacyStatus::Todo,
            TaskStage::InProgress => LegacyStatus::InProgress,
            TaskStage::Completed => LegacyStatus::Completed,
            TaskStage::Blocked => LegacyStatus::Todo,
        }
    }

    /// Parse a raw stage value, accepting `in_progress` and mixed case spellings.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        Self::from_str(&normalized).ok()
    }

    /// Ingestion rule: missing or unrecognised values become `NotStarted`.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw {
            None => TaskStage::NotStarted,
            Some(value) => Self::parse_lenient(value).unwrap_or_else(|| {
                warn!(stage = %value, "Unknown task stage, treating as not-started");
                TaskStage::NotStarted
            }),
        }
    }
}

/// Backward compatible status string still read by older consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LegacyStatus {
    Todo,
    InProgress,
    Completed,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Low,
        TaskPriority::Medium,
        TaskPriority::High,
        TaskPriority::Critical,
    ];

    /// Higher rank is more urgent.
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Medium => 2,
            TaskPriority::High => 3,
            TaskPriority::Critical => 4,
        }
    }
}

/// Site metadata carried along with a task. The engine never interprets it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub trade_required: Option<String>,
    pub weather_dependent: Option<bool>,
    pub safety_notes: Option<String>,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
}

/// Canonical in-memory task. Only [`Task::from_wire`] and [`Task::to_wire`]
/// know about the shapes rows take on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub stage: TaskStage,
    pub status: LegacyStatus,
    pub priority: Option<TaskPriority>,
    pub project_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    pub created_by: Option<Uuid>,
    #[serde(flatten)]
    pub metadata: TaskMetadata,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowError {
    #[error("row is not a JSON object")]
    NotAnObject,
    #[error("row has no id")]
    MissingId,
    #[error("row id is not a uuid: {0}")]
    InvalidId(String),
}

impl Task {
    /// Convert a wire row into the canonical shape.
    ///
    /// Rows may carry snake_case and camelCase spellings of the same column
    /// side by side; the snake_case value wins when both are present and
    /// non-null.
    pub fn from_wire(row: &Value) -> Result<Self, RowError> {
        let obj = row.as_object().ok_or(RowError::NotAnObject)?;

        let id = match pick(obj, &["id"]) {
            Some(Value::String(raw)) => {
                Uuid::parse_str(raw).map_err(|_| RowError::InvalidId(raw.clone()))?
            }
            Some(other) => return Err(RowError::InvalidId(other.to_string())),
            None => return Err(RowError::MissingId),
        };

        let stage = TaskStage::normalize(pick_str(obj, &["stage"]));
        let status = pick_str(obj, &["status"])
            .and_then(|raw| LegacyStatus::from_str(raw).ok())
            .unwrap_or_else(|| stage.legacy_status());
        let priority = pick_str(obj, &["priority"]).and_then(|raw| {
            TaskPriority::from_str(raw.trim())
                .inspect_err(|_| warn!(task_id = %id, priority = %raw, "Ignoring unknown priority"))
                .ok()
        });

        Ok(Task {
            id,
            title: pick_str(obj, &["title"]).unwrap_or_default().to_string(),
            description: pick_str(obj, &["description"]).map(str::to_string),
            due_date: pick_str(obj, &["due_date", "dueDate"]).and_then(|raw| parse_date(id, raw)),
            stage,
            status,
            priority,
            project_id: pick_uuid(obj, id, &["project_id", "projectId"]),
            assigned_to: pick_uuid(
                obj,
                id,
                &["assigned_to", "assignedTo", "assignee_id", "assigneeId"],
            ),
            created_by: pick_uuid(obj, id, &["created_by", "createdBy"]),
            metadata: TaskMetadata {
                trade_required: pick_str(obj, &["trade_required", "tradeRequired"])
                    .map(str::to_string),
                weather_dependent: pick(obj, &["weather_dependent", "weatherDependent"])
                    .and_then(Value::as_bool),
                safety_notes: pick_str(obj, &["safety_notes", "safetyNotes"]).map(str::to_string),
                estimated_hours: pick_f64(obj, &["estimated_hours", "estimatedHours"]),
                actual_hours: pick_f64(obj, &["actual_hours", "actualHours"]),
            },
            created_at: pick_str(obj, &["created_at", "createdAt"]).and_then(parse_timestamp),
            updated_at: pick_str(obj, &["updated_at", "updatedAt"]).and_then(parse_timestamp),
        })
    }

    /// Convert back into a snake_case wire row.
    pub fn to_wire(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("id".into(), json!(self.id));
        row.insert("title".into(), json!(self.title));
        row.insert("description".into(), json!(self.description));
        row.insert("due_date".into(), date_value(self.due_date));
        row.insert("stage".into(), json!(self.stage.to_string()));
        row.insert("status".into(), json!(self.status.to_string()));
        row.insert(
            "priority".into(),
            json!(self.priority.map(|p| p.to_string())),
        );
        row.insert("project_id".into(), json!(self.project_id));
        row.insert("assigned_to".into(), json!(self.assigned_to));
        row.insert("created_by".into(), json!(self.created_by));
        row.insert("trade_required".into(), json!(self.metadata.trade_required));
        row.insert(
            "weather_dependent".into(),
            json!(self.metadata.weather_dependent),
        );
        row.insert("safety_notes".into(), json!(self.metadata.safety_notes));
        row.insert("estimated_hours".into(), json!(self.metadata.estimated_hours));
        row.insert("actual_hours".into(), json!(self.metadata.actual_hours));
        if let Some(created_at) = self.created_at {
            row.insert("created_at".into(), timestamp_value(created_at));
        }
        if let Some(updated_at) = self.updated_at {
            row.insert("updated_at".into(), timestamp_value(updated_at));
        }
        row
    }

    pub fn is_completed(&self) -> bool {
        self.stage == TaskStage::Completed
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTask {
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub stage: Option<TaskStage>,
    pub priority: Option<TaskPriority>,
    pub project_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    #[serde(flatten)]
    pub metadata: TaskMetadata,
}

impl CreateTask {
    pub fn from_title(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Insert payload. The id and timestamps are left to the server.
    pub fn to_wire(&self, created_by: Uuid) -> Map<String, Value> {
        let stage = self.stage.unwrap_or_default();
        let mut row = Map::new();
        row.insert("title".into(), json!(self.title));
        row.insert("description".into(), json!(self.description));
        row.insert("due_date".into(), date_value(self.due_date));
        row.insert("stage".into(), json!(stage.to_string()));
        row.insert("status".into(), json!(stage.legacy_status().to_string()));
        row.insert(
            "priority".into(),
            json!(self.priority.map(|p| p.to_string())),
        );
        row.insert("project_id".into(), json!(self.project_id));
        row.insert("assigned_to".into(), json!(self.assigned_to));
        row.insert("created_by".into(), json!(created_by));
        row.insert("trade_required".into(), json!(self.metadata.trade_required));
        row.insert(
            "weather_dependent".into(),
            json!(self.metadata.weather_dependent),
        );
        row.insert("safety_notes".into(), json!(self.metadata.safety_notes));
        row.insert("estimated_hours".into(), json!(self.metadata.estimated_hours));
        row.insert("actual_hours".into(), json!(self.metadata.actual_hours));
        row
    }
}

/// Field updates for an existing task. `None` leaves a field untouched; for
/// nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub description: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<TaskStage>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub priority: Option<Option<TaskPriority>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub project_id: Option<Option<Uuid>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub assigned_to: Option<Option<Uuid>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub safety_notes: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "::serde_with::rust::double_option"
    )]
    pub actual_hours: Option<Option<f64>>,
}

impl TaskPatch {
    pub fn stage(stage: TaskStage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch to a local copy. A stage change also moves the legacy status.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(due_date) = self.due_date {
            task.due_date = due_date;
        }
        if let Some(stage) = self.stage {
            task.stage = stage;
            task.status = stage.legacy_status();
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(project_id) = self.project_id {
            task.project_id = project_id;
        }
        if let Some(assigned_to) = self.assigned_to {
            task.assigned_to = assigned_to;
        }
        if let Some(safety_notes) = &self.safety_notes {
            task.metadata.safety_notes = safety_notes.clone();
        }
        if let Some(actual_hours) = self.actual_hours {
            task.metadata.actual_hours = actual_hours;
        }
    }

    /// Write payload. A stage change carries its legacy status in the same write.
    pub fn to_wire(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(title) = &self.title {
            fields.insert("title".into(), json!(title));
        }
        if let Some(description) = &self.description {
            fields.insert("description".into(), json!(description));
        }
        if let Some(due_date) = self.due_date {
            fields.insert("due_date".into(), date_value(due_date));
        }
        if let Some(stage) = self.stage {
            fields.insert("stage".into(), json!(stage.to_string()));
            fields.insert(
                "status".into(),
                json!(stage.legacy_status().to_string()),
            );
        }
        if let Some(priority) = self.priority {
            fields.insert("priority".into(), json!(priority.map(|p| p.to_string())));
        }
        if let Some(project_id) = self.project_id {
            fields.insert("project_id".into(), json!(project_id));
        }
        if let Some(assigned_to) = self.assigned_to {
            fields.insert("assigned_to".into(), json!(assigned_to));
        }
        if let Some(safety_notes) = &self.safety_notes {
            fields.insert("safety_notes".into(), json!(safety_notes));
        }
        if let Some(actual_hours) = self.actual_hours {
            fields.insert("actual_hours".into(), json!(actual_hours));
        }
        fields
    }
}

/// Column a task query is ordered by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskOrderField {
    #[default]
    DueDate,
    CreatedAt,
    UpdatedAt,
    Priority,
    Title,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOrder {
    pub field: TaskOrderField,
    pub ascending: bool,
}

impl Default for TaskOrder {
    fn default() -> Self {
        Self {
            field: TaskOrderField::DueDate,
            ascending: true,
        }
    }
}

/// Caller supplied filters for a task fetch. Role based visibility is layered
/// on top by the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub project_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    pub stage: Option<TaskStage>,
    #[serde(default)]
    pub include_completed: bool,
    pub order: Option<TaskOrder>,
}

impl TaskFilter {
    /// Whether a normalised task passes this filter. Stage selection lives
    /// here rather than in a row predicate because rows spell stages several
    /// ways, or not at all.
    pub fn admits(&self, task: &Task) -> bool {
        if self.project_id.is_some() && task.project_id != self.project_id {
            return false;
        }
        if self.assigned_to.is_some() && task.assigned_to != self.assigned_to {
            return false;
        }
        match self.stage {
            Some(stage) => task.stage == stage,
            None => self.include_completed || !task.is_completed(),
        }
    }
}

fn pick<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|value| !value.is_null())
}

fn pick_str<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    pick(obj, names).and_then(Value::as_str)
}

fn pick_f64(obj: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    match pick(obj, names)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn pick_uuid(obj: &Map<String, Value>, task_id: Uuid, names: &[&str]) -> Option<Uuid> {
    let raw = pick_str(obj, names)?;
    Uuid::parse_str(raw)
        .inspect_err(|_| warn!(task_id = %task_id, field = names[0], value = %raw, "Ignoring malformed reference"))
        .ok()
}

fn parse_date(task_id: Uuid, raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(raw).map(|ts| ts.date_naive()))
        .or_else(|| {
            warn!(task_id = %task_id, due_date = %raw, "Ignoring unparseable due date");
            None
        })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn date_value(date: Option<NaiveDate>) -> Value {
    match date {
        Some(date) => Value::String(date.format("%Y-%m-%d").to_string()),
        None => Value::Null,
    }
}

pub fn timestamp_value(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(extra: Value) -> Value {
        let mut base = json!({
            "id": "6f1b7a3e-8f0c-4d43-9d9e-0d7a3c1e2b11",
            "title": "Pour footings",
        });
        if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                base_obj.insert(k.clone(), v.clone());
            }
        }
        base
    }

    #[test]
    fn test_legacy_status_mapping_is_fixed() {
        assert_eq!(TaskStage::NotStarted.legacy_status(), LegacyStatus::Todo);
        assert_eq!(TaskStage::InProgress.legacy_status(), LegacyStatus::InProgress);
        assert_eq!(TaskStage::Completed.legacy_status(), LegacyStatus::Completed);
        assert_eq!(TaskStage::Blocked.legacy_status(), LegacyStatus::Todo);
        assert_eq!(LegacyStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_filter_admits_normalised_stages() {
        let unstaged = Task::from_wire(&row(json!({}))).unwrap();
        let underscored = Task::from_wire(&row(json!({"stage": "in_progress"}))).unwrap();
        let shouted = Task::from_wire(&row(json!({"stage": "Completed"}))).unwrap();

        let not_started = TaskFilter {
            stage: Some(TaskStage::NotStarted),
            ..Default::default()
        };
        assert!(not_started.admits(&unstaged));
        assert!(!not_started.admits(&underscored));

        let in_progress = TaskFilter {
            stage: Some(TaskStage::InProgress),
            ..Default::default()
        };
        assert!(in_progress.admits(&underscored));

        let open = TaskFilter::default();
        assert!(open.admits(&unstaged));
        assert!(!open.admits(&shouted));
        assert!(
            TaskFilter {
                include_completed: true,
                ..Default::default()
            }
            .admits(&shouted)
        );

        let other_project = TaskFilter {
            project_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        assert!(!other_project.admits(&unstaged));
    }

    #[test]
    fn test_stage_normalisation() {
        assert_eq!(TaskStage::normalize(None), TaskStage::NotStarted);
        assert_eq!(TaskStage::normalize(Some("archived")), TaskStage::NotStarted);
        assert_eq!(TaskStage::normalize(Some("in_progress")), TaskStage::InProgress);
        assert_eq!(TaskStage::normalize(Some(" Blocked ")), TaskStage::Blocked);
        assert_eq!(TaskStage::InProgress.to_string(), "in-progress");
    }

    #[test]
    fn test_from_wire_reads_both_spellings() {
        let task = Task::from_wire(&row(json!({
            "dueDate": "2025-03-04",
            "stage": "completed",
            "projectId": "0b0e5cde-6c56-4a0b-a7a0-0f4c2d1a9e01",
            "estimatedHours": "6.5",
        })))
        .unwrap();
        assert_eq!(task.due_date, NaiveDate::from_ymd_opt(2025, 3, 4));
        assert_eq!(task.stage, TaskStage::Completed);
        assert_eq!(task.status, LegacyStatus::Completed);
        assert!(task.project_id.is_some());
        assert_eq!(task.metadata.estimated_hours, Some(6.5));
    }

    #[test]
    fn test_snake_case_wins_over_camel_case() {
        let task = Task::from_wire(&row(json!({
            "due_date": "2025-01-10",
            "dueDate": "2024-12-31",
        })))
        .unwrap();
        assert_eq!(task.due_date, NaiveDate::from_ymd_opt(2025, 1, 10));

        let task = Task::from_wire(&row(json!({
            "due_date": null,
            "dueDate": "2024-12-31T08:00:00Z",
        })))
        .unwrap();
        assert_eq!(task.due_date, NaiveDate::from_ymd_opt(2024, 12, 31));
    }

    #[test]
    fn test_from_wire_rejects_bad_ids() {
        assert_eq!(Task::from_wire(&json!({"title": "x"})), Err(RowError::MissingId));
        assert!(matches!(
            Task::from_wire(&json!({"id": "nope"})),
            Err(RowError::InvalidId(_))
        ));
        assert_eq!(Task::from_wire(&json!([1, 2])), Err(RowError::NotAnObject));
    }

    #[test]
    fn test_wire_round_trip_preserves_canonical_task() {
        let task = Task::from_wire(&row(json!({
            "stage": "blocked",
            "priority": "HIGH",
            "safety_notes": "Harness above 2m",
            "created_at": "2025-02-01 07:30:00",
        })))
        .unwrap();
        assert_eq!(task.priority, Some(TaskPriority::High));
        assert!(task.created_at.is_some());
        let back = Task::from_wire(&Value::Object(task.to_wire())).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_stage_patch_carries_legacy_status() {
        let patch = TaskPatch::stage(TaskStage::Blocked);
        let fields = patch.to_wire();
        assert_eq!(fields.get("stage"), Some(&json!("blocked")));
        assert_eq!(fields.get("status"), Some(&json!("todo")));
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_patch_apply_only_touches_named_fields() {
        let mut task = Task::from_wire(&row(json!({"description": "Level 2"}))).unwrap();
        let before = task.clone();
        let patch: TaskPatch = serde_json::from_value(json!({
            "description": null,
            "stage": "in-progress",
        }))
        .unwrap();
        patch.apply_to(&mut task);
        assert_eq!(task.description, None);
        assert_eq!(task.stage, TaskStage::InProgress);
        assert_eq!(task.status, LegacyStatus::InProgress);
        assert_eq!(task.title, before.title);
        assert_eq!(task.due_date, before.due_date);
    }
}
