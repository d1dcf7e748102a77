//! Drag gestures across stage lanes, reduced to at most one stage change.

use db::models::task::{Task, TaskStage};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis aligned hit region. Contains its left and top edges but not its right
/// and bottom ones, so adjacent regions never both claim a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x && point.x < self.right() && point.y >= self.y && point.y < self.bottom()
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

/// Direction lanes are laid out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Axis {
    /// Lanes side by side, left to right.
    #[default]
    Horizontal,
    /// Lanes stacked, top to bottom.
    Vertical,
}

#[derive(Debug, Error, PartialEq)]
pub enum LayoutError {
    #[error("layout bounds are empty")]
    EmptyBounds,
    #[error("no lanes to lay out")]
    NoLanes,
    #[error("lane {0} appears twice")]
    DuplicateLane(TaskStage),
    #[error("hit region for lane {0} is empty")]
    EmptyRegion(TaskStage),
    #[error("hit region for lane {0} overlaps lane {1}")]
    Overlap(TaskStage, TaskStage),
}

/// Hit regions of the stage lanes on screen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneLayout {
    lanes: Vec<(TaskStage, Rect)>,
}

impl LaneLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Divide `bounds` into equal, touching regions, one per stage in order.
    /// The regions cover `bounds` exactly.
    pub fn split(bounds: Rect, stages: &[TaskStage], axis: Axis) -> Result<Self, LayoutError> {
        if bounds.is_empty() {
            return Err(LayoutError::EmptyBounds);
        }
        if stages.is_empty() {
            return Err(LayoutError::NoLanes);
        }

        let count = stages.len() as f64;
        let (start, extent) = match axis {
            Axis::Horizontal => (bounds.x, bounds.width),
            Axis::Vertical => (bounds.y, bounds.height),
        };
        // Computing every edge from the same formula keeps neighbours exactly touching.
        let edge = |i: usize| {
            if i == stages.len() {
                start + extent
            } else {
                start + extent * i as f64 / count
            }
        };

        let mut layout = Self::new();
        for (i, stage) in stages.iter().enumerate() {
            let (lo, hi) = (edge(i), edge(i + 1));
            let region = match axis {
                Axis::Horizontal => Rect::new(lo, bounds.y, hi - lo, bounds.height),
                Axis::Vertical => Rect::new(bounds.x, lo, bounds.width, hi - lo),
            };
            if layout.lanes.iter().any(|(existing, _)| existing == stage) {
                return Err(LayoutError::DuplicateLane(*stage));
            }
            layout.set_lane(*stage, region)?;
        }
        Ok(layout)
    }

    /// Register or replace the measured region of one lane.
    pub fn set_lane(&mut self, stage: TaskStage, region: Rect) -> Result<(), LayoutError> {
        if region.is_empty() {
            return Err(LayoutError::EmptyRegion(stage));
        }
        if let Some((other, _)) = self
            .lanes
            .iter()
            .find(|(other, rect)| *other != stage && rect.overlaps(&region))
        {
            return Err(LayoutError::Overlap(stage, *other));
        }
        match self.lanes.iter_mut().find(|(existing, _)| *existing == stage) {
            Some((_, rect)) => *rect = region,
            None => self.lanes.push((stage, region)),
        }
        Ok(())
    }

    pub fn remove_lane(&mut self, stage: TaskStage) {
        self.lanes.retain(|(existing, _)| *existing != stage);
    }

    /// The lane whose region contains `point`, if any.
    pub fn lane_at(&self, point: Point) -> Option<TaskStage> {
        self.lanes
            .iter()
            .find(|(_, rect)| rect.contains(point))
            .map(|(stage, _)| *stage)
    }

    pub fn region(&self, stage: TaskStage) -> Option<Rect> {
        self.lanes
            .iter()
            .find(|(existing, _)| *existing == stage)
            .map(|(_, rect)| *rect)
    }

    pub fn lanes(&self) -> impl Iterator<Item = (TaskStage, Rect)> + '_ {
        self.lanes.iter().copied()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DragError {
    #[error("a drag of task {0} is already in progress")]
    AlreadyDragging(Uuid),
    #[error("no drag in progress")]
    NotDragging,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DragSession {
    pub task_id: Uuid,
    pub title: String,
    pub origin: TaskStage,
    /// Lane currently under the pointer.
    pub hover: Option<TaskStage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DropOutcome {
    /// Released over another lane; the caller issues exactly one stage change.
    Moved {
        task_id: Uuid,
        from: TaskStage,
        to: TaskStage,
    },
    SameLane,
    NoTarget,
    Cancelled,
}

/// A finished gesture and what the drop amounts to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DragEnd {
    pub session: DragSession,
    pub outcome: DropOutcome,
}

/// Visual feedback hooks. `on_drag_end` fires once for every `on_drag_start`,
/// whatever the outcome. Hooks run with no board lock held, so they may read
/// the board back.
pub trait DragObserver: Send + Sync {
    fn on_drag_start(&self, session: &DragSession);
    fn on_drag_end(&self, session: &DragSession, outcome: &DropOutcome);
}

#[derive(Debug, Default)]
enum DragState {
    #[default]
    Idle,
    Dragging(DragSession),
}

/// Idle/Dragging state machine over a lane layout. Observers are not called
/// from here; the owner notifies them once its own lock is released.
#[derive(Debug, Default)]
pub struct DragController {
    layout: LaneLayout,
    state: DragState,
}

impl DragController {
    pub fn new(layout: LaneLayout) -> Self {
        Self {
            layout,
            ..Default::default()
        }
    }

    pub fn layout(&self) -> &LaneLayout {
        &self.layout
    }

    /// Replace the lane regions, e.g. after the board was resized.
    pub fn set_layout(&mut self, layout: LaneLayout) {
        self.layout = layout;
    }

    pub fn session(&self) -> Option<&DragSession> {
        match &self.state {
            DragState::Idle => None,
            DragState::Dragging(session) => Some(session),
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.session().is_some()
    }

    pub fn begin(&mut self, task: &Task, at: Point) -> Result<&DragSession, DragError> {
        if let DragState::Dragging(session) = &self.state {
            return Err(DragError::AlreadyDragging(session.task_id));
        }
        let session = DragSession {
            task_id: task.id,
            title: task.title.clone(),
            origin: task.stage,
            hover: self.layout.lane_at(at),
        };
        debug!(task_id = %session.task_id, origin = %session.origin, "Drag started");
        self.state = DragState::Dragging(session);
        self.session().ok_or(DragError::NotDragging)
    }

    /// Track the pointer; returns the lane now under it.
    pub fn drag_move(&mut self, at: Point) -> Result<Option<TaskStage>, DragError> {
        let hover = self.layout.lane_at(at);
        match &mut self.state {
            DragState::Idle => Err(DragError::NotDragging),
            DragState::Dragging(session) => {
                if session.hover != hover {
                    debug!(task_id = %session.task_id, hover = ?hover, "Drag hover changed");
                    session.hover = hover;
                }
                Ok(hover)
            }
        }
    }

    /// End the gesture at `at`, judged against the lane the task started in.
    pub fn release(&mut self, at: Point) -> Result<DragEnd, DragError> {
        let origin = self.session().ok_or(DragError::NotDragging)?.origin;
        self.release_from(at, origin)
    }

    /// End the gesture at `at`, judged against `current`, the lane the task
    /// is in now. It differs from the origin when the task moved remotely
    /// mid-drag.
    pub fn release_from(&mut self, at: Point, current: TaskStage) -> Result<DragEnd, DragError> {
        let target = self.layout.lane_at(at);
        let session = self.take_session()?;
        let outcome = match target {
            None => DropOutcome::NoTarget,
            Some(to) if to == current => DropOutcome::SameLane,
            Some(to) => DropOutcome::Moved {
                task_id: session.task_id,
                from: current,
                to,
            },
        };
        debug!(task_id = %session.task_id, outcome = ?outcome, "Drag ended");
        Ok(DragEnd { session, outcome })
    }

    /// Abandon the gesture without a drop.
    pub fn cancel(&mut self) -> Result<DragEnd, DragError> {
        let session = self.take_session()?;
        debug!(task_id = %session.task_id, "Drag cancelled");
        Ok(DragEnd {
            session,
            outcome: DropOutcome::Cancelled,
        })
    }

    fn take_session(&mut self) -> Result<DragSession, DragError> {
        match std::mem::take(&mut self.state) {
            DragState::Dragging(session) => Ok(session),
            DragState::Idle => Err(DragError::NotDragging),
        }
    }
}
