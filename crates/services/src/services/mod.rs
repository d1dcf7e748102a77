pub mod ai_client;
pub mod config;
pub mod drag_drop;
pub mod notification;
pub mod optimistic;
pub mod prioritization;
pub mod stage_lanes;
pub mod task_board;
pub mod task_store;
