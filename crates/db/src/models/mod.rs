pub mod session;
pub mod task;
