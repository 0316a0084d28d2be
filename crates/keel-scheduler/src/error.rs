//! Scheduler error types.

use thiserror::Error;

use keel_state::{SlotId, SlotState, TaskId};

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("slot not found: {0}")]
    SlotNotFound(SlotId),

    #[error("slot {slot_id} is {state}, cannot bind a new task")]
    SlotOccupied { slot_id: SlotId, state: SlotState },

    #[error("task already bound to another slot: {0}")]
    DuplicateTask(TaskId),

    #[error("invalid desired spec: {0}")]
    InvalidSpec(String),

    #[error("scheduler is not running")]
    Stopped,

    #[error("state store error: {0}")]
    State(#[from] keel_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
