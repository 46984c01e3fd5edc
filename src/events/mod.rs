//! Task lifecycle events
//!
//! Emitted by the dispatcher on task boundaries and rejected commands.

use serde::{Deserialize, Serialize};

/// Events emitted by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task began (`begin task`)
    TaskStarted,

    /// The active task finished (`end task`)
    TaskEnded {
        /// Duration in milliseconds that the task was active
        duration_ms: u64,
    },

    /// A command was answered with `error`
    CommandRejected {
        /// The raw command line
        command: String,
    },
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskEvent::TaskStarted => write!(f, "TASK_STARTED"),
            TaskEvent::TaskEnded { duration_ms } => {
                write!(f, "TASK_ENDED ({}ms)", duration_ms)
            }
            TaskEvent::CommandRejected { command } => {
                write!(f, "COMMAND_REJECTED ({:?})", command)
            }
        }
    }
}
