//! Task state and command dispatch
//!
//! The dispatcher owns the per-task session and the advisory task state:
//! - Idle: no task running, every command is still accepted
//! - TaskActive: between `begin task` and `end task`

mod dispatcher;
mod session;

pub use dispatcher::{Dispatcher, Gateways};
