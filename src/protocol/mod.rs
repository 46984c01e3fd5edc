//! Serial line protocol: command verbs in, response tokens out

mod command;
mod response;

pub use command::Command;
pub use response::Response;
