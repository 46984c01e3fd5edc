//! Serial transport to the robot controller
//!
//! Runs its receive loop on a dedicated thread and feeds decoded lines to
//! the dispatcher over a bounded channel.

mod link;

pub use link::{InboundLine, LineWriter, SerialLink, TransportError};
