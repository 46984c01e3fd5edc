//! Process lifecycle: shutdown signals and worker teardown

mod shutdown;

pub use shutdown::{join_with_timeout, ShutdownSignal};
