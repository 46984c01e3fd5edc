//! Signal handling and bounded worker joins for graceful shutdown

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, warn};

/// Handles shutdown signals (SIGTERM, SIGINT)
pub struct ShutdownSignal;

impl ShutdownSignal {
    /// Create a new shutdown signal handler
    pub fn new() -> Self {
        Self
    }

    /// Wait for a shutdown signal
    ///
    /// Fails only if the signal handlers cannot be registered.
    pub async fn wait(&self) -> std::io::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                debug!("received SIGTERM");
            }
            _ = sigint.recv() => {
                debug!("received SIGINT");
            }
        }

        Ok(())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Join a worker thread, giving up after `timeout`.
///
/// A thread that has not finished by then is detached and `None` is
/// returned, as is the case for a panicked thread.
pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration, name: &str) -> Option<T> {
    let deadline = Instant::now() + timeout;

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(worker = name, ?timeout, "worker did not stop in time, detaching");
            return None;
        }
        thread::sleep(JOIN_POLL);
    }

    match handle.join() {
        Ok(value) => {
            debug!(worker = name, "worker joined");
            Some(value)
        }
        Err(_) => {
            error!(worker = name, "worker panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_finished_worker() {
        let handle = thread::spawn(|| 42);
        assert_eq!(join_with_timeout(handle, Duration::from_secs(1), "answer"), Some(42));
    }

    #[test]
    fn test_join_gives_up_on_stuck_worker() {
        let handle = thread::spawn(|| thread::sleep(Duration::from_secs(2)));
        let started = Instant::now();

        assert!(join_with_timeout(handle, Duration::from_millis(50), "sleeper").is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_join_panicked_worker() {
        let handle = thread::spawn(|| panic!("boom"));
        assert_eq!(join_with_timeout::<()>(handle, Duration::from_secs(1), "panicky"), None);
    }
}
