//! Operator journal
//!
//! A plain-text record of every command, response, recognition result and
//! announcement, kept next to the robot for the operators. Entries are
//! queued by the dispatcher and written by a dedicated thread so that
//! command handling never waits on the disk.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::lifecycle::join_with_timeout;
use crate::stations::{LabWindowId, QrPosition, WindowLabel};

const IDLE_POLL: Duration = Duration::from_millis(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogCategory {
    System,
    UartReceive,
    UartSend,
    Recognition,
    Voice,
    Error,
    Sampling,
    Delivery,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::System => "SYSTEM",
            LogCategory::UartReceive => "UART_RX",
            LogCategory::UartSend => "UART_TX",
            LogCategory::Recognition => "RECOGNITION",
            LogCategory::Voice => "VOICE",
            LogCategory::Error => "ERROR",
            LogCategory::Sampling => "SAMPLING",
            LogCategory::Delivery => "DELIVERY",
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fire-and-forget journal interface
pub trait Journal: Send + Sync {
    fn log(&self, category: LogCategory, message: &str);

    fn system(&self, message: &str) {
        self.log(LogCategory::System, message);
    }

    fn error(&self, message: &str) {
        self.log(LogCategory::Error, message);
    }

    fn uart_receive(&self, command: &str) {
        self.log(LogCategory::UartReceive, command);
    }

    fn uart_send(&self, response: &str) {
        self.log(LogCategory::UartSend, response);
    }

    fn qr_detection(&self, position: QrPosition, content: &str) {
        self.log(LogCategory::Recognition, &format!("{}: {}", position, content));
    }

    fn window_status(&self, window: LabWindowId, text: &str, available: bool) {
        let status = if available { "vacant" } else { "no vacancy" };
        self.log(
            LogCategory::Recognition,
            &format!("window {}: {} -> {}", window, text, status),
        );
    }

    fn sample_collection(&self, label: WindowLabel, sample_type: &str, count: usize) {
        self.log(
            LogCategory::Sampling,
            &format!("window {} collected {}, count: {}", label, sample_type, count),
        );
    }

    fn delivery(&self, window: LabWindowId, window_name: &str, action: &str) {
        self.log(
            LogCategory::Delivery,
            &format!("{} {}: {}", window, window_name, action),
        );
    }

    fn task_start(&self) {
        self.system("task started");
    }

    fn task_end(&self) {
        self.system("task finished");
    }

    fn recognition_error(&self, board: &str, details: &str) {
        self.error(&format!("{} recognition failed: {}", board, details));
    }

    fn communication_error(&self, kind: &str, details: &str) {
        self.error(&format!("communication error - {}: {}", kind, details));
    }
}

/// Render one journal line
pub fn format_entry(at: DateTime<Local>, category: LogCategory, message: &str) -> String {
    format!("[{}] [{}] {}", at.format("%Y-%m-%d %H:%M:%S"), category, message)
}

/// Journal backed by a timestamped file under the log directory
pub struct FileJournal {
    path: PathBuf,
    queue: Arc<Mutex<VecDeque<String>>>,
    /// Entries enqueued but not yet written
    pending: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileJournal {
    /// Create the journal file and start its writer thread
    pub fn create(log_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let now = Local::now();
        let path = log_dir.join(format!("pharmabot_{}.log", now.format("%Y%m%d_%H%M%S")));

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "Pharmacy robot daemon journal")?;
        writeln!(file, "Started: {}", now.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(file, "{}", "=".repeat(50))?;
        file.flush()?;

        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let pending = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let queue = Arc::clone(&queue);
            let pending = Arc::clone(&pending);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("journal-writer".to_string())
                .spawn(move || write_loop(file, queue, pending, running))?
        };

        info!(path = %path.display(), "journal opened");

        Ok(Self {
            path,
            queue,
            pending,
            running,
            worker: Mutex::new(Some(worker)),
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every queued entry is written. Returns false on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline || !self.running.load(Ordering::SeqCst) {
                return false;
            }
            thread::sleep(IDLE_POLL);
        }
        true
    }

    /// Record shutdown, drain the queue and stop the writer. Idempotent.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        self.system("system stopped");
        if !self.flush(FLUSH_TIMEOUT) {
            warn!(
                pending = self.pending.load(Ordering::SeqCst),
                "journal not fully flushed"
            );
        }

        self.running.store(false, Ordering::SeqCst);
        join_with_timeout(worker, JOIN_TIMEOUT, "journal-writer");
        info!(path = %self.path.display(), "journal closed");
    }
}

impl Journal for FileJournal {
    fn log(&self, category: LogCategory, message: &str) {
        let entry = format_entry(Local::now(), category, message);
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().push_back(entry);
    }
}

fn write_loop(
    mut file: File,
    queue: Arc<Mutex<VecDeque<String>>>,
    pending: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let next = queue.lock().pop_front();
        let Some(entry) = next else {
            thread::sleep(IDLE_POLL);
            continue;
        };

        debug!(target: "journal", "{}", entry);
        if let Err(e) = writeln!(file, "{}", entry).and_then(|_| file.flush()) {
            warn!(error = %e, "failed to write journal entry");
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}
