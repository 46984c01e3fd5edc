//! Voice announcements
//!
//! Announcements are queued and played one at a time by a playback thread.
//! Rendering is delegated to an external TTS program.

use std::collections::VecDeque;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::VoiceConfig;
use crate::lifecycle::join_with_timeout;

use super::journal::{Journal, LogCategory};

const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Fire-and-forget voice interface
pub trait Voice: Send + Sync {
    /// Queue `text`. A priority announcement discards everything not yet
    /// played.
    fn speak(&self, text: &str, priority: bool);
}

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("failed to run TTS command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TTS command {command} exited with {status}")]
    Exit {
        command: String,
        status: std::process::ExitStatus,
    },
}

/// Renders text to audio, blocking until playback finishes
pub trait Synthesizer: Send + Sync {
    fn render(&self, text: &str) -> Result<(), VoiceError>;
}

/// Synthesizer that shells out to a TTS program such as `espeak` or `say`
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
}

impl CommandSynthesizer {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

impl Synthesizer for CommandSynthesizer {
    fn render(&self, text: &str) -> Result<(), VoiceError> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|source| VoiceError::Spawn {
                command: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(VoiceError::Exit {
                command: self.program.clone(),
                status,
            })
        }
    }
}

/// Queue-backed announcement player
pub struct VoicePlayer {
    queue: Arc<Mutex<VecDeque<String>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl VoicePlayer {
    /// Start the playback thread
    pub fn start(
        synthesizer: Arc<dyn Synthesizer>,
        journal: Arc<dyn Journal>,
        idle_poll: Duration,
    ) -> std::io::Result<Self> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("voice-playback".to_string())
                .spawn(move || playback_loop(synthesizer, journal, queue, running, idle_poll))?
        };

        Ok(Self {
            queue,
            running,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn clear_queue(&self) {
        self.queue.lock().clear();
    }

    /// True while announcements are waiting to be played
    pub fn is_speaking(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Drop pending announcements and stop the playback thread. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.clear_queue();

        if let Some(worker) = self.worker.lock().take() {
            join_with_timeout(worker, JOIN_TIMEOUT, "voice-playback");
            info!("voice playback stopped");
        }
    }
}

impl Voice for VoicePlayer {
    fn speak(&self, text: &str, priority: bool) {
        let mut queue = self.queue.lock();
        if priority && !queue.is_empty() {
            debug!(dropped = queue.len(), "priority announcement clears queue");
            queue.clear();
        }
        queue.push_back(text.to_string());
    }
}

fn playback_loop(
    synthesizer: Arc<dyn Synthesizer>,
    journal: Arc<dyn Journal>,
    queue: Arc<Mutex<VecDeque<String>>>,
    running: Arc<AtomicBool>,
    idle_poll: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let next = queue.lock().pop_front();
        let Some(text) = next else {
            thread::sleep(idle_poll);
            continue;
        };

        match synthesizer.render(&text) {
            Ok(()) => {
                info!(%text, "announcement played");
                journal.log(LogCategory::Voice, &text);
            }
            Err(e) => warn!(error = %e, %text, "announcement failed"),
        }
    }
}

/// Announcement texts
pub mod announcements {
    pub fn system_start() -> String {
        "System started".to_string()
    }

    pub fn system_end() -> String {
        "This round is complete".to_string()
    }

    /// `None` when nothing was received
    pub fn samples_received(sample_types: &[String]) -> Option<String> {
        match sample_types {
            [] => None,
            [single] => Some(format!("Received {} sample", single)),
            many => Some(format!("Received {} samples", many.join(" and "))),
        }
    }

    pub fn window_busy(window_name: &str) -> String {
        format!("{} has no vacancy, waiting", window_name)
    }

    pub fn delivery_arrival(window_name: &str, sample_count: usize) -> String {
        format!("Arrived at {}, sample count {}", window_name, sample_count)
    }
}
