//! Serial link to the robot controller
//!
//! A dedicated receive thread reads newline-terminated commands and hands
//! them to the dispatcher through a bounded channel, in arrival order.
//! Responses are written synchronously with a bounded number of retries.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SerialConfig;
use crate::lifecycle::join_with_timeout;

const IDLE_POLL: Duration = Duration::from_millis(10);

/// Extra time granted to the receive thread beyond one read timeout
const JOIN_GRACE: Duration = Duration::from_millis(500);

/// Longest accepted command line, terminator excluded
const MAX_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// A decoded command line
#[derive(Debug, Clone)]
pub struct InboundLine {
    pub text: String,
    pub received_at: DateTime<Local>,
}

impl InboundLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Local::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("failed to spawn receive thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("serial link is not connected")]
    NotConnected,

    #[error("write failed after {attempts} attempts: {source}")]
    Write {
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Outbound half of the link, as seen by the dispatcher
pub trait LineWriter: Send + Sync {
    /// Write one line; the terminator is appended
    fn send(&self, line: &str) -> Result<(), TransportError>;
}

/// Serial link owning the port and its receive thread
pub struct SerialLink {
    config: SerialConfig,
    state: Arc<Mutex<LinkState>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl SerialLink {
    /// Open the configured port (8N1) and start receiving.
    ///
    /// Inbound lines are pushed into `line_tx`.
    pub fn connect(
        config: &SerialConfig,
        line_tx: mpsc::Sender<InboundLine>,
    ) -> Result<Self, TransportError> {
        info!(
            port = %config.port,
            baud_rate = config.baud_rate,
            "opening serial link"
        );

        let open_error = |source| TransportError::Open {
            port: config.port.clone(),
            source,
        };

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(config.timeout())
            .open()
            .map_err(open_error)?;
        let reader = port.try_clone().map_err(open_error)?;

        Self::from_parts(config.clone(), reader, port, line_tx)
    }

    /// Build a link over an already opened reader/writer pair
    pub fn from_parts<R, W>(
        config: SerialConfig,
        reader: R,
        writer: W,
        line_tx: mpsc::Sender<InboundLine>,
    ) -> Result<Self, TransportError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let state = Arc::new(Mutex::new(LinkState::Connecting));
        let running = Arc::new(AtomicBool::new(true));

        let spawned = {
            let state = Arc::clone(&state);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("serial-rx".to_string())
                .spawn(move || {
                    info!("serial receive thread started");
                    receive_loop(reader, line_tx, &running, &state);
                    info!("serial receive thread stopped");
                })
        };
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                *state.lock() = LinkState::Disconnected;
                return Err(TransportError::ThreadSpawn(e));
            }
        };

        {
            // A read failure in the new thread may already have won
            let mut state = state.lock();
            if *state == LinkState::Connecting {
                *state = LinkState::Connected;
            }
        }

        info!(port = %config.port, "serial link connected");

        Ok(Self {
            config,
            state,
            writer: Mutex::new(Some(Box::new(writer))),
            running,
            receiver: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Stop the receive thread and close the port. Idempotent.
    pub fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.receiver.lock().take() {
            join_with_timeout(handle, self.config.timeout() + JOIN_GRACE, "serial-rx");
        }

        if self.writer.lock().take().is_some() {
            info!(port = %self.config.port, "serial link closed");
        }
        *self.state.lock() = LinkState::Disconnected;
    }
}

impl LineWriter for SerialLink {
    fn send(&self, line: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let payload = format!("{}\n", line);
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;
        // Bytes already on the wire; a retry resumes after them
        let mut written = 0;

        for attempt in 1..=attempts {
            match write_from(&mut **writer, payload.as_bytes(), &mut written) {
                Ok(()) => {
                    debug!(%line, attempt, "line sent");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, attempts, written, error = %e, "serial write failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        thread::sleep(self.config.retry_delay());
                    }
                }
            }
        }

        Err(TransportError::Write {
            attempts,
            source: last_error.unwrap_or_else(|| io::Error::other("no write attempted")),
        })
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Write `payload[*written..]` and flush, advancing `written` as bytes land
fn write_from(writer: &mut dyn Write, payload: &[u8], written: &mut usize) -> io::Result<()> {
    while *written < payload.len() {
        match writer.write(&payload[*written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => *written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}

fn receive_loop<R: Read>(
    reader: R,
    line_tx: mpsc::Sender<InboundLine>,
    running: &AtomicBool,
    state: &Mutex<LinkState>,
) {
    let mut reader = BufReader::new(reader);
    // Survives read timeouts so that a line split across them is kept whole
    let mut buf = Vec::with_capacity(256);
    // Set while skipping the tail of an oversized line
    let mut discarding = false;

    while running.load(Ordering::SeqCst) {
        let limit = (MAX_LINE + 1 - buf.len()) as u64;
        match (&mut reader).take(limit).read_until(b'\n', &mut buf) {
            Ok(0) => thread::sleep(IDLE_POLL),
            Ok(_) if buf.ends_with(b"\n") => {
                let bytes = std::mem::take(&mut buf);
                if std::mem::take(&mut discarding) {
                    continue;
                }
                let Some(line) = decode_line(bytes) else {
                    continue;
                };
                debug!(line = %line.text, "line received");
                if line_tx.blocking_send(line).is_err() {
                    warn!("dispatcher channel closed, stopping receive loop");
                    break;
                }
            }
            Ok(_) if buf.len() > MAX_LINE => {
                if !discarding {
                    warn!(limit = MAX_LINE, "dropping oversized line");
                }
                discarding = true;
                buf.clear();
            }
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                error!(error = %e, "serial read failed, link lost");
                *state.lock() = LinkState::Disconnected;
                break;
            }
        }
    }
}

/// Decode a raw line; empty and non-UTF-8 lines yield `None`
fn decode_line(bytes: Vec<u8>) -> Option<InboundLine> {
    match String::from_utf8(bytes) {
        Ok(text) => {
            let text = text.trim_end();
            (!text.is_empty()).then(|| InboundLine::new(text))
        }
        Err(e) => {
            warn!(bytes = e.as_bytes().len(), "dropping line that is not valid UTF-8");
            None
        }
    }
}
