//! Command dispatcher
//!
//! Consumes inbound lines one at a time, runs the matching handler against
//! the session and answers each line with exactly one response token.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::RecognitionConfig;
use crate::events::TaskEvent;
use crate::gateway::{
    announcements, Journal, LogCategory, Recognition, RecognitionError, Voice, WindowStatus,
};
use crate::lifecycle::join_with_timeout;
use crate::protocol::{Command, Response};
use crate::serial::{InboundLine, LineWriter};
use crate::stations::{LabWindowId, QrPosition, StationMap, WindowLabel};

use super::session::{Session, TaskState};

/// Which board a recognition call was reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    Exam,
    Lab,
}

impl std::fmt::Display for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Board::Exam => write!(f, "QR"),
            Board::Lab => write!(f, "OCR"),
        }
    }
}

/// Why a command was answered with `error`
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("{board} recognition failed: {source}")]
    Recognition {
        board: Board,
        #[source]
        source: RecognitionError,
    },
}

/// Collaborators used by the handlers
#[derive(Clone)]
pub struct Gateways {
    pub recognition: Arc<dyn Recognition>,
    pub voice: Arc<dyn Voice>,
    pub journal: Arc<dyn Journal>,
}

/// Snapshot of the dispatcher, logged at shutdown
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub version: String,
    pub state: TaskState,
    pub commands_handled: u64,
    pub detections: BTreeMap<QrPosition, String>,
    pub station_status: BTreeMap<LabWindowId, WindowStatus>,
}

pub struct Dispatcher {
    /// Current task state
    state: TaskState,
    /// Time when the current task began
    task_started_at: Option<Instant>,
    session: Session,
    stations: Arc<StationMap>,
    gateways: Gateways,
    recognition: RecognitionConfig,
    /// Channel for emitting task events
    event_tx: broadcast::Sender<TaskEvent>,
    commands_handled: u64,
}

impl Dispatcher {
    pub fn new(
        stations: Arc<StationMap>,
        gateways: Gateways,
        recognition: RecognitionConfig,
        event_tx: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            state: TaskState::Idle,
            task_started_at: None,
            session: Session::default(),
            stations,
            gateways,
            recognition,
            event_tx,
            commands_handled: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[cfg(test)]
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: self.state,
            commands_handled: self.commands_handled,
            detections: self.session.detections().clone(),
            station_status: self.session.station_status().clone(),
        }
    }

    /// Run the dispatch loop on a dedicated thread
    pub fn spawn(
        self,
        line_rx: mpsc::Receiver<InboundLine>,
        link: Arc<dyn LineWriter>,
        running: Arc<AtomicBool>,
    ) -> io::Result<DispatcherHandle> {
        let (exited_tx, exited_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || {
                let status = self.run(line_rx, link, running);
                let _ = exited_tx.send(());
                status
            })?;

        Ok(DispatcherHandle {
            thread,
            exited: Some(exited_rx),
        })
    }

    /// Answer inbound lines until the channel closes or `running` clears.
    ///
    /// Blocks the calling thread. `running` is checked before each line.
    pub fn run(
        mut self,
        mut line_rx: mpsc::Receiver<InboundLine>,
        link: Arc<dyn LineWriter>,
        running: Arc<AtomicBool>,
    ) -> DispatcherStatus {
        info!("dispatcher started in Idle state");

        while let Some(line) = line_rx.blocking_recv() {
            if !running.load(Ordering::SeqCst) {
                info!(line = %line.text, "dispatcher stopping, line left unanswered");
                break;
            }

            debug!(
                queued_for_ms = (chrono::Local::now() - line.received_at).num_milliseconds(),
                "dequeued line"
            );
            let response = self.handle_line(&line.text);
            self.reply(link.as_ref(), &response);
        }

        info!(commands = self.commands_handled, "dispatcher stopped");
        self.status()
    }

    /// Run one command line and produce its response
    pub fn handle_line(&mut self, line: &str) -> Response {
        self.commands_handled += 1;
        self.gateways.journal.uart_receive(line);
        info!(command = %line, state = %self.state, "command received");

        let result = match Command::parse(line) {
            Some(command) => self.execute(command),
            None => Err(DispatchError::UnknownCommand(line.to_string())),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                error!(command = %line, error = %e, "command failed");
                match &e {
                    DispatchError::Recognition { board, source } => self
                        .gateways
                        .journal
                        .recognition_error(&board.to_string(), &source.to_string()),
                    DispatchError::UnknownCommand(_) => self.gateways.journal.error(&e.to_string()),
                }
                let _ = self.event_tx.send(TaskEvent::CommandRejected {
                    command: line.to_string(),
                });
                Response::Error
            }
        }
    }

    /// Send a response; failures are logged, the transport already retried
    fn reply(&self, link: &dyn LineWriter, response: &Response) {
        let token = response.to_string();
        match link.send(&token) {
            Ok(()) => self.gateways.journal.uart_send(&token),
            Err(e) => {
                error!(%token, error = %e, "failed to send response");
                self.gateways
                    .journal
                    .communication_error("send", &format!("{} ({})", token, e));
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<Response, DispatchError> {
        match command {
            Command::BeginTask => Ok(self.begin_task()),
            Command::ScanExamBoard => self.scan_exam_board(),
            Command::CheckWindow(label) => Ok(self.check_window(label)),
            Command::ScanLabBoard => self.scan_lab_board(),
            Command::CheckLabWindow(id) => Ok(self.check_lab_window(id)),
            Command::EndTask => Ok(self.end_task()),
        }
    }

    fn begin_task(&mut self) -> Response {
        self.gateways.journal.task_start();
        self.session.reset();
        self.gateways
            .voice
            .speak(&announcements::system_start(), true);
        self.enter_task();
        Response::Ok
    }

    fn end_task(&mut self) -> Response {
        self.gateways.voice.speak(&announcements::system_end(), true);
        self.session.reset();
        self.gateways.journal.task_end();
        self.leave_task();
        Response::Ok
    }

    fn scan_exam_board(&mut self) -> Result<Response, DispatchError> {
        let recognition = &self.gateways.recognition;
        let detections = with_attempts(self.recognition.qr_attempts, Board::Exam, || {
            recognition.scan_exam_board()
        })
        .map_err(|source| DispatchError::Recognition {
            board: Board::Exam,
            source,
        })?;

        for (position, content) in &detections {
            info!(%position, %content, "QR code detected");
            self.gateways.journal.qr_detection(*position, content);
        }

        let response = Response::detections(&detections);
        self.session.replace_detections(detections);
        Ok(response)
    }

    fn check_window(&mut self, label: WindowLabel) -> Response {
        let sample_types = self.session.sample_types_for(label, &self.stations);

        if let Some(text) = announcements::samples_received(&sample_types) {
            self.gateways.voice.speak(&text, false);
        } else {
            self.gateways
                .journal
                .log(LogCategory::Sampling, &format!("window {}: no sample", label));
        }

        for sample_type in &sample_types {
            self.gateways.journal.sample_collection(label, sample_type, 1);
        }

        Response::collected(sample_types)
    }

    fn scan_lab_board(&mut self) -> Result<Response, DispatchError> {
        let recognition = &self.gateways.recognition;
        let status = with_attempts(self.recognition.ocr_attempts, Board::Lab, || {
            recognition.scan_lab_board()
        })
        .map_err(|source| DispatchError::Recognition {
            board: Board::Lab,
            source,
        })?;

        for (window, s) in &status {
            info!(%window, text = %s.text, available = s.available, "window status read");
            self.gateways.journal.window_status(*window, &s.text, s.available);
        }
        self.session.replace_station_status(status);

        let busy = self.session.busy_windows(&self.stations);
        if busy.is_empty() {
            return Ok(Response::Ok);
        }

        for (window, name) in busy {
            warn!(%window, %name, "needed window is busy");
            self.gateways
                .voice
                .speak(&announcements::window_busy(&name), false);
        }
        Ok(Response::Wait)
    }

    fn check_lab_window(&mut self, window: LabWindowId) -> Response {
        let count = self.session.samples_for_window(window, &self.stations);
        let name = self.stations.window_name(window);

        if count > 0 {
            self.gateways
                .voice
                .speak(&announcements::delivery_arrival(&name, count), false);
            self.gateways.journal.delivery(
                window,
                &name,
                &format!("stopped, sample count: {}", count),
            );
            Response::Wait
        } else {
            self.gateways.journal.delivery(window, &name, "passed through");
            Response::Ok
        }
    }

    fn enter_task(&mut self) {
        if self.state == TaskState::TaskActive {
            info!("task restarted while active");
        }
        info!(from = %self.state, to = %TaskState::TaskActive, "state transition");

        self.state = TaskState::TaskActive;
        self.task_started_at = Some(Instant::now());
        let _ = self.event_tx.send(TaskEvent::TaskStarted);
    }

    fn leave_task(&mut self) {
        let duration_ms = self
            .task_started_at
            .take()
            .map(|t| t.elapsed().as_millis() as u64);

        info!(from = %self.state, to = %TaskState::Idle, ?duration_ms, "state transition");

        if let Some(duration_ms) = duration_ms {
            let _ = self.event_tx.send(TaskEvent::TaskEnded { duration_ms });
        }
        self.state = TaskState::Idle;
    }
}

/// A dispatcher running on its own thread
pub struct DispatcherHandle {
    thread: JoinHandle<DispatcherStatus>,
    exited: Option<oneshot::Receiver<()>>,
}

impl DispatcherHandle {
    /// Resolves once the dispatch loop has returned
    pub async fn exited(&mut self) {
        if let Some(exited) = self.exited.as_mut() {
            let _ = exited.await;
            self.exited = None;
        }
    }

    /// Join the thread, detaching it if it does not finish within `timeout`
    pub fn join(self, timeout: Duration) -> Option<DispatcherStatus> {
        join_with_timeout(self.thread, timeout, "dispatcher")
    }
}

/// Call `scan` up to `attempts` times, returning the last error
fn with_attempts<T, F>(attempts: u32, board: Board, mut scan: F) -> Result<T, RecognitionError>
where
    F: FnMut() -> Result<T, RecognitionError>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match scan() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(%board, attempt, attempts, error = %e, "recognition failed, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use parking_lot::Mutex;

    use super::*;
    use crate::serial::TransportError;

    #[derive(Default)]
    struct FakeRecognition {
        exam: Mutex<BTreeMap<QrPosition, String>>,
        lab: Mutex<BTreeMap<LabWindowId, WindowStatus>>,
        /// Calls that fail before scans start succeeding
        failures: AtomicU32,
        calls: AtomicU32,
        /// Time each scan blocks for, like a slow camera
        delay: Mutex<Option<Duration>>,
    }

    impl FakeRecognition {
        fn next_call(&self) -> Result<(), RecognitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RecognitionError::Unavailable);
            }
            Ok(())
        }
    }

    impl Recognition for FakeRecognition {
        fn scan_exam_board(&self) -> Result<BTreeMap<QrPosition, String>, RecognitionError> {
            self.next_call()?;
            Ok(self.exam.lock().clone())
        }

        fn scan_lab_board(&self) -> Result<BTreeMap<LabWindowId, WindowStatus>, RecognitionError> {
            self.next_call()?;
            Ok(self.lab.lock().clone())
        }
    }

    #[derive(Default)]
    struct RecordingVoice(Mutex<Vec<(String, bool)>>);

    impl Voice for RecordingVoice {
        fn speak(&self, text: &str, priority: bool) {
            self.0.lock().push((text.to_string(), priority));
        }
    }

    #[derive(Default)]
    struct RecordingJournal(Mutex<Vec<(LogCategory, String)>>);

    impl RecordingJournal {
        fn count(&self, category: LogCategory) -> usize {
            self.0.lock().iter().filter(|(c, _)| *c == category).count()
        }
    }

    impl Journal for RecordingJournal {
        fn log(&self, category: LogCategory, message: &str) {
            self.0.lock().push((category, message.to_string()));
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    impl LineWriter for RecordingWriter {
        fn send(&self, line: &str) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().push(line.to_string());
            Ok(())
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        recognition: Arc<FakeRecognition>,
        voice: Arc<RecordingVoice>,
        journal: Arc<RecordingJournal>,
        events: broadcast::Receiver<TaskEvent>,
    }

    fn harness() -> Harness {
        harness_with(RecognitionConfig::default())
    }

    fn harness_with(config: RecognitionConfig) -> Harness {
        let recognition = Arc::new(FakeRecognition::default());
        let voice = Arc::new(RecordingVoice::default());
        let journal = Arc::new(RecordingJournal::default());
        let (event_tx, events) = broadcast::channel(16);

        let gateways = Gateways {
            recognition: recognition.clone(),
            voice: voice.clone(),
            journal: journal.clone(),
        };
        let dispatcher =
            Dispatcher::new(Arc::new(StationMap::default()), gateways, config, event_tx);

        Harness {
            dispatcher,
            recognition,
            voice,
            journal,
            events,
        }
    }

    fn lab(id: u8) -> LabWindowId {
        LabWindowId::new(id).unwrap()
    }

    impl Harness {
        fn exam_board(&self, pairs: &[(QrPosition, &str)]) {
            *self.recognition.exam.lock() =
                pairs.iter().map(|(p, c)| (*p, c.to_string())).collect();
        }

        fn lab_board(&self, windows: &[(u8, bool)]) {
            *self.recognition.lab.lock() = windows
                .iter()
                .map(|(id, available)| {
                    let text = if *available { "vacant" } else { "busy" };
                    (
                        lab(*id),
                        WindowStatus {
                            text: text.to_string(),
                            available: *available,
                        },
                    )
                })
                .collect();
        }

        fn send(&mut self, line: &str) -> String {
            self.dispatcher.handle_line(line).to_string()
        }

        fn spoken(&self) -> Vec<(String, bool)> {
            self.voice.0.lock().clone()
        }
    }

    fn is_vocabulary(token: &str) -> bool {
        if token.is_empty() || token.contains('\n') || token.contains('\r') {
            return false;
        }
        matches!(token, "ok" | "wait" | "error" | "no_qr_found" | "no_sample")
            || token.starts_with("collected:")
            || token.split(',').all(|pair| {
                pair.split_once(':')
                    .is_some_and(|(position, _)| QrPosition::from_name(position).is_some())
            })
    }

    #[test]
    fn test_initial_state() {
        let h = harness();
        assert_eq!(h.dispatcher.state(), TaskState::Idle);
        assert!(h.dispatcher.session().is_empty());
    }

    #[test]
    fn test_unknown_command_is_error_in_any_state() {
        let mut h = harness();
        assert_eq!(h.send("dance"), "error");

        h.send("begin task");
        assert_eq!(h.dispatcher.state(), TaskState::TaskActive);
        assert_eq!(h.send("check window Z"), "error");
        assert_eq!(h.dispatcher.state(), TaskState::TaskActive);

        assert_eq!(h.journal.count(LogCategory::Error), 2);
    }

    #[test]
    fn test_begin_then_end_leaves_empty_session() {
        let mut h = harness();
        h.exam_board(&[(QrPosition::TopLeft, "A")]);
        h.lab_board(&[(1, true)]);
        h.send("scan exam board");
        h.send("scan lab board");
        assert!(!h.dispatcher.session().is_empty());

        assert_eq!(h.send("begin task"), "ok");
        assert_eq!(h.send("end task"), "ok");

        assert!(h.dispatcher.session().is_empty());
        assert_eq!(h.dispatcher.state(), TaskState::Idle);
        assert_eq!(h.events.try_recv().unwrap(), TaskEvent::TaskStarted);
        assert!(matches!(h.events.try_recv().unwrap(), TaskEvent::TaskEnded { .. }));
    }

    #[test]
    fn test_task_announcements_are_priority() {
        let mut h = harness();
        h.send("begin task");
        h.send("end task");

        assert_eq!(
            h.spoken(),
            vec![
                (announcements::system_start(), true),
                (announcements::system_end(), true)
            ]
        );
    }

    #[test]
    fn test_scan_exam_board_formats_and_replaces() {
        let mut h = harness();
        h.exam_board(&[(QrPosition::TopRight, "C"), (QrPosition::TopLeft, "AB")]);

        let first = h.send("scan exam board");
        let second = h.send("scan exam board");
        assert_eq!(first, "top_left:AB,top_right:C");
        assert_eq!(first, second);

        h.exam_board(&[(QrPosition::BottomRight, "B")]);
        assert_eq!(h.send("scan exam board"), "bottom_right:B");

        let detections = h.dispatcher.session().detections();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[&QrPosition::BottomRight], "B");
        assert_eq!(h.journal.count(LogCategory::Recognition), 5);
    }

    #[test]
    fn test_scan_response_round_trips() {
        let mut h = harness();
        h.exam_board(&[
            (QrPosition::TopLeft, "AB"),
            (QrPosition::BottomLeft, "C"),
            (QrPosition::BottomRight, "ABC"),
        ]);

        let token = h.send("scan exam board");
        let parsed: BTreeMap<QrPosition, String> = token
            .split(',')
            .map(|pair| {
                let (position, content) = pair.split_once(':').unwrap();
                (QrPosition::from_name(position).unwrap(), content.to_string())
            })
            .collect();

        assert_eq!(parsed, *h.recognition.exam.lock());
    }

    #[test]
    fn test_scan_exam_board_empty_and_failure() {
        let mut h = harness();
        assert_eq!(h.send("scan exam board"), "no_qr_found");

        h.exam_board(&[(QrPosition::TopLeft, "A")]);
        h.send("scan exam board");

        h.recognition.failures.store(1, Ordering::SeqCst);
        assert_eq!(h.send("scan exam board"), "error");

        // A failed scan leaves the previous detections in place
        assert_eq!(h.dispatcher.session().detections().len(), 1);
        assert!(h
            .journal
            .0
            .lock()
            .iter()
            .any(|(c, m)| *c == LogCategory::Error && m.starts_with("QR recognition failed")));
    }

    #[test]
    fn test_recognition_attempts_are_configurable() {
        let mut h = harness_with(RecognitionConfig {
            qr_attempts: 3,
            ocr_attempts: 1,
        });
        h.exam_board(&[(QrPosition::TopLeft, "A")]);

        h.recognition.failures.store(2, Ordering::SeqCst);
        assert_eq!(h.send("scan exam board"), "top_left:A");
        assert_eq!(h.recognition.calls.load(Ordering::SeqCst), 3);

        h.recognition.failures.store(1, Ordering::SeqCst);
        assert_eq!(h.send("scan lab board"), "error");
        assert_eq!(h.recognition.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_check_window_scenario() {
        let mut h = harness();
        h.exam_board(&[(QrPosition::TopLeft, "AB"), (QrPosition::TopRight, "C")]);
        h.send("scan exam board");

        assert_eq!(h.send("check window A"), "collected:venous blood");
        assert_eq!(h.send("check window B"), "collected:venous blood");
        assert_eq!(h.send("check window C"), "collected:saliva");

        let spoken = h.spoken();
        assert_eq!(spoken.len(), 3);
        assert_eq!(spoken[2], ("Received saliva sample".to_string(), false));
        assert_eq!(h.journal.count(LogCategory::Sampling), 3);
    }

    #[test]
    fn test_check_window_combines_positions() {
        let mut h = harness();
        h.exam_board(&[(QrPosition::TopLeft, "A"), (QrPosition::BottomLeft, "AA")]);
        h.send("scan exam board");

        assert_eq!(h.send("check A"), "collected:venous blood,tissue");
        assert_eq!(
            h.spoken(),
            vec![("Received venous blood and tissue samples".to_string(), false)]
        );
        assert_eq!(h.send("check window B"), "no_sample");
        assert_eq!(h.spoken().len(), 1);
    }

    #[test]
    fn test_scan_lab_board_waits_for_busy_needed_window() {
        let mut h = harness();
        h.exam_board(&[(QrPosition::TopRight, "B")]);
        h.send("scan exam board");

        h.lab_board(&[(1, true), (2, false), (3, true), (4, true)]);
        assert_eq!(h.send("scan lab board"), "wait");
        assert_eq!(
            h.spoken(),
            vec![(announcements::window_busy("Body Fluid Window"), false)]
        );
        assert_eq!(h.dispatcher.session().station_status().len(), 4);

        h.lab_board(&[(1, true), (2, true), (3, true), (4, true)]);
        assert_eq!(h.send("scan lab board"), "ok");
        assert_eq!(h.spoken().len(), 1);
    }

    #[test]
    fn test_scan_lab_board_ignores_unneeded_busy_windows() {
        let mut h = harness();
        h.exam_board(&[(QrPosition::TopLeft, "A")]);
        h.send("scan exam board");

        h.lab_board(&[(1, true), (4, false)]);
        assert_eq!(h.send("scan lab board"), "ok");
        assert!(h.spoken().is_empty());
    }

    #[test]
    fn test_check_lab_window_scenario() {
        let mut h = harness();
        assert_eq!(h.send("check lab window 3"), "ok");

        h.exam_board(&[(QrPosition::BottomLeft, "AB")]);
        h.send("scan exam board");
        assert_eq!(h.send("check lab window 3"), "wait");
        assert_eq!(
            h.spoken(),
            vec![(
                announcements::delivery_arrival("Immunoassay Window", 2),
                false
            )]
        );
        assert_eq!(h.send("check 1"), "ok");
        assert_eq!(h.journal.count(LogCategory::Delivery), 3);
    }

    #[test]
    fn test_every_response_is_one_vocabulary_token() {
        let mut h = harness();
        h.exam_board(&[(QrPosition::TopLeft, "AB\nC"), (QrPosition::TopRight, "")]);
        h.lab_board(&[(1, false)]);

        for line in [
            "begin task",
            "scan exam board",
            "check window A",
            "check window C",
            "scan lab board",
            "check lab window 1",
            "check lab window 2",
            "",
            "  ",
            "end task",
            "end task",
            "garbage\twith tab",
        ] {
            let token = h.send(line);
            assert!(is_vocabulary(&token), "{line:?} produced {token:?}");
        }
    }

    #[test]
    fn test_run_answers_lines_in_order() {
        let h = harness();
        h.exam_board(&[(QrPosition::TopLeft, "A")]);

        let (tx, rx) = mpsc::channel(8);
        for line in ["begin task", "scan exam board", "nope", "end task"] {
            tx.blocking_send(InboundLine::new(line)).unwrap();
        }
        drop(tx);

        let writer = Arc::new(RecordingWriter::default());
        let status = h.dispatcher.run(rx, writer.clone(), Arc::new(AtomicBool::new(true)));

        assert_eq!(*writer.sent.lock(), vec!["ok", "top_left:A", "error", "ok"]);
        assert_eq!(status.commands_handled, 4);
        assert_eq!(status.state, TaskState::Idle);
        assert_eq!(h.journal.count(LogCategory::UartSend), 4);
        assert_eq!(h.journal.count(LogCategory::UartReceive), 4);
    }

    #[test]
    fn test_run_logs_send_failures() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        tx.blocking_send(InboundLine::new("begin task")).unwrap();
        drop(tx);

        let writer = Arc::new(RecordingWriter {
            fail: true,
            ..Default::default()
        });
        h.dispatcher.run(rx, writer, Arc::new(AtomicBool::new(true)));

        assert_eq!(h.journal.count(LogCategory::UartSend), 0);
        assert!(h
            .journal
            .0
            .lock()
            .iter()
            .any(|(c, m)| *c == LogCategory::Error && m.contains("communication error")));
    }

    #[test]
    fn test_run_leaves_lines_unanswered_once_stopped() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        tx.blocking_send(InboundLine::new("begin task")).unwrap();

        let writer = Arc::new(RecordingWriter::default());
        let status = h.dispatcher.run(rx, writer.clone(), Arc::new(AtomicBool::new(false)));

        assert_eq!(status.commands_handled, 0);
        assert!(writer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_dispatcher_exits_when_lines_end() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        let writer = Arc::new(RecordingWriter::default());
        let mut handle = h
            .dispatcher
            .spawn(rx, writer.clone(), Arc::new(AtomicBool::new(true)))
            .unwrap();

        tx.send(InboundLine::new("begin task")).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), handle.exited())
            .await
            .unwrap();
        let status = handle.join(Duration::from_secs(1)).unwrap();
        assert_eq!(status.commands_handled, 1);
        assert_eq!(*writer.sent.lock(), vec!["ok"]);
    }

    #[test]
    fn test_join_is_bounded_while_a_scan_blocks() {
        let h = harness();
        *h.recognition.delay.lock() = Some(Duration::from_secs(3));

        let (tx, rx) = mpsc::channel(8);
        let running = Arc::new(AtomicBool::new(true));
        let handle = h
            .dispatcher
            .spawn(rx, Arc::new(RecordingWriter::default()), Arc::clone(&running))
            .unwrap();

        tx.blocking_send(InboundLine::new("scan exam board")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while h.recognition.calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.recognition.calls.load(Ordering::SeqCst), 1);

        running.store(false, Ordering::SeqCst);
        drop(tx);

        let begun = Instant::now();
        assert!(handle.join(Duration::from_millis(100)).is_none());
        assert!(begun.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_status_serializes() {
        let mut h = harness();
        h.exam_board(&[(QrPosition::TopLeft, "A")]);
        h.lab_board(&[(2, false)]);
        h.send("begin task");
        h.send("scan exam board");
        h.send("scan lab board");

        let json = serde_json::to_value(h.dispatcher.status()).unwrap();
        assert_eq!(json["state"], "task_active");
        assert_eq!(json["commands_handled"], 3);
        assert_eq!(json["detections"]["top_left"], "A");
        assert_eq!(json["station_status"]["2"]["available"], false);
    }
}
