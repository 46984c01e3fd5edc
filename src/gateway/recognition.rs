//! Board recognition
//!
//! Camera capture and QR/OCR decoding run outside the daemon. This module
//! defines what the dispatcher needs from them and the backends the daemon
//! can run with on its own.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::config::SimulationConfig;
use crate::stations::{LabWindowId, QrPosition};

/// Recognised state of one lab window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub text: String,
    pub available: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("no recognition backend is attached")]
    Unavailable,
}

pub trait Recognition: Send + Sync {
    /// Decode the QR codes on the exam-area board
    fn scan_exam_board(&self) -> Result<BTreeMap<QrPosition, String>, RecognitionError>;

    /// Read the availability sign of every lab window
    fn scan_lab_board(&self) -> Result<BTreeMap<LabWindowId, WindowStatus>, RecognitionError>;
}

const BUSY_MARKERS: &[&str] = &[
    "no vacancy",
    "unavailable",
    "busy",
    "occupied",
    "无空闲",
    "忙碌",
    "占用",
];

/// Interpret the OCR text of a window sign.
///
/// Anything without a busy marker, including unreadable text, counts as
/// available.
pub fn availability_from_text(text: &str) -> bool {
    let text = text.to_lowercase();
    !BUSY_MARKERS.iter().any(|m| text.contains(m))
}

/// Backend returning configured board contents
pub struct SimulatedRecognition {
    exam_board: BTreeMap<QrPosition, String>,
    lab_board: BTreeMap<LabWindowId, String>,
}

impl SimulatedRecognition {
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            exam_board: config
                .exam_board
                .iter()
                .map(|e| (e.position, e.content.clone()))
                .collect(),
            lab_board: config
                .lab_board
                .iter()
                .map(|e| (e.window, e.text.clone()))
                .collect(),
        }
    }
}

impl Recognition for SimulatedRecognition {
    fn scan_exam_board(&self) -> Result<BTreeMap<QrPosition, String>, RecognitionError> {
        debug!(codes = self.exam_board.len(), "simulated exam board scan");
        Ok(self.exam_board.clone())
    }

    fn scan_lab_board(&self) -> Result<BTreeMap<LabWindowId, WindowStatus>, RecognitionError> {
        debug!(windows = self.lab_board.len(), "simulated lab board scan");
        Ok(self
            .lab_board
            .iter()
            .map(|(id, text)| {
                let status = WindowStatus {
                    text: text.clone(),
                    available: availability_from_text(text),
                };
                (*id, status)
            })
            .collect())
    }
}

/// Backend used when nothing is attached; every scan fails
pub struct UnavailableRecognition;

impl Recognition for UnavailableRecognition {
    fn scan_exam_board(&self) -> Result<BTreeMap<QrPosition, String>, RecognitionError> {
        Err(RecognitionError::Unavailable)
    }

    fn scan_lab_board(&self) -> Result<BTreeMap<LabWindowId, WindowStatus>, RecognitionError> {
        Err(RecognitionError::Unavailable)
    }
}
