//! Inbound command verbs
//!
//! Verbs are exact, case-sensitive strings. The firmware shipped with the
//! first robot revision still sends the short legacy forms, so both are
//! accepted.

use std::fmt;

use crate::stations::{LabWindowId, WindowLabel};

/// A recognised command from the robot controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a new task, clearing the session
    BeginTask,
    /// Read the QR codes on the exam-area board
    ScanExamBoard,
    /// Robot is at an exam window, collect its samples
    CheckWindow(WindowLabel),
    /// Read the availability board of the lab area
    ScanLabBoard,
    /// Robot is passing a lab window, decide whether to stop
    CheckLabWindow(LabWindowId),
    /// Finish the task, clearing the session
    EndTask,
}

impl Command {
    /// Parse a command line.
    ///
    /// Returns `None` when no handler exists for the verb.
    pub fn parse(line: &str) -> Option<Self> {
        let verb = line.trim();

        let command = match verb {
            "begin task" | "start" => Command::BeginTask,
            "scan exam board" | "check board 1" => Command::ScanExamBoard,
            "scan lab board" | "check board 2" => Command::ScanLabBoard,
            "end task" | "over" => Command::EndTask,
            _ => {
                if let Some(rest) = verb.strip_prefix("check lab window ") {
                    return parse_lab_window(rest).map(Command::CheckLabWindow);
                }
                if let Some(rest) = verb.strip_prefix("check window ") {
                    return parse_label(rest).map(Command::CheckWindow);
                }
                // Legacy "check A" / "check 3"
                let rest = verb.strip_prefix("check ")?;
                return parse_label(rest)
                    .map(Command::CheckWindow)
                    .or_else(|| parse_lab_window(rest).map(Command::CheckLabWindow));
            }
        };

        Some(command)
    }
}

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

fn parse_label(s: &str) -> Option<WindowLabel> {
    single_char(s).and_then(WindowLabel::from_char)
}

fn parse_lab_window(s: &str) -> Option<LabWindowId> {
    single_char(s)
        .and_then(|c| c.to_digit(10))
        .and_then(|d| LabWindowId::new(d as u8))
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::BeginTask => write!(f, "begin task"),
            Command::ScanExamBoard => write!(f, "scan exam board"),
            Command::CheckWindow(label) => write!(f, "check window {}", label),
            Command::ScanLabBoard => write!(f, "scan lab board"),
            Command::CheckLabWindow(id) => write!(f, "check lab window {}", id),
            Command::EndTask => write!(f, "end task"),
        }
    }
}
