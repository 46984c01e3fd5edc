//! Station layout: QR positions on the exam board, exam window labels and
//! lab analysis windows.
//!
//! The layout is read once from configuration and shared immutably with the
//! dispatcher and recognition backends.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the four fixed QR slots on the exam-area board
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl QrPosition {
    #[cfg(test)]
    pub const ALL: [QrPosition; 4] = [
        QrPosition::TopLeft,
        QrPosition::TopRight,
        QrPosition::BottomLeft,
        QrPosition::BottomRight,
    ];

    /// Wire name of the position, as used in `scan exam board` responses
    pub fn as_str(&self) -> &'static str {
        match self {
            QrPosition::TopLeft => "top_left",
            QrPosition::TopRight => "top_right",
            QrPosition::BottomLeft => "bottom_left",
            QrPosition::BottomRight => "bottom_right",
        }
    }

    #[cfg(test)]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|position| position.as_str() == name)
    }
}

impl fmt::Display for QrPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-letter exam window label embedded in QR content
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WindowLabel {
    A,
    B,
    C,
}

impl WindowLabel {
    /// Exact, case-sensitive conversion used by the command parser
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(WindowLabel::A),
            'B' => Some(WindowLabel::B),
            'C' => Some(WindowLabel::C),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            WindowLabel::A => 'A',
            WindowLabel::B => 'B',
            WindowLabel::C => 'C',
        }
    }
}

impl fmt::Display for WindowLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Extract the window labels named by a QR content string.
///
/// Content is matched case-insensitively; unknown characters are ignored
/// and repeated labels are kept.
pub fn labels_in(content: &str) -> Vec<WindowLabel> {
    content
        .chars()
        .filter_map(|c| WindowLabel::from_char(c.to_ascii_uppercase()))
        .collect()
}

/// Identifier of a lab analysis window (1..=4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct LabWindowId(u8);

impl LabWindowId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 4;

    pub fn new(id: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&id).then_some(Self(id))
    }

    #[cfg(test)]
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for LabWindowId {
    type Error = String;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::new(id).ok_or_else(|| {
            format!(
                "lab window id {} outside {}..={}",
                id,
                Self::MIN,
                Self::MAX
            )
        })
    }
}

impl From<LabWindowId> for u8 {
    fn from(id: LabWindowId) -> Self {
        id.0
    }
}

impl fmt::Display for LabWindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where samples read from one QR position are delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionStation {
    pub position: QrPosition,
    pub window: LabWindowId,
    pub sample_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabWindow {
    pub id: LabWindowId,
    pub name: String,
}

/// Sample information derived from one QR detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleInfo {
    pub window_id: LabWindowId,
    pub window_name: String,
    pub sample_type: String,
    pub target_labels: Vec<WindowLabel>,
    pub count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StationMapError {
    #[error("QR position {0} is mapped more than once")]
    DuplicatePosition(QrPosition),

    #[error("QR position {position} targets lab window {window}, which has no name")]
    UnknownWindow {
        position: QrPosition,
        window: LabWindowId,
    },
}

/// Static mapping from QR positions to lab windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationMap {
    pub positions: Vec<PositionStation>,
    pub windows: Vec<LabWindow>,
}

impl Default for StationMap {
    fn default() -> Self {
        let stations = [
            (QrPosition::TopLeft, 1, "Blood Routine Window", "venous blood"),
            (QrPosition::TopRight, 2, "Body Fluid Window", "saliva"),
            (QrPosition::BottomLeft, 3, "Immunoassay Window", "tissue"),
            (QrPosition::BottomRight, 4, "Hormone Testing Window", "plasma"),
        ];

        let mut positions = Vec::with_capacity(stations.len());
        let mut windows = Vec::with_capacity(stations.len());
        for (position, id, name, sample_type) in stations {
            let id = LabWindowId(id);
            positions.push(PositionStation {
                position,
                window: id,
                sample_type: sample_type.to_string(),
            });
            windows.push(LabWindow {
                id,
                name: name.to_string(),
            });
        }

        Self { positions, windows }
    }
}

impl StationMap {
    pub fn station(&self, position: QrPosition) -> Option<&PositionStation> {
        self.positions.iter().find(|s| s.position == position)
    }

    /// Display name of a lab window, falling back to its number
    pub fn window_name(&self, id: LabWindowId) -> String {
        self.windows
            .iter()
            .find(|w| w.id == id)
            .map(|w| w.name.clone())
            .unwrap_or_else(|| format!("window {}", id))
    }

    /// Resolve a QR detection into the sample it describes.
    ///
    /// Returns `None` when the position has no configured station.
    pub fn sample_info(&self, position: QrPosition, content: &str) -> Option<SampleInfo> {
        let station = self.station(position)?;
        let target_labels = labels_in(content);

        Some(SampleInfo {
            window_id: station.window,
            window_name: self.window_name(station.window),
            sample_type: station.sample_type.clone(),
            count: target_labels.len(),
            target_labels,
        })
    }

    pub fn validate(&self) -> Result<(), StationMapError> {
        for (i, station) in self.positions.iter().enumerate() {
            if self.positions[..i]
                .iter()
                .any(|s| s.position == station.position)
            {
                return Err(StationMapError::DuplicatePosition(station.position));
            }
            if !self.windows.iter().any(|w| w.id == station.window) {
                return Err(StationMapError::UnknownWindow {
                    position: station.position,
                    window: station.window,
                });
            }
        }
        Ok(())
    }
}
