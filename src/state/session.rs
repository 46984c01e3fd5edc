//! Per-task session state
//!
//! Holds what the robot learned since the last `begin task`: which QR codes
//! were read on the exam board and which lab windows are free.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::gateway::WindowStatus;
use crate::stations::{LabWindowId, QrPosition, StationMap, WindowLabel};

/// Advisory task state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// No task running
    #[default]
    Idle,
    /// Between `begin task` and `end task`
    TaskActive,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Idle => write!(f, "Idle"),
            TaskState::TaskActive => write!(f, "TaskActive"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    detections: BTreeMap<QrPosition, String>,
    stations: BTreeMap<LabWindowId, WindowStatus>,
}

impl Session {
    pub fn detections(&self) -> &BTreeMap<QrPosition, String> {
        &self.detections
    }

    pub fn station_status(&self) -> &BTreeMap<LabWindowId, WindowStatus> {
        &self.stations
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty() && self.stations.is_empty()
    }

    pub fn replace_detections(&mut self, detections: BTreeMap<QrPosition, String>) {
        self.detections = detections;
    }

    pub fn replace_station_status(&mut self, stations: BTreeMap<LabWindowId, WindowStatus>) {
        self.stations = stations;
    }

    pub fn reset(&mut self) {
        self.detections.clear();
        self.stations.clear();
    }

    /// Sample types to collect at an exam window, in board order.
    ///
    /// A position contributes once however often its content names `label`.
    pub fn sample_types_for(&self, label: WindowLabel, map: &StationMap) -> Vec<String> {
        self.detections
            .iter()
            .filter_map(|(position, content)| map.sample_info(*position, content))
            .filter(|info| info.target_labels.contains(&label))
            .map(|info| info.sample_type)
            .collect()
    }

    /// Lab windows the detected samples must be delivered to, with their names
    pub fn needed_windows(&self, map: &StationMap) -> BTreeMap<LabWindowId, String> {
        self.detections
            .iter()
            .filter_map(|(position, content)| map.sample_info(*position, content))
            .map(|info| (info.window_id, info.window_name))
            .collect()
    }

    /// Number of samples to drop off at `window`
    pub fn samples_for_window(&self, window: LabWindowId, map: &StationMap) -> usize {
        self.detections
            .iter()
            .filter_map(|(position, content)| map.sample_info(*position, content))
            .filter(|info| info.window_id == window)
            .map(|info| info.count)
            .sum()
    }

    /// Needed windows whose sign reads unavailable
    pub fn busy_windows(&self, map: &StationMap) -> Vec<(LabWindowId, String)> {
        self.needed_windows(map)
            .into_iter()
            .filter(|(id, _)| self.stations.get(id).is_some_and(|s| !s.available))
            .collect()
    }
}
