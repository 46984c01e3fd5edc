//! Configuration loading and management
//!
//! Values come from built-in defaults, then an optional TOML file, then a
//! handful of environment overrides for the serial link.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stations::{LabWindowId, QrPosition, StationMap, StationMapError};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "PHARMABOT_CONFIG";

/// Configuration file picked up from the working directory
pub const DEFAULT_CONFIG_FILE: &str = "pharmabot.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Stations(#[from] StationMapError),
}

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub recognition: RecognitionConfig,
    pub voice: VoiceConfig,
    pub journal: JournalConfig,
    pub stations: StationMap,
    pub simulation: SimulationConfig,
}

/// Serial link to the robot controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Read timeout in seconds
    pub timeout_secs: f64,
    /// Total write attempts per response
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Capacity of the inbound line queue
    pub line_queue: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            timeout_secs: 1.0,
            max_retries: 3,
            retry_delay_ms: 100,
            line_queue: 32,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Attempts per recognition call; 1 means single-shot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub qr_attempts: u32,
    pub ocr_attempts: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            qr_attempts: 1,
            ocr_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// TTS program; the announcement text is passed as its last argument
    pub command: String,
    pub args: Vec<String>,
    pub idle_poll_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            command: "espeak".to_string(),
            args: Vec::new(),
            idle_poll_ms: 100,
        }
    }
}

impl VoiceConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub log_dir: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
        }
    }
}

/// Canned board contents used when no camera pipeline is attached
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
    pub exam_board: Vec<ExamBoardEntry>,
    pub lab_board: Vec<LabBoardEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamBoardEntry {
    pub position: QrPosition,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabBoardEntry {
    pub window: LabWindowId,
    pub text: String,
}

impl Config {
    /// Load configuration from file, environment and defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV).map(PathBuf::from).or_else(|| {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            local.exists().then_some(local)
        });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SERIAL_PORT") {
            self.serial.port = port;
        }
        if let Some(value) = lookup("SERIAL_BAUDRATE") {
            self.serial.baud_rate = parse_env("SERIAL_BAUDRATE", value)?;
        }
        if let Some(value) = lookup("SERIAL_TIMEOUT") {
            self.serial.timeout_secs = parse_env("SERIAL_TIMEOUT", value)?;
        }
        if let Some(value) = lookup("SERIAL_MAX_RETRIES") {
            self.serial.max_retries = parse_env("SERIAL_MAX_RETRIES", value)?;
        }
        if let Some(dir) = lookup("PHARMABOT_LOG_DIR") {
            self.journal.log_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("SIMULATION_MODE") {
            self.simulation.enabled = value.eq_ignore_ascii_case("true") || value == "1";
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.is_empty() {
            return Err(ConfigError::Invalid("serial.port is empty".into()));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be positive".into()));
        }
        if !(self.serial.timeout_secs.is_finite() && self.serial.timeout_secs > 0.0) {
            return Err(ConfigError::Invalid("serial.timeout_secs must be positive".into()));
        }
        if self.serial.max_retries == 0 {
            return Err(ConfigError::Invalid("serial.max_retries must be at least 1".into()));
        }
        if self.serial.line_queue == 0 {
            return Err(ConfigError::Invalid("serial.line_queue must be at least 1".into()));
        }
        if self.recognition.qr_attempts == 0 || self.recognition.ocr_attempts == 0 {
            return Err(ConfigError::Invalid(
                "recognition attempts must be at least 1".into(),
            ));
        }
        self.stations.validate()?;
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}
