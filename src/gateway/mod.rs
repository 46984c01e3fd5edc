//! Collaborators called by command handlers: recognition, voice and the
//! operator journal

pub mod journal;
pub mod recognition;
pub mod voice;

pub use journal::{FileJournal, Journal, LogCategory};
pub use recognition::{
    Recognition, RecognitionError, SimulatedRecognition, UnavailableRecognition, WindowStatus,
};
pub use voice::{announcements, CommandSynthesizer, Voice, VoicePlayer};
