//! Outbound response tokens
//!
//! Every command is answered with exactly one line drawn from this closed
//! vocabulary.

use std::collections::BTreeMap;
use std::fmt;

use crate::stations::QrPosition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Wait,
    Error,
    NoQrFound,
    NoSample,
    /// Sample types picked up at an exam window, in board order
    Collected(Vec<String>),
    /// QR contents per position, in board order
    Detections(Vec<(QrPosition, String)>),
}

impl Response {
    /// Response for a completed exam board scan
    pub fn detections(detections: &BTreeMap<QrPosition, String>) -> Self {
        if detections.is_empty() {
            Response::NoQrFound
        } else {
            Response::Detections(
                detections
                    .iter()
                    .map(|(position, content)| (*position, content.clone()))
                    .collect(),
            )
        }
    }

    /// Response for an exam window check
    pub fn collected(sample_types: Vec<String>) -> Self {
        if sample_types.is_empty() {
            Response::NoSample
        } else {
            Response::Collected(sample_types)
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => f.write_str("ok"),
            Response::Wait => f.write_str("wait"),
            Response::Error => f.write_str("error"),
            Response::NoQrFound => f.write_str("no_qr_found"),
            Response::NoSample => f.write_str("no_sample"),
            Response::Collected(types) if types.is_empty() => f.write_str("no_sample"),
            Response::Collected(types) => {
                write!(f, "collected:{}", single_line(&types.join(",")))
            }
            Response::Detections(pairs) if pairs.is_empty() => f.write_str("no_qr_found"),
            Response::Detections(pairs) => {
                for (i, (position, content)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", position, single_line(content))?;
                }
                Ok(())
            }
        }
    }
}

/// Line terminators inside a token would split it on the wire
fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}
