use serde::{Deserialize, Serialize};
use std::fmt;

use crate::devices::SensorKind;
use crate::utils::error::SimulationError;

/// Two-character sender identifier, e.g. `MG` or `CR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TalkerId([u8; 2]);

impl TalkerId {
    pub fn parse(raw: &str) -> Result<Self, SimulationError> {
        match raw.as_bytes() {
            [a, b] if a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric() => {
                Ok(Self([a.to_ascii_uppercase(), b.to_ascii_uppercase()]))
            }
            _ => Err(SimulationError::ConfigError(format!(
                "talker id '{}' must be exactly two ASCII letters or digits",
                raw
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        // Both bytes are ASCII alphanumerics, checked in `parse`.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl fmt::Display for TalkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SentenceKind {
    /// Rate of turn: `rate,status`.
    #[serde(rename = "ROT")]
    Rot,
    /// Mean water temperature: `temperature,unit`.
    #[serde(rename = "MTW")]
    Mtw,
}

impl SentenceKind {
    pub fn code(&self) -> &'static str {
        match self {
            SentenceKind::Rot => "ROT",
            SentenceKind::Mtw => "MTW",
        }
    }

    /// Sensor kind whose readings this sentence carries.
    pub fn sensor_kind(&self) -> SensorKind {
        match self {
            SentenceKind::Rot => SensorKind::AngularRate,
            SentenceKind::Mtw => SensorKind::Temperature,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "ROT" => Some(SentenceKind::Rot),
            "MTW" => Some(SentenceKind::Mtw),
            _ => None,
        }
    }
}

impl fmt::Display for SentenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Static description of how measurements become telegram fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelegramSpec {
    pub talker: TalkerId,
    pub kind: SentenceKind,
    pub precision: usize,
}

impl TelegramSpec {
    pub fn new(talker: TalkerId, kind: SentenceKind, precision: usize) -> Self {
        Self {
            talker,
            kind,
            precision,
        }
    }

    pub fn fields(&self, value: f64) -> Vec<String> {
        let rendered = format!("{:.*}", self.precision, value);
        match self.kind {
            SentenceKind::Rot => vec![rendered, "A".to_string()],
            SentenceKind::Mtw => vec![rendered, "C".to_string()],
        }
    }

    /// Largest difference between a value and its rendered field.
    pub fn tolerance(&self) -> f64 {
        0.5 * 10f64.powi(-(self.precision as i32))
    }
}
