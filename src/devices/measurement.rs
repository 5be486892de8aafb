use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Identifier of a simulated sensor channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId(pub u16);

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Crane component temperature in degrees Celsius, exposed as a holding register.
    Temperature,
    /// Slewing rate of turn in degrees per minute, streamed as a telegram.
    AngularRate,
}

impl SensorKind {
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::AngularRate => "°/min",
        }
    }

    /// Integral sensors only ever report whole numbers.
    pub fn is_integral(&self) -> bool {
        matches!(self, SensorKind::Temperature)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Temperature => write!(f, "temperature"),
            SensorKind::AngularRate => write!(f, "angular_rate"),
        }
    }
}

/// One synthetic reading. Sinks receive copies, never shared references.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub sensor_id: SensorId,
    pub kind: SensorKind,
    pub value: f64,
    pub tick: u64,
    pub timestamp: Instant,
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] = {}{} (tick {})",
            self.sensor_id,
            self.kind,
            self.value,
            self.kind.unit(),
            self.tick
        )
    }
}
