pub mod measurement;
pub mod sensors;

pub use measurement::{Measurement, SensorId, SensorKind};
pub use sensors::{crane_channels, MeasurementSource, SensorChannel, ValueRange};
