//! Crane Instrumentation Simulator
//!
//! Generates synthetic crane sensor readings on a fixed tick and publishes
//! them two ways: temperatures as Modbus holding registers, and the slewing
//! rate as NMEA 0183 telegrams streamed to a bounded set of TCP clients.

pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::SimulationConfig;
pub use devices::{Measurement, MeasurementSource, SensorId, SensorKind};
pub use modbus::{HoldingRegisterBank, ModbusTcpServer, RegisterAssignment, RegisterStore};
pub use output::{NmeaEncoder, RegisterSink, TelegramEncoder, TelegramSink, TelegramSpec};
pub use services::{ConnectionManager, SchedulerState, SimulationScheduler};
pub use utils::error::SimulationError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
