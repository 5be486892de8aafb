pub mod error;

pub use error::SimulationError;
