pub mod settings;

pub use settings::SimulationConfig;
