use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to bind listener on {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Illegal holding register address: {0}")]
    IllegalAddress(u16),

    #[error("Value {0} does not fit into a holding register")]
    ValueOutOfRange(f64),

    #[error("Invalid telegram: {0}")]
    InvalidTelegram(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout occurred")]
    Timeout,
}

impl SimulationError {
    /// Errors that only affect a single client or register write.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SimulationError::CommunicationError(_)
                | SimulationError::IllegalAddress(_)
                | SimulationError::ValueOutOfRange(_)
                | SimulationError::Timeout
        )
    }
}

impl From<std::io::Error> for SimulationError {
    fn from(err: std::io::Error) -> Self {
        SimulationError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for SimulationError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SimulationError::Timeout
    }
}

impl From<toml::de::Error> for SimulationError {
    fn from(err: toml::de::Error) -> Self {
        SimulationError::ConfigError(format!("TOML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SimulationError::Timeout.is_transient());
        assert!(SimulationError::IllegalAddress(7).is_transient());
        assert!(!SimulationError::ConfigError("bad".to_string()).is_transient());

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: SimulationError = io.into();
        assert!(err.is_transient());
        assert!(err.to_string().contains("pipe"));
    }
}
