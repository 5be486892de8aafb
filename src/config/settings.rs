use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::devices::{crane_channels, SensorChannel, ValueRange};
use crate::output::telegram::{SentenceKind, TalkerId, TelegramSpec};
use crate::utils::error::SimulationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    // Simulation clock
    pub tick_interval_ms: u64,
    pub tick_limit: Option<u64>,
    pub seed: Option<u64>,

    pub sensor_count: usize,

    // Network
    pub host: String,
    pub register_port: u16,
    pub telegram_port: u16,
    pub max_clients: usize,

    // Register surface
    pub register_base: u16,
    pub register_count: u16,

    // Telegram surface
    pub talker_id: String,
    pub sentence: SentenceKind,
    pub precision: usize,

    // Pipeline tuning
    pub queue_depth: usize,
    pub write_timeout_ms: u64,
    pub drain_timeout_ms: u64,

    // Value ranges stay last so they serialize as trailing TOML tables
    pub register_range: ValueRange,
    pub angular_rate_range: ValueRange,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2000,
            tick_limit: None,
            seed: None,

            sensor_count: 4,

            host: "127.0.0.1".to_string(),
            register_port: 502,
            telegram_port: 8888,
            max_clients: 3,

            register_base: 0,
            register_count: 100,

            talker_id: "MG".to_string(),
            sentence: SentenceKind::Rot,
            precision: 1,

            queue_depth: 16,
            write_timeout_ms: 1000,
            drain_timeout_ms: 500,

            register_range: ValueRange::new(1.0, 100.0),
            angular_rate_range: ValueRange::new(0.0, 360.0),
        }
    }
}

impl SimulationConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SimulationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SimulationError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: SimulationConfig = toml::from_str(&content)?;
        info!("📄 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SimulationError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, SimulationError> {
        toml::to_string_pretty(self)
            .map_err(|e| SimulationError::ConfigError(format!("TOML serialization failed: {}", e)))
    }

    /// Loads the optional `--config` file and applies command line overrides.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, SimulationError> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_matches(matches)?;
        Ok(config)
    }

    fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), SimulationError> {
        if let Some(host) = matches.get_one::<String>("host") {
            self.host = host.clone();
        }
        if let Some(port) = parse_arg::<u16>(matches, "register-port")? {
            self.register_port = port;
        }
        if let Some(port) = parse_arg::<u16>(matches, "telegram-port")? {
            self.telegram_port = port;
        }
        if let Some(interval) = parse_arg::<u64>(matches, "interval-ms")? {
            self.tick_interval_ms = interval;
        }
        if let Some(count) = parse_arg::<usize>(matches, "sensors")? {
            self.sensor_count = count;
        }
        if let Some(max) = parse_arg::<usize>(matches, "max-clients")? {
            self.max_clients = max;
        }
        if let Some(seed) = parse_arg::<u64>(matches, "seed")? {
            self.seed = Some(seed);
        }
        if let Some(ticks) = parse_arg::<u64>(matches, "ticks")? {
            self.tick_limit = Some(ticks);
        }
        debug!("⚙️  Effective configuration: {:?}", self);
        Ok(())
    }

    /// Rejects any configuration the simulation could not run with.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.tick_interval_ms == 0 {
            return Err(SimulationError::ConfigError(
                "tick interval must be greater than zero".to_string(),
            ));
        }
        if self.sensor_count == 0 {
            return Err(SimulationError::ConfigError(
                "at least one register sensor is required".to_string(),
            ));
        }
        if self.max_clients == 0 {
            return Err(SimulationError::ConfigError(
                "max_clients must be at least 1".to_string(),
            ));
        }
        if self.write_timeout_ms == 0 || self.drain_timeout_ms == 0 {
            return Err(SimulationError::ConfigError(
                "write and drain timeouts must be greater than zero".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(SimulationError::ConfigError(
                "queue_depth must be at least 1".to_string(),
            ));
        }

        self.register_range.validate("register")?;
        self.angular_rate_range.validate("angular rate")?;
        if self.register_range.min < 0.0 || self.register_range.max > f64::from(u16::MAX) {
            return Err(SimulationError::ConfigError(format!(
                "register range ({}, {}) must lie within 0..={}",
                self.register_range.min,
                self.register_range.max,
                u16::MAX
            )));
        }
        if self.register_range.min.ceil() > self.register_range.max.floor() {
            return Err(SimulationError::ConfigError(format!(
                "register range ({}, {}) contains no whole number",
                self.register_range.min, self.register_range.max
            )));
        }

        let last_address = u32::from(self.register_base) + self.sensor_count as u32;
        if last_address > u32::from(self.register_count) {
            return Err(SimulationError::ConfigError(format!(
                "{} sensors starting at register {} do not fit into a bank of {} registers",
                self.sensor_count, self.register_base, self.register_count
            )));
        }

        TalkerId::parse(&self.talker_id)?;
        if self.precision > 6 {
            return Err(SimulationError::ConfigError(format!(
                "precision {} exceeds 6 decimal places",
                self.precision
            )));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn telegram_address(&self) -> String {
        format!("{}:{}", self.host, self.telegram_port)
    }

    pub fn register_address(&self) -> String {
        format!("{}:{}", self.host, self.register_port)
    }

    pub fn channels(&self) -> Vec<SensorChannel> {
        crane_channels(self.sensor_count, self.register_range, self.angular_rate_range)
    }

    pub fn telegram_spec(&self) -> Result<TelegramSpec, SimulationError> {
        Ok(TelegramSpec::new(
            TalkerId::parse(&self.talker_id)?,
            self.sentence,
            self.precision,
        ))
    }
}

fn parse_arg<T>(matches: &ArgMatches, name: &str) -> Result<Option<T>, SimulationError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match matches.get_one::<String>(name) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
            SimulationError::ConfigError(format!("invalid value '{}' for --{}: {}", raw, name, e))
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.telegram_address(), "127.0.0.1:8888");
        assert_eq!(config.channels().len(), 5);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let cases: Vec<Box<dyn Fn(&mut SimulationConfig)>> = vec![
            Box::new(|c| c.tick_interval_ms = 0),
            Box::new(|c| c.sensor_count = 0),
            Box::new(|c| c.max_clients = 0),
            Box::new(|c| c.register_range = ValueRange::new(50.0, 50.0)),
            Box::new(|c| c.angular_rate_range = ValueRange::new(360.0, 0.0)),
            Box::new(|c| c.angular_rate_range = ValueRange::new(-1e308, 1e308)),
            Box::new(|c| c.write_timeout_ms = 0),
            Box::new(|c| c.drain_timeout_ms = 0),
            Box::new(|c| c.register_range = ValueRange::new(-5.0, 10.0)),
            Box::new(|c| c.register_range = ValueRange::new(1.2, 1.8)),
            Box::new(|c| c.register_base = 98),
            Box::new(|c| c.talker_id = "M".to_string()),
        ];

        for (i, mutate) in cases.iter().enumerate() {
            let mut config = SimulationConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(SimulationError::ConfigError(_))),
                "case {} should be rejected",
                i
            );
        }
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SimulationConfig = toml::from_str(
            r#"
            tick_interval_ms = 100
            telegram_port = 9000
            sentence = "MTW"

            [register_range]
            min = 20.0
            max = 90.0
            "#,
        )
        .unwrap();

        assert_eq!(config.tick_interval_ms, 100);
        assert_eq!(config.telegram_port, 9000);
        assert_eq!(config.sentence, SentenceKind::Mtw);
        assert_eq!(config.register_range, ValueRange::new(20.0, 90.0));
        assert_eq!(config.sensor_count, 4);
        assert_eq!(config.max_clients, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = SimulationConfig::default();
        config.seed = Some(11);
        let text = config.to_toml().unwrap();
        let parsed: SimulationConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.seed, Some(11));
        assert_eq!(parsed.talker_id, config.talker_id);
    }
}
