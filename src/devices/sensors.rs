use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::measurement::{Measurement, SensorId, SensorKind};
use crate::utils::error::SimulationError;

/// Inclusive numeric bounds for a sensor's simulated values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn validate(&self, label: &str) -> Result<(), SimulationError> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(SimulationError::ConfigError(format!(
                "{} range must be finite, got ({}, {})",
                label, self.min, self.max
            )));
        }
        if self.min >= self.max {
            return Err(SimulationError::ConfigError(format!(
                "{} range minimum {} must be below maximum {}",
                label, self.min, self.max
            )));
        }
        // The sampler needs a finite width, not just finite bounds
        if !(self.max - self.min).is_finite() {
            return Err(SimulationError::ConfigError(format!(
                "{} range ({}, {}) is too wide to sample",
                label, self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorChannel {
    pub id: SensorId,
    pub kind: SensorKind,
    pub range: ValueRange,
}

impl SensorChannel {
    pub fn new(id: SensorId, kind: SensorKind, range: ValueRange) -> Self {
        Self { id, kind, range }
    }
}

/// Sensor layout of the simulated crane: `temperature_sensors` register
/// channels numbered from zero, followed by one slewing rate-of-turn channel.
pub fn crane_channels(
    temperature_sensors: usize,
    temperature_range: ValueRange,
    angular_rate_range: ValueRange,
) -> Vec<SensorChannel> {
    let mut channels: Vec<SensorChannel> = (0..temperature_sensors)
        .map(|i| SensorChannel::new(SensorId(i as u16), SensorKind::Temperature, temperature_range))
        .collect();
    channels.push(SensorChannel::new(
        SensorId(temperature_sensors as u16),
        SensorKind::AngularRate,
        angular_rate_range,
    ));
    channels
}

/// Produces uncorrelated readings, one per channel per call.
///
/// The generator is owned by a single task; each concurrent producer gets its
/// own `MeasurementSource`.
pub struct MeasurementSource {
    rng: StdRng,
}

impl MeasurementSource {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    pub fn generate(&mut self, channels: &[SensorChannel], tick: u64) -> Vec<Measurement> {
        let timestamp = Instant::now();
        let measurements: Vec<Measurement> = channels
            .iter()
            .map(|channel| Measurement {
                sensor_id: channel.id,
                kind: channel.kind,
                value: self.sample(channel),
                tick,
                timestamp,
            })
            .collect();

        debug!(
            "🎲 Tick {} generated [{}]",
            tick,
            measurements
                .iter()
                .map(|m| format!("{}={}", m.sensor_id, m.value))
                .collect::<Vec<_>>()
                .join(", ")
        );
        measurements
    }

    fn sample(&mut self, channel: &SensorChannel) -> f64 {
        let ValueRange { min, max } = channel.range;
        if channel.kind.is_integral() {
            let low = min.ceil() as i64;
            let high = (max.floor() as i64).max(low);
            self.rng.random_range(low..=high) as f64
        } else {
            self.rng.random_range(min..max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        assert!(ValueRange::new(1.0, 100.0).validate("register").is_ok());
        assert!(ValueRange::new(5.0, 5.0).validate("register").is_err());
        assert!(ValueRange::new(10.0, 1.0).validate("register").is_err());
        assert!(ValueRange::new(f64::NAN, 1.0).validate("register").is_err());
        assert!(ValueRange::new(-1e308, 1e308).validate("angular rate").is_err());
    }

    #[test]
    fn test_crane_channel_layout() {
        let channels = crane_channels(4, ValueRange::new(1.0, 100.0), ValueRange::new(0.0, 360.0));
        assert_eq!(channels.len(), 5);
        assert!(channels[..4].iter().all(|c| c.kind == SensorKind::Temperature));
        assert_eq!(channels[4].kind, SensorKind::AngularRate);
        assert_eq!(channels[4].id, SensorId(4));
    }

    #[test]
    fn test_generate_one_value_per_channel_within_range() {
        let channels = crane_channels(4, ValueRange::new(1.0, 100.0), ValueRange::new(0.0, 360.0));
        let mut source = MeasurementSource::seeded(42);

        for tick in 1..=200 {
            let batch = source.generate(&channels, tick);
            assert_eq!(batch.len(), channels.len());
            for (m, channel) in batch.iter().zip(&channels) {
                assert_eq!(m.sensor_id, channel.id);
                assert_eq!(m.tick, tick);
                assert!(channel.range.contains(m.value), "{} out of range", m);
                if channel.kind.is_integral() {
                    assert_eq!(m.value.fract(), 0.0);
                }
            }
        }
    }

    #[test]
    fn test_widest_accepted_range_samples_without_panicking() {
        let range = ValueRange::new(-8e307, 8e307);
        assert!(range.validate("angular rate").is_ok());

        let channels = crane_channels(1, ValueRange::new(1.0, 100.0), range);
        let batch = MeasurementSource::seeded(1).generate(&channels, 1);
        assert!(range.contains(batch[1].value));
    }

    #[test]
    fn test_seeded_sources_are_reproducible() {
        let channels = crane_channels(3, ValueRange::new(1.0, 100.0), ValueRange::new(0.0, 360.0));
        let mut a = MeasurementSource::seeded(7);
        let mut b = MeasurementSource::seeded(7);
        let values_a: Vec<f64> = a.generate(&channels, 1).iter().map(|m| m.value).collect();
        let values_b: Vec<f64> = b.generate(&channels, 1).iter().map(|m| m.value).collect();
        assert_eq!(values_a, values_b);
    }
}
