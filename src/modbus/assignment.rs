use std::collections::BTreeMap;

use crate::devices::SensorId;
use crate::utils::error::SimulationError;

/// Fixed sensor to holding-register mapping. Addresses are unique and
/// contiguous from `base`, in the order the sensors were given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterAssignment {
    base: u16,
    addresses: BTreeMap<SensorId, u16>,
}

impl RegisterAssignment {
    pub fn contiguous(base: u16, sensors: &[SensorId]) -> Result<Self, SimulationError> {
        let mut addresses = BTreeMap::new();
        for (offset, sensor) in sensors.iter().enumerate() {
            let address = u16::try_from(u32::from(base) + offset as u32).map_err(|_| {
                SimulationError::ConfigError(format!(
                    "sensor {} would be mapped beyond register {}",
                    sensor,
                    u16::MAX
                ))
            })?;
            if addresses.insert(*sensor, address).is_some() {
                return Err(SimulationError::ConfigError(format!(
                    "sensor {} assigned to more than one register",
                    sensor
                )));
            }
        }
        Ok(Self { base, addresses })
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn address_of(&self, sensor: SensorId) -> Option<u16> {
        self.addresses.get(&sensor).copied()
    }

    /// Assigned addresses in ascending order.
    pub fn addresses(&self) -> Vec<u16> {
        let mut addresses: Vec<u16> = self.addresses.values().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}
