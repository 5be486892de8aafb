use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use crate::utils::error::SimulationError;

/// Destination of simulated register values.
#[async_trait]
pub trait RegisterStore: Send + Sync {
    async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), SimulationError>;
}

/// In-memory holding registers shared between the simulation and the
/// Modbus TCP server.
pub struct HoldingRegisterBank {
    registers: RwLock<Vec<u16>>,
}

impl HoldingRegisterBank {
    pub fn new(size: u16) -> Self {
        Self {
            registers: RwLock::new(vec![0; usize::from(size)]),
        }
    }

    pub async fn size(&self) -> usize {
        self.registers.read().await.len()
    }

    pub async fn read_holding_registers(
        &self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, SimulationError> {
        let registers = self.registers.read().await;
        let range = Self::checked_range(registers.len(), start, count)?;
        Ok(registers[range].to_vec())
    }

    pub async fn write_holding_registers(
        &self,
        start: u16,
        values: &[u16],
    ) -> Result<(), SimulationError> {
        let count = u16::try_from(values.len()).map_err(|_| SimulationError::IllegalAddress(start))?;
        let mut registers = self.registers.write().await;
        let range = Self::checked_range(registers.len(), start, count)?;
        registers[range].copy_from_slice(values);
        Ok(())
    }

    fn checked_range(
        len: usize,
        start: u16,
        count: u16,
    ) -> Result<std::ops::Range<usize>, SimulationError> {
        let begin = usize::from(start);
        let end = begin + usize::from(count);
        if end > len {
            let first_bad = u16::try_from(begin.max(len)).unwrap_or(u16::MAX);
            return Err(SimulationError::IllegalAddress(first_bad));
        }
        Ok(begin..end)
    }
}

#[async_trait]
impl RegisterStore for HoldingRegisterBank {
    async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), SimulationError> {
        let mut registers = self.registers.write().await;
        match registers.get_mut(usize::from(address)) {
            Some(slot) => {
                *slot = value;
                debug!("📝 HR[{}] = {}", address, value);
                Ok(())
            }
            None => Err(SimulationError::IllegalAddress(address)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read_back() {
        let bank = HoldingRegisterBank::new(8);
        bank.write_holding_register(0, 42).await.unwrap();
        bank.write_holding_register(7, 99).await.unwrap();
        bank.write_holding_registers(2, &[5, 6]).await.unwrap();

        assert_eq!(
            bank.read_holding_registers(0, 8).await.unwrap(),
            vec![42, 0, 5, 6, 0, 0, 0, 99]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_access_rejected() {
        let bank = HoldingRegisterBank::new(4);
        assert!(matches!(
            bank.write_holding_register(4, 1).await,
            Err(SimulationError::IllegalAddress(4))
        ));
        assert!(bank.read_holding_registers(3, 2).await.is_err());
        assert!(bank.write_holding_registers(2, &[1, 2, 3]).await.is_err());
        assert_eq!(bank.read_holding_registers(0, 4).await.unwrap(), vec![0; 4]);
    }
}
