pub mod assignment;
pub mod protocol;
pub mod server;
pub mod store;

pub use assignment::RegisterAssignment;
pub use protocol::{ExceptionCode, ModbusRequest, ModbusResponse};
pub use server::ModbusTcpServer;
pub use store::{HoldingRegisterBank, RegisterStore};
