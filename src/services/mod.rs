pub mod connections;
pub mod scheduler;
pub mod shutdown;

pub use connections::{ClientHandle, ClientId, ClientInfo, ConnectionManager};
pub use scheduler::{DispatchStats, SchedulerState, SimulationScheduler};
pub use shutdown::{Shutdown, ShutdownTrigger};
