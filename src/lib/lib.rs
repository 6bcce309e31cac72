pub mod bus;
pub mod config;
pub mod port;
pub mod protocol;
pub mod regs;
pub mod sim;
pub mod transport;

pub use bus::{Bus, BusClient, BusWorker, ExecError, Outcome, PumpError};
pub use config::{DeviceConfig, ProtocolConfig};
pub use protocol::{Address, Primitive};
pub use transport::Transport;
