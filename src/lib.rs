pub mod control;
pub mod correlator;
pub mod error;
pub mod fleet;
pub mod link;
pub mod progress;
pub mod services;
pub mod simulator;
pub mod state_cache;
pub mod state_machine;
pub mod transport;
pub mod unit;

pub use error::{ErrorKind, SessionError, SessionResult};
pub use link::{DeviceLink, LinkConfig};
pub use unit::{DeviceTopics, UnitId};
