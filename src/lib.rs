pub mod admission;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod log;
pub mod reactor;
pub mod readiness;
pub mod reader;
pub mod server;
pub mod signal;
pub mod table;
pub mod transport;

pub use config::{AddressKey, ServerConfig};
pub use error::ReactorError;
pub use reactor::{Reactor, ReactorState, ReactorStats, ServerContext};
pub use signal::{SignalSource, Wakeup};
