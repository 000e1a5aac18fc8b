mod shutdown;

pub mod command;
pub mod config;
pub mod executor;
pub mod modbus;
pub mod mqtt;
pub mod server;
pub mod status;

mod error;
pub use error::{ConfigError, ConnectError, ConnectErrorKind, Error, RangeError, WriteError};

pub type Result<T> = std::result::Result<T, Error>;
