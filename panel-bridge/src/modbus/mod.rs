use std::fmt;

use serde::Serialize;

pub mod connection;
pub mod register;
pub mod transport;

pub use connection::ConnectionManager;
pub use register::{DesiredValue, RegisterMapper, ResolvedWrite, WriteRequest, WriteValue};
pub use transport::{TcpTransport, Transport};

pub type UnitId = tokio_modbus::slave::SlaveId;

/// Lifecycle of the single Modbus session. Only [`ConnectionManager`] moves between these.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[test]
fn connection_state_serializes_lowercase() {
    use serde_json::json;
    assert_eq!(
        serde_json::to_value(ConnectionState::Failed).unwrap(),
        json!("failed")
    );
}
