use tracing::{debug, warn};

use crate::{
    modbus::{ConnectionManager, RegisterMapper, Transport, WriteRequest},
    ConnectError, WriteError,
};

pub const INVALID_REQUEST: &str = "invalid request";
pub const CONNECTION_UNAVAILABLE: &str = "connection unavailable";
pub const TRANSPORT_ERROR: &str = "transport error";

/// Result of one command. Every command produces exactly one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    pub panel_index: u16,
    pub success: bool,
    /// `None` when the request never resolved to an address.
    pub address: Option<u16>,
    pub error_reason: Option<String>,
}

impl WriteOutcome {
    fn ok(panel_index: u16, address: u16) -> Self {
        Self {
            panel_index,
            success: true,
            address: Some(address),
            error_reason: None,
        }
    }

    fn failed(panel_index: u16, address: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            panel_index,
            success: false,
            address,
            error_reason: Some(reason.into()),
        }
    }
}

/// Runs one addressed write at a time. Never retries; resubmitting is up to the command source.
pub struct CommandExecutor<T> {
    mapper: RegisterMapper,
    connection: ConnectionManager<T>,
}

impl<T: Transport> CommandExecutor<T> {
    pub fn new(mapper: RegisterMapper, connection: ConnectionManager<T>) -> Self {
        Self { mapper, connection }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager<T> {
        &mut self.connection
    }

    /// Opens the session ahead of the first command.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        self.connection.connect().await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn execute(&mut self, request: WriteRequest) -> WriteOutcome {
        let panel_index = request.panel_index;

        let write = match self.mapper.resolve(&request) {
            Ok(write) => write,
            Err(error) => {
                warn!(%error, "rejecting request");
                return WriteOutcome::failed(panel_index, None, INVALID_REQUEST);
            }
        };
        let address = write.address;

        if let Err(error) = self.connection.ensure_connected().await {
            warn!(%error, address, "no Modbus session for write");
            return WriteOutcome::failed(panel_index, Some(address), CONNECTION_UNAVAILABLE);
        }

        match self.connection.write(write).await {
            Ok(()) => {
                debug!(address, "write acknowledged");
                WriteOutcome::ok(panel_index, address)
            }
            Err(WriteError::Device(reason)) => {
                warn!(address, %reason, "device rejected write");
                WriteOutcome::failed(panel_index, Some(address), reason)
            }
            Err(error @ (WriteError::Transport(_) | WriteError::NotConnected)) => {
                self.connection.mark_failed(&error.to_string()).await;
                WriteOutcome::failed(panel_index, Some(address), TRANSPORT_ERROR)
            }
        }
    }
}
