use std::time::Duration;

use async_trait::async_trait;
use tokio::{net::lookup_host, time::timeout};
use tokio_modbus::{
    client::{tcp, Client, Context as ModbusClient, Writer},
    slave::Slave,
};
use tracing::debug;

use crate::{
    config::ConnectionConfig,
    modbus::{register::WriteValue, ResolvedWrite},
    ConnectError, ConnectErrorKind, WriteError,
};

/// The wire underneath [`super::ConnectionManager`]. Implementations hold at most one session and must bound every
/// call by the configured timeout.
#[async_trait]
pub trait Transport: Send {
    /// Open a new session, replacing any previous one.
    async fn connect(&mut self, config: &ConnectionConfig) -> Result<(), ConnectError>;

    async fn write(&mut self, write: ResolvedWrite) -> Result<(), WriteError>;

    /// Close the session if there is one. Never fails.
    async fn disconnect(&mut self);
}

/// Modbus TCP via `tokio-modbus`.
#[derive(Default)]
pub struct TcpTransport {
    client: Option<ModbusClient>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, config: &ConnectionConfig) -> Result<(), ConnectError> {
        self.disconnect().await;
        self.timeout = config.timeout;

        let authority = config.authority();
        let socket_addr = timeout(config.timeout, lookup_host(authority.as_str()))
            .await
            .map_err(|_| ConnectError::timeout(format!("resolving {authority}")))?
            .map_err(|err| {
                ConnectError::new(
                    ConnectErrorKind::Refused,
                    format!("resolving {authority}: {err}"),
                )
            })?
            .next()
            .ok_or_else(|| {
                ConnectError::new(
                    ConnectErrorKind::Refused,
                    format!("{authority} did not resolve to any address"),
                )
            })?;

        debug!(%socket_addr, "opening Modbus TCP session");
        let client = timeout(
            config.timeout,
            tcp::connect_slave(socket_addr, Slave(config.unit_id)),
        )
        .await
        .map_err(|_| {
            ConnectError::timeout(format!(
                "no connection to {socket_addr} within {:?}",
                config.timeout
            ))
        })??;

        self.client = Some(client);
        Ok(())
    }

    async fn write(&mut self, write: ResolvedWrite) -> Result<(), WriteError> {
        let client = self.client.as_mut().ok_or(WriteError::NotConnected)?;
        let ResolvedWrite { address, value } = write;

        let response = match value {
            WriteValue::Coil(on) => timeout(self.timeout, client.write_single_coil(address, on)).await,
            WriteValue::Register(word) => {
                timeout(self.timeout, client.write_single_register(address, word)).await
            }
        };

        match response {
            Err(_) => Err(WriteError::Transport(format!(
                "no response within {:?}",
                self.timeout
            ))),
            Ok(Err(err)) => Err(WriteError::Transport(err.to_string())),
            Ok(Ok(Err(exception))) => Err(WriteError::Device(exception.to_string())),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut client) = self.client.take() {
            // The socket is dropped either way; a failed or slow close is not worth reporting.
            let _ = timeout(self.timeout, client.disconnect()).await;
        }
    }
}
