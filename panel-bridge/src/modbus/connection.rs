use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::{
    config::ConnectionConfig,
    modbus::{ConnectionState, ResolvedWrite, Transport},
    ConnectError, WriteError,
};

/// Owns the one Modbus session of the process.
///
/// Every operation takes `&mut self`, so whoever owns the manager serializes connect, write and disconnect. State
/// changes are logged inside a span carrying the host, port and unit id, and broadcast to [`Self::subscribe`]rs.
pub struct ConnectionManager<T> {
    config: ConnectionConfig,
    transport: T,
    state: watch::Sender<ConnectionState>,
    span: Span,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(config: ConnectionConfig, transport: T) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let span = info_span!(
            "modbus",
            host = %config.host,
            port = config.port,
            unit_id = config.unit_id
        );
        Self {
            config,
            transport,
            state,
            span,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Opens the session. A no-op when already connected.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.transition(ConnectionState::Connecting);
        match self
            .transport
            .connect(&self.config)
            .instrument(self.span.clone())
            .await
        {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(error) => {
                warn!(parent: &self.span, kind = ?error.kind, detail = %error.detail, "Modbus connect failed");
                self.transition(ConnectionState::Failed);
                Err(error)
            }
        }
    }

    /// Closes the session if one is open. Best effort.
    pub async fn disconnect(&mut self) {
        if self.state() == ConnectionState::Connected {
            self.transport
                .disconnect()
                .instrument(self.span.clone())
                .await;
        }
        self.transition(ConnectionState::Disconnected);
    }

    /// Makes at most one connect attempt, and none at all when the session is already up.
    pub async fn ensure_connected(&mut self) -> Result<(), ConnectError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => self.connect().await,
        }
    }

    /// Drops a session that can no longer be trusted. The next [`Self::ensure_connected`] reconnects.
    pub async fn mark_failed(&mut self, reason: &str) {
        warn!(parent: &self.span, reason, "dropping Modbus session");
        self.transport
            .disconnect()
            .instrument(self.span.clone())
            .await;
        self.transition(ConnectionState::Failed);
    }

    pub async fn write(&mut self, write: ResolvedWrite) -> Result<(), WriteError> {
        if self.state() != ConnectionState::Connected {
            return Err(WriteError::NotConnected);
        }
        debug!(parent: &self.span, address = write.address, value = ?write.value, "writing");
        self.transport
            .write(write)
            .instrument(self.span.clone())
            .await
    }

    fn transition(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(parent: &self.span, %from, %to, "Modbus connection state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{modbus::transport::mock::MockTransport, ConnectErrorKind};
    use pretty_assertions::assert_eq;

    fn manager() -> (ConnectionManager<MockTransport>, MockTransport) {
        let transport = MockTransport::new();
        let manager = ConnectionManager::new(ConnectionConfig::new("plc.local"), transport.clone());
        (manager, transport)
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let (manager, transport) = manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.state().calls(), 0);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (mut manager, transport) = manager();

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.state().connects, 1);
    }

    #[tokio::test]
    async fn ensure_connected_twice_does_not_reconnect() {
        let (mut manager, transport) = manager();
        manager.connect().await.unwrap();

        manager.ensure_connected().await.unwrap();
        manager.ensure_connected().await.unwrap();

        assert_eq!(transport.state().connects, 1);
    }

    #[tokio::test]
    async fn failed_connect_reports_kind_and_moves_to_failed() {
        let (mut manager, transport) = manager();
        transport.fail_next_connect(ConnectError::new(ConnectErrorKind::Refused, "nope"));

        let err = manager.connect().await.unwrap_err();

        assert_eq!(err.kind, ConnectErrorKind::Refused);
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn ensure_connected_makes_one_attempt_per_call() {
        let (mut manager, transport) = manager();
        transport.fail_next_connect(ConnectError::timeout("slow"));
        transport.fail_next_connect(ConnectError::timeout("slow"));

        assert!(manager.ensure_connected().await.is_err());
        assert_eq!(transport.state().connects, 1);

        assert!(manager.ensure_connected().await.is_err());
        assert_eq!(transport.state().connects, 2);

        manager.ensure_connected().await.unwrap();
        assert_eq!(transport.state().connects, 3);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_always_ends_disconnected() {
        let (mut manager, transport) = manager();

        manager.disconnect().await;
        assert_eq!(transport.state().disconnects, 0);

        manager.connect().await.unwrap();
        manager.disconnect().await;
        assert_eq!(transport.state().disconnects, 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn mark_failed_forces_a_reconnect() {
        let (mut manager, transport) = manager();
        manager.connect().await.unwrap();

        manager.mark_failed("reset by peer").await;
        assert_eq!(manager.state(), ConnectionState::Failed);

        manager.ensure_connected().await.unwrap();
        assert_eq!(transport.state().connects, 2);
    }

    #[tokio::test]
    async fn write_requires_a_session() {
        let (mut manager, transport) = manager();
        let write = ResolvedWrite {
            address: 0,
            value: crate::modbus::WriteValue::Coil(true),
        };

        assert_eq!(manager.write(write).await, Err(WriteError::NotConnected));
        assert!(transport.state().writes.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let (mut manager, transport) = manager();
        let mut rx = manager.subscribe();
        transport.fail_next_connect(ConnectError::timeout("slow"));

        let _ = manager.connect().await;

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Failed);
    }
}
