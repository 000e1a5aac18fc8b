use tokio::sync::broadcast;

/// Listens for the bridge-wide shutdown signal.
///
/// The signal is the sending half of a `broadcast` channel being dropped, so every receiver sees it exactly once and
/// nothing ever has to be sent. Once observed it is latched: later [`Shutdown::recv`] calls return immediately.
#[derive(Debug)]
pub(crate) struct Shutdown {
    shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Wait for the signal. Cancel safe.
    pub(crate) async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        // Closed or a value: either way we are done.
        let _ = self.notify.recv().await;
        self.shutdown = true;
    }
}

impl From<broadcast::Receiver<()>> for Shutdown {
    fn from(notify: broadcast::Receiver<()>) -> Self {
        Self::new(notify)
    }
}

#[tokio::test]
async fn latches_once_sender_is_dropped() {
    let (tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::from(rx);
    assert!(!shutdown.is_shutdown());

    drop(tx);
    shutdown.recv().await;
    shutdown.recv().await;

    assert!(shutdown.is_shutdown());
}
