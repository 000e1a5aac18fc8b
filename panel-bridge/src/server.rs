use std::{future::Future, time::Duration};

use serde_json::json;
use tokio::sync::{broadcast, mpsc, mpsc::error::TrySendError, watch};
use tracing::{debug, error, info, warn};

use crate::{
    command::{self, MALFORMED_COMMAND},
    config::{Config, ControlMode},
    executor::CommandExecutor,
    modbus::{
        ConnectionManager, ConnectionState, RegisterMapper, TcpTransport, Transport, WriteRequest,
    },
    mqtt::{self, BridgeStatus, BRIDGE_TOPIC},
    shutdown::Shutdown,
    status::{MqttStatusSink, StatusReporter, StatusSink},
};

pub const COMMAND_TOPIC: &str = "command";
pub const STATUS_TOPIC: &str = "status";
pub const CONNECTION_TOPIC: &str = "connection";
pub const SHUTTING_DOWN: &str = "bridge shutting down";
pub const BRIDGE_BUSY: &str = "bridge busy";

/// Commands waiting for the worker. Anything beyond this is answered with [`BRIDGE_BUSY`].
const JOB_QUEUE_DEPTH: usize = 32;

/// How long the MQTT session gets to flush the final status after the worker has drained.
const MQTT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the bridge until `shutdown` resolves or the MQTT session ends.
pub async fn run(config: Config, shutdown: impl Future) -> crate::Result<()> {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (mqtt_connection, mqtt) = mqtt::new(&config.mqtt);
    let mut mqtt_task = tokio::spawn(mqtt_connection.run());

    let commands = mqtt.subscribe(COMMAND_TOPIC).await?;

    let connection = ConnectionManager::new(config.connection, TcpTransport::new());
    let state_publisher = tokio::spawn(publish_connection_state(
        connection.subscribe(),
        mqtt.clone(),
    ));

    let control_mode = config.panels.control_mode;
    let executor = CommandExecutor::new(RegisterMapper::new(config.panels), connection);
    let reporter = StatusReporter::new(MqttStatusSink::new(mqtt.clone(), STATUS_TOPIC));
    let overflow = StatusReporter::new(MqttStatusSink::new(mqtt.clone(), STATUS_TOPIC));

    let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_DEPTH);
    let worker = Worker::new(
        executor,
        reporter,
        jobs_rx,
        notify_shutdown.subscribe().into(),
    );
    let worker_handle = tokio::spawn(worker.run());

    let mut ret = Ok(());

    tokio::select! {
        res = ingest(commands, jobs_tx, control_mode, overflow) => {
            if let Err(err) = res {
                error!(cause = %err, "command ingest stopped");
                ret = Err(err);
            }
        }

        _ = shutdown => {
            info!("shutting down");
        }
    }

    // Dropping the sender is the shutdown signal. The worker finishes its current write, answers anything still
    // queued and closes the Modbus session.
    drop(notify_shutdown);
    if let Err(err) = worker_handle.await {
        error!(cause = %err, "worker panicked");
    }
    // The worker owned the state sender, so the publisher ends once the final state is out.
    if let Err(err) = state_publisher.await {
        error!(cause = %err, "connection state publisher panicked");
    }

    if let Err(err) = mqtt
        .publish_retained(BRIDGE_TOPIC, BridgeStatus::Stopped.payload())
        .await
    {
        warn!(cause = %err, "could not publish bridge status");
    }
    let _ = mqtt.disconnect().await;
    drop(mqtt);

    match tokio::time::timeout(MQTT_FLUSH_TIMEOUT, &mut mqtt_task).await {
        Ok(Ok(Err(err))) => warn!(cause = %err, "MQTT connection ended with error"),
        Ok(Err(err)) => error!(cause = %err, "MQTT task panicked"),
        Ok(Ok(Ok(()))) => debug!("MQTT connection closed"),
        Err(_) => {
            warn!("MQTT connection did not close in time");
            mqtt_task.abort();
        }
    }

    ret
}

/// Turns raw MQTT payloads into jobs. Returns when the subscription ends, which only happens if the MQTT connection
/// has gone away.
///
/// Never waits for the worker. A command arriving while the queue is full is answered right away with
/// [`BRIDGE_BUSY`].
async fn ingest<S: StatusSink>(
    mut commands: mpsc::Receiver<mqtt::Payload>,
    jobs: mpsc::Sender<Job>,
    control_mode: ControlMode,
    overflow: StatusReporter<S>,
) -> crate::Result<()> {
    while let Some(mqtt::Payload { topic, bytes }) = commands.recv().await {
        debug!(%topic, ?bytes, "received command");

        let job = match command::parse(&bytes, control_mode) {
            Ok(request) => Job::Execute(request),
            Err(rejection) => {
                warn!(error = %rejection.error, "malformed command");
                Job::Reject {
                    panel_index: rejection.panel_index,
                    reason: MALFORMED_COMMAND,
                }
            }
        };

        match jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => overflow.reject(job.panel_index(), BRIDGE_BUSY).await,
            Err(TrySendError::Closed(_)) => return Err(crate::Error::SendError),
        }
    }

    Err("MQTT command subscription closed".into())
}

async fn publish_connection_state(mut state: watch::Receiver<ConnectionState>, mqtt: mqtt::Handle) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        let payload = json!({ "state": current }).to_string();
        if let Err(err) = mqtt.publish_retained(CONNECTION_TOPIC, payload).await {
            debug!(cause = %err, "could not publish connection state");
            break;
        }
    }
}

#[derive(Debug)]
pub(crate) enum Job {
    Execute(WriteRequest),
    Reject {
        panel_index: Option<u16>,
        reason: &'static str,
    },
}

impl Job {
    fn panel_index(&self) -> Option<u16> {
        match self {
            Job::Execute(request) => Some(request.panel_index),
            Job::Reject { panel_index, .. } => *panel_index,
        }
    }
}

/// Sole owner of the Modbus session. Jobs are handled one at a time in arrival order, so there is never more than one
/// Modbus operation in flight.
pub(crate) struct Worker<T, S> {
    executor: CommandExecutor<T>,
    reporter: StatusReporter<S>,
    jobs: mpsc::Receiver<Job>,
    shutdown: Shutdown,
}

impl<T: Transport, S: StatusSink> Worker<T, S> {
    pub(crate) fn new(
        executor: CommandExecutor<T>,
        reporter: StatusReporter<S>,
        jobs: mpsc::Receiver<Job>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            executor,
            reporter,
            jobs,
            shutdown,
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn run(mut self) {
        info!("starting Modbus worker");

        if let Err(err) = self.executor.connect().await {
            warn!(cause = %err, "initial Modbus connect failed, will retry on the next command");
        }

        while !self.shutdown.is_shutdown() {
            // Shutdown is only observed between jobs so a write is never abandoned halfway.
            let job = tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.process(job).await;
        }

        self.jobs.close();
        while let Some(job) = self.jobs.recv().await {
            self.reporter.reject(job.panel_index(), SHUTTING_DOWN).await;
        }

        self.executor.connection_mut().disconnect().await;
        info!("Modbus worker stopped");
    }

    async fn process(&mut self, job: Job) {
        match job {
            Job::Execute(request) => {
                let outcome = self.executor.execute(request).await;
                self.reporter.report(&outcome).await;
            }
            Job::Reject {
                panel_index,
                reason,
            } => self.reporter.reject(panel_index, reason).await,
        }
    }
}
