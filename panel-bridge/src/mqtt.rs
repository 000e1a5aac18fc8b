use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use rumqttc::{
    mqttbytes::matches as matches_topic, AsyncClient, Event, EventLoop, Incoming, LastWill,
    MqttOptions, Outgoing, Publish, QoS,
};
use tokio::{
    select,
    sync::mpsc::{channel, error::TrySendError, Receiver, Sender},
};
use tracing::{debug, info, warn};

use crate::config::MqttConfig;

/// Topic under the prefix carrying the bridge's own liveness.
pub const BRIDGE_TOPIC: &str = "bridge";

#[derive(Clone, Copy, Debug)]
pub enum BridgeStatus {
    Running,
    Stopped,
}

impl BridgeStatus {
    pub fn payload(self) -> Bytes {
        match self {
            BridgeStatus::Running => Bytes::from_static(br#"{"status":"running"}"#),
            BridgeStatus::Stopped => Bytes::from_static(br#"{"status":"stopped"}"#),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Payload {
    pub topic: String,
    pub bytes: Bytes,
}

#[derive(Debug)]
pub(crate) enum Message {
    Subscribe(String, Sender<Payload>),
    Publish {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    Disconnect,
}

/// The connection must be [`Connection::run`] for the handle to do anything. It stops once every handle is dropped.
pub(crate) fn new(config: &MqttConfig) -> (Connection, Handle) {
    let mut options: MqttOptions = config.options();
    let bridge_topic = config.topic(BRIDGE_TOPIC);
    options.set_last_will(LastWill::new(
        bridge_topic.as_str(),
        BridgeStatus::Stopped.payload(),
        QoS::AtLeastOnce,
        true,
    ));

    let (client, event_loop) = AsyncClient::new(options, 32);
    let (tx, rx) = channel(32);
    let connection = Connection {
        client,
        event_loop,
        subscriptions: HashMap::new(),
        rx,
        bridge_topic,
        disconnecting: false,
    };
    let handle = Handle {
        prefix: config.topic_prefix.clone(),
        tx,
    };
    (connection, handle)
}

// Maintain internal subscriptions as well as MQTT subscriptions. Relay all received messages on MQTT subscribed topics
// to internal components who have a matching topic.
pub(crate) struct Connection {
    subscriptions: HashMap<String, Vec<Sender<Payload>>>,
    rx: Receiver<Message>,
    client: AsyncClient,
    event_loop: EventLoop,
    bridge_topic: String,
    disconnecting: bool,
}

impl Connection {
    /// Drives the MQTT session until a [`Handle::disconnect`] has been flushed or every handle is dropped. Broker
    /// outages are retried; rumqttc reconnects on the next poll.
    pub async fn run(mut self) -> crate::Result<()> {
        loop {
            select! {
                event = self.event_loop.poll() => {
                    match event {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                        Ok(event) => self.handle_event(event),
                        Err(error) if self.disconnecting => {
                            debug!(%error, "connection closed while disconnecting");
                            return Ok(());
                        }
                        Err(error) => {
                            warn!(%error, "MQTT connection error, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                request = self.rx.recv(), if !self.disconnecting => {
                    match request {
                        Some(req) => self.handle_request(req)?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Incoming::ConnAck(_)) => {
                info!("Connected to MQTT!");
                if let Err(error) = self.client.try_publish(
                    self.bridge_topic.as_str(),
                    QoS::AtLeastOnce,
                    true,
                    BridgeStatus::Running.payload().to_vec(),
                ) {
                    warn!(%error, "could not announce bridge status");
                }
                // Subscriptions do not survive a clean-session reconnect.
                for filter in self.subscriptions.keys() {
                    if let Err(error) = self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        warn!(%filter, %error, "could not resubscribe");
                    }
                }
            }
            Event::Incoming(Incoming::Publish(Publish { topic, payload, .. })) => {
                debug!(%topic, ?payload, "publish");
                self.handle_data(topic, payload);
            }
            _ => {}
        }
    }

    #[tracing::instrument(level = "debug", skip(self, payload), fields(subscriptions = ?self.subscriptions.keys()))]
    fn handle_data(&mut self, topic: String, payload: Bytes) {
        let mut targets = vec![];

        // Remove subscriptions whose channels are closed, adding matching channels to the `targets` vec.
        self.subscriptions.retain(|filter, channels| {
            if matches_topic(&topic, filter) {
                channels.retain(|channel| {
                    if channel.is_closed() {
                        warn!(?channel, "closed");
                        false
                    } else {
                        targets.push(channel.clone());
                        true
                    }
                });
                !channels.is_empty()
            } else {
                true
            }
        });

        for target in targets {
            let payload = Payload {
                topic: topic.clone(),
                bytes: payload.clone(),
            };
            if let Err(TrySendError::Full(Payload { topic, .. })) = target.try_send(payload) {
                warn!(%topic, "subscriber is not keeping up, dropping message");
            }
        }
    }

    fn handle_request(&mut self, request: Message) -> crate::Result<()> {
        match request {
            Message::Publish {
                topic,
                payload,
                retain,
            } => {
                // rumqttc stops draining its queue while the broker is away; waiting on it would stall this loop.
                if let Err(error) =
                    self.client
                        .try_publish(topic.as_str(), QoS::AtLeastOnce, retain, payload.to_vec())
                {
                    warn!(%topic, %error, "dropping MQTT publish");
                }
            }
            Message::Subscribe(filter, channel) => {
                self.subscriptions
                    .entry(filter.clone())
                    .or_default()
                    .push(channel);
                // Recorded above, so a failed request is retried on the next ConnAck.
                if let Err(error) = self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                    warn!(%filter, %error, "could not subscribe yet");
                }
            }
            Message::Disconnect => {
                self.disconnecting = true;
                self.client.try_disconnect()?
            }
        }
        Ok(())
    }
}

/// Cheap, cloneable access to the MQTT connection. Topics are relative to the configured prefix.
#[derive(Clone, Debug)]
pub struct Handle {
    prefix: String,
    tx: Sender<Message>,
}

impl Handle {
    fn topic(&self, topic: &str) -> String {
        format!("{}/{}", self.prefix, topic)
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> crate::Result<()> {
        self.send(Message::Publish {
            topic: self.topic(topic),
            payload: payload.into(),
            retain: false,
        })
        .await
    }

    pub async fn publish_retained(&self, topic: &str, payload: impl Into<Bytes>) -> crate::Result<()> {
        self.send(Message::Publish {
            topic: self.topic(topic),
            payload: payload.into(),
            retain: true,
        })
        .await
    }

    pub async fn subscribe(&self, filter: &str) -> crate::Result<Receiver<Payload>> {
        let (tx, rx) = channel(32);
        self.send(Message::Subscribe(self.topic(filter), tx)).await?;
        Ok(rx)
    }

    /// Queue a clean disconnect behind everything already sent through any handle.
    pub async fn disconnect(&self) -> crate::Result<()> {
        self.send(Message::Disconnect).await
    }

    async fn send(&self, message: Message) -> crate::Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| crate::Error::SendError)
    }
}
