use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::{executor::WriteOutcome, mqtt};

/// Wire form of an outcome on the status channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub panel_index: Option<u16>,
    pub address: Option<u16>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl From<&WriteOutcome> for StatusMessage {
    fn from(outcome: &WriteOutcome) -> Self {
        Self {
            panel_index: Some(outcome.panel_index),
            address: outcome.address,
            success: outcome.success,
            error_reason: outcome.error_reason.clone(),
        }
    }
}

impl StatusMessage {
    pub fn rejected(panel_index: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            panel_index,
            address: None,
            success: false,
            error_reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, message: &StatusMessage) -> crate::Result<()>;
}

/// Publishes status messages as JSON to a topic under the MQTT handle's prefix.
pub struct MqttStatusSink {
    mqtt: mqtt::Handle,
    topic: String,
}

impl MqttStatusSink {
    pub fn new(mqtt: mqtt::Handle, topic: impl Into<String>) -> Self {
        Self {
            mqtt,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl StatusSink for MqttStatusSink {
    async fn publish(&self, message: &StatusMessage) -> crate::Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.mqtt.publish(self.topic.as_str(), payload).await
    }
}

/// Surfaces outcomes. Command execution has already happened by the time this runs, so nothing here can fail the
/// caller.
pub struct StatusReporter<S> {
    sink: S,
}

impl<S: StatusSink> StatusReporter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub async fn report(&self, outcome: &WriteOutcome) {
        if outcome.success {
            info!(
                panel_index = outcome.panel_index,
                address = outcome.address,
                "panel write succeeded"
            );
        } else {
            warn!(
                panel_index = outcome.panel_index,
                address = outcome.address,
                reason = outcome.error_reason.as_deref().unwrap_or_default(),
                "panel write failed"
            );
        }
        self.emit(StatusMessage::from(outcome)).await
    }

    /// For commands that never reached the executor.
    pub async fn reject(&self, panel_index: Option<u16>, reason: &str) {
        warn!(?panel_index, reason, "command rejected");
        self.emit(StatusMessage::rejected(panel_index, reason)).await
    }

    async fn emit(&self, message: StatusMessage) {
        if let Err(error) = self.sink.publish(&message).await {
            warn!(%error, ?message, "failed to publish status");
        }
    }
}
