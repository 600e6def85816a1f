use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use shared::{topics, PieceType};

use crate::error::{Result, WarehouseError};

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    pub fn json<T: Serialize>(topic: impl Into<String>, key: Option<String>, body: &T) -> Result<Self> {
        let topic = topic.into();
        let payload = serde_json::to_value(body).map_err(|e| WarehouseError::Publish {
            topic: topic.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { topic, key, payload })
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<()>;
}

/// Outbound topic names.
#[derive(Debug, Clone)]
pub struct Topics {
    pub produce_prefix: String,
    pub piece_cancel: String,
    pub order_completed: String,
    pub order_cancelled: String,
}

impl Topics {
    /// Production requests are routed per piece type.
    pub fn produce(&self, piece_type: PieceType) -> String {
        format!("{}.{}", self.produce_prefix, piece_type)
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            produce_prefix: topics::PRODUCE_PREFIX.to_string(),
            piece_cancel: topics::PIECE_CANCEL.to_string(),
            order_completed: topics::ORDER_COMPLETED.to_string(),
            order_cancelled: topics::ORDER_CANCELLED.to_string(),
        }
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, timeout: Duration) -> Self {
        Self { producer, timeout }
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let json = serde_json::to_string(&message.payload).map_err(|e| WarehouseError::Publish {
            topic: message.topic.clone(),
            reason: e.to_string(),
        })?;

        let mut record = FutureRecord::<str, str>::to(&message.topic).payload(&json);
        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| WarehouseError::Publish {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

/// Keeps every published message in memory. Topics listed in
/// `fail_topics` reject publishes, for exercising failure paths.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<OutboundMessage>>>,
    fail_topics: Arc<Mutex<Vec<String>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, topic: impl Into<String>) {
        self.fail_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topic.into());
    }

    pub fn recover(&self, topic: &str) {
        self.fail_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|failing| failing != topic);
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<OutboundMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let rejected = self
            .fail_topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&message.topic);
        if rejected {
            return Err(WarehouseError::Publish {
                topic: message.topic,
                reason: "broker unavailable".to_string(),
            });
        }

        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}
