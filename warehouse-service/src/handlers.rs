use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use shared::{
    topics, CancelCommand, PieceEvent, PieceRequest, PublicKeyNotice, ReleaseCommand,
    ReserveCommand, PUBLIC_KEY_AVAILABLE,
};
use tracing::{debug, error, info, warn};

use crate::auth::KeyRefresher;
use crate::error::{Disposition, Result, WarehouseError};
use crate::service::Warehouse;

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub enum Inbound {
    Reserve(ReserveCommand),
    Release(ReleaseCommand),
    Cancel(CancelCommand),
    PieceRequest(PieceRequest),
    PieceProducing(PieceEvent),
    PieceProduced(PieceEvent),
    PieceCancelled(PieceEvent),
    PublicKey(PublicKeyNotice),
}

/// Inbound topic names.
#[derive(Debug, Clone)]
pub struct InboundTopics {
    pub reserve: String,
    pub release: String,
    pub cancel: String,
    pub piece_request: String,
    pub piece_producing: String,
    pub piece_produced: String,
    pub piece_executed: String,
    pub piece_cancelled: String,
    pub public_key: String,
}

impl Default for InboundTopics {
    fn default() -> Self {
        Self {
            reserve: topics::RESERVE.to_string(),
            release: topics::RELEASE.to_string(),
            cancel: topics::CANCEL.to_string(),
            piece_request: topics::PIECE_REQUEST.to_string(),
            piece_producing: topics::PIECE_PRODUCING.to_string(),
            piece_produced: topics::PIECE_PRODUCED.to_string(),
            piece_executed: topics::PIECE_EXECUTED.to_string(),
            piece_cancelled: topics::PIECE_CANCELLED.to_string(),
            public_key: topics::PUBLIC_KEY.to_string(),
        }
    }
}

impl InboundTopics {
    pub fn names(&self) -> Vec<&str> {
        vec![
            &self.reserve,
            &self.release,
            &self.cancel,
            &self.piece_request,
            &self.piece_producing,
            &self.piece_produced,
            &self.piece_executed,
            &self.piece_cancelled,
            &self.public_key,
        ]
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Inbound> {
        let inbound = if topic == self.reserve {
            Inbound::Reserve(parse(topic, payload)?)
        } else if topic == self.release {
            Inbound::Release(parse(topic, payload)?)
        } else if topic == self.cancel {
            Inbound::Cancel(parse(topic, payload)?)
        } else if topic == self.piece_request {
            Inbound::PieceRequest(parse(topic, payload)?)
        } else if topic == self.piece_producing {
            Inbound::PieceProducing(parse(topic, payload)?)
        } else if topic == self.piece_produced || topic == self.piece_executed {
            Inbound::PieceProduced(parse(topic, payload)?)
        } else if topic == self.piece_cancelled {
            Inbound::PieceCancelled(parse(topic, payload)?)
        } else if topic == self.public_key {
            Inbound::PublicKey(parse(topic, payload)?)
        } else {
            return Err(WarehouseError::Decode {
                topic: topic.to_string(),
                reason: "no handler for topic".to_string(),
            });
        };
        Ok(inbound)
    }
}

fn parse<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| WarehouseError::Decode {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

const REDELIVERY_BACKOFF: Duration = Duration::from_secs(1);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// What the consumer loop does with offsets after a message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAction {
    /// Commit this position; every earlier offset of the partition is settled.
    Commit(i64),
    /// Nothing new may be committed yet.
    Hold,
    /// Seek the partition back to this offset and consume again from there.
    Rewind(i64),
}

#[derive(Debug, Default)]
struct PartitionProgress {
    in_flight: BTreeSet<i64>,
    held: Option<i64>,
    settled_up_to: i64,
    committed: i64,
}

/// Tracks offsets per partition so the committed position never passes a
/// message that is still being handled or is left for redelivery.
#[derive(Debug, Default)]
pub struct CommitGate {
    partitions: Mutex<HashMap<(String, i32), PartitionProgress>>,
}

impl CommitGate {
    /// Called in stream order, before the message is handled.
    pub fn begin(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .in_flight
            .insert(offset);
    }

    pub fn settle(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        disposition: Disposition,
    ) -> OffsetAction {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        let progress = partitions.entry((topic.to_string(), partition)).or_default();
        progress.in_flight.remove(&offset);
        progress.settled_up_to = progress.settled_up_to.max(offset + 1);

        match disposition {
            Disposition::Redeliver => {
                // A rewind to an earlier offset is already pending.
                if progress.held.is_some_and(|held| held <= offset) {
                    return OffsetAction::Hold;
                }
                progress.held = Some(offset);
                return OffsetAction::Rewind(offset);
            }
            Disposition::Ack | Disposition::Drop => {
                if progress.held == Some(offset) {
                    progress.held = None;
                }
            }
        }

        let floor = progress.in_flight.first().copied().into_iter().chain(progress.held).min();
        let position = floor.unwrap_or(progress.settled_up_to);
        if position > progress.committed {
            progress.committed = position;
            OffsetAction::Commit(position)
        } else {
            OffsetAction::Hold
        }
    }
}

fn commit_position(consumer: &StreamConsumer, topic: &str, partition: i32, position: i64) {
    let mut offsets = TopicPartitionList::new();
    let committed = offsets
        .add_partition_offset(topic, partition, Offset::Offset(position))
        .and_then(|()| consumer.commit(&offsets, CommitMode::Async));
    if let Err(e) = committed {
        error!(topic, partition, position, "Error committing offset: {}", e);
    }
}

pub struct MessageHandler {
    warehouse: Arc<Warehouse>,
    keys: KeyRefresher,
    topics: InboundTopics,
}

impl MessageHandler {
    pub fn new(warehouse: Arc<Warehouse>, keys: KeyRefresher, topics: InboundTopics) -> Self {
        Self {
            warehouse,
            keys,
            topics,
        }
    }

    pub async fn run(&self, consumer: StreamConsumer, max_in_flight: usize) {
        let consumer = &consumer;
        let gate = &CommitGate::default();

        consumer
            .stream()
            .for_each_concurrent(max_in_flight, move |message| {
                if let Ok(m) = &message {
                    gate.begin(m.topic(), m.partition(), m.offset());
                }

                async move {
                    let m = match message {
                        Ok(m) => m,
                        Err(e) => {
                            error!("Error receiving message: {}", e);
                            return;
                        }
                    };

                    let disposition = match m.payload() {
                        Some(payload) => self.handle_payload(m.topic(), payload).await,
                        None => {
                            warn!(topic = m.topic(), "Empty message dropped");
                            Disposition::Drop
                        }
                    };

                    match gate.settle(m.topic(), m.partition(), m.offset(), disposition) {
                        OffsetAction::Commit(position) => {
                            commit_position(consumer, m.topic(), m.partition(), position)
                        }
                        OffsetAction::Hold => {}
                        OffsetAction::Rewind(offset) => {
                            tokio::time::sleep(REDELIVERY_BACKOFF).await;
                            // On failure the offset stays held, so a restart
                            // still starts from it.
                            if let Err(e) = consumer.seek(
                                m.topic(),
                                m.partition(),
                                Offset::Offset(offset),
                                SEEK_TIMEOUT,
                            ) {
                                error!(
                                    topic = m.topic(),
                                    partition = m.partition(),
                                    offset,
                                    "Error seeking back for redelivery: {}",
                                    e
                                );
                            }
                        }
                    }
                }
            })
            .await;
    }

    pub async fn handle_payload(&self, topic: &str, payload: &[u8]) -> Disposition {
        let outcome = match self.topics.decode(topic, payload) {
            Ok(inbound) => self.handle(inbound).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                debug!(topic, "Message handled");
                Disposition::Ack
            }
            Err(e) => {
                let disposition = e.disposition();
                match disposition {
                    Disposition::Drop => warn!(topic, "Dropping message: {}", e),
                    Disposition::Redeliver => error!(topic, "Message left for redelivery: {}", e),
                    Disposition::Ack => {}
                }
                disposition
            }
        }
    }

    pub async fn handle(&self, inbound: Inbound) -> Result<()> {
        let warehouse = &self.warehouse;
        match inbound {
            Inbound::Reserve(command) => {
                warehouse.saga.reserve(&command).await;
                Ok(())
            }
            Inbound::Release(command) => warehouse.saga.release(&command).await.map(drop),
            Inbound::Cancel(command) => warehouse.saga.cancel(&command).await.map(drop),
            Inbound::PieceRequest(request) => warehouse
                .reallocation
                .reallocate(request.order_id, &request.pieces)
                .await
                .map(drop),
            Inbound::PieceProducing(event) => {
                warehouse.lifecycle.mark_producing(event.piece_id).await.map(drop)
            }
            Inbound::PieceProduced(event) => {
                warehouse.lifecycle.mark_produced(event.piece_id).await.map(drop)
            }
            Inbound::PieceCancelled(event) => {
                warehouse.lifecycle.cancel(event.piece_id).await.map(drop)
            }
            Inbound::PublicKey(notice) => self.refresh_public_key(&notice).await,
        }
    }

    async fn refresh_public_key(&self, notice: &PublicKeyNotice) -> Result<()> {
        if notice.public_key != PUBLIC_KEY_AVAILABLE {
            return Err(WarehouseError::Decode {
                topic: self.topics.public_key.clone(),
                reason: format!("unexpected public_key value '{}'", notice.public_key),
            });
        }
        self.keys.refresh().await?;
        info!("Public key refreshed after rotation notice");
        Ok(())
    }
}
