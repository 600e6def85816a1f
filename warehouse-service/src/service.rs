use std::sync::Arc;

use crate::completion::OrderCompletionWatcher;
use crate::lifecycle::PieceLifecycle;
use crate::publisher::{EventPublisher, Topics};
use crate::reallocation::ReallocationEngine;
use crate::saga::SagaCommandHandler;
use crate::store::{CapacityLedger, PieceStore};

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub max_capacity: i64,
    pub topics: Topics,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            topics: Topics::default(),
        }
    }
}

/// The warehouse core wired to one store and one publisher.
#[derive(Clone)]
pub struct Warehouse {
    pub lifecycle: PieceLifecycle,
    pub reallocation: ReallocationEngine,
    pub saga: SagaCommandHandler,
}

impl Warehouse {
    pub fn new<S>(store: Arc<S>, publisher: Arc<dyn EventPublisher>, config: WarehouseConfig) -> Self
    where
        S: PieceStore + CapacityLedger + 'static,
    {
        let pieces: Arc<dyn PieceStore> = store.clone();
        let ledger: Arc<dyn CapacityLedger> = store;
        let watcher =
            OrderCompletionWatcher::new(publisher.clone(), config.topics.order_completed.clone());

        Self {
            lifecycle: PieceLifecycle::new(pieces.clone(), watcher.clone()),
            reallocation: ReallocationEngine::new(
                pieces.clone(),
                publisher.clone(),
                config.topics.clone(),
                watcher,
            ),
            saga: SagaCommandHandler::new(
                pieces,
                ledger,
                publisher,
                config.topics,
                config.max_capacity,
            ),
        }
    }
}
