//! Chain events delivered to subscribers after every tip change.
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::core::block_index::BlockSummary;
use crate::core::types::Block;

#[derive(Debug, Clone)]
pub enum ChainEvent {
    BlockConnected { block: Arc<Block>, summary: BlockSummary },
    BlockDisconnected { block: Arc<Block>, summary: BlockSummary },
    TipChanged { tip: BlockSummary },
}

impl ChainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::BlockConnected { .. } => "BlockConnected",
            ChainEvent::BlockDisconnected { .. } => "BlockDisconnected",
            ChainEvent::TipChanged { .. } => "TipChanged",
        }
    }
}

/// Receives chain events. Called with the chainstate lock held, so sinks must
/// not call back into the manager.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &ChainEvent);
}

impl<F> NotificationSink for F
where
    F: Fn(&ChainEvent) + Send + Sync,
{
    fn notify(&self, event: &ChainEvent) {
        self(event)
    }
}

#[derive(Default)]
pub struct NotificationRegistry {
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.write().push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    pub fn emit(&self, event: ChainEvent) {
        let sinks = self.sinks.read();
        debug!("📣 {} to {} sink(s)", event.name(), sinks.len());
        for sink in sinks.iter() {
            sink.notify(&event);
        }
    }
}
