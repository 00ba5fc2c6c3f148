use super::events::TraceEvent;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fan-out of trace events to any number of subscribers.
///
/// Emitting never blocks and never fails: subscribers receive on unbounded
/// channels and closed ones are dropped on the next emit.
#[derive(Clone, Default)]
pub struct TraceBroadcaster {
    subscribers: Arc<DashMap<u64, mpsc::UnboundedSender<TraceEvent>>>,
    next_id: Arc<AtomicU64>,
}

impl TraceBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<TraceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        log::debug!("[TRACE] Subscriber {} attached", id);
        (id, rx)
    }

    /// Detach a subscriber; its receiver drains what was already sent, then closes
    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            log::debug!("[TRACE] Subscriber {} detached", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn emit(&self, event: TraceEvent) {
        log::debug!("[TRACE] {}", event.log_line());

        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().send(event.clone()).is_err() {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            log::debug!("[TRACE] Dropping closed subscriber {}", id);
            self.subscribers.remove(&id);
        }
    }
}
