//! In-memory bus for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{BusError, BusResult, MessageBus, Queue};
use crate::messages::Message;

struct QueueState {
    sender: mpsc::UnboundedSender<Message>,
    /// Taken by the first subscriber.
    receiver: Option<mpsc::UnboundedReceiver<Message>>,
}

impl QueueState {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// Bus backed by per-queue unbounded channels. Queues are created on first
/// publish or subscribe; each queue supports one consumer.
#[derive(Clone, Default)]
pub struct MemoryBus {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything currently sitting on a queue without consuming the
    /// subscription. Test helper for inspecting produced messages.
    pub fn drain(&self, queue: Queue) -> Vec<Message> {
        let mut queues = self.queues.lock().expect("bus state poisoned");
        let state = queues.entry(queue.name()).or_insert_with(QueueState::new);
        let mut drained = Vec::new();
        if let Some(receiver) = state.receiver.as_mut() {
            while let Ok(message) = receiver.try_recv() {
                drained.push(message);
            }
        }
        drained
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, queue: Queue, message: Message) -> BusResult<()> {
        let name = queue.name();
        let mut queues = self.queues.lock().expect("bus state poisoned");
        let state = queues.entry(name.clone()).or_insert_with(QueueState::new);
        state
            .sender
            .send(message)
            .map_err(|_| BusError::Closed(name))
    }

    async fn subscribe(&self, queue: Queue) -> BusResult<mpsc::UnboundedReceiver<Message>> {
        let name = queue.name();
        let mut queues = self.queues.lock().expect("bus state poisoned");
        let state = queues.entry(name.clone()).or_insert_with(QueueState::new);
        state
            .receiver
            .take()
            .ok_or(BusError::AlreadySubscribed(name))
    }
}
