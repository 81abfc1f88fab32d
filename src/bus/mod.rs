//! Message bus seam.
//!
//! The controller talks to the bus through [`MessageBus`]; the production
//! transport lives outside this crate. [`MemoryBus`] backs tests and local
//! runs.

mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::messages::Message;

pub use memory::MemoryBus;

// ============================================================================
// Queues
// ============================================================================

/// Addressable queues. Dispatcher and ticker queues are derived from the
/// target service instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Tasks consumed by this controller.
    WorkflowProcessing,
    /// Released job runs and step-level pre-emptions.
    JobProcessing,
    /// Action assignments for one dispatcher instance.
    Dispatcher(Uuid),
    /// Timeout scheduling for one ticker instance.
    Ticker(Uuid),
}

impl Queue {
    /// Wire-level queue name.
    pub fn name(&self) -> String {
        match self {
            Self::WorkflowProcessing => "workflow_processing_queue".to_string(),
            Self::JobProcessing => "job_processing_queue".to_string(),
            Self::Dispatcher(id) => format!("dispatcher_{id}"),
            Self::Ticker(id) => format!("ticker_{id}"),
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum BusError {
    #[error("queue {0} is closed")]
    Closed(String),

    #[error("queue {0} already has a consumer")]
    AlreadySubscribed(String),

    #[error("bus error: {0}")]
    Transient(String),
}

pub type BusResult<T> = Result<T, BusError>;

// ============================================================================
// Trait
// ============================================================================

/// At-least-once message transport. The client is shared and safe for
/// concurrent sends.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message on a queue, creating it if necessary.
    async fn publish(&self, queue: Queue, message: Message) -> BusResult<()>;

    /// Attach the single consumer for a queue. Delivery order follows
    /// publish order per queue.
    async fn subscribe(&self, queue: Queue) -> BusResult<mpsc::UnboundedReceiver<Message>>;
}
