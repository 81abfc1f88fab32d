//! Controller error type and redelivery policy.

use thiserror::Error;

use crate::bus::BusError;
use crate::messages::DecodeError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    /// The root context was cancelled while the handler was still pending.
    #[error("shutdown requested")]
    Shutdown,

    /// A background task died instead of returning.
    #[error("background task panicked: {0}")]
    Panicked(String),
}

impl ControllerError {
    /// Whether the message that hit this error should be redelivered.
    ///
    /// Malformed messages and missing entities never heal on retry; store
    /// conflicts, transient store failures and bus failures do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Decode(_) => false,
            Self::Store(err) => err.is_retryable(),
            Self::Bus(_) => true,
            Self::Shutdown => false,
            Self::Panicked(_) => false,
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
