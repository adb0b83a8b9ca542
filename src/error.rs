//! Transport error types

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the ring transport and the buffer-exchange layer
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Request can never be satisfied by this channel, regardless of retries
    #[error("request for {requested} bytes exceeds channel capacity of {capacity} bytes")]
    OutOfMemory {
        /// Requested payload size
        requested: usize,
        /// Largest payload this channel can ever carry
        capacity: usize,
    },

    /// Bounded wait expired before the operation could proceed
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Shared state (index or size field) is outside its valid range.
    /// Fatal for the ring: the consuming loop must stop being driven.
    #[error("shared channel corrupted: {0}")]
    Corrupted(String),

    /// Caller-supplied argument is invalid (e.g. undersized receive buffer,
    /// shrink target larger than the allocated run)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Peer sent a message that violates the protocol; logged and dropped
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A fixed-capacity table (endpoints or pending bonds) is exhausted
    #[error("too many {0}")]
    TooMany(&'static str),

    /// Data send attempted before the endpoint finished bonding
    #[error("endpoint {0:?} is not bound yet")]
    NotBound(String),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    /// Check whether retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChannelError::Timeout(_) | ChannelError::NotBound(_)
        )
    }
}
