//! Link interface error types.

use sid_resource::ResourceError;
use sid_storage::StorageError;
use sid_wire::WireError;
use thiserror::Error;

use crate::state::LinkState;
use crate::transport::TransportError;

/// Link interface errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// Framing or crypt failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Message pool failure
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Persisted record failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Radio failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Counter did not advance past the last accepted one
    #[error("replay detected: counter {counter} seqn {ll_seqn}")]
    ReplayDetected {
        /// Received counter or timestamp
        counter: u32,
        /// Received link sequence
        ll_seqn: u32,
    },

    /// Operation needs a connected link
    #[error("link not connected")]
    NotConnected,

    /// Event not accepted in the current state
    #[error("invalid transition from {from:?} on {event}")]
    InvalidState {
        /// State at the time of the event
        from: LinkState,
        /// Event name
        event: &'static str,
    },

    /// Argument outside of the accepted domain
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),

    /// Lookup miss
    #[error("not found: {0}")]
    NotFound(&'static str),
}
