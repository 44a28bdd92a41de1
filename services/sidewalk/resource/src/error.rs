//! Resource manager error types.

use thiserror::Error;

use crate::pool::Message;

/// Block pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// No block available, even after the no-memory callback ran
    #[error("out of memory: {size} bytes requested")]
    OutOfMemory {
        /// Requested payload size
        size: usize,
    },

    /// Request or handle outside of what this pool accepts
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),
}

/// A message released to a pool that did not allocate it.
///
/// Carries the handle back so it can still be freed by its own pool.
#[derive(Error, Debug)]
#[error("message from another pool")]
pub struct ForeignMessage(pub Message);

impl ForeignMessage {
    /// Take the handle back
    pub fn into_message(self) -> Message {
        self.0
    }
}

impl From<ForeignMessage> for ResourceError {
    fn from(_: ForeignMessage) -> Self {
        ResourceError::InvalidArgs("message from another pool")
    }
}
