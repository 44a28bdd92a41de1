//! Message block pool for the Sidewalk link.
//!
//! Inbound and outbound protocol messages live in fixed-size blocks carved
//! out of a single arena. Allocation is priority aware and may ask the owner
//! to release memory through a registered callback before giving up.
//!
//! ## Features
//!
//! - **Fixed blocks**: no fragmentation, constant-time allocate and free
//! - **Header room**: every message reserves a configurable leading offset
//! - **Single owner**: handles are consumed by `free`, so a block cannot be
//!   released twice
//! - **Interrupt safe**: pool state sits behind a `critical-section` mutex
//!
//! ## Example
//!
//! ```rust
//! use sid_resource::{Priority, ResourceManager, ResourceManagerConfig};
//!
//! # fn example() -> Result<(), sid_resource::ResourceError> {
//! let rm = ResourceManager::new(ResourceManagerConfig::default())?;
//! let msg = rm.get_with_priority(32, Priority::Normal)?;
//! rm.write(&msg, 0, b"hello")?;
//! rm.free(msg)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod pool;

// Re-export main types
pub use error::{ForeignMessage, ResourceError};
pub use pool::{
    Message, NoMemoryCallback, PoolStats, Priority, ResourceManager, ResourceManagerConfig,
};
