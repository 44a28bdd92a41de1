//! Sidewalk BLE link interface.
//!
//! Ties the wire codecs, the crypt-mask table and the message pool into the
//! BLE network interface: advertising, connection state, transmit
//! sequencing, receive validation and the events handed to the owning layer.
//!
//! # Features
//!
//! - **Connection state machine**: Disconnected, Advertising, Connecting,
//!   Connected and Disconnecting, driven by radio and timer callbacks
//! - **Advertising**: fast then slow interval, periodic beacon rotation
//! - **Data path**: per-message crypt mask, pool-backed TX and RX buffers
//! - **Replay protection**: serial counter comparison, optionally persisted
//! - **Dedicated link**: temporary keys overlaying the long-term ones
//!
//! # Architecture
//!
//! ```text
//!   radio ──on_receive──►┌──────────────────┐──send──► Transport
//!   timers ─on_timer──►  │ BleLinkInterface │──arm───► TimerService
//!                        └──────────────────┘──events─► LinkEvent channel
//!                          │      │      │
//!                  ReplayGuard  Keys  ResourceManager
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dedicated;
pub mod error;
pub mod interface;
pub mod keys;
pub mod local_address;
pub mod replay;
pub mod sequencer;
pub mod state;
pub mod stats;
pub mod transport;

// Re-export main types
pub use config::{LinkConfig, DEFAULT_ADV_ROTATION_TIMEOUT, DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_MTU};
pub use dedicated::{DedicatedLink, DedicatedLinkParams, DedicatedRole, DedicatedState, TempKeyType};
pub use error::LinkError;
pub use interface::{BleLinkInterface, InboundMessage, LinkResources, OutboundMessage};
pub use keys::{KeyStore, KeyView};
pub use local_address::{deinit_global, global, init_global, LocalAddressRegistry};
pub use replay::{CounterLayer, ReplayGuard, RxSequence};
pub use sequencer::{TxSequence, TxSequencer, MAX_COUNTER_VALUE};
pub use state::{LinkInput, LinkState};
pub use stats::{BleErrorType, LinkEvent, LinkStats};
pub use transport::{
    ChannelTimers, ChannelTransport, Clock, FixedClock, LinkTimer, RadioFrame, SystemClock,
    TimerCommand, TimerService, Transport, TransportError,
};
