//! Link statistics and events.

use serde::Serialize;
use sid_wire::Address;

use crate::state::LinkState;

/// Counters kept by the link interface
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// PDUs handed to the radio
    pub tx: u64,
    /// Outbound messages that failed
    pub tx_fail: u64,
    /// Inbound messages delivered to the queue
    pub rx: u64,
    /// Inbound messages dropped after decoding
    pub rx_fail: u64,
    /// Inbound frames that did not parse
    pub malformed: u64,
    /// Replayed or duplicated inbound frames
    pub duplicates: u64,
    /// Connections established
    pub connection_success: u64,
    /// Connection attempts that failed
    pub connection_fail: u64,
    /// Beacon payload rotations
    pub adv_rotations: u64,
    /// Connections closed for inactivity
    pub inactivity_disconnects: u64,
}

/// Error categories reported to the owning layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BleErrorType {
    /// Frame used an unknown crypt mask or failed authentication
    DataInvalid,
    /// Frame was a replay
    Replay,
    /// No memory to hold the frame
    ResourceExhausted,
}

/// Events emitted by the link interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connection state changed
    StateChanged {
        /// Previous state
        from: LinkState,
        /// New state
        to: LinkState,
    },
    /// A message is waiting in the inbound queue
    MessageReceived {
        /// Source address
        src: Address,
        /// Command class
        cmd_class: u8,
        /// Command id
        cmd_id: u16,
        /// Payload length
        len: usize,
    },
    /// Beacon payload rotated
    AdvertisementRotated {
        /// Rotation index after the change
        rotation: u8,
    },
    /// Inbound processing error
    Error(BleErrorType),
}
