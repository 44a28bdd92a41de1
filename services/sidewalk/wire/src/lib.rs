//! Framing and link security for the Sidewalk BLE network interface.
//!
//! This crate holds the pure, allocation-light pieces of the link layer:
//! the crypt-mask table that maps a frame's security byte to its handling
//! rules, the AEAD transforms those rules select, address encoding and
//! filtering, the advertisement beacon and the connected-link data PDU.
//!
//! ## Features
//!
//! - **Crypt-mask table**: static, sorted, total lookup with per-handle flags
//! - **AES-128-GCM**: authenticate-only, single and layered encryption
//! - **Self-describing addresses**: size carried in the first raw byte
//! - **Beacons**: 20-byte manufacturer data with versioned bit layouts
//!
//! ## Data PDU
//!
//! ```text
//! +------------------+---------------------------------+
//! | header           | mask, seqn, counter, cmd, addrs |
//! +------------------+---------------------------------+
//! | body             | crypt output (payload + tags)   |
//! +------------------+---------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod beacon;
pub mod crypt;
pub mod crypt_mask;
pub mod error;
pub mod pdu;

// Re-export main types
pub use address::{
    address_match, Address, AddressType, ADDRESS_MAX_SIZE, ADDRESS_WILDCARD, FILTER_ANY,
    FILTER_DEVICE_ANY,
};
pub use beacon::{
    BatteryLevel, BeaconFrame, BeaconState, DeviceMode, DeviceType, FrameIndicator, TxId,
    TxIdFormat, ADVERTISEMENT_VERSION, ADV_VERSION_LEGACY, MAX_BEACON_PAYLOAD,
    MAX_MANU_SPECIFIC_DATA_SIZE, MAX_TX_ID_SIZE, MIN_ADV_SIZE,
};
pub use crypt::{CryptParams, KeyProvider, CRYPT_SCRATCH_SIZE, KEY_SIZE, TAG_SIZE};
pub use crypt_mask::{lookup, CryptMaskHandle, CryptStrategy, HandleFlags, KeyId, MaskBits};
pub use error::WireError;
pub use pdu::{DataPdu, PduHeader, MAX_LL_SEQN, MAX_PDU_SIZE};
