//! Crypt-mask table: maps the security byte of a frame to its handling rules.
//!
//! Bit layout of the mask byte:
//!
//! ```text
//!   bit 4  ENCR      network layer encryption
//!   bit 3  SEC       application layer security
//!   bit 2  TOPO      WAN (1) or PAN (0) key domain
//!   bit 1  COUNTER   counter based nonce (else time based)
//!   bit 0  AUTH_TAG  authentication tag present
//! ```
//!
//! The table is a static, sorted array. Lookups are total: every byte either
//! resolves to a handle or fails with [`WireError::NotFound`].

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::WireError;

bitflags! {
    /// Bits of the crypt-mask byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MaskBits: u8 {
        /// Authentication tag present
        const AUTH_TAG = 1 << 0;
        /// Counter based nonce
        const COUNTER = 1 << 1;
        /// WAN key domain
        const TOPO = 1 << 2;
        /// Application layer security
        const SEC = 1 << 3;
        /// Network layer encryption
        const ENCR = 1 << 4;
    }
}

bitflags! {
    /// Per-handle processing flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HandleFlags: u8 {
        /// Frame header is authenticated as AAD
        const NEEDS_AAD = 1 << 0;
        /// AAD is prefixed with command class/id and the mask
        const NEEDS_AAD_PREFIX = 1 << 1;
        /// Leading application bytes travel clear but authenticated
        const USE_APP_OFFSET = 1 << 2;
        /// Remember the receive counter
        const SAVE_COUNTER = 1 << 3;
        /// Reject frames whose counter does not advance
        const CHECK_REPLAY = 1 << 4;
        /// Remember the application counter rather than the link counter
        const SAVE_EXPLICIT_COUNTER = 1 << 5;
        /// Resolve keys through the dedicated-link overlay
        const USE_EXT_REFERENCE = 1 << 6;
        /// Persist the receive counter to storage
        const SAVE_COUNTER_ONLINE = 1 << 7;
    }
}

/// Plain, no security
pub const PLAIN: u8 = 0x00;
/// PAN key, time nonce, auth tag
pub const PAN_TIME_AUTH: u8 = 0x01;
/// PAN key, counter nonce, auth tag
pub const PAN_CNT_AUTH: u8 = 0x03;
/// WAN key, time nonce, auth tag
pub const WAN_TIME_AUTH: u8 = 0x05;
/// WAN key, counter nonce, auth tag
pub const WAN_CNT_AUTH: u8 = 0x07;
/// Application encryption, time nonce
pub const APP_WAN_TIME_AUTH: u8 = 0x0D;
/// Application encryption, counter nonce
pub const APP_WAN_CNT_AUTH: u8 = 0x0F;
/// Network encryption with the PAN key, time nonce
pub const NW_PAN_TIME_AUTH: u8 = 0x11;
/// Network encryption with the PAN key, counter nonce
pub const NW_PAN_CNT_AUTH: u8 = 0x13;
/// Network encryption with the WAN key, time nonce
pub const NW_WAN_TIME_AUTH: u8 = 0x15;
/// Network encryption with the WAN key, counter nonce
pub const NW_WAN_CNT_AUTH: u8 = 0x17;
/// Application then network encryption, time nonce
pub const NW_APP_WAN_TIME_AUTH: u8 = 0x1D;
/// Application then network encryption, counter nonce
pub const NW_APP_WAN_CNT_AUTH: u8 = 0x1F;
/// Sentinel; never registered
pub const NOT_FOUND: u8 = 0xFF;

/// Key slots referenced by handles
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyId {
    /// No key
    None = 0,
    /// Network WAN key
    Network = 1,
    /// PAN key
    Pan = 2,
    /// Application key
    App = 3,
    /// Dedicated-link temporary unicast key
    TempUnicast = 4,
    /// Dedicated-link temporary application key
    TempApp = 5,
}

impl TryFrom<u8> for KeyId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyId::None),
            1 => Ok(KeyId::Network),
            2 => Ok(KeyId::Pan),
            3 => Ok(KeyId::App),
            4 => Ok(KeyId::TempUnicast),
            5 => Ok(KeyId::TempApp),
            _ => Err(WireError::InvalidArgs("unknown key id")),
        }
    }
}

/// How a handle transforms a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CryptStrategy {
    /// Copy through
    Plain,
    /// Clear payload followed by a tag over AAD and payload
    Authenticate,
    /// Single AEAD layer with the first key
    Encrypt,
    /// Application AEAD with the second key inside network AEAD with the first
    Layered,
}

/// Handling rules for one mask byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptMaskHandle {
    /// Mask byte
    pub mask: u8,
    /// Processing flags
    pub flags: HandleFlags,
    /// Outer (or only) key
    pub first_key: KeyId,
    /// Inner application key for layered handles
    pub second_key: KeyId,
    /// Transform
    pub strategy: CryptStrategy,
}

const fn handle(
    mask: u8,
    flags: HandleFlags,
    first_key: KeyId,
    second_key: KeyId,
    strategy: CryptStrategy,
) -> CryptMaskHandle {
    CryptMaskHandle {
        mask,
        flags,
        first_key,
        second_key,
        strategy,
    }
}

const AAD: HandleFlags = HandleFlags::NEEDS_AAD;
const PAN_COUNTER: HandleFlags = HandleFlags::NEEDS_AAD
    .union(HandleFlags::CHECK_REPLAY)
    .union(HandleFlags::SAVE_COUNTER);
const WAN_COUNTER: HandleFlags = PAN_COUNTER.union(HandleFlags::SAVE_COUNTER_ONLINE);
const APP_TIME: HandleFlags = HandleFlags::NEEDS_AAD
    .union(HandleFlags::NEEDS_AAD_PREFIX)
    .union(HandleFlags::USE_APP_OFFSET);
const APP_COUNTER: HandleFlags = APP_TIME
    .union(HandleFlags::CHECK_REPLAY)
    .union(HandleFlags::SAVE_EXPLICIT_COUNTER);
const LAYERED_TIME: HandleFlags = APP_TIME.union(HandleFlags::USE_EXT_REFERENCE);
const LAYERED_COUNTER: HandleFlags = APP_COUNTER.union(HandleFlags::USE_EXT_REFERENCE);

/// Registered handles, sorted by mask
static CRYPT_MASK_TABLE: [CryptMaskHandle; 13] = [
    handle(PLAIN, HandleFlags::empty(), KeyId::None, KeyId::None, CryptStrategy::Plain),
    handle(PAN_TIME_AUTH, AAD, KeyId::Pan, KeyId::None, CryptStrategy::Authenticate),
    handle(PAN_CNT_AUTH, PAN_COUNTER, KeyId::Pan, KeyId::None, CryptStrategy::Authenticate),
    handle(WAN_TIME_AUTH, AAD, KeyId::Network, KeyId::None, CryptStrategy::Authenticate),
    handle(WAN_CNT_AUTH, WAN_COUNTER, KeyId::Network, KeyId::None, CryptStrategy::Authenticate),
    handle(APP_WAN_TIME_AUTH, APP_TIME, KeyId::App, KeyId::None, CryptStrategy::Encrypt),
    handle(APP_WAN_CNT_AUTH, APP_COUNTER, KeyId::App, KeyId::None, CryptStrategy::Encrypt),
    handle(NW_PAN_TIME_AUTH, AAD, KeyId::Pan, KeyId::None, CryptStrategy::Encrypt),
    handle(NW_PAN_CNT_AUTH, PAN_COUNTER, KeyId::Pan, KeyId::None, CryptStrategy::Encrypt),
    handle(NW_WAN_TIME_AUTH, AAD, KeyId::Network, KeyId::None, CryptStrategy::Encrypt),
    handle(NW_WAN_CNT_AUTH, WAN_COUNTER, KeyId::Network, KeyId::None, CryptStrategy::Encrypt),
    handle(NW_APP_WAN_TIME_AUTH, LAYERED_TIME, KeyId::Network, KeyId::App, CryptStrategy::Layered),
    handle(NW_APP_WAN_CNT_AUTH, LAYERED_COUNTER, KeyId::Network, KeyId::App, CryptStrategy::Layered),
];

/// Resolve a mask byte to its handle.
pub fn lookup(mask: u8) -> Result<&'static CryptMaskHandle, WireError> {
    CRYPT_MASK_TABLE
        .binary_search_by_key(&mask, |h| h.mask)
        .map(|idx| &CRYPT_MASK_TABLE[idx])
        .map_err(|_| WireError::NotFound(mask))
}

/// All registered handles
pub fn handles() -> &'static [CryptMaskHandle] {
    &CRYPT_MASK_TABLE
}

/// Counter based nonce
pub fn is_counter_set(mask: u8) -> bool {
    MaskBits::from_bits_truncate(mask).contains(MaskBits::COUNTER)
}

/// Network layer encryption
pub fn is_network_set(mask: u8) -> bool {
    MaskBits::from_bits_truncate(mask).contains(MaskBits::ENCR)
}

/// Application layer security
pub fn is_app_set(mask: u8) -> bool {
    MaskBits::from_bits_truncate(mask).contains(MaskBits::SEC)
}

/// WAN key domain
pub fn is_wan_set(mask: u8) -> bool {
    MaskBits::from_bits_truncate(mask).contains(MaskBits::TOPO)
}

/// Authentication tag present
pub fn is_use_auth_tag_set(mask: u8) -> bool {
    MaskBits::from_bits_truncate(mask).contains(MaskBits::AUTH_TAG)
}

impl CryptMaskHandle {
    /// Frame header is authenticated
    pub fn needs_aad(&self) -> bool {
        self.flags.contains(HandleFlags::NEEDS_AAD)
    }

    /// AAD carries the command prefix
    pub fn needs_aad_prefix(&self) -> bool {
        self.flags.contains(HandleFlags::NEEDS_AAD_PREFIX)
    }

    /// Leading application bytes stay clear
    pub fn use_app_offset(&self) -> bool {
        self.flags.contains(HandleFlags::USE_APP_OFFSET)
    }

    /// Remember the receive counter
    pub fn save_counter(&self) -> bool {
        self.flags.contains(HandleFlags::SAVE_COUNTER)
    }

    /// Enforce counter progression
    pub fn check_replay(&self) -> bool {
        self.flags.contains(HandleFlags::CHECK_REPLAY)
    }

    /// Track the application counter
    pub fn save_explicit_counter(&self) -> bool {
        self.flags.contains(HandleFlags::SAVE_EXPLICIT_COUNTER)
    }

    /// Keys resolve through the dedicated-link overlay
    pub fn use_ext_reference(&self) -> bool {
        self.flags.contains(HandleFlags::USE_EXT_REFERENCE)
    }

    /// Persist the receive counter
    pub fn save_counter_online(&self) -> bool {
        self.flags.contains(HandleFlags::SAVE_COUNTER_ONLINE)
    }

    /// Bytes added by the transform on top of the payload
    pub fn overhead(&self) -> usize {
        match self.strategy {
            CryptStrategy::Plain => 0,
            CryptStrategy::Authenticate | CryptStrategy::Encrypt => crate::crypt::TAG_SIZE,
            CryptStrategy::Layered => 2 * crate::crypt::TAG_SIZE,
        }
    }
}
