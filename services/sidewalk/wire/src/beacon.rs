//! BLE advertisement beacon framing.
//!
//! The beacon lives in the manufacturer-specific data of an advertisement and
//! never exceeds [`MAX_MANU_SPECIFIC_DATA_SIZE`] bytes:
//!
//! ```text
//! +----------------+-----------+---------------+-------------+--------------+
//! | application_id | state (1) | indicator (1) | tx_id (5)   | payload (0..12)
//! +----------------+-----------+---------------+-------------+--------------+
//!
//! state:     [7] device_type [6:5] device_mode [4:3] battery_level [2:0] adv_version
//! indicator: [7:4] data_len  [3:2] asl_version [1:0] tx_id_format
//! ```

use bytes::{Bytes, BytesMut, BufMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Upper bound on manufacturer-specific advertisement data
pub const MAX_MANU_SPECIFIC_DATA_SIZE: usize = 20;

/// Size of the transmit identifier
pub const MAX_TX_ID_SIZE: usize = 5;

/// Fixed part of a beacon
pub const MIN_ADV_SIZE: usize = 3 + MAX_TX_ID_SIZE;

/// Largest beacon payload
pub const MAX_BEACON_PAYLOAD: usize = MAX_MANU_SPECIFIC_DATA_SIZE - MIN_ADV_SIZE;

/// Layout without an application-layer version
pub const ADV_VERSION_LEGACY: u8 = 0;

/// Current advertisement layout
pub const ADVERTISEMENT_VERSION: u8 = 1;

/// Largest 24-bit link sequence
const TX_ID_SEQN_MASK: u32 = 0x00FF_FFFF;

/// Largest 31-bit counter
const TX_ID_COUNTER_MASK: u32 = 0x7FFF_FFFF;

/// Kind of advertiser
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    /// End device
    Endpoint = 0,
    /// Gateway
    Gateway = 1,
}

/// Registration and connectability mode
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMode {
    /// Not yet registered
    Unregistered = 0,
    /// Registered, connectable on request
    Registered = 1,
    /// Registered, asking for a connection
    ConnectionRequest = 2,
    /// Dedicated link in progress
    DedicatedLink = 3,
}

/// Coarse battery level
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryLevel {
    /// Mains or unknown
    Normal = 0,
    /// Low
    Low = 1,
    /// Critical
    Critical = 2,
    /// Not reported
    Unknown = 3,
}

/// Interpretation of the tx_id field
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxIdFormat {
    /// Time-synchronised link sequence
    TimeSync = 0,
    /// Monotonic send counter
    Counter = 1,
    /// Sidewalk manufacturing serial number
    Smsn = 2,
}

impl TryFrom<u8> for TxIdFormat {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TxIdFormat::TimeSync),
            1 => Ok(TxIdFormat::Counter),
            2 => Ok(TxIdFormat::Smsn),
            _ => Err(WireError::UnknownIndicator(value)),
        }
    }
}

/// Advertiser state byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconState {
    /// Kind of advertiser
    pub device_type: DeviceType,
    /// Registration mode
    pub device_mode: DeviceMode,
    /// Battery level
    pub battery_level: BatteryLevel,
    /// Layout version (0..7)
    pub adv_version: u8,
}

impl Default for BeaconState {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Endpoint,
            device_mode: DeviceMode::Registered,
            battery_level: BatteryLevel::Normal,
            adv_version: ADVERTISEMENT_VERSION,
        }
    }
}

impl BeaconState {
    /// Pack into the state byte
    pub fn pack(self) -> u8 {
        ((self.device_type as u8) << 7)
            | ((self.device_mode as u8) << 5)
            | ((self.battery_level as u8) << 3)
            | (self.adv_version & 0x07)
    }

    /// Unpack from the state byte
    pub fn unpack(value: u8) -> Self {
        let device_type = if value >> 7 == 0 {
            DeviceType::Endpoint
        } else {
            DeviceType::Gateway
        };
        let device_mode = match (value >> 5) & 0x03 {
            0 => DeviceMode::Unregistered,
            1 => DeviceMode::Registered,
            2 => DeviceMode::ConnectionRequest,
            _ => DeviceMode::DedicatedLink,
        };
        let battery_level = match (value >> 3) & 0x03 {
            0 => BatteryLevel::Normal,
            1 => BatteryLevel::Low,
            2 => BatteryLevel::Critical,
            _ => BatteryLevel::Unknown,
        };

        Self {
            device_type,
            device_mode,
            battery_level,
            adv_version: value & 0x07,
        }
    }
}

/// Frame indicator byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameIndicator {
    /// Payload length (0..12)
    pub data_len: u8,
    /// Application security layer version (0..3)
    pub asl_version: u8,
    /// tx_id interpretation
    pub tx_id_format: TxIdFormat,
}

impl FrameIndicator {
    /// Pack into the indicator byte
    pub fn pack(self) -> u8 {
        ((self.data_len & 0x0F) << 4) | ((self.asl_version & 0x03) << 2) | self.tx_id_format as u8
    }

    /// Unpack from the indicator byte
    pub fn unpack(value: u8) -> Result<Self, WireError> {
        Ok(Self {
            data_len: value >> 4,
            asl_version: (value >> 2) & 0x03,
            tx_id_format: TxIdFormat::try_from(value & 0x03)?,
        })
    }
}

/// Transmit identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxId {
    /// 24-bit link sequence and the low bits of the epoch
    TimeSync {
        /// Link sequence (24 bits)
        ll_seqn: u32,
        /// Low 16 bits of epoch seconds
        epoch_lo: u16,
    },
    /// 31-bit send counter and the advertisement rotation index
    Counter {
        /// Send counter (31 bits)
        counter: u32,
        /// Rotation index
        rotation: u8,
    },
    /// Serial number fragment
    Smsn {
        /// Raw id
        id: [u8; MAX_TX_ID_SIZE],
    },
}

impl TxId {
    /// Format announced in the indicator
    pub fn format(&self) -> TxIdFormat {
        match self {
            TxId::TimeSync { .. } => TxIdFormat::TimeSync,
            TxId::Counter { .. } => TxIdFormat::Counter,
            TxId::Smsn { .. } => TxIdFormat::Smsn,
        }
    }

    fn encode(&self) -> Result<[u8; MAX_TX_ID_SIZE], WireError> {
        let mut out = [0u8; MAX_TX_ID_SIZE];
        match *self {
            TxId::TimeSync { ll_seqn, epoch_lo } => {
                if ll_seqn > TX_ID_SEQN_MASK {
                    return Err(WireError::InvalidArgs("ll_seqn exceeds 24 bits"));
                }
                out[..3].copy_from_slice(&ll_seqn.to_be_bytes()[1..]);
                out[3..].copy_from_slice(&epoch_lo.to_be_bytes());
            }
            TxId::Counter { counter, rotation } => {
                if counter > TX_ID_COUNTER_MASK {
                    return Err(WireError::InvalidArgs("counter exceeds 31 bits"));
                }
                out[..4].copy_from_slice(&counter.to_be_bytes());
                out[4] = rotation;
            }
            TxId::Smsn { id } => out = id,
        }
        Ok(out)
    }

    fn decode(format: TxIdFormat, raw: &[u8]) -> Result<Self, WireError> {
        let mut id = [0u8; MAX_TX_ID_SIZE];
        id.copy_from_slice(&raw[..MAX_TX_ID_SIZE]);

        match format {
            TxIdFormat::TimeSync => Ok(TxId::TimeSync {
                ll_seqn: u32::from_be_bytes([0, id[0], id[1], id[2]]),
                epoch_lo: u16::from_be_bytes([id[3], id[4]]),
            }),
            TxIdFormat::Counter => {
                let counter = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
                if counter > TX_ID_COUNTER_MASK {
                    return Err(WireError::FrameMalformed);
                }
                Ok(TxId::Counter {
                    counter,
                    rotation: id[4],
                })
            }
            TxIdFormat::Smsn => Ok(TxId::Smsn { id }),
        }
    }
}

/// Advertisement beacon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconFrame {
    /// Application identifier
    pub application_id: u8,
    /// Advertiser state
    pub state: BeaconState,
    /// Application security layer version
    pub asl_version: u8,
    /// Transmit identifier
    pub tx_id: TxId,
    /// Beacon payload (at most [`MAX_BEACON_PAYLOAD`] bytes)
    pub payload: Bytes,
}

impl BeaconFrame {
    /// Create a beacon with an empty payload
    pub fn new(application_id: u8, state: BeaconState, tx_id: TxId) -> Self {
        Self {
            application_id,
            state,
            asl_version: 0,
            tx_id,
            payload: Bytes::new(),
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Indicator byte derived from the frame contents
    pub fn indicator(&self) -> FrameIndicator {
        FrameIndicator {
            data_len: self.payload.len() as u8,
            asl_version: self.asl_version,
            tx_id_format: self.tx_id.format(),
        }
    }

    /// Encoded size
    pub fn encoded_len(&self) -> usize {
        MIN_ADV_SIZE + self.payload.len()
    }

    /// Encode into `out`, returning the number of bytes written.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, WireError> {
        if self.payload.len() > MAX_BEACON_PAYLOAD {
            return Err(WireError::InvalidArgs("beacon payload too large"));
        }
        if self.state.adv_version > ADVERTISEMENT_VERSION {
            return Err(WireError::Version(self.state.adv_version));
        }
        if self.state.adv_version == ADV_VERSION_LEGACY && self.asl_version != 0 {
            return Err(WireError::InvalidArgs("legacy beacon carries no asl version"));
        }
        if self.asl_version > 0x03 {
            return Err(WireError::InvalidArgs("asl version exceeds 2 bits"));
        }

        let len = self.encoded_len();
        if out.len() < len {
            return Err(WireError::BufferTooSmall {
                need: len,
                got: out.len(),
            });
        }

        out[0] = self.application_id;
        out[1] = self.state.pack();
        out[2] = self.indicator().pack();
        out[3..MIN_ADV_SIZE].copy_from_slice(&self.tx_id.encode()?);
        out[MIN_ADV_SIZE..len].copy_from_slice(&self.payload);

        Ok(len)
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut out = [0u8; MAX_MANU_SPECIFIC_DATA_SIZE];
        let len = self.encode_into(&mut out)?;

        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(&out[..len]);
        Ok(buf.freeze())
    }

    /// Decode a beacon, validating the length announced by the indicator.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < MIN_ADV_SIZE {
            return Err(WireError::FrameTooShort {
                need: MIN_ADV_SIZE,
                got: buf.len(),
            });
        }

        let application_id = buf[0];
        let state = BeaconState::unpack(buf[1]);
        if state.adv_version > ADVERTISEMENT_VERSION {
            return Err(WireError::Version(state.adv_version));
        }

        let indicator = FrameIndicator::unpack(buf[2])?;
        if state.adv_version == ADV_VERSION_LEGACY && indicator.asl_version != 0 {
            return Err(WireError::FrameMalformed);
        }

        let data_len = indicator.data_len as usize;
        if data_len > MAX_BEACON_PAYLOAD {
            return Err(WireError::FrameMalformed);
        }
        let total = MIN_ADV_SIZE + data_len;
        if buf.len() < total {
            return Err(WireError::FrameTooShort {
                need: total,
                got: buf.len(),
            });
        }
        if buf.len() > total {
            return Err(WireError::FrameMalformed);
        }

        let tx_id = TxId::decode(indicator.tx_id_format, &buf[3..MIN_ADV_SIZE])?;

        Ok(Self {
            application_id,
            state,
            asl_version: indicator.asl_version,
            tx_id,
            payload: Bytes::copy_from_slice(&buf[MIN_ADV_SIZE..total]),
        })
    }
}
