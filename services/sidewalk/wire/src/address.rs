//! Sidewalk address encoding, filtering and matching.
//!
//! An address carries up to [`ADDRESS_MAX_SIZE`] raw bytes. The number of
//! significant bytes is announced in the three most significant bits of the
//! first raw byte, so a raw buffer is self-describing on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Maximum number of raw address bytes
pub const ADDRESS_MAX_SIZE: usize = 7;

/// Filter byte value that matches any address byte
pub const ADDRESS_WILDCARD: u8 = 0xFF;

const SIZE_SHIFT: u8 = 5;
const SIZE_MASK: u8 = 0x1F;

/// Address kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    /// Cloud endpoint
    Cloud = 0,
    /// End device
    Device = 1,
    /// Short-lived handle
    Handle = 2,
    /// Group address
    Group = 3,
    /// Unset, or "any type" when used as a filter
    Undefined = 0xFF,
}

impl TryFrom<u8> for AddressType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AddressType::Cloud),
            1 => Ok(AddressType::Device),
            2 => Ok(AddressType::Handle),
            3 => Ok(AddressType::Group),
            0xFF => Ok(AddressType::Undefined),
            _ => Err(WireError::InvalidArgs("unknown address type")),
        }
    }
}

/// Matches every address
pub const FILTER_ANY: Address = Address {
    kind: AddressType::Undefined,
    bytes: [ADDRESS_WILDCARD; ADDRESS_MAX_SIZE],
};

/// Matches every device address
pub const FILTER_DEVICE_ANY: Address = Address {
    kind: AddressType::Device,
    bytes: [ADDRESS_WILDCARD; ADDRESS_MAX_SIZE],
};

/// A typed Sidewalk address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Address kind
    pub kind: AddressType,
    /// Raw bytes; only the first [`Address::size`] are significant
    pub bytes: [u8; ADDRESS_MAX_SIZE],
}

impl Default for Address {
    fn default() -> Self {
        Self::UNSET
    }
}

impl Address {
    /// Address with no significant bytes
    pub const UNSET: Address = Address {
        kind: AddressType::Undefined,
        bytes: [0; ADDRESS_MAX_SIZE],
    };

    /// Build an address from `raw`, stamping its length into the first byte.
    pub fn new(kind: AddressType, raw: &[u8]) -> Result<Self, WireError> {
        if raw.is_empty() || raw.len() > ADDRESS_MAX_SIZE {
            return Err(WireError::InvalidArgs("address length"));
        }

        let mut bytes = [0u8; ADDRESS_MAX_SIZE];
        bytes[..raw.len()].copy_from_slice(raw);
        bytes[0] = ((raw.len() as u8) << SIZE_SHIFT) | (bytes[0] & SIZE_MASK);

        Ok(Self { kind, bytes })
    }

    /// Build a match filter; bytes are taken verbatim and the rest are wildcards.
    pub fn filter(kind: AddressType, raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() > ADDRESS_MAX_SIZE {
            return Err(WireError::InvalidArgs("filter length"));
        }

        let mut bytes = [ADDRESS_WILDCARD; ADDRESS_MAX_SIZE];
        bytes[..raw.len()].copy_from_slice(raw);

        Ok(Self { kind, bytes })
    }

    /// Number of significant raw bytes
    pub fn size(&self) -> usize {
        (self.bytes[0] >> SIZE_SHIFT) as usize
    }

    /// Whether the address carries no significant bytes
    pub fn is_unset(&self) -> bool {
        self.size() == 0
    }

    /// Significant raw bytes
    pub fn as_raw(&self) -> &[u8] {
        &self.bytes[..self.size().min(ADDRESS_MAX_SIZE)]
    }

    /// Copy the significant bytes into `buf`, returning how many were written.
    pub fn to_raw_buffer(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        let size = self.size();
        if size == 0 || size > ADDRESS_MAX_SIZE {
            return Err(WireError::InvalidArgs("address not set"));
        }
        if buf.len() < size {
            return Err(WireError::BufferTooSmall {
                need: size,
                got: buf.len(),
            });
        }

        buf[..size].copy_from_slice(&self.bytes[..size]);
        Ok(size)
    }

    /// Decode an address from a raw buffer whose first byte announces the size.
    pub fn from_raw_buffer(kind: AddressType, buf: &[u8]) -> Result<Self, WireError> {
        let first = *buf.first().ok_or(WireError::FrameTooShort { need: 1, got: 0 })?;
        let size = (first >> SIZE_SHIFT) as usize;
        if size == 0 || size > ADDRESS_MAX_SIZE {
            return Err(WireError::FrameMalformed);
        }
        if buf.len() < size {
            return Err(WireError::FrameTooShort {
                need: size,
                got: buf.len(),
            });
        }

        let mut bytes = [0u8; ADDRESS_MAX_SIZE];
        bytes[..size].copy_from_slice(&buf[..size]);
        Ok(Self { kind, bytes })
    }

    /// Encoded length of `[type][raw]`
    pub fn encoded_len(&self) -> usize {
        1 + self.size()
    }

    /// Encode as `[type][raw]`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        let size = self.size();
        if size == 0 || size > ADDRESS_MAX_SIZE {
            return Err(WireError::InvalidArgs("address not set"));
        }
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.bytes[..size]);
        Ok(())
    }

    /// Decode from `[type][raw]`
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < 2 {
            return Err(WireError::FrameTooShort {
                need: 2,
                got: buf.len(),
            });
        }

        let kind = AddressType::try_from(buf.get_u8()).map_err(|_| WireError::FrameMalformed)?;
        let addr = Self::from_raw_buffer(kind, &buf[..])?;
        buf.advance(addr.size());
        Ok(addr)
    }
}

/// Check `addr` against `filter`.
///
/// An `Undefined` filter type accepts any address type. Each significant byte
/// of `addr` must equal the filter byte unless the filter byte is a wildcard.
pub fn address_match(filter: &Address, addr: &Address) -> bool {
    if filter.kind != AddressType::Undefined && filter.kind != addr.kind {
        return false;
    }

    let size = addr.size().min(ADDRESS_MAX_SIZE);
    filter.bytes[..size]
        .iter()
        .zip(&addr.bytes[..size])
        .all(|(f, a)| *f == ADDRESS_WILDCARD || f == a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_type_conversion() {
        assert_eq!(AddressType::try_from(1).unwrap(), AddressType::Device);
        assert_eq!(AddressType::try_from(0xFF).unwrap(), AddressType::Undefined);
        assert_eq!(
            AddressType::try_from(4),
            Err(WireError::InvalidArgs("unknown address type"))
        );
    }

    #[test]
    fn test_new_stamps_size() {
        let addr = Address::new(AddressType::Device, &[0x01, 0x02, 0x03, 0x04, 0x05]).unwrap();
        assert_eq!(addr.size(), 5);
        assert_eq!(addr.bytes[0], (5 << 5) | 0x01);

        assert!(Address::new(AddressType::Device, &[]).is_err());
        assert!(Address::new(AddressType::Device, &[0; 8]).is_err());
    }

    #[test]
    fn test_raw_buffer_sizes() {
        let addr = Address::new(AddressType::Cloud, &[0xAA, 0xBB, 0xCC]).unwrap();

        let mut small = [0u8; 2];
        assert_eq!(
            addr.to_raw_buffer(&mut small),
            Err(WireError::BufferTooSmall { need: 3, got: 2 })
        );

        let mut buf = [0u8; ADDRESS_MAX_SIZE];
        assert_eq!(addr.to_raw_buffer(&mut buf).unwrap(), 3);
        let decoded = Address::from_raw_buffer(AddressType::Cloud, &buf).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_from_raw_buffer_rejects_bad_size() {
        assert_eq!(
            Address::from_raw_buffer(AddressType::Device, &[0x00, 0x11]),
            Err(WireError::FrameMalformed)
        );
        // announces 4 bytes, carries 2
        assert!(matches!(
            Address::from_raw_buffer(AddressType::Device, &[0x80, 0x11]),
            Err(WireError::FrameTooShort { need: 4, got: 2 })
        ));
    }

    #[test]
    fn test_wire_encode_decode() {
        let addr = Address::new(AddressType::Group, &[0x10, 0x20, 0x30, 0x40, 0x50, 0x60]).unwrap();

        let mut buf = BytesMut::new();
        addr.encode(&mut buf).unwrap();
        buf.put_u8(0xEE);
        assert_eq!(buf.len(), addr.encoded_len() + 1);

        let mut bytes = buf.freeze();
        let decoded = Address::decode(&mut bytes).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(bytes.as_ref(), &[0xEE]);
    }

    #[test]
    fn test_unset_address_does_not_encode() {
        let mut buf = BytesMut::new();
        assert!(Address::UNSET.encode(&mut buf).is_err());
        assert!(Address::UNSET.is_unset());
    }

    #[test]
    fn test_filter_any_matches_everything() {
        let device = Address::new(AddressType::Device, &[1, 2, 3, 4, 5]).unwrap();
        let cloud = Address::new(AddressType::Cloud, &[9]).unwrap();

        assert!(address_match(&FILTER_ANY, &device));
        assert!(address_match(&FILTER_ANY, &cloud));
    }

    #[test]
    fn test_filter_device_any_checks_type() {
        let device = Address::new(AddressType::Device, &[1, 2, 3, 4, 5]).unwrap();
        let handle = Address::new(AddressType::Handle, &[1, 2, 3, 4, 5]).unwrap();
        let group = Address::new(AddressType::Group, &[1, 2, 3, 4, 5]).unwrap();

        assert!(address_match(&FILTER_DEVICE_ANY, &device));
        assert!(!address_match(&FILTER_DEVICE_ANY, &handle));
        assert!(!address_match(&FILTER_DEVICE_ANY, &group));

        // same bytes, filter pinned to Device
        let exact = Address::filter(AddressType::Device, device.as_raw()).unwrap();
        assert!(address_match(&exact, &device));
        assert!(!address_match(&exact, &group));
    }

    #[test]
    fn test_filter_partial_wildcard() {
        let device = Address::new(AddressType::Device, &[0x01, 0x02, 0x03, 0x04, 0x05]).unwrap();
        let mut raw = device.bytes;
        raw[3] = ADDRESS_WILDCARD;
        raw[4] = ADDRESS_WILDCARD;
        let filter = Address::filter(AddressType::Device, &raw[..5]).unwrap();
        assert!(address_match(&filter, &device));

        let other = Address::new(AddressType::Device, &[0x01, 0x02, 0x07, 0x04, 0x05]).unwrap();
        assert!(!address_match(&filter, &other));
    }
}
