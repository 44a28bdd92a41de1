//! Connected-link data PDU.
//!
//! ```text
//! +------------+-------------+-------------------+-----------+----------+-----+-----+------+
//! | crypt_mask | ll_seqn (3) | nonce_counter (4) | cmd_class | cmd_id(2)| dst | src | body |
//! +------------+-------------+-------------------+-----------+----------+-----+-----+------+
//! ```
//!
//! Addresses use the `[type][raw]` form. Everything before `body` is the
//! header, which crypt handles authenticate as AAD.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::Address;
use crate::WireError;

/// Largest PDU accepted on the link
pub const MAX_PDU_SIZE: usize = 255;

/// Header bytes before the addresses
pub const PDU_FIXED_HEADER_SIZE: usize = 11;

/// Largest link sequence value
pub const MAX_LL_SEQN: u32 = 0x3F_FFFF;

/// Decoded PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    /// Security byte selecting the crypt handle
    pub crypt_mask: u8,
    /// Link sequence (24 bits)
    pub ll_seqn: u32,
    /// Send counter or epoch seconds
    pub nonce_counter: u32,
    /// Command class
    pub cmd_class: u8,
    /// Command id
    pub cmd_id: u16,
    /// Destination
    pub dst: Address,
    /// Source
    pub src: Address,
}

impl PduHeader {
    /// Encoded header length
    pub fn encoded_len(&self) -> usize {
        PDU_FIXED_HEADER_SIZE + self.dst.encoded_len() + self.src.encoded_len()
    }

    /// Encode the header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        if self.ll_seqn > 0x00FF_FFFF {
            return Err(WireError::InvalidArgs("ll_seqn exceeds 24 bits"));
        }

        buf.put_u8(self.crypt_mask);
        buf.put_slice(&self.ll_seqn.to_be_bytes()[1..]);
        buf.put_u32(self.nonce_counter);
        buf.put_u8(self.cmd_class);
        buf.put_u16(self.cmd_id);
        self.dst.encode(buf)?;
        self.src.encode(buf)?;
        Ok(())
    }

    /// Decode the header, leaving `buf` at the start of the body
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < PDU_FIXED_HEADER_SIZE {
            return Err(WireError::FrameTooShort {
                need: PDU_FIXED_HEADER_SIZE,
                got: buf.len(),
            });
        }

        let crypt_mask = buf.get_u8();
        let ll_seqn = {
            let hi = buf.get_u8() as u32;
            let lo = buf.get_u16() as u32;
            (hi << 16) | lo
        };
        let nonce_counter = buf.get_u32();
        let cmd_class = buf.get_u8();
        let cmd_id = buf.get_u16();
        let dst = Address::decode(buf)?;
        let src = Address::decode(buf)?;

        Ok(Self {
            crypt_mask,
            ll_seqn,
            nonce_counter,
            cmd_class,
            cmd_id,
            dst,
            src,
        })
    }
}

/// A PDU split into its header bytes and body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPdu {
    /// Decoded header
    pub header: PduHeader,
    /// Raw header bytes as received, used as AAD
    pub header_bytes: Bytes,
    /// Crypt output
    pub body: Bytes,
}

impl DataPdu {
    /// Split a received frame
    pub fn decode(frame: Bytes) -> Result<Self, WireError> {
        if frame.len() > MAX_PDU_SIZE {
            return Err(WireError::FrameMalformed);
        }

        let mut rest = frame.clone();
        let header = PduHeader::decode(&mut rest)?;
        let header_len = frame.len() - rest.len();

        Ok(Self {
            header,
            header_bytes: frame.slice(..header_len),
            body: rest,
        })
    }
}
