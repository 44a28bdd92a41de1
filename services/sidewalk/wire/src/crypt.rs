//! AEAD transforms selected by a [`CryptMaskHandle`].
//!
//! All transforms are AES-128-GCM with a 16-byte tag. Buffers are owned by the
//! caller; the only scratch space used is [`CryptParams::scratch`], which holds
//! the associated data while a layer is sealed or opened.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes128Gcm;

use crate::address::Address;
use crate::crypt_mask::{CryptMaskHandle, CryptStrategy, KeyId};
use crate::WireError;

/// Scratch space shared by AAD building
pub const CRYPT_SCRATCH_SIZE: usize = 326;

/// Key length in bytes
pub const KEY_SIZE: usize = 16;

/// Authentication tag length in bytes
pub const TAG_SIZE: usize = 16;

/// Nonce length in bytes
pub const NONCE_SIZE: usize = 12;

/// AAD prefix length: command class, command id and mask
const AAD_PREFIX_SIZE: usize = 4;

/// Source of key material for crypt handles
pub trait KeyProvider {
    /// Key for `id`. With `ext_reference` set, dedicated-link keys take precedence.
    fn key(&self, id: KeyId, ext_reference: bool) -> Option<&[u8; KEY_SIZE]>;
}

/// Per-frame crypt parameters
pub struct CryptParams<'a> {
    /// AAD scratch space
    pub scratch: [u8; CRYPT_SCRATCH_SIZE],
    /// Encoded frame header, authenticated as AAD
    pub header: &'a [u8],
    /// Link sequence number (24 bits used)
    pub seqn: u32,
    /// Send counter or epoch seconds
    pub nonce_counter: u32,
    /// Application sequence number for the inner layer
    pub app_seqn: u32,
    /// Command class
    pub cmd_class: u8,
    /// Command id
    pub cmd_id: u16,
    /// Clear leading bytes for handles using an application offset
    pub app_offset: usize,
    /// Frame source
    pub src: &'a Address,
    /// Frame destination
    pub dst: &'a Address,
}

impl<'a> CryptParams<'a> {
    /// Create parameters for a frame between `src` and `dst`
    pub fn new(header: &'a [u8], src: &'a Address, dst: &'a Address) -> Self {
        Self {
            scratch: [0u8; CRYPT_SCRATCH_SIZE],
            header,
            seqn: 0,
            nonce_counter: 0,
            app_seqn: 0,
            cmd_class: 0,
            cmd_id: 0,
            app_offset: 0,
            src,
            dst,
        }
    }

    /// Set the link sequence and nonce counter
    pub fn with_sequence(mut self, seqn: u32, nonce_counter: u32) -> Self {
        self.seqn = seqn;
        self.nonce_counter = nonce_counter;
        self
    }

    /// Set the application sequence number
    pub fn with_app_seqn(mut self, app_seqn: u32) -> Self {
        self.app_seqn = app_seqn;
        self
    }

    /// Set the command class and id
    pub fn with_command(mut self, cmd_class: u8, cmd_id: u16) -> Self {
        self.cmd_class = cmd_class;
        self.cmd_id = cmd_id;
        self
    }

    /// Set the clear application offset
    pub fn with_app_offset(mut self, app_offset: usize) -> Self {
        self.app_offset = app_offset;
        self
    }

    fn nonce(&self, mask: u8, seqn: u32) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = mask;
        let src = self.src.as_raw();
        let n = src.len().min(4);
        nonce[1..1 + n].copy_from_slice(&src[..n]);
        nonce[5..8].copy_from_slice(&seqn.to_be_bytes()[1..]);
        nonce[8..].copy_from_slice(&self.nonce_counter.to_be_bytes());
        nonce
    }

    /// Build the AAD into scratch and return its length.
    fn build_aad(
        &mut self,
        handle: &CryptMaskHandle,
        with_prefix: bool,
        clear: &[u8],
    ) -> Result<usize, WireError> {
        let prefix = if with_prefix && handle.needs_aad_prefix() {
            AAD_PREFIX_SIZE
        } else {
            0
        };
        let header = if handle.needs_aad() { self.header.len() } else { 0 };
        let total = prefix + header + clear.len();
        if total > CRYPT_SCRATCH_SIZE {
            return Err(WireError::InvalidArgs("aad exceeds scratch"));
        }

        let mut pos = 0;
        if prefix > 0 {
            self.scratch[0] = self.cmd_class;
            self.scratch[1..3].copy_from_slice(&self.cmd_id.to_be_bytes());
            self.scratch[3] = handle.mask;
            pos = prefix;
        }
        if header > 0 {
            self.scratch[pos..pos + header].copy_from_slice(self.header);
            pos += header;
        }
        self.scratch[pos..pos + clear.len()].copy_from_slice(clear);

        Ok(total)
    }

    fn clear_offset(&self, handle: &CryptMaskHandle, len: usize) -> Result<usize, WireError> {
        if !handle.use_app_offset() {
            return Ok(0);
        }
        if self.app_offset > len {
            return Err(WireError::InvalidArgs("app offset beyond payload"));
        }
        Ok(self.app_offset)
    }
}

fn resolve<'k>(
    keys: &'k dyn KeyProvider,
    handle: &CryptMaskHandle,
    id: KeyId,
) -> Result<&'k [u8; KEY_SIZE], WireError> {
    if id == KeyId::None {
        return Err(WireError::Crypto);
    }
    keys.key(id, handle.use_ext_reference())
        .ok_or(WireError::Crypto)
}

fn seal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    buf: &mut [u8],
) -> Result<[u8; TAG_SIZE], WireError> {
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| WireError::Crypto)?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf)
        .map_err(|_| WireError::Crypto)?;

    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    Ok(out)
}

fn open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<(), WireError> {
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| WireError::Crypto)?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buf,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| WireError::Crypto)
}

fn split_tag(buf: &[u8], len: usize) -> Result<(usize, [u8; TAG_SIZE]), WireError> {
    if len < TAG_SIZE {
        return Err(WireError::FrameTooShort {
            need: TAG_SIZE,
            got: len,
        });
    }
    let body = len - TAG_SIZE;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&buf[body..len]);
    Ok((body, tag))
}

impl CryptMaskHandle {
    /// Transform `input` into `output`, returning the number of bytes written.
    pub fn encrypt(
        &self,
        keys: &dyn KeyProvider,
        params: &mut CryptParams<'_>,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, WireError> {
        let need = input.len() + self.overhead();
        if output.len() < need {
            return Err(WireError::BufferTooSmall {
                need,
                got: output.len(),
            });
        }
        output[..input.len()].copy_from_slice(input);

        match self.strategy {
            CryptStrategy::Plain => Ok(input.len()),
            CryptStrategy::Authenticate => {
                let key = resolve(keys, self, self.first_key)?;
                let nonce = params.nonce(self.mask, params.seqn);
                let aad_len = params.build_aad(self, true, input)?;
                let tag = seal(key, &nonce, &params.scratch[..aad_len], &mut [])?;
                output[input.len()..need].copy_from_slice(&tag);
                Ok(need)
            }
            CryptStrategy::Encrypt => {
                let key = resolve(keys, self, self.first_key)?;
                let seqn = params.seqn;
                self.seal_layer(key, params, seqn, true, output, input.len())
            }
            CryptStrategy::Layered => {
                let inner_key = resolve(keys, self, self.second_key)?;
                let app_seqn = params.app_seqn;
                let inner = self.seal_layer(inner_key, params, app_seqn, true, output, input.len())?;
                let outer_key = resolve(keys, self, self.first_key)?;
                let nonce = params.nonce(self.mask, params.seqn);
                let aad_len = params.build_aad(self, false, &[])?;
                let tag = seal(outer_key, &nonce, &params.scratch[..aad_len], &mut output[..inner])?;
                output[inner..inner + TAG_SIZE].copy_from_slice(&tag);
                Ok(inner + TAG_SIZE)
            }
        }
    }

    /// Verify and recover the payload of `input` into `output`.
    pub fn decrypt(
        &self,
        keys: &dyn KeyProvider,
        params: &mut CryptParams<'_>,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, WireError> {
        let overhead = self.overhead();
        if input.len() < overhead {
            return Err(WireError::FrameTooShort {
                need: overhead,
                got: input.len(),
            });
        }
        let plain_len = input.len() - overhead;
        if output.len() < input.len() {
            return Err(WireError::BufferTooSmall {
                need: input.len(),
                got: output.len(),
            });
        }
        output[..input.len()].copy_from_slice(input);

        match self.strategy {
            CryptStrategy::Plain => Ok(input.len()),
            CryptStrategy::Authenticate => {
                let key = resolve(keys, self, self.first_key)?;
                let (body, tag) = split_tag(input, input.len())?;
                let nonce = params.nonce(self.mask, params.seqn);
                let aad_len = params.build_aad(self, true, &input[..body])?;
                open(key, &nonce, &params.scratch[..aad_len], &mut [], &tag)?;
                Ok(body)
            }
            CryptStrategy::Encrypt => {
                let key = resolve(keys, self, self.first_key)?;
                let seqn = params.seqn;
                self.open_layer(key, params, seqn, output, input.len())
            }
            CryptStrategy::Layered => {
                let outer_key = resolve(keys, self, self.first_key)?;
                let (inner, tag) = split_tag(output, input.len())?;
                let nonce = params.nonce(self.mask, params.seqn);
                let aad_len = params.build_aad(self, false, &[])?;
                open(outer_key, &nonce, &params.scratch[..aad_len], &mut output[..inner], &tag)?;

                let inner_key = resolve(keys, self, self.second_key)?;
                let app_seqn = params.app_seqn;
                let len = self.open_layer(inner_key, params, app_seqn, output, inner)?;
                debug_assert_eq!(len, plain_len);
                Ok(len)
            }
        }
    }

    /// Seal `buf[..len]` in place and append the tag.
    fn seal_layer(
        &self,
        key: &[u8; KEY_SIZE],
        params: &mut CryptParams<'_>,
        seqn: u32,
        with_prefix: bool,
        buf: &mut [u8],
        len: usize,
    ) -> Result<usize, WireError> {
        let offset = params.clear_offset(self, len)?;
        let nonce = params.nonce(self.mask, seqn);
        let aad_len = params.build_aad(self, with_prefix, &buf[..offset])?;
        let tag = seal(key, &nonce, &params.scratch[..aad_len], &mut buf[offset..len])?;
        buf[len..len + TAG_SIZE].copy_from_slice(&tag);
        Ok(len + TAG_SIZE)
    }

    /// Open `buf[..len]` (body followed by tag) in place.
    fn open_layer(
        &self,
        key: &[u8; KEY_SIZE],
        params: &mut CryptParams<'_>,
        seqn: u32,
        buf: &mut [u8],
        len: usize,
    ) -> Result<usize, WireError> {
        let (body, tag) = split_tag(buf, len)?;
        let offset = params.clear_offset(self, body)?;
        let nonce = params.nonce(self.mask, seqn);
        let aad_len = params.build_aad(self, true, &buf[..offset])?;
        open(key, &nonce, &params.scratch[..aad_len], &mut buf[offset..body], &tag)?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressType;
    use crate::crypt_mask::{self, lookup};

    struct TestKeys {
        network: [u8; KEY_SIZE],
        pan: [u8; KEY_SIZE],
        app: [u8; KEY_SIZE],
    }

    impl TestKeys {
        fn new() -> Self {
            Self {
                network: [0x11; KEY_SIZE],
                pan: [0x22; KEY_SIZE],
                app: [0x33; KEY_SIZE],
            }
        }
    }

    impl KeyProvider for TestKeys {
        fn key(&self, id: KeyId, _ext_reference: bool) -> Option<&[u8; KEY_SIZE]> {
            match id {
                KeyId::Network => Some(&self.network),
                KeyId::Pan => Some(&self.pan),
                KeyId::App => Some(&self.app),
                _ => None,
            }
        }
    }

    fn addrs() -> (Address, Address) {
        (
            Address::new(AddressType::Device, &[0x01, 0x02, 0x03, 0x04, 0x05]).unwrap(),
            Address::new(AddressType::Cloud, &[0x0A]).unwrap(),
        )
    }

    fn seal_open(mask: u8, payload: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let keys = TestKeys::new();
        let (src, dst) = addrs();
        let header = [mask, 0x00, 0x00, 0x07];
        let handle = lookup(mask).unwrap();

        let mut params = CryptParams::new(&header, &src, &dst)
            .with_sequence(7, 42)
            .with_app_seqn(3)
            .with_command(0x02, 0x0104)
            .with_app_offset(2);

        let mut sealed = vec![0u8; payload.len() + handle.overhead()];
        let n = handle.encrypt(&keys, &mut params, payload, &mut sealed).unwrap();
        assert_eq!(n, sealed.len());

        let mut opened = vec![0u8; sealed.len()];
        let m = handle.decrypt(&keys, &mut params, &sealed, &mut opened).unwrap();
        opened.truncate(m);
        (sealed, opened)
    }

    #[test]
    fn test_every_handle_recovers_payload() {
        let payload = b"sidewalk payload";
        for h in crypt_mask::handles() {
            let (_, opened) = seal_open(h.mask, payload);
            assert_eq!(opened, payload, "mask 0x{:02x}", h.mask);
        }
    }

    #[test]
    fn test_authenticate_keeps_payload_clear() {
        let payload = b"hello";
        let (sealed, _) = seal_open(crypt_mask::WAN_CNT_AUTH, payload);
        assert_eq!(&sealed[..payload.len()], payload);
        assert_eq!(sealed.len(), payload.len() + TAG_SIZE);
    }

    #[test]
    fn test_encrypt_hides_payload() {
        let payload = b"secret message";
        let (sealed, _) = seal_open(crypt_mask::NW_WAN_CNT_AUTH, payload);
        assert_ne!(&sealed[..payload.len()], payload);
    }

    #[test]
    fn test_app_offset_bytes_stay_clear() {
        let payload = b"\x01\x02encrypted part";
        let (sealed, _) = seal_open(crypt_mask::APP_WAN_CNT_AUTH, payload);
        assert_eq!(&sealed[..2], &payload[..2]);
        assert_ne!(&sealed[2..payload.len()], &payload[2..]);
    }

    #[test]
    fn test_tampering_is_detected() {
        let keys = TestKeys::new();
        let (src, dst) = addrs();
        let header = [crypt_mask::NW_WAN_CNT_AUTH, 0x00, 0x01];
        let handle = lookup(crypt_mask::NW_WAN_CNT_AUTH).unwrap();
        let mut params = CryptParams::new(&header, &src, &dst).with_sequence(1, 1);

        let mut sealed = [0u8; 4 + TAG_SIZE];
        handle.encrypt(&keys, &mut params, b"data", &mut sealed).unwrap();
        sealed[1] ^= 0x80;

        let mut out = [0u8; 4 + TAG_SIZE];
        assert_eq!(
            handle.decrypt(&keys, &mut params, &sealed, &mut out),
            Err(WireError::Crypto)
        );
    }

    #[test]
    fn test_header_is_authenticated() {
        let keys = TestKeys::new();
        let (src, dst) = addrs();
        let handle = lookup(crypt_mask::WAN_TIME_AUTH).unwrap();

        let header = [crypt_mask::WAN_TIME_AUTH, 0x10];
        let mut params = CryptParams::new(&header, &src, &dst).with_sequence(9, 1_700_000_000);
        let mut sealed = [0u8; 3 + TAG_SIZE];
        handle.encrypt(&keys, &mut params, b"abc", &mut sealed).unwrap();

        let forged = [crypt_mask::WAN_TIME_AUTH, 0x11];
        let mut params = CryptParams::new(&forged, &src, &dst).with_sequence(9, 1_700_000_000);
        let mut out = [0u8; 3 + TAG_SIZE];
        assert!(handle.decrypt(&keys, &mut params, &sealed, &mut out).is_err());
    }

    #[test]
    fn test_missing_key_fails() {
        struct NoKeys;
        impl KeyProvider for NoKeys {
            fn key(&self, _id: KeyId, _ext: bool) -> Option<&[u8; KEY_SIZE]> {
                None
            }
        }

        let (src, dst) = addrs();
        let handle = lookup(crypt_mask::PAN_CNT_AUTH).unwrap();
        let mut params = CryptParams::new(&[], &src, &dst);
        let mut out = [0u8; 32];
        assert_eq!(
            handle.encrypt(&NoKeys, &mut params, b"x", &mut out),
            Err(WireError::Crypto)
        );
    }

    #[test]
    fn test_output_too_small() {
        let keys = TestKeys::new();
        let (src, dst) = addrs();
        let handle = lookup(crypt_mask::NW_PAN_TIME_AUTH).unwrap();
        let mut params = CryptParams::new(&[], &src, &dst);
        let mut out = [0u8; 8];
        assert_eq!(
            handle.encrypt(&keys, &mut params, b"payload", &mut out),
            Err(WireError::BufferTooSmall { need: 23, got: 8 })
        );
    }

    #[test]
    fn test_aad_larger_than_scratch_rejected() {
        let keys = TestKeys::new();
        let (src, dst) = addrs();
        let handle = lookup(crypt_mask::WAN_TIME_AUTH).unwrap();
        let header = [0u8; CRYPT_SCRATCH_SIZE];
        let mut params = CryptParams::new(&header, &src, &dst);
        let mut out = [0u8; 1 + TAG_SIZE];
        assert!(matches!(
            handle.encrypt(&keys, &mut params, b"x", &mut out),
            Err(WireError::InvalidArgs(_))
        ));
    }
}
