//! Link key material.

use sid_wire::{KeyId, KeyProvider, KEY_SIZE};

use crate::dedicated::{DedicatedLink, TempKeyType};

/// Long-term keys provisioned on the device
#[derive(Default)]
pub struct KeyStore {
    network: Option<[u8; KEY_SIZE]>,
    pan: Option<[u8; KEY_SIZE]>,
    app: Option<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("network", &self.network.is_some())
            .field("pan", &self.pan.is_some())
            .field("app", &self.app.is_some())
            .finish()
    }
}

impl KeyStore {
    /// No keys provisioned
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a long-term key
    pub fn set_key(&mut self, id: KeyId, key: [u8; KEY_SIZE]) -> bool {
        let slot = match id {
            KeyId::Network => &mut self.network,
            KeyId::Pan => &mut self.pan,
            KeyId::App => &mut self.app,
            _ => return false,
        };
        *slot = Some(key);
        true
    }

    fn get(&self, id: KeyId) -> Option<&[u8; KEY_SIZE]> {
        match id {
            KeyId::Network => self.network.as_ref(),
            KeyId::Pan => self.pan.as_ref(),
            KeyId::App => self.app.as_ref(),
            _ => None,
        }
    }
}

/// Long-term keys overlaid with dedicated-link keys
pub struct KeyView<'a> {
    keys: &'a KeyStore,
    dedicated: &'a DedicatedLink,
}

impl<'a> KeyView<'a> {
    /// Combine the two key sources
    pub fn new(keys: &'a KeyStore, dedicated: &'a DedicatedLink) -> Self {
        Self { keys, dedicated }
    }
}

impl KeyProvider for KeyView<'_> {
    fn key(&self, id: KeyId, ext_reference: bool) -> Option<&[u8; KEY_SIZE]> {
        match id {
            KeyId::TempUnicast => return self.dedicated.get_temp_key(TempKeyType::Unicast),
            KeyId::TempApp => return self.dedicated.get_temp_key(TempKeyType::App),
            _ => {}
        }

        if ext_reference && self.dedicated.is_established() {
            let temp = match id {
                KeyId::Network | KeyId::Pan => TempKeyType::Unicast,
                _ => TempKeyType::App,
            };
            return self.dedicated.get_temp_key(temp);
        }

        self.keys.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedicated::{DedicatedLinkParams, DedicatedRole};

    fn keys() -> KeyStore {
        let mut keys = KeyStore::new();
        assert!(keys.set_key(KeyId::Network, [0x11; KEY_SIZE]));
        assert!(keys.set_key(KeyId::App, [0x33; KEY_SIZE]));
        assert!(!keys.set_key(KeyId::TempApp, [0; KEY_SIZE]));
        keys
    }

    #[test]
    fn test_long_term_keys() {
        let keys = keys();
        let dedicated = DedicatedLink::new();
        let view = KeyView::new(&keys, &dedicated);

        assert_eq!(view.key(KeyId::Network, false), Some(&[0x11; KEY_SIZE]));
        assert_eq!(view.key(KeyId::Network, true), Some(&[0x11; KEY_SIZE]));
        assert_eq!(view.key(KeyId::Pan, false), None);
        assert_eq!(view.key(KeyId::TempUnicast, false), None);
    }

    #[test]
    fn test_dedicated_overlay() {
        let keys = keys();
        let mut dedicated = DedicatedLink::new();
        dedicated
            .set_params(DedicatedLinkParams {
                role: DedicatedRole::AssistingDev,
                peer_dev_id: [9; 5],
                channel: 1,
            })
            .unwrap();
        dedicated.set_temp_key(TempKeyType::Unicast, [0xAA; KEY_SIZE]).unwrap();
        dedicated.set_temp_key(TempKeyType::App, [0xBB; KEY_SIZE]).unwrap();

        let view = KeyView::new(&keys, &dedicated);
        assert_eq!(view.key(KeyId::Network, true), Some(&[0xAA; KEY_SIZE]));
        assert_eq!(view.key(KeyId::App, true), Some(&[0xBB; KEY_SIZE]));
        assert_eq!(view.key(KeyId::Network, false), Some(&[0x11; KEY_SIZE]));
    }
}
