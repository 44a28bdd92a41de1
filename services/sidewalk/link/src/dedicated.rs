//! Dedicated link: a temporary point-to-point session between two devices
//! with its own unicast and application keys.

use serde::Serialize;
use sid_wire::KEY_SIZE;
use tracing::{debug, info};

use crate::LinkError;

/// Device id length used to name the peer
pub const PEER_DEV_ID_SIZE: usize = 5;

/// Role of this device in the dedicated link
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DedicatedRole {
    /// Device asking for assistance
    ClientDev = 1,
    /// Device providing the link
    AssistingDev = 2,
}

/// Key exchange progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DedicatedState {
    /// No dedicated link
    Idle,
    /// Parameters set, temporary keys pending
    HandshakeRequested,
    /// Both temporary keys installed
    Established,
}

/// Temporary key kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempKeyType {
    /// Replaces the network keys
    Unicast,
    /// Replaces the application key
    App,
}

/// Dedicated link parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedicatedLinkParams {
    /// Our role
    pub role: DedicatedRole,
    /// Peer device id
    pub peer_dev_id: [u8; PEER_DEV_ID_SIZE],
    /// Radio channel agreed for the link
    pub channel: u8,
}

/// Dedicated link session state
#[derive(Debug)]
pub struct DedicatedLink {
    params: Option<DedicatedLinkParams>,
    state: DedicatedState,
    unicast_key: Option<[u8; KEY_SIZE]>,
    app_key: Option<[u8; KEY_SIZE]>,
}

impl Default for DedicatedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl DedicatedLink {
    /// No dedicated link
    pub fn new() -> Self {
        Self {
            params: None,
            state: DedicatedState::Idle,
            unicast_key: None,
            app_key: None,
        }
    }

    /// Current state
    pub fn state(&self) -> DedicatedState {
        self.state
    }

    /// Whether the temporary keys are in force
    pub fn is_established(&self) -> bool {
        self.state == DedicatedState::Established
    }

    /// Current parameters
    pub fn params(&self) -> Option<&DedicatedLinkParams> {
        self.params.as_ref()
    }

    /// Begin a dedicated link with `params`
    pub fn set_params(&mut self, params: DedicatedLinkParams) -> Result<(), LinkError> {
        if self.state == DedicatedState::Established {
            return Err(LinkError::InvalidArgs("dedicated link already established"));
        }

        info!(
            "Dedicated link requested: role {:?}, peer {:02x?}, channel {}",
            params.role, params.peer_dev_id, params.channel
        );
        self.params = Some(params);
        self.state = DedicatedState::HandshakeRequested;
        Ok(())
    }

    /// Install a temporary key; the link is established once both are present
    pub fn set_temp_key(&mut self, kind: TempKeyType, key: [u8; KEY_SIZE]) -> Result<(), LinkError> {
        if self.state == DedicatedState::Idle {
            return Err(LinkError::InvalidArgs("no dedicated link requested"));
        }

        match kind {
            TempKeyType::Unicast => self.unicast_key = Some(key),
            TempKeyType::App => self.app_key = Some(key),
        }
        debug!("Dedicated link {:?} key installed", kind);

        if self.unicast_key.is_some() && self.app_key.is_some() {
            self.state = DedicatedState::Established;
            info!("Dedicated link established");
        }
        Ok(())
    }

    /// Temporary key of `kind`
    pub fn get_temp_key(&self, kind: TempKeyType) -> Option<&[u8; KEY_SIZE]> {
        match kind {
            TempKeyType::Unicast => self.unicast_key.as_ref(),
            TempKeyType::App => self.app_key.as_ref(),
        }
    }

    /// Drop the dedicated link and wipe its keys
    pub fn terminate(&mut self) {
        if let Some(key) = self.unicast_key.as_mut() {
            key.fill(0);
        }
        if let Some(key) = self.app_key.as_mut() {
            key.fill(0);
        }
        *self = Self::new();
        debug!("Dedicated link terminated");
    }
}
