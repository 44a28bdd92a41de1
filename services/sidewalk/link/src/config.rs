//! Link interface configuration.

use std::time::Duration;

use sid_resource::Priority;
use sid_wire::beacon::{DeviceType, TxIdFormat};
use sid_wire::crypt_mask;

/// Default beacon payload rotation period
pub const DEFAULT_ADV_ROTATION_TIMEOUT: Duration = Duration::from_secs(900);

/// Default connection inactivity timeout
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ATT MTU
pub const DEFAULT_MTU: usize = 247;

/// Link interface configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Application id carried in the beacon
    pub application_id: u8,
    /// Advertiser kind carried in the beacon
    pub device_type: DeviceType,
    /// Which transmit counter advances per message
    pub tx_id_format: TxIdFormat,
    /// Crypt mask used when a message does not name one
    pub default_crypt_mask: u8,
    /// Beacon payload rotation period
    pub adv_rotation_timeout: Duration,
    /// Advertising interval right after advertising starts
    pub fast_adv_interval: Duration,
    /// How long the fast interval is kept
    pub fast_adv_timeout: Duration,
    /// Advertising interval after the fast window
    pub slow_adv_interval: Duration,
    /// Connection inactivity timeout
    pub inactivity_timeout: Duration,
    /// Keep idle connections open
    pub disable_inactivity_timer: bool,
    /// Largest PDU handed to the radio
    pub mtu: usize,
    /// Pool priority of outbound messages
    pub tx_priority: Priority,
    /// Pool priority of queued inbound messages
    pub rx_priority: Priority,
    /// Accepted clock skew for time-based crypt masks
    pub time_window: Duration,
    /// Inbound messages kept for the application before new ones are dropped
    pub rx_queue_depth: usize,
    /// Leading payload bytes left clear by handles using an application offset
    pub app_offset: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            application_id: 0x01,
            device_type: DeviceType::Endpoint,
            tx_id_format: TxIdFormat::TimeSync,
            default_crypt_mask: crypt_mask::NW_WAN_CNT_AUTH,
            adv_rotation_timeout: DEFAULT_ADV_ROTATION_TIMEOUT,
            fast_adv_interval: Duration::from_millis(160),
            fast_adv_timeout: Duration::from_secs(30),
            slow_adv_interval: Duration::from_millis(1000),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            disable_inactivity_timer: false,
            mtu: DEFAULT_MTU,
            tx_priority: Priority::Normal,
            rx_priority: Priority::Low,
            time_window: Duration::from_secs(60),
            rx_queue_depth: 8,
            app_offset: 0,
        }
    }
}

impl LinkConfig {
    /// Set the transmit id format
    pub fn with_tx_id_format(mut self, format: TxIdFormat) -> Self {
        self.tx_id_format = format;
        self
    }

    /// Set the inactivity timeout
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Set the default crypt mask
    pub fn with_default_crypt_mask(mut self, mask: u8) -> Self {
        self.default_crypt_mask = mask;
        self
    }
}
