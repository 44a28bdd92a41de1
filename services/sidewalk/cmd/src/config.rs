//! Configuration handling for the Sidewalk link simulator.
//!
//! Values come from the `services.sidewalk.config` map of the shared YAML
//! config file, then from `SID_*` environment variables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sid_link::{LinkConfig, DEFAULT_ADV_ROTATION_TIMEOUT, DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_MTU};
use sid_resource::ResourceManagerConfig;
use sid_storage::StorageMode;
use sid_wire::{crypt_mask, TxIdFormat, KEY_SIZE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const CONFIG_PREFIX: &str = "services.sidewalk.";

/// Environment variables and the config keys they override
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SID_APPLICATION_ID", "application_id"),
    ("SID_DEVICE_ID", "device_id"),
    ("SID_GATEWAY_ID", "gateway_id"),
    ("SID_TX_ID_FORMAT", "tx_id_format"),
    ("SID_CRYPT_MASK", "default_crypt_mask"),
    ("SID_INACTIVITY_TIMEOUT", "inactivity_timeout"),
    ("SID_MTU", "mtu"),
    ("SID_STORAGE_MODE", "storage.mode"),
    ("SID_DATA_DIR", "storage.data_dir"),
];

/// Sidewalk simulator configuration
#[derive(Debug, Clone)]
pub struct SidewalkConfig {
    /// Application id advertised in the beacon
    pub application_id: u8,
    /// Raw address of the simulated end device
    pub device_id: Vec<u8>,
    /// Raw address of the simulated gateway
    pub gateway_id: Vec<u8>,
    /// Transmit id format
    pub tx_id_format: TxIdFormat,
    /// Crypt mask for messages that do not name one
    pub default_crypt_mask: u8,
    /// Beacon rotation period
    pub adv_rotation_timeout: Duration,
    /// Connection inactivity timeout
    pub inactivity_timeout: Duration,
    /// Keep idle connections open
    pub disable_inactivity_timer: bool,
    /// Largest PDU
    pub mtu: usize,
    /// Network key shared by both ends
    pub network_key: [u8; KEY_SIZE],
    /// Application key shared by both ends
    pub app_key: [u8; KEY_SIZE],
    /// Message pool geometry
    pub pool: ResourceManagerConfig,
    /// Persisted record backend
    pub storage: StorageMode,
}

impl Default for SidewalkConfig {
    fn default() -> Self {
        Self {
            application_id: 0x01,
            device_id: vec![0xA0, 0x00, 0x00, 0x10, 0x01],
            gateway_id: vec![0xB0, 0x00, 0x00, 0x20, 0x01],
            tx_id_format: TxIdFormat::TimeSync,
            default_crypt_mask: crypt_mask::NW_WAN_CNT_AUTH,
            adv_rotation_timeout: DEFAULT_ADV_ROTATION_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            disable_inactivity_timer: false,
            mtu: DEFAULT_MTU,
            network_key: [0x11; KEY_SIZE],
            app_key: [0x33; KEY_SIZE],
            pool: ResourceManagerConfig::default(),
            storage: StorageMode::InMemory,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    sidewalk: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl SidewalkConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing {:?}", config_path.as_ref()))?;
                config.apply_root_config(root)?;
                info!("Loaded configuration from {:?}", config_path.as_ref());
            }
            Err(_) => {
                warn!(
                    "Config file {:?} not found, using defaults",
                    config_path.as_ref()
                );
            }
        }

        config.apply_environment_overrides()?;

        info!(
            "Sidewalk configuration: app id {:#04x}, device {:02x?}, gateway {:02x?}, tx id {:?}, mask {:#04x}",
            config.application_id,
            config.device_id,
            config.gateway_id,
            config.tx_id_format,
            config.default_crypt_mask
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        let Some(values) = root
            .services
            .and_then(|services| services.sidewalk)
            .and_then(|service| service.config)
        else {
            return Ok(());
        };

        for (key, value) in values {
            match key.strip_prefix(CONFIG_PREFIX) {
                Some(name) => self.apply_value(name, &value)?,
                None => warn!("Ignoring configuration key {}", key),
            }
        }
        Ok(())
    }

    fn apply_environment_overrides(&mut self) -> Result<()> {
        for (var, name) in ENV_OVERRIDES {
            if let Ok(value) = std::env::var(var) {
                self.apply_value(name, &value)
                    .with_context(|| format!("environment variable {}", var))?;
                info!("{} overridden by environment: {}", name, value);
            }
        }
        Ok(())
    }

    /// Apply one `name = value` setting
    pub fn apply_value(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "application_id" => self.application_id = parse_u8(value)?,
            "device_id" => self.device_id = parse_address(value)?,
            "gateway_id" => self.gateway_id = parse_address(value)?,
            "tx_id_format" => self.tx_id_format = parse_tx_id_format(value)?,
            "default_crypt_mask" => {
                let mask = parse_u8(value)?;
                crypt_mask::lookup(mask)?;
                self.default_crypt_mask = mask;
            }
            "adv_rotation_timeout" => self.adv_rotation_timeout = humantime::parse_duration(value)?,
            "inactivity_timeout" => self.inactivity_timeout = humantime::parse_duration(value)?,
            "disable_inactivity_timer" => {
                self.disable_inactivity_timer = value.eq_ignore_ascii_case("true")
            }
            "mtu" => self.mtu = value.parse()?,
            "network_key" => self.network_key = parse_key(value)?,
            "app_key" => self.app_key = parse_key(value)?,
            "pool.block_count" => self.pool.block_count = value.parse()?,
            "pool.block_size" => self.pool.block_size = value.parse()?,
            "pool.offset" => self.pool.offset = value.parse()?,
            "pool.high_priority_reserve" => self.pool.high_priority_reserve = value.parse()?,
            "storage.mode" => {
                self.storage = match value {
                    "memory" => StorageMode::InMemory,
                    "file" => StorageMode::File {
                        data_dir: self.data_dir().unwrap_or_else(|| PathBuf::from("./sidewalkdata")),
                        fsync: true,
                    },
                    other => bail!("unknown storage mode {}", other),
                }
            }
            "storage.data_dir" => {
                self.storage = StorageMode::File {
                    data_dir: PathBuf::from(value),
                    fsync: true,
                }
            }
            _ => warn!("Ignoring unknown setting {}", name),
        }
        Ok(())
    }

    fn data_dir(&self) -> Option<PathBuf> {
        match &self.storage {
            StorageMode::File { data_dir, .. } => Some(data_dir.clone()),
            StorageMode::InMemory => None,
        }
    }

    /// Link interface configuration for one end of the simulated link
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            application_id: self.application_id,
            tx_id_format: self.tx_id_format,
            default_crypt_mask: self.default_crypt_mask,
            adv_rotation_timeout: self.adv_rotation_timeout,
            inactivity_timeout: self.inactivity_timeout,
            disable_inactivity_timer: self.disable_inactivity_timer,
            mtu: self.mtu,
            ..LinkConfig::default()
        }
    }
}

fn parse_u8(value: &str) -> Result<u8> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    Ok(parsed)
}

fn parse_hex(value: &str) -> Result<Vec<u8>> {
    let value = value.trim();
    if !value.is_ascii() || value.len() % 2 != 0 {
        bail!("invalid hex string {}", value);
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).context("invalid hex digit"))
        .collect()
}

fn parse_address(value: &str) -> Result<Vec<u8>> {
    let raw = parse_hex(value)?;
    if raw.is_empty() || raw.len() > sid_wire::ADDRESS_MAX_SIZE {
        bail!("address must be 1 to {} bytes", sid_wire::ADDRESS_MAX_SIZE);
    }
    Ok(raw)
}

fn parse_key(value: &str) -> Result<[u8; KEY_SIZE]> {
    let raw = parse_hex(value)?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| anyhow::anyhow!("key must be {} bytes, got {}", KEY_SIZE, raw.len()))
}

fn parse_tx_id_format(value: &str) -> Result<TxIdFormat> {
    match value {
        "time_sync" => Ok(TxIdFormat::TimeSync),
        "counter" => Ok(TxIdFormat::Counter),
        "smsn" => Ok(TxIdFormat::Smsn),
        other => bail!("unknown tx id format {}", other),
    }
}
