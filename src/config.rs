//! Engine configuration and protocol constants.
//! Gateways with their shared secrets are seeded here before the socket opens.

use crate::error::{AqaraError, Result};
use serde::{Deserialize, Serialize};

/// Multicast group the gateways listen on for discovery broadcasts.
pub const MULTICAST_ADDRESS: &str = "224.0.0.50";
/// Port of the discovery multicast group.
pub const MULTICAST_PORT: u16 = 4321;
/// Port the engine binds for inbound unicast/multicast traffic.
pub const SERVER_PORT: u16 = 9898;

/// Default initialization vector for the write-key cipher.
/// Published by the vendor, shared by all gateways unless overridden.
pub const DEFAULT_IV: [u8; 16] = [
    0x17, 0x99, 0x6d, 0x09, 0x3d, 0x28, 0xdd, 0xb3, 0xba, 0x69, 0x5a, 0x2e, 0x6f, 0x58, 0x56, 0x2e,
];

/// Per-gateway credentials known ahead of discovery.
///
/// The password is the 16-character "LAN communication key" from the vendor app.
/// The IV is a hex string and only needs to be set for gateways with non-standard
/// firmware; everything else uses [`DEFAULT_IV`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub sid: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

impl GatewayConfig {
    pub fn new(sid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            password: password.into(),
            iv: None,
        }
    }

    /// Decode the configured IV, falling back to [`DEFAULT_IV`].
    pub fn iv_bytes(&self) -> Result<[u8; 16]> {
        match &self.iv {
            None => Ok(DEFAULT_IV),
            Some(s) => {
                let bytes = hex::decode(s)
                    .map_err(|e| AqaraError::InvalidKeyMaterial(format!("bad iv hex: {}", e)))?;
                bytes.try_into().map_err(|_| {
                    AqaraError::InvalidKeyMaterial("iv must be 16 bytes".to_string())
                })
            }
        }
    }
}

/// Configuration for [`crate::AqaraClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Multicast group used for discovery broadcasts.
    pub multicast_address: String,
    /// Port of the multicast group.
    pub multicast_port: u16,
    /// Local port to bind for inbound traffic.
    pub server_port: u16,
    /// Local interface address for the multicast membership.
    /// Only needed on multi-homed hosts; empty means "let the OS pick".
    #[serde(default)]
    pub bind_address: String,
    /// Gateways known at startup, with their write passwords.
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multicast_address: MULTICAST_ADDRESS.to_string(),
            multicast_port: MULTICAST_PORT,
            server_port: SERVER_PORT,
            bind_address: String::new(),
            gateways: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a gateway credential entry.
    pub fn with_gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateways.push(gateway);
        self
    }

    /// Override the local bind interface.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }
}
