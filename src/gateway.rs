//! Gateway entity and registry.
//!
//! A gateway is the hub bridging the wireless sub-device mesh onto the IP
//! network. Its sid is fixed at creation; every other field is last-write-wins
//! and refreshed from inbound traffic (`iam`, heartbeats, reports).

use crate::config::DEFAULT_IV;
use crate::protocol::Envelope;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// A known gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    /// Stable identifier, never changes after creation.
    pub sid: String,
    /// Last reported unicast address.
    pub ip: Option<String>,
    /// Last reported unicast port.
    pub port: Option<u16>,
    /// Session token from the latest heartbeat; input to the write-key cipher.
    pub token: Option<String>,
    /// Shared secret ("LAN communication key") from configuration.
    pub password: Option<String>,
    /// Cipher initialization vector.
    pub iv: [u8; 16],
}

impl Gateway {
    pub fn new(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            ip: None,
            port: None,
            token: None,
            password: None,
            iv: DEFAULT_IV,
        }
    }

    /// Unicast address of this gateway, if it has announced one.
    pub fn addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ip.as_ref()?.parse().ok()?;
        Some(SocketAddr::new(ip, self.port?))
    }

    /// Apply a partial update. Only the allow-listed fields below can ever be
    /// touched; unknown message noise cannot inject new attributes and the sid
    /// is immutable.
    pub fn merge(&mut self, update: &GatewayUpdate) {
        if let Some(ip) = &update.ip {
            self.ip = Some(ip.clone());
        }
        if let Some(port) = update.port {
            self.port = Some(port);
        }
        if let Some(token) = &update.token {
            self.token = Some(token.clone());
        }
        if let Some(password) = &update.password {
            self.password = Some(password.clone());
        }
        if let Some(iv) = update.iv {
            self.iv = iv;
        }
    }
}

/// Allow-listed partial record for [`Gateway::merge`].
#[derive(Debug, Clone, Default)]
pub struct GatewayUpdate {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub token: Option<String>,
    pub password: Option<String>,
    pub iv: Option<[u8; 16]>,
}

impl From<&Envelope> for GatewayUpdate {
    /// Network-facing fields a gateway may report about itself. Credentials
    /// never travel on the wire, so password and iv stay untouched here.
    fn from(envelope: &Envelope) -> Self {
        Self {
            ip: envelope.ip.clone(),
            port: envelope.port,
            token: envelope.token.clone(),
            password: None,
            iv: None,
        }
    }
}

/// Owns all known gateways, keyed by sid.
#[derive(Debug, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<String, Gateway>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a gateway if its sid is new; existing entries are left alone.
    pub fn add(&mut self, gateway: Gateway) {
        self.gateways.entry(gateway.sid.clone()).or_insert(gateway);
    }

    /// Create-or-partially-update by sid.
    pub fn upsert(&mut self, sid: &str, update: &GatewayUpdate) {
        self.gateways
            .entry(sid.to_string())
            .or_insert_with(|| Gateway::new(sid))
            .merge(update);
    }

    /// Partially update an existing gateway; unknown sids are ignored.
    pub fn update(&mut self, sid: &str, update: &GatewayUpdate) {
        if let Some(gateway) = self.gateways.get_mut(sid) {
            gateway.merge(update);
        }
    }

    pub fn remove(&mut self, sid: &str) {
        self.gateways.remove(sid);
    }

    pub fn get(&self, sid: &str) -> Option<&Gateway> {
        self.gateways.get(sid)
    }

    pub fn list(&self) -> Vec<Gateway> {
        self.gateways.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}
