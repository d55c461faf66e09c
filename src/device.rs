//! Sub-device entity and registry.
//!
//! Devices are sensors and actuators living behind a gateway. They appear on
//! first sighting (enumeration or an unsolicited report) and are refreshed by
//! every later report, heartbeat and acknowledgement.

use crate::index::DeviceMap;
use crate::protocol::Envelope;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Human-readable names for the known Lumi device models.
/// Unrecognized models keep working, they just have no display name.
pub fn name_for_model(model: &str) -> Option<&'static str> {
    match model {
        "gateway" => Some("Gateway"),
        "magnet" => Some("Door/Window Sensor"),
        "sensor_magnet.aq2" => Some("Door/Window Sensor"),
        "motion" => Some("Motion Sensor"),
        "sensor_motion.aq2" => Some("Motion Sensor"),
        "switch" => Some("Wireless Switch"),
        "sensor_switch.aq2" => Some("Wireless Switch"),
        "sensor_ht" => Some("Temperature/Humidity Sensor"),
        "weather.v1" => Some("Temperature/Humidity/Pressure Sensor"),
        "plug" => Some("Smart Plug"),
        "86plug" => Some("Wall Plug"),
        "86sw1" => Some("Single-Button Wall Switch"),
        "86sw2" => Some("Dual-Button Wall Switch"),
        "ctrl_neutral1" => Some("Single-Gang Wired Switch"),
        "ctrl_neutral2" => Some("Dual-Gang Wired Switch"),
        "cube" => Some("Magic Cube"),
        "smoke" => Some("Smoke Detector"),
        "natgas" => Some("Gas Detector"),
        "curtain" => Some("Curtain Controller"),
        "vibration" => Some("Vibration Sensor"),
        "sensor_wleak.aq1" => Some("Water Leak Sensor"),
        _ => None,
    }
}

/// A known sub-device.
#[derive(Debug, Clone)]
pub struct Device {
    /// Stable identifier, never changes after creation.
    pub sid: String,
    /// Device type tag; determines the semantics of `data`.
    pub model: Option<String>,
    /// Mesh-local short address.
    pub short_id: Option<u32>,
    /// Current attribute map, semantics defined by `model`.
    pub data: Map<String, Value>,
    /// Display name derived from `model`, recomputed on every update.
    pub name: Option<String>,
}

impl Device {
    pub fn new(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            model: None,
            short_id: None,
            data: Map::new(),
            name: None,
        }
    }

    /// Apply a partial update. Only model, short_id and data are mergeable;
    /// the sid is immutable and unknown keys are dropped.
    pub fn merge(&mut self, update: &DeviceUpdate) {
        if let Some(model) = &update.model {
            self.model = Some(model.clone());
        }
        if let Some(short_id) = update.short_id {
            self.short_id = Some(short_id);
        }
        if let Some(data) = &update.data {
            self.data = data.clone();
        }
        self.name = self
            .model
            .as_deref()
            .and_then(name_for_model)
            .map(str::to_string);
    }
}

/// Allow-listed partial record for [`Device::merge`].
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub model: Option<String>,
    pub short_id: Option<u32>,
    pub data: Option<Map<String, Value>>,
}

impl From<&Envelope> for DeviceUpdate {
    fn from(envelope: &Envelope) -> Self {
        Self {
            model: envelope.model.clone(),
            short_id: envelope.short_id,
            data: match &envelope.data {
                Some(Value::Object(map)) => Some(map.clone()),
                _ => None,
            },
        }
    }
}

/// Owns all known sub-devices, keyed by sid.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device if its sid is new; existing entries are left alone.
    pub fn add(&mut self, device: Device) {
        self.devices.entry(device.sid.clone()).or_insert(device);
    }

    /// Create-or-partially-update by sid. The display name is looked up from
    /// the model table every time, so renamed models never go stale.
    pub fn upsert(&mut self, sid: &str, update: &DeviceUpdate) {
        self.devices
            .entry(sid.to_string())
            .or_insert_with(|| Device::new(sid))
            .merge(update);
    }

    pub fn remove(&mut self, sid: &str) {
        self.devices.remove(sid);
    }

    pub fn get(&self, sid: &str) -> Option<&Device> {
        self.devices.get(sid)
    }

    pub fn get_mut(&mut self, sid: &str) -> Option<&mut Device> {
        self.devices.get_mut(sid)
    }

    pub fn list(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    /// All devices of one model.
    pub fn by_model(&self, model: &str) -> Vec<Device> {
        self.devices
            .values()
            .filter(|d| d.model.as_deref() == Some(model))
            .cloned()
            .collect()
    }

    /// All devices owned by one gateway, resolved through the index.
    pub fn by_gateway(&self, index: &DeviceMap, gateway_sid: &str) -> Vec<Device> {
        index
            .device_sids(gateway_sid)
            .unwrap_or_default()
            .iter()
            .filter_map(|sid| self.devices.get(sid))
            .cloned()
            .collect()
    }

    /// Devices of one model behind one gateway.
    pub fn by_gateway_and_model(
        &self,
        index: &DeviceMap,
        gateway_sid: &str,
        model: &str,
    ) -> Vec<Device> {
        self.by_gateway(index, gateway_sid)
            .into_iter()
            .filter(|d| d.model.as_deref() == Some(model))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(model: &str, data: &[(&str, &str)]) -> DeviceUpdate {
        let mut map = Map::new();
        for (k, v) in data {
            map.insert(k.to_string(), Value::String(v.to_string()));
        }
        DeviceUpdate {
            model: Some(model.to_string()),
            short_id: None,
            data: Some(map),
        }
    }

    #[test]
    fn merge_replaces_present_fields_only() {
        let mut device = Device::new("D1");
        device.merge(&report("magnet", &[("status", "open")]));
        device.merge(&DeviceUpdate {
            short_id: Some(4343),
            ..Default::default()
        });

        assert_eq!(device.model.as_deref(), Some("magnet"));
        assert_eq!(device.short_id, Some(4343));
        assert_eq!(device.data["status"], "open");
        assert_eq!(device.sid, "D1");
    }

    #[test]
    fn merge_recomputes_display_name() {
        let mut device = Device::new("D1");
        device.merge(&report("magnet", &[]));
        assert_eq!(device.name.as_deref(), Some("Door/Window Sensor"));
        device.merge(&report("some_future_model", &[]));
        assert_eq!(device.name, None);
    }

    #[test]
    fn upsert_creates_on_first_sighting() {
        let mut registry = DeviceRegistry::new();
        registry.upsert("D1", &report("motion", &[("status", "motion")]));
        let device = registry.get("D1").unwrap();
        assert_eq!(device.model.as_deref(), Some("motion"));
        assert_eq!(device.name.as_deref(), Some("Motion Sensor"));
    }

    #[test]
    fn model_queries() {
        let mut registry = DeviceRegistry::new();
        registry.upsert("D1", &report("magnet", &[]));
        registry.upsert("D2", &report("magnet", &[]));
        registry.upsert("D3", &report("plug", &[]));

        assert_eq!(registry.by_model("magnet").len(), 2);
        assert_eq!(registry.by_model("plug").len(), 1);
        assert!(registry.by_model("cube").is_empty());
    }

    #[test]
    fn gateway_queries_resolve_through_index() {
        let mut registry = DeviceRegistry::new();
        registry.upsert("D1", &report("magnet", &[]));
        registry.upsert("D2", &report("plug", &[]));
        registry.upsert("D3", &report("plug", &[]));

        let mut index = DeviceMap::new();
        index.set_membership("G1", &["D1".to_string(), "D2".to_string()]);
        index.set_membership("G2", &["D3".to_string()]);

        assert_eq!(registry.by_gateway(&index, "G1").len(), 2);
        assert_eq!(registry.by_gateway_and_model(&index, "G1", "plug").len(), 1);
        assert!(registry.by_gateway_and_model(&index, "G1", "cube").is_empty());
        assert!(registry.by_gateway(&index, "G9").is_empty());
    }

    #[test]
    fn gateway_query_skips_unregistered_sids() {
        let registry = DeviceRegistry::new();
        let mut index = DeviceMap::new();
        index.set_membership("G1", &["ghost".to_string()]);
        assert!(registry.by_gateway(&index, "G1").is_empty());
    }
}
