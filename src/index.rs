//! Bidirectional gateway↔device membership index.
//!
//! Enumeration responses report membership gateway-by-gateway, but later
//! reports and heartbeats arrive keyed only by device sid. The reverse map is
//! what lets the engine find which gateway a read or write must travel through.

use std::collections::{HashMap, HashSet};

/// Forward map gateway→devices plus the reverse device→gateway pointer.
///
/// Invariant: a device belongs to at most one gateway at any time. Recording a
/// device under a new gateway moves it, removing it from the previous owner's
/// set as well.
#[derive(Debug, Default)]
pub struct DeviceMap {
    forward: HashMap<String, HashSet<String>>,
    reverse: HashMap<String, String>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one membership, reassigning the device if it was owned elsewhere.
    pub fn add(&mut self, gateway_sid: &str, device_sid: &str) {
        if let Some(previous) = self.reverse.get(device_sid)
            && previous != gateway_sid
        {
            let previous = previous.clone();
            if let Some(devices) = self.forward.get_mut(&previous) {
                devices.remove(device_sid);
                if devices.is_empty() {
                    self.forward.remove(&previous);
                }
            }
        }
        self.forward
            .entry(gateway_sid.to_string())
            .or_default()
            .insert(device_sid.to_string());
        self.reverse
            .insert(device_sid.to_string(), gateway_sid.to_string());
    }

    /// Merge a batch of device sids into a gateway's set.
    pub fn set_membership(&mut self, gateway_sid: &str, device_sids: &[String]) {
        for sid in device_sids {
            self.add(gateway_sid, sid);
        }
    }

    /// Drop a gateway and every membership recorded under it.
    pub fn remove_gateway(&mut self, gateway_sid: &str) {
        if let Some(devices) = self.forward.remove(gateway_sid) {
            for sid in devices {
                self.reverse.remove(&sid);
            }
        }
    }

    /// Drop one device, pruning its gateway's set (and the gateway entry
    /// entirely if the set becomes empty).
    pub fn remove_device(&mut self, device_sid: &str) {
        let Some(gateway_sid) = self.reverse.remove(device_sid) else {
            return;
        };
        if let Some(devices) = self.forward.get_mut(&gateway_sid) {
            devices.remove(device_sid);
            if devices.is_empty() {
                self.forward.remove(&gateway_sid);
            }
        }
    }

    /// Device sids owned by a gateway, or None if the gateway is unknown.
    pub fn device_sids(&self, gateway_sid: &str) -> Option<Vec<String>> {
        self.forward
            .get(gateway_sid)
            .map(|set| set.iter().cloned().collect())
    }

    /// Owning gateway of a device, if any.
    pub fn gateway_for(&self, device_sid: &str) -> Option<&str> {
        self.reverse.get(device_sid).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_round_trip() {
        let mut map = DeviceMap::new();
        map.set_membership("G1", &["D1".to_string(), "D2".to_string()]);

        assert_eq!(map.gateway_for("D1"), Some("G1"));
        assert_eq!(map.gateway_for("D2"), Some("G1"));
        let mut sids = map.device_sids("G1").unwrap();
        sids.sort();
        assert_eq!(sids, vec!["D1", "D2"]);
        assert!(map.device_sids("G9").is_none());
    }

    #[test]
    fn reassignment_moves_device_and_prunes_old_owner() {
        let mut map = DeviceMap::new();
        map.set_membership("G1", &["D1".to_string()]);
        map.set_membership("G2", &["D1".to_string()]);

        assert_eq!(map.gateway_for("D1"), Some("G2"));
        // Old owner's set is pruned; being its only device, the entry goes too.
        assert!(map.device_sids("G1").is_none());
        assert_eq!(map.device_sids("G2").unwrap(), vec!["D1"]);
    }

    #[test]
    fn device_owned_by_one_gateway_at_a_time() {
        let mut map = DeviceMap::new();
        for gw in ["G1", "G2", "G3", "G1"] {
            map.set_membership(gw, &["D1".to_string()]);
        }
        assert_eq!(map.gateway_for("D1"), Some("G1"));
        let owners: Vec<_> = ["G1", "G2", "G3"]
            .iter()
            .filter(|gw| {
                map.device_sids(gw)
                    .is_some_and(|sids| sids.contains(&"D1".to_string()))
            })
            .collect();
        assert_eq!(owners.len(), 1);
    }

    #[test]
    fn set_membership_merges_into_existing_set() {
        let mut map = DeviceMap::new();
        map.set_membership("G1", &["D1".to_string()]);
        map.set_membership("G1", &["D2".to_string()]);
        assert_eq!(map.device_sids("G1").unwrap().len(), 2);
    }

    #[test]
    fn remove_gateway_clears_reverse_pointers() {
        let mut map = DeviceMap::new();
        map.set_membership("G1", &["D1".to_string(), "D2".to_string()]);
        map.remove_gateway("G1");
        assert_eq!(map.gateway_for("D1"), None);
        assert_eq!(map.gateway_for("D2"), None);
        assert!(map.device_sids("G1").is_none());
    }

    #[test]
    fn remove_device_prunes_empty_gateway_entry() {
        let mut map = DeviceMap::new();
        map.set_membership("G1", &["D1".to_string(), "D2".to_string()]);
        map.remove_device("D1");
        assert_eq!(map.device_sids("G1").unwrap(), vec!["D2"]);
        map.remove_device("D2");
        assert!(map.device_sids("G1").is_none());
        // Removing an unknown device is a no-op.
        map.remove_device("D9");
    }
}
