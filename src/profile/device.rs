//! Device profiles: aggregated per-MAC traffic statistics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::decode::DecodedPacket;
use crate::resolvers::Resolvers;
use crate::types::{DeviceProfile, IpStats, Record};

/// In-memory device profile store keyed by source MAC address.
pub struct DeviceProfileStore {
    items: Mutex<HashMap<String, DeviceProfile>>,
    resolvers: Arc<Resolvers>,
}

impl DeviceProfileStore {
    pub fn new(resolvers: Arc<Resolvers>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            resolvers,
        }
    }

    /// Number of profiles currently held.
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Update the sender's profile with one decoded packet: the source IP
    /// joins the device's own IPs, the destination IP its contacts, and
    /// both sides get per-protocol and per-port counters bumped.
    pub fn update(&self, packet: &DecodedPacket, ts: &str, wire_len: u64) {
        if packet.src_mac.is_empty() || packet.src_ip.is_empty() {
            return;
        }

        let mut items = self.items.lock();
        let profile = items
            .entry(packet.src_mac.clone())
            .or_insert_with(|| DeviceProfile {
                timestamp: ts.to_string(),
                mac_addr: packet.src_mac.clone(),
                device_manufacturer: self.resolvers.lookup_manufacturer(&packet.src_mac),
                timestamp_first: ts.to_string(),
                ..Default::default()
            });

        profile.num_packets += 1;
        profile.bytes += wire_len;
        profile.timestamp_last = ts.to_string();

        update_ip_stats(
            &mut profile.device_ips,
            &packet.src_ip,
            &packet.protocol,
            packet.dst_port,
            ts,
        );
        update_ip_stats(
            &mut profile.contacts,
            &packet.dst_ip,
            &packet.protocol,
            packet.dst_port,
            ts,
        );
    }

    /// Ident (`mac <manufacturer>`) of the profile a packet belongs to.
    pub fn ident_for(&self, src_mac: &str) -> Option<String> {
        self.items.lock().get(src_mac).map(|p| p.ident())
    }

    /// Snapshot all profiles as audit records for a periodic flush.
    pub fn snapshot(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .items
            .lock()
            .values()
            .cloned()
            .map(Record::DeviceProfile)
            .collect();
        records.sort_by(|a, b| match (a, b) {
            (Record::DeviceProfile(x), Record::DeviceProfile(y)) => x.mac_addr.cmp(&y.mac_addr),
            _ => std::cmp::Ordering::Equal,
        });
        records
    }
}

fn update_ip_stats(
    list: &mut Vec<IpStats>,
    addr: &str,
    protocol: &str,
    dst_port: u16,
    ts: &str,
) {
    if addr.is_empty() {
        return;
    }

    let stats = match list.iter_mut().find(|s| s.addr == addr) {
        Some(s) => s,
        None => {
            list.push(IpStats {
                addr: addr.to_string(),
                timestamp_first: ts.to_string(),
                ..Default::default()
            });
            list.last_mut().expect("just pushed")
        }
    };

    stats.num_packets += 1;
    stats.timestamp_last = ts.to_string();
    if !protocol.is_empty() {
        *stats.protocols.entry(protocol.to_string()).or_insert(0) += 1;
    }
    if dst_port != 0 {
        *stats.ports.entry(dst_port.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(src_mac: &str, src_ip: &str, dst_ip: &str, proto: &str, dst_port: u16) -> DecodedPacket {
        DecodedPacket {
            src_mac: src_mac.into(),
            src_ip: src_ip.into(),
            dst_ip: dst_ip.into(),
            protocol: proto.into(),
            dst_port,
            ..Default::default()
        }
    }

    #[test]
    fn test_profile_aggregation() {
        let store = DeviceProfileStore::new(Arc::new(Resolvers::embedded()));

        store.update(
            &packet("00:0c:29:aa:bb:cc", "10.0.0.5", "93.184.216.34", "TCP", 443),
            "1.000000",
            100,
        );
        store.update(
            &packet("00:0c:29:aa:bb:cc", "10.0.0.5", "93.184.216.34", "TCP", 443),
            "2.000000",
            200,
        );
        store.update(
            &packet("00:0c:29:aa:bb:cc", "10.0.0.5", "8.8.8.8", "UDP", 53),
            "3.000000",
            60,
        );

        assert_eq!(store.size(), 1);
        let records = store.snapshot();
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::DeviceProfile(p) => {
                assert_eq!(p.num_packets, 3);
                assert_eq!(p.bytes, 360);
                assert_eq!(p.device_manufacturer, "VMware");
                assert_eq!(p.device_ips.len(), 1);
                assert_eq!(p.contacts.len(), 2);
                assert_eq!(p.timestamp_first, "1.000000");
                assert_eq!(p.timestamp_last, "3.000000");

                let contact = p.contacts.iter().find(|c| c.addr == "93.184.216.34").unwrap();
                assert_eq!(contact.num_packets, 2);
                assert_eq!(contact.protocols.get("TCP"), Some(&2));
                assert_eq!(contact.ports.get("443"), Some(&2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_profiles_keyed_by_mac() {
        let store = DeviceProfileStore::new(Arc::new(Resolvers::embedded()));
        store.update(&packet("aa:aa:aa:00:00:01", "10.0.0.1", "10.0.0.2", "TCP", 80), "1.0", 10);
        store.update(&packet("aa:aa:aa:00:00:02", "10.0.0.2", "10.0.0.1", "TCP", 80), "1.0", 10);
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn test_ident_includes_manufacturer() {
        let store = DeviceProfileStore::new(Arc::new(Resolvers::embedded()));
        store.update(&packet("00:0c:29:11:22:33", "10.0.0.1", "10.0.0.2", "TCP", 80), "1.0", 10);
        assert_eq!(
            store.ident_for("00:0c:29:11:22:33").unwrap(),
            "00:0c:29:11:22:33 <VMware>"
        );
    }
}
