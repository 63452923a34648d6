//! Link-layer decoders.
//!
//! These operate on the raw frame bytes; each returns `None` when the
//! layer is malformed or too short.

use crate::types::{
    Arp, CiscoDiscovery, Dot1Q, Eap, Eapol, Ethernet, Llc, Lldp, NortelDiscovery, Record, Snap,
};
use crate::utils::{entropy, mac_to_string};

/// Minimum Ethernet II header length.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Decode the Ethernet II header of a frame.
pub fn decode_ethernet(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < ETHERNET_HEADER_LEN {
        return None;
    }

    let payload = &data[ETHERNET_HEADER_LEN..];
    Some(
        Ethernet {
            timestamp: ts.to_string(),
            dst_mac: mac_to_string(&data[0..6]),
            src_mac: mac_to_string(&data[6..12]),
            ethernet_type: u16::from_be_bytes([data[12], data[13]]) as u32,
            payload_entropy: entropy(payload),
            payload_size: payload.len() as u32,
            context: None,
        }
        .into(),
    )
}

/// Decode an 802.1Q VLAN tag located at `data` (the 4 tag bytes).
pub fn decode_dot1q(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 4 {
        return None;
    }

    let tci = u16::from_be_bytes([data[0], data[1]]);
    Some(
        Dot1Q {
            timestamp: ts.to_string(),
            priority: (tci >> 13) as u32,
            drop_eligible: tci & 0x1000 != 0,
            vlan_identifier: (tci & 0x0fff) as u32,
            ethernet_type: u16::from_be_bytes([data[2], data[3]]) as u32,
        }
        .into(),
    )
}

/// Decode an ARP message (`data` starts after the link header).
pub fn decode_arp(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 8 {
        return None;
    }

    let hw_size = data[4] as usize;
    let proto_size = data[5] as usize;
    let needed = 8 + 2 * (hw_size + proto_size);
    if data.len() < needed || hw_size == 0 || proto_size == 0 {
        return None;
    }

    let mut off = 8;
    let src_hw = &data[off..off + hw_size];
    off += hw_size;
    let src_proto = &data[off..off + proto_size];
    off += proto_size;
    let dst_hw = &data[off..off + hw_size];
    off += hw_size;
    let dst_proto = &data[off..off + proto_size];

    let fmt_proto = |b: &[u8]| -> String {
        if b.len() == 4 {
            format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
        } else {
            mac_to_string(b)
        }
    };

    Some(
        Arp {
            timestamp: ts.to_string(),
            addr_type: u16::from_be_bytes([data[0], data[1]]) as u32,
            protocol: u16::from_be_bytes([data[2], data[3]]) as u32,
            hw_address_size: hw_size as u32,
            proto_address_size: proto_size as u32,
            operation: u16::from_be_bytes([data[6], data[7]]) as u32,
            src_hw_address: mac_to_string(src_hw),
            src_proto_address: fmt_proto(src_proto),
            dst_hw_address: mac_to_string(dst_hw),
            dst_proto_address: fmt_proto(dst_proto),
        }
        .into(),
    )
}

/// Decode an 802.2 LLC header.
pub fn decode_llc(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 3 {
        return None;
    }

    Some(
        Llc {
            timestamp: ts.to_string(),
            dsap: (data[0] & 0xfe) as u32,
            ig: data[0] & 0x01 != 0,
            ssap: (data[1] & 0xfe) as u32,
            cr: data[1] & 0x01 != 0,
            control: data[2] as u32,
        }
        .into(),
    )
}

/// Decode a SNAP header following an LLC header with SAP 0xaa.
pub fn decode_snap(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 5 {
        return None;
    }

    Some(
        Snap {
            timestamp: ts.to_string(),
            organizational_code: format!("{:02x}:{:02x}:{:02x}", data[0], data[1], data[2]),
            snap_type: u16::from_be_bytes([data[3], data[4]]) as u32,
        }
        .into(),
    )
}

/// Decode the three mandatory LLDP TLVs (chassis id, port id, TTL).
pub fn decode_lldp(data: &[u8], ts: &str) -> Option<Record> {
    let mut rec = Lldp {
        timestamp: ts.to_string(),
        ..Default::default()
    };

    let mut off = 0;
    let mut seen = 0;
    while off + 2 <= data.len() {
        let tl = u16::from_be_bytes([data[off], data[off + 1]]);
        let tlv_type = (tl >> 9) as u8;
        let tlv_len = (tl & 0x01ff) as usize;
        off += 2;
        if off + tlv_len > data.len() {
            return None;
        }
        let value = &data[off..off + tlv_len];
        off += tlv_len;

        match tlv_type {
            0 => break, // end of LLDPDU
            1 if !value.is_empty() => {
                rec.chassis_id_type = value[0] as u32;
                rec.chassis_id = tlv_id_string(value[0], &value[1..]);
                seen += 1;
            }
            2 if !value.is_empty() => {
                rec.port_id_type = value[0] as u32;
                rec.port_id = tlv_id_string(value[0], &value[1..]);
                seen += 1;
            }
            3 if value.len() >= 2 => {
                rec.ttl = u16::from_be_bytes([value[0], value[1]]) as u32;
                seen += 1;
            }
            _ => {}
        }
    }

    if seen == 0 {
        return None;
    }
    Some(rec.into())
}

// LLDP subtype 4 is a MAC address, everything else is rendered as text.
fn tlv_id_string(subtype: u8, value: &[u8]) -> String {
    if subtype == 4 && value.len() == 6 {
        mac_to_string(value)
    } else {
        String::from_utf8_lossy(value).to_string()
    }
}

/// Decode a Cisco discovery protocol announcement (payload after the
/// LLC/SNAP headers).
pub fn decode_cisco_discovery(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 4 {
        return None;
    }

    let mut rec = CiscoDiscovery {
        timestamp: ts.to_string(),
        version: data[0] as u32,
        ttl: data[1] as u32,
        checksum: u16::from_be_bytes([data[2], data[3]]) as u32,
        ..Default::default()
    };

    let mut off = 4;
    while off + 4 <= data.len() {
        let tlv_type = u16::from_be_bytes([data[off], data[off + 1]]);
        let tlv_len = u16::from_be_bytes([data[off + 2], data[off + 3]]) as usize;
        if tlv_len < 4 || off + tlv_len > data.len() {
            break;
        }
        let value = &data[off + 4..off + tlv_len];
        off += tlv_len;

        rec.values.push(tlv_type as u32);
        match tlv_type {
            0x0001 => rec.device_id = String::from_utf8_lossy(value).to_string(),
            0x0003 => rec.port_id = String::from_utf8_lossy(value).to_string(),
            0x0006 => rec.platform = String::from_utf8_lossy(value).to_string(),
            _ => {}
        }
    }

    Some(rec.into())
}

/// Decode a Nortel discovery protocol frame.
pub fn decode_nortel_discovery(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 11 {
        return None;
    }

    Some(
        NortelDiscovery {
            timestamp: ts.to_string(),
            ip_address: format!("{}.{}.{}.{}", data[0], data[1], data[2], data[3]),
            segment_id: format!("{:02x}{:02x}{:02x}", data[4], data[5], data[6]),
            chassis: data[7] as u32,
            backplane: data[8] as u32,
            state: data[9] as u32,
            num_links: data[10] as u32,
        }
        .into(),
    )
}

/// Decode an EAPOL header.
pub fn decode_eapol(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 4 {
        return None;
    }

    Some(
        Eapol {
            timestamp: ts.to_string(),
            version: data[0] as u32,
            eapol_type: data[1] as u32,
            length: u16::from_be_bytes([data[2], data[3]]) as u32,
        }
        .into(),
    )
}

/// Decode an EAP packet carried in an EAPOL frame of type 0.
pub fn decode_eap(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 4 {
        return None;
    }

    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if length < 4 || data.len() < length {
        return None;
    }

    let (eap_type, type_data) = if length > 4 {
        (data[4] as u32, data[5..length].to_vec())
    } else {
        (0, Vec::new())
    };

    Some(
        Eap {
            timestamp: ts.to_string(),
            code: data[0] as u32,
            id: data[1] as u32,
            length: length as u32,
            eap_type,
            type_data,
        }
        .into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Record;

    const TS: &str = "1580806571.988737";

    #[test]
    fn test_decode_ethernet() {
        let mut frame = vec![
            0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, // dst
            0xca, 0xfe, 0xba, 0xbe, 0x00, 0x02, // src
            0x08, 0x00, // IPv4
        ];
        frame.extend_from_slice(&[0u8; 20]);

        match decode_ethernet(&frame, TS) {
            Some(Record::Ethernet(e)) => {
                assert_eq!(e.src_mac, "ca:fe:ba:be:00:02");
                assert_eq!(e.dst_mac, "de:ad:be:ef:00:01");
                assert_eq!(e.ethernet_type, 0x0800);
                assert_eq!(e.payload_size, 20);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(decode_ethernet(&frame[..10], TS).is_none());
    }

    #[test]
    fn test_decode_arp_request() {
        let mut arp = vec![
            0x00, 0x01, // ethernet
            0x08, 0x00, // IPv4
            6, 4, // sizes
            0x00, 0x01, // request
        ];
        arp.extend_from_slice(&[0xaa; 6]);
        arp.extend_from_slice(&[192, 168, 1, 1]);
        arp.extend_from_slice(&[0x00; 6]);
        arp.extend_from_slice(&[192, 168, 1, 2]);

        match decode_arp(&arp, TS) {
            Some(Record::Arp(a)) => {
                assert_eq!(a.operation, 1);
                assert_eq!(a.src_proto_address, "192.168.1.1");
                assert_eq!(a.dst_proto_address, "192.168.1.2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_dot1q() {
        let tag = [0x60, 0x64, 0x08, 0x00];
        match decode_dot1q(&tag, TS) {
            Some(Record::Dot1Q(d)) => {
                assert_eq!(d.priority, 3);
                assert_eq!(d.vlan_identifier, 100);
                assert_eq!(d.ethernet_type, 0x0800);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_lldp_mandatory_tlvs() {
        // chassis id (mac), port id (ifname), ttl
        let mut frame = Vec::new();
        frame.extend_from_slice(&[(1 << 1), 7, 4, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        frame.extend_from_slice(&[(2 << 1), 5, 5]);
        frame.extend_from_slice(b"eth0");
        frame.extend_from_slice(&[(3 << 1), 2, 0, 120]);
        frame.extend_from_slice(&[0, 0]);

        match decode_lldp(&frame, TS) {
            Some(Record::Lldp(l)) => {
                assert_eq!(l.chassis_id, "de:ad:be:ef:00:01");
                assert_eq!(l.port_id, "eth0");
                assert_eq!(l.ttl, 120);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
