//! Network-layer decoders.

use std::net::Ipv6Addr;

use etherparse::{Icmpv4Slice, Icmpv4Type, Icmpv6Slice, Ipv4Slice, Ipv6Slice};

use crate::types::{
    IPv4, IPv6, IPv6HopByHop, Icmpv4, Icmpv6, Icmpv6NeighborAdvertisement,
    Icmpv6NeighborSolicitation, Icmpv6RouterAdvertisement, Ospfv2, Ospfv3, Record, Vrrpv2,
};
use crate::utils::entropy;

/// Decode an IPv4 header from an etherparse slice.
pub fn decode_ipv4(ip: &Ipv4Slice, ts: &str) -> Option<Record> {
    let header = ip.header();
    let payload = ip.payload().payload;

    Some(
        IPv4 {
            timestamp: ts.to_string(),
            version: 4,
            ihl: header.ihl() as u32,
            tos: ((header.dcp().value() << 2) | header.ecn().value()) as u32,
            length: header.total_len() as u32,
            id: header.identification() as u32,
            flags: ((header.dont_fragment() as u32) << 1) | (header.more_fragments() as u32),
            frag_offset: header.fragments_offset().value() as u32,
            ttl: header.ttl() as u32,
            protocol: header.protocol().0 as u32,
            checksum: header.header_checksum() as u32,
            src_ip: header.source_addr().to_string(),
            dst_ip: header.destination_addr().to_string(),
            payload_entropy: entropy(payload),
            payload_size: payload.len() as u32,
            context: None,
        }
        .into(),
    )
}

/// Decode an IPv6 header from an etherparse slice.
pub fn decode_ipv6(ip: &Ipv6Slice, ts: &str) -> Option<Record> {
    let header = ip.header();
    let payload = ip.payload().payload;

    Some(
        IPv6 {
            timestamp: ts.to_string(),
            version: 6,
            traffic_class: header.traffic_class() as u32,
            flow_label: header.flow_label().value(),
            length: header.payload_length() as u32,
            next_header: header.next_header().0 as u32,
            hop_limit: header.hop_limit() as u32,
            src_ip: header.source_addr().to_string(),
            dst_ip: header.destination_addr().to_string(),
            payload_entropy: entropy(payload),
            payload_size: payload.len() as u32,
            context: None,
        }
        .into(),
    )
}

/// Decode an IPv6 hop-by-hop extension header (`data` starts at the
/// extension, i.e. 40 bytes into the IPv6 packet).
pub fn decode_ipv6_hop_by_hop(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 2 {
        return None;
    }

    let ext_len = (data[1] as usize + 1) * 8;
    if data.len() < ext_len {
        return None;
    }

    let mut options = Vec::new();
    let mut off = 2;
    while off < ext_len {
        let opt_type = data[off];
        options.push(opt_type as u32);
        if opt_type == 0 {
            // Pad1 has no length byte
            off += 1;
            continue;
        }
        if off + 1 >= ext_len {
            break;
        }
        off += 2 + data[off + 1] as usize;
    }

    Some(
        IPv6HopByHop {
            timestamp: ts.to_string(),
            options,
            context: None,
        }
        .into(),
    )
}

/// Decode an ICMPv4 message.
pub fn decode_icmpv4(icmp: &Icmpv4Slice, ts: &str) -> Option<Record> {
    let (id, seq) = match icmp.icmp_type() {
        Icmpv4Type::EchoRequest(echo) | Icmpv4Type::EchoReply(echo) => {
            (echo.id as u32, echo.seq as u32)
        }
        _ => (0, 0),
    };

    Some(
        Icmpv4 {
            timestamp: ts.to_string(),
            type_code: ((icmp.type_u8() as u32) << 8) | icmp.code_u8() as u32,
            checksum: icmp.checksum() as u32,
            id,
            seq,
            context: None,
        }
        .into(),
    )
}

/// Decode an ICMPv6 message. NDP messages additionally produce their own
/// typed record, returned second.
pub fn decode_icmpv6(icmp: &Icmpv6Slice, ts: &str) -> (Option<Record>, Option<Record>) {
    let base = Icmpv6 {
        timestamp: ts.to_string(),
        type_code: ((icmp.type_u8() as u32) << 8) | icmp.code_u8() as u32,
        checksum: icmp.checksum() as u32,
        context: None,
    };

    let ndp = match icmp.type_u8() {
        133..=136 => decode_ndp(icmp.type_u8(), icmp.payload(), ts),
        _ => None,
    };

    (Some(base.into()), ndp)
}

// NDP message bodies start after the 4-byte ICMPv6 header; `data` here is
// the ICMPv6 payload (message body without type/code/checksum).
fn decode_ndp(icmp_type: u8, data: &[u8], ts: &str) -> Option<Record> {
    match icmp_type {
        // router advertisement
        134 => {
            if data.len() < 12 {
                return None;
            }
            Some(
                Icmpv6RouterAdvertisement {
                    timestamp: ts.to_string(),
                    hop_limit: data[0] as u32,
                    flags: data[1] as u32,
                    router_lifetime: u16::from_be_bytes([data[2], data[3]]) as u32,
                    reachable_time: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                    retrans_timer: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                    options: ndp_options(&data[12..]),
                }
                .into(),
            )
        }
        // neighbor solicitation
        135 => {
            if data.len() < 20 {
                return None;
            }
            Some(
                Icmpv6NeighborSolicitation {
                    timestamp: ts.to_string(),
                    target_address: ipv6_from(&data[4..20]).to_string(),
                    options: ndp_options(&data[20..]),
                }
                .into(),
            )
        }
        // neighbor advertisement
        136 => {
            if data.len() < 20 {
                return None;
            }
            Some(
                Icmpv6NeighborAdvertisement {
                    timestamp: ts.to_string(),
                    flags: data[0] as u32,
                    target_address: ipv6_from(&data[4..20]).to_string(),
                    options: ndp_options(&data[20..]),
                }
                .into(),
            )
        }
        _ => None,
    }
}

fn ipv6_from(bytes: &[u8]) -> Ipv6Addr {
    let mut arr = [0u8; 16];
    arr.copy_from_slice(bytes);
    Ipv6Addr::from(arr)
}

// NDP options are (type, length-in-8-byte-units) pairs.
fn ndp_options(mut data: &[u8]) -> Vec<u32> {
    let mut options = Vec::new();
    while data.len() >= 2 {
        let len = data[1] as usize * 8;
        if len == 0 || len > data.len() {
            break;
        }
        options.push(data[0] as u32);
        data = &data[len..];
    }
    options
}

/// Decode an OSPF packet (IP protocol 89); the version field selects the
/// v2 or v3 record.
pub fn decode_ospf(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 16 {
        return None;
    }

    let version = data[0];
    match version {
        2 => {
            if data.len() < 24 {
                return None;
            }
            Some(
                Ospfv2 {
                    timestamp: ts.to_string(),
                    version: 2,
                    ospf_type: data[1] as u32,
                    packet_length: u16::from_be_bytes([data[2], data[3]]) as u32,
                    router_id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                    area_id: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                    checksum: u16::from_be_bytes([data[12], data[13]]) as u32,
                    au_type: u16::from_be_bytes([data[14], data[15]]) as u32,
                }
                .into(),
            )
        }
        3 => Some(
            Ospfv3 {
                timestamp: ts.to_string(),
                version: 3,
                ospf_type: data[1] as u32,
                packet_length: u16::from_be_bytes([data[2], data[3]]) as u32,
                router_id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                area_id: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                checksum: u16::from_be_bytes([data[12], data[13]]) as u32,
                instance: data[14] as u32,
            }
            .into(),
        ),
        _ => None,
    }
}

/// Decode a VRRP version 2 advertisement (IP protocol 112).
pub fn decode_vrrpv2(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 8 {
        return None;
    }

    let version = (data[0] >> 4) as u32;
    if version != 2 {
        return None;
    }

    let count = data[3] as usize;
    if data.len() < 8 + count * 4 {
        return None;
    }

    let ip_addresses = (0..count)
        .map(|i| {
            let b = &data[8 + i * 4..12 + i * 4];
            format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
        })
        .collect();

    Some(
        Vrrpv2 {
            timestamp: ts.to_string(),
            version,
            vrrp_type: (data[0] & 0x0f) as u32,
            virtual_rtr_id: data[1] as u32,
            priority: data[2] as u32,
            count_ip_addr: count as u32,
            auth_type: data[4] as u32,
            adver_int: data[5] as u32,
            checksum: u16::from_be_bytes([data[6], data[7]]) as u32,
            ip_addresses,
        }
        .into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "1580806571.988737";

    #[test]
    fn test_decode_vrrpv2() {
        let pkt = [
            0x21, // version 2, type 1 (advertisement)
            5,    // vrid
            100,  // priority
            1,    // count
            0, 1, // auth type, adver int
            0xab, 0xcd, // checksum
            192, 168, 1, 1,
        ];
        match decode_vrrpv2(&pkt, TS) {
            Some(Record::Vrrpv2(v)) => {
                assert_eq!(v.virtual_rtr_id, 5);
                assert_eq!(v.ip_addresses, vec!["192.168.1.1"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_ospfv2_header() {
        let mut pkt = vec![2u8, 1]; // version 2, hello
        pkt.extend_from_slice(&44u16.to_be_bytes());
        pkt.extend_from_slice(&0x01020304u32.to_be_bytes());
        pkt.extend_from_slice(&0u32.to_be_bytes());
        pkt.extend_from_slice(&[0, 0, 0, 0]); // checksum + autype
        pkt.extend_from_slice(&[0u8; 8]);

        match decode_ospf(&pkt, TS) {
            Some(Record::Ospfv2(o)) => {
                assert_eq!(o.router_id, 0x01020304);
                assert_eq!(o.ospf_type, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_hop_by_hop() {
        // next header TCP, length 0 (8 bytes total), PadN option
        let ext = [6u8, 0, 1, 4, 0, 0, 0, 0];
        match decode_ipv6_hop_by_hop(&ext, TS) {
            Some(Record::IPv6HopByHop(h)) => assert_eq!(h.options, vec![1]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
