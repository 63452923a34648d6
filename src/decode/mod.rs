//! Per-packet layer decoding.
//!
//! [`PacketDecoder::decode`] walks one packet through all applicable layer
//! decoders and returns the typed records plus the metadata the collector
//! needs for reassembly and profiling. Layer decoders are pure functions:
//! parsed layer in, audit record or `None` out. Malformed layers bump the
//! per-tag error counter and the packet is reported to the caller so it
//! can be appended to `errors.pcap`.

pub mod app;
pub mod link;
pub mod network;
pub mod transport;

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::types::{PacketContext, Record};
use crate::utils::{mac_to_string, time_to_string};

/// Errors that fail the whole packet (written to `errors.pcap`).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated packet ({0} bytes)")]
    Truncated(usize),
}

/// Link layer of the capture source, selects the outermost decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Linux usbmon captures (mmapped URB headers).
    UsbLinuxMmapped,
}

/// Thread-safe string-keyed counters, used for per-layer stats and for
/// decode error tallies.
#[derive(Debug, Default)]
pub struct CounterMap {
    items: Mutex<HashMap<String, u64>>,
}

impl CounterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str) {
        let mut items = self.items.lock();
        *items.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.items.lock().get(name).copied().unwrap_or(0)
    }

    /// Sorted snapshot of all counters.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut v: Vec<_> = self
            .items
            .lock()
            .iter()
            .map(|(k, c)| (k.clone(), *c))
            .collect();
        v.sort();
        v
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// A TCP segment extracted for the reassembly engine.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack: bool,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl TcpSegment {
    /// Flow identifier oriented from this segment's sender.
    pub fn ident(&self) -> String {
        format!(
            "{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Everything derived from one packet.
#[derive(Debug, Default)]
pub struct DecodedPacket {
    pub records: Vec<Record>,
    /// Set when the packet carries a TCP segment to reassemble.
    pub tcp_segment: Option<TcpSegment>,
    pub src_mac: String,
    pub dst_mac: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    /// Name of the innermost decoded protocol, used by the profiling
    /// stores for per-protocol counters.
    pub protocol: String,
    /// True when the outermost layer is not implemented; the collector
    /// writes such packets to `unknown.pcap`.
    pub unknown_layer: bool,
    /// Error tags of layers that failed to decode in this packet; the
    /// collector appends such packets to `errors.pcap`.
    pub error_tags: Vec<String>,
}

impl DecodedPacket {
    /// Flow identifier of the packet, oriented from its sender.
    pub fn flow_ident(&self) -> String {
        if self.src_port != 0 || self.dst_port != 0 {
            format!(
                "{}:{}->{}:{}",
                self.src_ip, self.src_port, self.dst_ip, self.dst_port
            )
        } else {
            format!("{}->{}", self.src_ip, self.dst_ip)
        }
    }
}

/// Stateless per-packet decoder with shared counters.
pub struct PacketDecoder {
    include_payloads: bool,
    /// Per-layer record counts.
    pub stats: CounterMap,
    /// Per-tag decode error counts.
    pub errors: CounterMap,
}

impl PacketDecoder {
    pub fn new(include_payloads: bool) -> Self {
        Self {
            include_payloads,
            stats: CounterMap::new(),
            errors: CounterMap::new(),
        }
    }

    /// Decode one packet into audit records.
    pub fn decode(
        &self,
        data: &[u8],
        ts: DateTime<Utc>,
        link: LinkLayer,
    ) -> Result<DecodedPacket, DecodeError> {
        let ts_str = time_to_string(ts);
        let mut out = DecodedPacket::default();

        match link {
            LinkLayer::UsbLinuxMmapped => {
                match app::decode_usb(data, &ts_str) {
                    Some(rec) => {
                        self.stats.inc("USB");
                        out.protocol = "USB".into();
                        out.records.push(rec);
                    }
                    None => {
                        self.errors.inc("decode/usb");
                        return Err(DecodeError::Truncated(data.len()));
                    }
                }
                return Ok(out);
            }
            LinkLayer::Ethernet => {}
        }

        if data.len() < link::ETHERNET_HEADER_LEN {
            self.errors.inc("decode/ethernet");
            return Err(DecodeError::Truncated(data.len()));
        }

        out.dst_mac = mac_to_string(&data[0..6]);
        out.src_mac = mac_to_string(&data[6..12]);

        match link::decode_ethernet(data, &ts_str) {
            Some(rec) => {
                self.stats.inc("Ethernet");
                out.records.push(rec);
            }
            None => self.errors.inc("decode/ethernet"),
        }

        // walk VLAN tags manually so each produces its own record
        let mut ether_type = u16::from_be_bytes([data[12], data[13]]);
        let mut offset = link::ETHERNET_HEADER_LEN;
        while (ether_type == 0x8100 || ether_type == 0x88a8) && data.len() >= offset + 4 {
            match link::decode_dot1q(&data[offset..offset + 4], &ts_str) {
                Some(rec) => {
                    self.stats.inc("Dot1Q");
                    out.records.push(rec);
                }
                None => self.errors.inc("decode/dot1q"),
            }
            ether_type = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            offset += 4;
        }

        let payload = &data[offset..];

        match ether_type {
            0x0800 | 0x86dd => self.decode_ip(data, &ts_str, ts, &mut out),
            0x0806 => {
                out.protocol = "ARP".into();
                self.emit(&mut out, "ARP", "decode/arp", link::decode_arp(payload, &ts_str));
            }
            0x88cc => {
                out.protocol = "LLDP".into();
                self.emit(&mut out, "LLDP", "decode/lldp", link::decode_lldp(payload, &ts_str));
            }
            0x888e => {
                out.protocol = "EAPOL".into();
                self.emit(
                    &mut out,
                    "EAPOL",
                    "decode/eapol",
                    link::decode_eapol(payload, &ts_str),
                );
                // EAPOL type 0 carries an EAP packet
                if payload.len() > 4 && payload[1] == 0 {
                    self.emit(
                        &mut out,
                        "EAP",
                        "decode/eap",
                        link::decode_eap(&payload[4..], &ts_str),
                    );
                }
            }
            t if t as usize <= 1500 => self.decode_llc(payload, &ts_str, &mut out),
            _ => {
                trace!(ether_type, "unhandled ethertype");
                out.unknown_layer = true;
            }
        }

        Ok(out)
    }

    // 802.3 frames: LLC, optionally SNAP, then the discovery protocols.
    fn decode_llc(&self, payload: &[u8], ts: &str, out: &mut DecodedPacket) {
        out.protocol = "LLC".into();
        self.emit(out, "LLC", "decode/llc", link::decode_llc(payload, ts));

        if payload.len() >= 8 && payload[0] == 0xaa && payload[1] == 0xaa {
            let snap = &payload[3..];
            self.emit(out, "SNAP", "decode/snap", link::decode_snap(snap, ts));

            let org = &snap[0..3];
            let snap_type = u16::from_be_bytes([snap[3], snap[4]]);
            let inner = &snap[5..];

            if org == [0x00, 0x00, 0x0c] && snap_type == 0x2000 {
                out.protocol = "CiscoDiscovery".into();
                self.emit(
                    out,
                    "CiscoDiscovery",
                    "decode/ciscodiscovery",
                    link::decode_cisco_discovery(inner, ts),
                );
            } else if org == [0x00, 0x00, 0x81] {
                out.protocol = "NortelDiscovery".into();
                self.emit(
                    out,
                    "NortelDiscovery",
                    "decode/norteldiscovery",
                    link::decode_nortel_discovery(inner, ts),
                );
            }
        }
    }

    fn decode_ip(
        &self,
        frame: &[u8],
        ts_str: &str,
        ts: DateTime<Utc>,
        out: &mut DecodedPacket,
    ) {
        let sliced = match SlicedPacket::from_ethernet(frame) {
            Ok(s) => s,
            Err(e) => {
                self.errors.inc("decode/packet");
                trace!(error = %e, "packet slicing failed");
                return;
            }
        };

        let ip_protocol = match &sliced.net {
            Some(InternetSlice::Ipv4(ip)) => {
                out.src_ip = ip.header().source_addr().to_string();
                out.dst_ip = ip.header().destination_addr().to_string();
                out.protocol = "IPv4".into();
                self.emit(out, "IPv4", "decode/ipv4", network::decode_ipv4(ip, ts_str));
                ip.header().protocol().0
            }
            Some(InternetSlice::Ipv6(ip)) => {
                out.src_ip = ip.header().source_addr().to_string();
                out.dst_ip = ip.header().destination_addr().to_string();
                out.protocol = "IPv6".into();
                self.emit(out, "IPv6", "decode/ipv6", network::decode_ipv6(ip, ts_str));

                // hop-by-hop options sit directly after the fixed header
                if ip.header().next_header().0 == 0 {
                    if let Some(ext) = frame_ipv6_extension(frame, ip.header().slice().len()) {
                        self.emit(
                            out,
                            "IPv6HopByHop",
                            "decode/ipv6hopbyhop",
                            network::decode_ipv6_hop_by_hop(ext, ts_str),
                        );
                    }
                }
                ip.header().next_header().0
            }
            _ => {
                out.unknown_layer = true;
                return;
            }
        };

        match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                out.protocol = "TCP".into();
                out.src_port = tcp.source_port();
                out.dst_port = tcp.destination_port();

                let payload = tcp.payload();

                self.emit(
                    out,
                    "TCP",
                    "decode/tcp",
                    transport::decode_tcp(tcp, payload, ts_str, self.include_payloads),
                );

                out.tcp_segment = Some(TcpSegment {
                    src_ip: out.src_ip.parse().unwrap_or(IpAddr::from([0, 0, 0, 0])),
                    dst_ip: out.dst_ip.parse().unwrap_or(IpAddr::from([0, 0, 0, 0])),
                    src_port: tcp.source_port(),
                    dst_port: tcp.destination_port(),
                    seq: tcp.sequence_number(),
                    syn: tcp.syn(),
                    fin: tcp.fin(),
                    rst: tcp.rst(),
                    ack: tcp.ack(),
                    payload: payload.to_vec(),
                    timestamp: ts,
                });
            }
            Some(TransportSlice::Udp(udp)) => {
                out.protocol = "UDP".into();
                out.src_port = udp.source_port();
                out.dst_port = udp.destination_port();

                let payload = udp.payload();

                self.emit(
                    out,
                    "UDP",
                    "decode/udp",
                    transport::decode_udp(udp, payload, ts_str, self.include_payloads),
                );

                self.decode_udp_app(udp.source_port(), udp.destination_port(), payload, ts_str, out);
            }
            Some(TransportSlice::Icmpv4(icmp)) => {
                out.protocol = "ICMPv4".into();
                self.emit(
                    out,
                    "ICMPv4",
                    "decode/icmpv4",
                    network::decode_icmpv4(icmp, ts_str),
                );
            }
            Some(TransportSlice::Icmpv6(icmp)) => {
                out.protocol = "ICMPv6".into();
                let (base, ndp) = network::decode_icmpv6(icmp, ts_str);
                self.emit(out, "ICMPv6", "decode/icmpv6", base);
                if let Some(ndp) = ndp {
                    let name = ndp.record_type().name();
                    self.stats.inc(name);
                    out.records.push(ndp);
                }
            }
            _ => match ip_protocol {
                // OSPF
                89 => {
                    out.protocol = "OSPF".into();
                    let payload = sliced.ip_payload().map(|p| p.payload).unwrap_or(&[]);
                    self.emit(out, "OSPF", "decode/ospf", network::decode_ospf(payload, ts_str));
                }
                // VRRP
                112 => {
                    out.protocol = "VRRP".into();
                    let payload = sliced.ip_payload().map(|p| p.payload).unwrap_or(&[]);
                    self.emit(
                        out,
                        "VRRPv2",
                        "decode/vrrpv2",
                        network::decode_vrrpv2(payload, ts_str),
                    );
                }
                _ => {}
            },
        }

        self.attach_context(out);
    }

    // UDP application protocols are selected by well-known port.
    fn decode_udp_app(
        &self,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
        ts: &str,
        out: &mut DecodedPacket,
    ) {
        if payload.is_empty() {
            return;
        }
        let port = |p: u16| src_port == p || dst_port == p;

        if port(67) || port(68) {
            out.protocol = "DHCPv4".into();
            self.emit(out, "DHCPv4", "decode/dhcpv4", app::decode_dhcpv4(payload, ts));
        } else if port(546) || port(547) {
            out.protocol = "DHCPv6".into();
            self.emit(out, "DHCPv6", "decode/dhcpv6", app::decode_dhcpv6(payload, ts));
        } else if port(53) || port(5353) {
            out.protocol = "DNS".into();
            self.emit(out, "DNS", "decode/dns", app::decode_dns(payload, ts));
        } else if port(5060) {
            out.protocol = "SIP".into();
            self.emit(out, "SIP", "decode/sip", app::decode_sip(payload, ts));
        } else if port(3784) {
            out.protocol = "BFD".into();
            self.emit(out, "BFD", "decode/bfd", app::decode_bfd(payload, ts));
        } else if port(2222) || port(44818) {
            out.protocol = "CIP".into();
            self.emit(out, "CIP", "decode/cip", app::decode_cip(payload, ts));
        }
    }

    fn emit(&self, out: &mut DecodedPacket, layer: &str, error_tag: &str, record: Option<Record>) {
        match record {
            Some(rec) => {
                self.stats.inc(layer);
                out.records.push(rec);
            }
            None => {
                self.errors.inc(error_tag);
                out.error_tags.push(error_tag.to_string());
            }
        }
    }

    // Attach the cross-layer packet context: transport records get the
    // enclosing IPs, network records the enclosing ports.
    fn attach_context(&self, out: &mut DecodedPacket) {
        let ctx = PacketContext {
            src_ip: out.src_ip.clone(),
            dst_ip: out.dst_ip.clone(),
            src_port: out.src_port.to_string(),
            dst_port: out.dst_port.to_string(),
        };

        for rec in &mut out.records {
            match rec {
                Record::Tcp(r) => r.context = Some(ctx.clone()),
                Record::Udp(r) => r.context = Some(ctx.clone()),
                Record::IPv4(r) => r.context = Some(ctx.clone()),
                Record::IPv6(r) => r.context = Some(ctx.clone()),
                Record::IPv6HopByHop(r) => r.context = Some(ctx.clone()),
                Record::Icmpv4(r) => r.context = Some(ctx.clone()),
                Record::Icmpv6(r) => r.context = Some(ctx.clone()),
                Record::Dhcpv4(r) => r.context = Some(ctx.clone()),
                Record::Dhcpv6(r) => r.context = Some(ctx.clone()),
                Record::Dns(r) => r.context = Some(ctx.clone()),
                Record::Sip(r) => r.context = Some(ctx.clone()),
                Record::Bfd(r) => r.context = Some(ctx.clone()),
                Record::Cip(r) => r.context = Some(ctx.clone()),
                _ => {}
            }
        }
    }
}

// Slice out the IPv6 hop-by-hop extension from the raw frame; `ip_header_len`
// is the length of the fixed IPv6 header within the frame.
fn frame_ipv6_extension(frame: &[u8], ip_header_len: usize) -> Option<&[u8]> {
    // find the start of the IP header: skip ethernet + any VLAN tags
    let mut offset = link::ETHERNET_HEADER_LEN;
    let mut ether_type = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
    while ether_type == 0x8100 || ether_type == 0x88a8 {
        ether_type = u16::from_be_bytes([*frame.get(offset + 2)?, *frame.get(offset + 3)?]);
        offset += 4;
    }
    frame.get(offset + ip_header_len..)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn decode_one(decoder: &PacketDecoder, frame: &[u8]) -> DecodedPacket {
        decoder
            .decode(frame, Utc::now(), LinkLayer::Ethernet)
            .expect("decode failed")
    }

    #[test]
    fn test_decode_tcp_packet() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 1, 14], [172, 217, 6, 163], 64)
            .tcp(49209, 443, 1000, 65535);
        let mut frame = Vec::with_capacity(builder.size(15));
        builder.write(&mut frame, &[0xabu8; 15]).unwrap();

        let decoder = PacketDecoder::new(false);
        let out = decode_one(&decoder, &frame);

        assert_eq!(out.src_ip, "192.168.1.14");
        assert_eq!(out.dst_ip, "172.217.6.163");
        assert_eq!(out.src_port, 49209);
        assert_eq!(out.dst_port, 443);
        assert_eq!(out.protocol, "TCP");
        assert!(!out.unknown_layer);

        let seg = out.tcp_segment.as_ref().expect("tcp segment");
        assert_eq!(seg.payload.len(), 15);

        // Ethernet + IPv4 + TCP records
        assert_eq!(out.records.len(), 3);
        assert_eq!(decoder.stats.get("TCP"), 1);
        assert_eq!(decoder.stats.get("Ethernet"), 1);
        assert_eq!(decoder.stats.get("IPv4"), 1);

        // context attached to the TCP record
        match &out.records[2] {
            Record::Tcp(t) => {
                let ctx = t.context.as_ref().unwrap();
                assert_eq!(ctx.src_ip, "192.168.1.14");
                assert_eq!(ctx.dst_port, "443");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_udp_dns() {
        let mut dns = Vec::new();
        dns.extend_from_slice(&0x42u16.to_be_bytes());
        dns.extend_from_slice(&0x0100u16.to_be_bytes());
        dns.extend_from_slice(&1u16.to_be_bytes());
        dns.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        dns.extend_from_slice(&[3]);
        dns.extend_from_slice(b"foo");
        dns.extend_from_slice(&[2]);
        dns.extend_from_slice(b"io");
        dns.push(0);
        dns.extend_from_slice(&1u16.to_be_bytes());
        dns.extend_from_slice(&1u16.to_be_bytes());

        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [8, 8, 8, 8], 64)
            .udp(40000, 53);
        let mut frame = Vec::with_capacity(builder.size(dns.len()));
        builder.write(&mut frame, &dns).unwrap();

        let decoder = PacketDecoder::new(false);
        let out = decode_one(&decoder, &frame);

        assert_eq!(out.protocol, "DNS");
        assert!(out
            .records
            .iter()
            .any(|r| matches!(r, Record::Dns(d) if d.questions[0].name == "foo.io")));
    }

    #[test]
    fn test_unknown_ethertype_flagged() {
        let mut frame = vec![0u8; 14];
        frame[12] = 0x98; // bogus ethertype
        frame[13] = 0x76;
        frame.extend_from_slice(&[0u8; 20]);

        let decoder = PacketDecoder::new(false);
        let out = decode_one(&decoder, &frame);
        assert!(out.unknown_layer);
    }

    #[test]
    fn test_truncated_packet_is_error() {
        let decoder = PacketDecoder::new(false);
        assert!(decoder
            .decode(&[0u8; 5], Utc::now(), LinkLayer::Ethernet)
            .is_err());
        assert_eq!(decoder.errors.get("decode/ethernet"), 1);
    }

    #[test]
    fn test_counter_map() {
        let counters = CounterMap::new();
        counters.inc("a");
        counters.inc("a");
        counters.inc("b");
        assert_eq!(counters.get("a"), 2);
        assert_eq!(counters.snapshot(), vec![("a".into(), 2), ("b".into(), 1)]);
    }
}
