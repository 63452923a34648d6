//! Network-layer audit records.

use serde::{Deserialize, Serialize};

use super::{join, AuditRecord, PacketContext};

fn ctx_ports(ctx: &Option<PacketContext>) -> (String, String) {
    match ctx {
        Some(c) => (c.src_port.clone(), c.dst_port.clone()),
        None => (String::new(), String::new()),
    }
}

/// IPv4 header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IPv4 {
    pub timestamp: String,
    pub version: u32,
    /// Header length in 32-bit words.
    pub ihl: u32,
    pub tos: u32,
    pub length: u32,
    pub id: u32,
    pub flags: u32,
    pub frag_offset: u32,
    pub ttl: u32,
    pub protocol: u32,
    pub checksum: u32,
    pub src_ip: String,
    pub dst_ip: String,
    pub payload_entropy: f64,
    pub payload_size: u32,
    pub context: Option<PacketContext>,
}

impl IPv4 {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Version",
        "IHL",
        "TOS",
        "Length",
        "Id",
        "Flags",
        "FragOffset",
        "TTL",
        "Protocol",
        "Checksum",
        "SrcIP",
        "DstIP",
        "PayloadEntropy",
        "PayloadSize",
        "SrcPort",
        "DstPort",
    ];
}

impl AuditRecord for IPv4 {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        let (sp, dp) = ctx_ports(&self.context);
        vec![
            self.timestamp.clone(),
            self.version.to_string(),
            self.ihl.to_string(),
            self.tos.to_string(),
            self.length.to_string(),
            self.id.to_string(),
            self.flags.to_string(),
            self.frag_offset.to_string(),
            self.ttl.to_string(),
            self.protocol.to_string(),
            self.checksum.to_string(),
            self.src_ip.clone(),
            self.dst_ip.clone(),
            format!("{:.6}", self.payload_entropy),
            self.payload_size.to_string(),
            sp,
            dp,
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.src_ip.clone()
    }

    fn dst(&self) -> String {
        self.dst_ip.clone()
    }
}

/// IPv6 header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IPv6 {
    pub timestamp: String,
    pub version: u32,
    pub traffic_class: u32,
    pub flow_label: u32,
    pub length: u32,
    pub next_header: u32,
    pub hop_limit: u32,
    pub src_ip: String,
    pub dst_ip: String,
    pub payload_entropy: f64,
    pub payload_size: u32,
    pub context: Option<PacketContext>,
}

impl IPv6 {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Version",
        "TrafficClass",
        "FlowLabel",
        "Length",
        "NextHeader",
        "HopLimit",
        "SrcIP",
        "DstIP",
        "PayloadEntropy",
        "PayloadSize",
        "SrcPort",
        "DstPort",
    ];
}

impl AuditRecord for IPv6 {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        let (sp, dp) = ctx_ports(&self.context);
        vec![
            self.timestamp.clone(),
            self.version.to_string(),
            self.traffic_class.to_string(),
            self.flow_label.to_string(),
            self.length.to_string(),
            self.next_header.to_string(),
            self.hop_limit.to_string(),
            self.src_ip.clone(),
            self.dst_ip.clone(),
            format!("{:.6}", self.payload_entropy),
            self.payload_size.to_string(),
            sp,
            dp,
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.src_ip.clone()
    }

    fn dst(&self) -> String {
        self.dst_ip.clone()
    }
}

/// IPv6 hop-by-hop extension header options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IPv6HopByHop {
    pub timestamp: String,
    /// Option type values in order of appearance.
    pub options: Vec<u32>,
    pub context: Option<PacketContext>,
}

impl IPv6HopByHop {
    pub const CSV_HEADER: &'static [&'static str] = &["Timestamp", "Options"];
}

impl AuditRecord for IPv6HopByHop {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![self.timestamp.clone(), join(&self.options)]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.context.as_ref().map(|c| c.src_ip.clone()).unwrap_or_default()
    }

    fn dst(&self) -> String {
        self.context.as_ref().map(|c| c.dst_ip.clone()).unwrap_or_default()
    }
}

/// ICMPv4 message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Icmpv4 {
    pub timestamp: String,
    pub type_code: u32,
    pub checksum: u32,
    pub id: u32,
    pub seq: u32,
    pub context: Option<PacketContext>,
}

impl Icmpv4 {
    pub const CSV_HEADER: &'static [&'static str] =
        &["Timestamp", "TypeCode", "Checksum", "Id", "Seq"];
}

impl AuditRecord for Icmpv4 {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.type_code.to_string(),
            self.checksum.to_string(),
            self.id.to_string(),
            self.seq.to_string(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.context.as_ref().map(|c| c.src_ip.clone()).unwrap_or_default()
    }

    fn dst(&self) -> String {
        self.context.as_ref().map(|c| c.dst_ip.clone()).unwrap_or_default()
    }
}

/// ICMPv6 message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Icmpv6 {
    pub timestamp: String,
    pub type_code: u32,
    pub checksum: u32,
    pub context: Option<PacketContext>,
}

impl Icmpv6 {
    pub const CSV_HEADER: &'static [&'static str] = &["Timestamp", "TypeCode", "Checksum"];
}

impl AuditRecord for Icmpv6 {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.type_code.to_string(),
            self.checksum.to_string(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.context.as_ref().map(|c| c.src_ip.clone()).unwrap_or_default()
    }

    fn dst(&self) -> String {
        self.context.as_ref().map(|c| c.dst_ip.clone()).unwrap_or_default()
    }
}

/// NDP neighbor solicitation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Icmpv6NeighborSolicitation {
    pub timestamp: String,
    pub target_address: String,
    /// NDP option type values.
    pub options: Vec<u32>,
}

impl Icmpv6NeighborSolicitation {
    pub const CSV_HEADER: &'static [&'static str] = &["Timestamp", "TargetAddress", "Options"];
}

impl AuditRecord for Icmpv6NeighborSolicitation {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.target_address.clone(),
            join(&self.options),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        String::new()
    }

    fn dst(&self) -> String {
        self.target_address.clone()
    }
}

/// NDP neighbor advertisement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Icmpv6NeighborAdvertisement {
    pub timestamp: String,
    pub flags: u32,
    pub target_address: String,
    pub options: Vec<u32>,
}

impl Icmpv6NeighborAdvertisement {
    pub const CSV_HEADER: &'static [&'static str] =
        &["Timestamp", "Flags", "TargetAddress", "Options"];
}

impl AuditRecord for Icmpv6NeighborAdvertisement {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.flags.to_string(),
            self.target_address.clone(),
            join(&self.options),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.target_address.clone()
    }

    fn dst(&self) -> String {
        String::new()
    }
}

/// NDP router advertisement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Icmpv6RouterAdvertisement {
    pub timestamp: String,
    pub hop_limit: u32,
    pub flags: u32,
    pub router_lifetime: u32,
    pub reachable_time: u32,
    pub retrans_timer: u32,
    pub options: Vec<u32>,
}

impl Icmpv6RouterAdvertisement {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "HopLimit",
        "Flags",
        "RouterLifetime",
        "ReachableTime",
        "RetransTimer",
        "Options",
    ];
}

impl AuditRecord for Icmpv6RouterAdvertisement {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.hop_limit.to_string(),
            self.flags.to_string(),
            self.router_lifetime.to_string(),
            self.reachable_time.to_string(),
            self.retrans_timer.to_string(),
            join(&self.options),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        String::new()
    }

    fn dst(&self) -> String {
        String::new()
    }
}

/// OSPF version 2 packet header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ospfv2 {
    pub timestamp: String,
    pub version: u32,
    pub ospf_type: u32,
    pub packet_length: u32,
    pub router_id: u32,
    pub area_id: u32,
    pub checksum: u32,
    pub au_type: u32,
}

impl Ospfv2 {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Version",
        "Type",
        "PacketLength",
        "RouterID",
        "AreaID",
        "Checksum",
        "AuType",
    ];
}

impl AuditRecord for Ospfv2 {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.version.to_string(),
            self.ospf_type.to_string(),
            self.packet_length.to_string(),
            self.router_id.to_string(),
            self.area_id.to_string(),
            self.checksum.to_string(),
            self.au_type.to_string(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.router_id.to_string()
    }

    fn dst(&self) -> String {
        String::new()
    }
}

/// OSPF version 3 packet header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ospfv3 {
    pub timestamp: String,
    pub version: u32,
    pub ospf_type: u32,
    pub packet_length: u32,
    pub router_id: u32,
    pub area_id: u32,
    pub checksum: u32,
    pub instance: u32,
}

impl Ospfv3 {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Version",
        "Type",
        "PacketLength",
        "RouterID",
        "AreaID",
        "Checksum",
        "Instance",
    ];
}

impl AuditRecord for Ospfv3 {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.version.to_string(),
            self.ospf_type.to_string(),
            self.packet_length.to_string(),
            self.router_id.to_string(),
            self.area_id.to_string(),
            self.checksum.to_string(),
            self.instance.to_string(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.router_id.to_string()
    }

    fn dst(&self) -> String {
        String::new()
    }
}

/// VRRP version 2 advertisement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vrrpv2 {
    pub timestamp: String,
    pub version: u32,
    pub vrrp_type: u32,
    pub virtual_rtr_id: u32,
    pub priority: u32,
    pub count_ip_addr: u32,
    pub auth_type: u32,
    pub adver_int: u32,
    pub checksum: u32,
    pub ip_addresses: Vec<String>,
}

impl Vrrpv2 {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Version",
        "Type",
        "VirtualRtrID",
        "Priority",
        "CountIPAddr",
        "AuthType",
        "AdverInt",
        "Checksum",
        "IPAddresses",
    ];
}

impl AuditRecord for Vrrpv2 {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.version.to_string(),
            self.vrrp_type.to_string(),
            self.virtual_rtr_id.to_string(),
            self.priority.to_string(),
            self.count_ip_addr.to_string(),
            self.auth_type.to_string(),
            self.adver_int.to_string(),
            self.checksum.to_string(),
            join(&self.ip_addresses),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        String::new()
    }

    fn dst(&self) -> String {
        String::new()
    }
}
