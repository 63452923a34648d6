//! Link-layer audit records.
//!
//! Layer 2 records identify endpoints by MAC address; `src()`/`dst()`
//! return the hardware addresses.

use serde::{Deserialize, Serialize};

use super::{join, AuditRecord, PacketContext};

/// Ethernet II frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ethernet {
    pub timestamp: String,
    pub src_mac: String,
    pub dst_mac: String,
    /// EtherType of the encapsulated payload.
    pub ethernet_type: u32,
    pub payload_entropy: f64,
    pub payload_size: u32,
    pub context: Option<PacketContext>,
}

impl Ethernet {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "SrcMAC",
        "DstMAC",
        "EthernetType",
        "PayloadEntropy",
        "PayloadSize",
    ];
}

impl AuditRecord for Ethernet {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.src_mac.clone(),
            self.dst_mac.clone(),
            self.ethernet_type.to_string(),
            format!("{:.6}", self.payload_entropy),
            self.payload_size.to_string(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.src_mac.clone()
    }

    fn dst(&self) -> String {
        self.dst_mac.clone()
    }
}

/// Address resolution protocol message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arp {
    pub timestamp: String,
    pub addr_type: u32,
    pub protocol: u32,
    pub hw_address_size: u32,
    pub proto_address_size: u32,
    /// 1 = request, 2 = reply.
    pub operation: u32,
    pub src_hw_address: String,
    pub src_proto_address: String,
    pub dst_hw_address: String,
    pub dst_proto_address: String,
}

impl Arp {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "AddrType",
        "Protocol",
        "HwAddressSize",
        "ProtoAddressSize",
        "Operation",
        "SrcHwAddress",
        "SrcProtoAddress",
        "DstHwAddress",
        "DstProtoAddress",
    ];
}

impl AuditRecord for Arp {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.addr_type.to_string(),
            self.protocol.to_string(),
            self.hw_address_size.to_string(),
            self.proto_address_size.to_string(),
            self.operation.to_string(),
            self.src_hw_address.clone(),
            self.src_proto_address.clone(),
            self.dst_hw_address.clone(),
            self.dst_proto_address.clone(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.src_hw_address.clone()
    }

    fn dst(&self) -> String {
        self.dst_hw_address.clone()
    }
}

/// IEEE 802.1Q VLAN tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dot1Q {
    pub timestamp: String,
    pub priority: u32,
    pub drop_eligible: bool,
    pub vlan_identifier: u32,
    pub ethernet_type: u32,
}

impl Dot1Q {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Priority",
        "DropEligible",
        "VLANIdentifier",
        "Type",
    ];
}

impl AuditRecord for Dot1Q {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.priority.to_string(),
            self.drop_eligible.to_string(),
            self.vlan_identifier.to_string(),
            self.ethernet_type.to_string(),
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

/// IEEE 802.2 logical link control header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Llc {
    pub timestamp: String,
    pub dsap: u32,
    pub ig: bool,
    pub ssap: u32,
    pub cr: bool,
    pub control: u32,
}

impl Llc {
    pub const CSV_HEADER: &'static [&'static str] =
        &["Timestamp", "DSAP", "IG", "SSAP", "CR", "Control"];
}

impl AuditRecord for Llc {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.dsap.to_string(),
            self.ig.to_string(),
            self.ssap.to_string(),
            self.cr.to_string(),
            self.control.to_string(),
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

/// SNAP extension header on top of LLC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snap {
    pub timestamp: String,
    pub organizational_code: String,
    pub snap_type: u32,
}

impl Snap {
    pub const CSV_HEADER: &'static [&'static str] = &["Timestamp", "OrganizationalCode", "Type"];
}

impl AuditRecord for Snap {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.organizational_code.clone(),
            self.snap_type.to_string(),
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

/// Link layer discovery protocol frame (mandatory TLVs only).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lldp {
    pub timestamp: String,
    pub chassis_id_type: u32,
    pub chassis_id: String,
    pub port_id_type: u32,
    pub port_id: String,
    pub ttl: u32,
}

impl Lldp {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "ChassisIDType",
        "ChassisID",
        "PortIDType",
        "PortID",
        "TTL",
    ];
}

impl AuditRecord for Lldp {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.chassis_id_type.to_string(),
            self.chassis_id.clone(),
            self.port_id_type.to_string(),
            self.port_id.clone(),
            self.ttl.to_string(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.chassis_id.clone()
    }

    fn dst(&self) -> String {
        String::new()
    }
}

/// Cisco discovery protocol announcement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CiscoDiscovery {
    pub timestamp: String,
    pub version: u32,
    pub ttl: u32,
    pub checksum: u32,
    pub device_id: String,
    pub port_id: String,
    pub platform: String,
    /// Raw TLV type values observed in the frame.
    pub values: Vec<u32>,
}

impl CiscoDiscovery {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Version",
        "TTL",
        "Checksum",
        "DeviceID",
        "PortID",
        "Platform",
        "Values",
    ];
}

impl AuditRecord for CiscoDiscovery {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.version.to_string(),
            self.ttl.to_string(),
            self.checksum.to_string(),
            self.device_id.clone(),
            self.port_id.clone(),
            self.platform.clone(),
            join(&self.values),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.device_id.clone()
    }

    fn dst(&self) -> String {
        String::new()
    }
}

/// Nortel (SynOptics) discovery protocol frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NortelDiscovery {
    pub timestamp: String,
    pub ip_address: String,
    pub segment_id: String,
    pub chassis: u32,
    pub backplane: u32,
    pub state: u32,
    pub num_links: u32,
}

impl NortelDiscovery {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "IPAddress",
        "SegmentID",
        "Chassis",
        "Backplane",
        "State",
        "NumLinks",
    ];
}

impl AuditRecord for NortelDiscovery {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.ip_address.clone(),
            self.segment_id.clone(),
            self.chassis.to_string(),
            self.backplane.to_string(),
            self.state.to_string(),
            self.num_links.to_string(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.ip_address.clone()
    }

    fn dst(&self) -> String {
        String::new()
    }
}

/// Extensible authentication protocol packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Eap {
    pub timestamp: String,
    pub code: u32,
    pub id: u32,
    pub length: u32,
    pub eap_type: u32,
    pub type_data: Vec<u8>,
}

impl Eap {
    pub const CSV_HEADER: &'static [&'static str] =
        &["Timestamp", "Code", "Id", "Length", "Type", "TypeData"];
}

impl AuditRecord for Eap {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.code.to_string(),
            self.id.to_string(),
            self.length.to_string(),
            self.eap_type.to_string(),
            join(&self.type_data),
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

/// EAP over LAN header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Eapol {
    pub timestamp: String,
    pub version: u32,
    pub eapol_type: u32,
    pub length: u32,
}

impl Eapol {
    pub const CSV_HEADER: &'static [&'static str] = &["Timestamp", "Version", "Type", "Length"];
}

impl AuditRecord for Eapol {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.version.to_string(),
            self.eapol_type.to_string(),
            self.length.to_string(),
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
