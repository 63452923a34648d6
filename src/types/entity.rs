//! Entity audit records aggregated across flows: credentials, extracted
//! files, software products, device profiles and known-issue matches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{join, AuditRecord, PacketContext};

/// A credential pair harvested from cleartext traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub timestamp: String,
    /// Service tag, e.g. `HTTP`, `HTTP Basic Auth`, `POP3`.
    pub service: String,
    pub flow: String,
    pub user: String,
    pub password: String,
    pub notes: String,
}

impl Credentials {
    pub const CSV_HEADER: &'static [&'static str] =
        &["Timestamp", "Service", "Flow", "User", "Password", "Notes"];
}

impl AuditRecord for Credentials {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.service.clone(),
            self.flow.clone(),
            self.user.clone(),
            self.password.clone(),
            self.notes.clone(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.flow
            .split_once("->")
            .map(|(a, _)| a.split(':').next().unwrap_or("").to_string())
            .unwrap_or_default()
    }

    fn dst(&self) -> String {
        self.flow
            .split_once("->")
            .map(|(_, b)| b.split(':').next().unwrap_or("").to_string())
            .unwrap_or_default()
    }
}

/// A file artifact extracted from a stream and stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub timestamp: String,
    pub name: String,
    pub length: i64,
    /// MD5 of the stored bytes, hex-encoded.
    pub hash: String,
    /// On-disk location inside the file storage tree.
    pub location: String,
    /// Flow identifier of the carrying connection.
    pub ident: String,
    /// Human-readable description of where the file came from. Prefixed
    /// `incomplete-` when the carrying stream ended mid-body.
    pub source: String,
    /// Declared content type from protocol headers.
    pub content_type: String,
    /// Content type sniffed from the stored bytes.
    pub content_type_detected: String,
    pub host: String,
    pub context: Option<PacketContext>,
}

impl File {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Name",
        "Length",
        "Hash",
        "Location",
        "Ident",
        "Source",
        "ContentType",
        "ContentTypeDetected",
        "Host",
    ];
}

impl AuditRecord for File {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.name.clone(),
            self.length.to_string(),
            self.hash.clone(),
            self.location.clone(),
            self.ident.clone(),
            self.source.clone(),
            self.content_type.clone(),
            self.content_type_detected.clone(),
            self.host.clone(),
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

/// A software product observed on the wire, deduplicated by
/// `product/version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Software {
    pub timestamp: String,
    pub product: String,
    pub vendor: String,
    pub version: String,
    /// What identified the product: `UserAgent`, `ServerName`,
    /// `X-Powered-By`, `SSH client Ident`, `SSH server Ident`,
    /// `HASSH Lookup`, `JA3s`, or `Generic version harvester`.
    pub source_name: String,
    /// The raw observation the identification was derived from.
    pub source_data: String,
    pub service: String,
    /// Device profile idents that exhibited this product.
    pub device_profiles: Vec<String>,
    /// Flow identifiers the product was seen on.
    pub flows: Vec<String>,
    pub notes: String,
}

impl Software {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Product",
        "Vendor",
        "Version",
        "SourceName",
        "SourceData",
        "Service",
        "DeviceProfiles",
        "Flows",
        "Notes",
    ];

    /// Dedup key in the software store.
    pub fn ident(&self) -> String {
        format!("{}/{}", self.product, self.version)
    }
}

impl AuditRecord for Software {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.product.clone(),
            self.vendor.clone(),
            self.version.clone(),
            self.source_name.clone(),
            self.source_data.clone(),
            self.service.clone(),
            join(&self.device_profiles),
            join(&self.flows),
            self.notes.clone(),
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

/// Per-IP traffic statistics inside a device profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpStats {
    pub addr: String,
    pub num_packets: u64,
    pub timestamp_first: String,
    pub timestamp_last: String,
    /// Per-protocol packet counters.
    pub protocols: BTreeMap<String, u64>,
    /// Per-destination-port packet counters.
    pub ports: BTreeMap<String, u64>,
}

impl std::fmt::Display for IpStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.addr, self.num_packets)
    }
}

/// Aggregated per-MAC view of a host's traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub timestamp: String,
    pub mac_addr: String,
    /// Manufacturer resolved from the OUI prefix.
    pub device_manufacturer: String,
    /// IPs this device sent traffic from.
    pub device_ips: Vec<IpStats>,
    /// IPs this device talked to.
    pub contacts: Vec<IpStats>,
    pub num_packets: u64,
    pub bytes: u64,
    pub timestamp_first: String,
    pub timestamp_last: String,
}

impl DeviceProfile {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "MacAddr",
        "DeviceManufacturer",
        "DeviceIPs",
        "Contacts",
        "NumPackets",
        "Bytes",
        "TimestampFirst",
        "TimestampLast",
    ];

    /// Profile identifier used in software records: MAC plus manufacturer.
    pub fn ident(&self) -> String {
        if self.device_manufacturer.is_empty() {
            self.mac_addr.clone()
        } else {
            format!("{} <{}>", self.mac_addr, self.device_manufacturer)
        }
    }
}

impl AuditRecord for DeviceProfile {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.mac_addr.clone(),
            self.device_manufacturer.clone(),
            join(&self.device_ips),
            join(&self.contacts),
            self.num_packets.to_string(),
            self.bytes.to_string(),
            self.timestamp_first.clone(),
            self.timestamp_last.clone(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.mac_addr.clone()
    }

    fn dst(&self) -> String {
        String::new()
    }
}

/// A known vulnerability matched against an observed software product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub timestamp: String,
    /// Advisory identifier, e.g. a CVE id.
    pub id: String,
    pub description: String,
    pub software: String,
    pub version: String,
    pub severity: String,
    pub notes: String,
}

impl Vulnerability {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "ID",
        "Description",
        "Software",
        "Version",
        "Severity",
        "Notes",
    ];
}

impl AuditRecord for Vulnerability {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.id.clone(),
            self.description.clone(),
            self.software.clone(),
            self.version.clone(),
            self.severity.clone(),
            self.notes.clone(),
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

/// A known public exploit matched against an observed software product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exploit {
    pub timestamp: String,
    pub id: String,
    pub description: String,
    pub software: String,
    pub version: String,
    pub source_file: String,
    pub notes: String,
}

impl Exploit {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "ID",
        "Description",
        "Software",
        "Version",
        "SourceFile",
        "Notes",
    ];
}

impl AuditRecord for Exploit {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.id.clone(),
            self.description.clone(),
            self.software.clone(),
            self.version.clone(),
            self.source_file.clone(),
            self.notes.clone(),
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
