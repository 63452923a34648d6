//! Audit record type definitions
//!
//! Every protocol or entity the framework can observe maps to exactly one
//! record type here. A record is a flat, timestamped, serde-serializable
//! struct; the [`AuditRecord`] trait provides the CSV projection used by
//! the dumper and the source/destination accessors used for labeling.
//!
//! The [`record_types!`] table at the bottom of this file is the single
//! registry mapping numeric type tags to record structs. Decoders register
//! by adding their type here.

use serde::{Deserialize, Serialize};

pub mod app;
pub mod entity;
pub mod link;
pub mod network;
pub mod session;
pub mod transport;

pub use app::*;
pub use entity::*;
pub use link::*;
pub use network::*;
pub use session::*;
pub use transport::*;

/// Interface shared by all audit records.
///
/// CSV headers are static per type; `csv_record` must produce values in
/// the same order and count as `csv_header`.
pub trait AuditRecord {
    /// Ordered CSV column names for this record type.
    fn csv_header(&self) -> &'static [&'static str];

    /// Ordered CSV values, matching `csv_header`.
    fn csv_record(&self) -> Vec<String>;

    /// The capture timestamp as `seconds.microseconds`.
    fn time(&self) -> &str;

    /// Source of the record: MAC address for layer 2, IP for layer 3+.
    fn src(&self) -> String;

    /// Destination of the record: MAC address for layer 2, IP for layer 3+.
    fn dst(&self) -> String;
}

/// Transport/network cross-layer context attached by the collector before
/// a record is written: transport records receive the enclosing IPs,
/// network records the enclosing ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketContext {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: String,
    pub dst_port: String,
}

impl PacketContext {
    pub fn flow_ident(&self) -> String {
        format!(
            "{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// File header written as the first frame of every audit-record file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Numeric record type tag for the records that follow.
    pub record_type: i32,
    /// File creation time, `seconds.microseconds`.
    pub created: String,
    /// Name of the capture source (pcap path or interface name).
    pub input_source: String,
    /// Framework version string.
    pub version: String,
    /// Whether the records include raw payload bytes.
    pub contains_payloads: bool,
}

/// Join a list of displayable values for a CSV cell.
pub(crate) fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

/// Join a string map for a CSV cell, sorted for determinism.
pub(crate) fn join_map(map: &std::collections::BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join("|")
}

macro_rules! record_types {
    ( $( $tag:literal => $variant:ident ),+ $(,)? ) => {
        /// Numeric tag identifying a record type on disk.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(i32)]
        pub enum RecordType {
            $( $variant = $tag ),+
        }

        impl RecordType {
            /// All registered record types.
            pub const ALL: &'static [RecordType] = &[ $( RecordType::$variant ),+ ];

            /// Logical name, used as the output filename stem.
            pub fn name(&self) -> &'static str {
                match self {
                    $( RecordType::$variant => stringify!($variant) ),+
                }
            }

            /// Reverse lookup from the on-disk tag value.
            pub fn from_tag(tag: i32) -> Option<RecordType> {
                match tag {
                    $( $tag => Some(RecordType::$variant), )+
                    _ => None,
                }
            }

            /// Lookup by logical name (case-insensitive).
            pub fn from_name(name: &str) -> Option<RecordType> {
                Self::ALL
                    .iter()
                    .find(|t| t.name().eq_ignore_ascii_case(name))
                    .copied()
            }

            /// CSV header for this record type, available without an instance.
            pub fn csv_header(&self) -> &'static [&'static str] {
                match self {
                    $( RecordType::$variant => $variant::CSV_HEADER ),+
                }
            }
        }

        impl std::fmt::Display for RecordType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }

        /// A decoded audit record of any registered type.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum Record {
            $( $variant($variant) ),+
        }

        impl Record {
            pub fn record_type(&self) -> RecordType {
                match self {
                    $( Record::$variant(_) => RecordType::$variant ),+
                }
            }

            /// Serialize the record payload (without framing).
            pub fn encode(&self) -> bincode::Result<Vec<u8>> {
                match self {
                    $( Record::$variant(r) => bincode::serialize(r) ),+
                }
            }

            /// Deserialize a record payload of a known type.
            pub fn decode(ty: RecordType, bytes: &[u8]) -> bincode::Result<Record> {
                match ty {
                    $( RecordType::$variant => Ok(Record::$variant(bincode::deserialize(bytes)?)) ),+
                }
            }

            /// JSON projection of the record payload.
            pub fn to_json(&self) -> serde_json::Result<String> {
                match self {
                    $( Record::$variant(r) => serde_json::to_string(r) ),+
                }
            }

            /// Access the record through the common audit interface.
            pub fn audit(&self) -> &dyn AuditRecord {
                match self {
                    $( Record::$variant(r) => r ),+
                }
            }
        }

        $(
            impl From<$variant> for Record {
                fn from(r: $variant) -> Self {
                    Record::$variant(r)
                }
            }
        )+
    };
}

record_types! {
    1  => Ethernet,
    2  => Arp,
    3  => Dot1Q,
    4  => Llc,
    5  => Snap,
    6  => Lldp,
    7  => CiscoDiscovery,
    8  => NortelDiscovery,
    9  => Eap,
    10 => Eapol,
    20 => IPv4,
    21 => IPv6,
    22 => IPv6HopByHop,
    23 => Icmpv4,
    24 => Icmpv6,
    25 => Icmpv6NeighborSolicitation,
    26 => Icmpv6NeighborAdvertisement,
    27 => Icmpv6RouterAdvertisement,
    28 => Ospfv2,
    29 => Ospfv3,
    30 => Vrrpv2,
    40 => Tcp,
    41 => Udp,
    50 => Dhcpv4,
    51 => Dhcpv6,
    52 => Dns,
    53 => Sip,
    54 => Bfd,
    55 => Cip,
    56 => Usb,
    70 => Http,
    71 => Ssh,
    72 => Credentials,
    73 => File,
    74 => Software,
    75 => DeviceProfile,
    76 => Vulnerability,
    77 => Exploit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for ty in RecordType::ALL {
            assert_eq!(RecordType::from_tag(*ty as i32), Some(*ty));
        }
        assert_eq!(RecordType::from_tag(9999), None);
    }

    #[test]
    fn test_name_lookup() {
        assert_eq!(RecordType::from_name("http"), Some(RecordType::Http));
        assert_eq!(RecordType::from_name("TCP"), Some(RecordType::Tcp));
        assert_eq!(RecordType::from_name("nope"), None);
    }

    #[test]
    fn test_record_encode_decode() {
        let rec: Record = Credentials {
            timestamp: "1580806571.988737".into(),
            service: "HTTP".into(),
            flow: "1.2.3.4:1->5.6.7.8:80".into(),
            user: "alice".into(),
            password: "s3cr3t".into(),
            notes: "Login Parameters".into(),
        }
        .into();

        let bytes = rec.encode().unwrap();
        let back = Record::decode(RecordType::Credentials, &bytes).unwrap();
        assert_eq!(rec, back);
    }

    #[test]
    fn test_csv_header_matches_record_len() {
        let rec: Record = Credentials {
            timestamp: "1.000000".into(),
            service: "POP3".into(),
            flow: String::new(),
            user: "u".into(),
            password: "p".into(),
            notes: String::new(),
        }
        .into();
        assert_eq!(rec.audit().csv_header().len(), rec.audit().csv_record().len());
    }
}
