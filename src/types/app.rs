//! Application-layer audit records decoded directly from single packets.

use serde::{Deserialize, Serialize};

use super::{join, AuditRecord, PacketContext};

/// One DHCP option (type, length, data rendered as string).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DhcpOption {
    pub option_type: u32,
    pub length: u32,
    pub data: String,
}

impl std::fmt::Display for DhcpOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.option_type, self.data)
    }
}

/// DHCPv4 message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dhcpv4 {
    pub timestamp: String,
    pub operation: u32,
    pub hardware_type: u32,
    pub hardware_len: u32,
    pub hardware_opts: u32,
    pub xid: u32,
    pub secs: u32,
    pub flags: u32,
    pub client_ip: String,
    pub your_ip: String,
    pub server_ip: String,
    pub relay_ip: String,
    pub client_hw_address: String,
    pub server_name: String,
    pub file: String,
    pub options: Vec<DhcpOption>,
    /// Comma-joined parameter request list (option 55), used for device
    /// fingerprinting.
    pub fingerprint: String,
    pub context: Option<PacketContext>,
}

impl Dhcpv4 {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Operation",
        "HardwareType",
        "HardwareLen",
        "HardwareOpts",
        "Xid",
        "Secs",
        "Flags",
        "ClientIP",
        "YourIP",
        "ServerIP",
        "RelayIP",
        "ClientHWAddress",
        "ServerName",
        "File",
        "Options",
        "Fingerprint",
    ];
}

impl AuditRecord for Dhcpv4 {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.operation.to_string(),
            self.hardware_type.to_string(),
            self.hardware_len.to_string(),
            self.hardware_opts.to_string(),
            self.xid.to_string(),
            self.secs.to_string(),
            self.flags.to_string(),
            self.client_ip.clone(),
            self.your_ip.clone(),
            self.server_ip.clone(),
            self.relay_ip.clone(),
            self.client_hw_address.clone(),
            self.server_name.clone(),
            self.file.clone(),
            join(&self.options),
            self.fingerprint.clone(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.client_ip.clone()
    }

    fn dst(&self) -> String {
        self.server_ip.clone()
    }
}

/// DHCPv6 message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dhcpv6 {
    pub timestamp: String,
    pub msg_type: u32,
    /// Transaction id, hex-encoded.
    pub transaction_id: String,
    pub options: Vec<DhcpOption>,
    pub context: Option<PacketContext>,
}

impl Dhcpv6 {
    pub const CSV_HEADER: &'static [&'static str] =
        &["Timestamp", "MsgType", "TransactionID", "Options"];
}

impl AuditRecord for Dhcpv6 {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.msg_type.to_string(),
            self.transaction_id.clone(),
            join(&self.options),
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

/// One DNS question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsQuestion {
    pub name: String,
    pub record_type: u32,
    pub class: u32,
}

impl std::fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.record_type)
    }
}

/// One DNS resource record (answer / authority / additional).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsResourceRecord {
    pub name: String,
    pub record_type: u32,
    pub class: u32,
    pub ttl: u32,
    pub data: String,
}

impl std::fmt::Display for DnsResourceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.data)
    }
}

/// DNS message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dns {
    pub timestamp: String,
    pub id: u32,
    pub qr: bool,
    pub op_code: u32,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub response_code: u32,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsResourceRecord>,
    pub authorities: Vec<DnsResourceRecord>,
    pub additionals: Vec<DnsResourceRecord>,
    pub context: Option<PacketContext>,
}

impl Dns {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "ID",
        "QR",
        "OpCode",
        "AA",
        "TC",
        "RD",
        "RA",
        "ResponseCode",
        "Questions",
        "Answers",
        "Authorities",
        "Additionals",
    ];
}

impl AuditRecord for Dns {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.id.to_string(),
            self.qr.to_string(),
            self.op_code.to_string(),
            self.authoritative.to_string(),
            self.truncated.to_string(),
            self.recursion_desired.to_string(),
            self.recursion_available.to_string(),
            self.response_code.to_string(),
            join(&self.questions),
            join(&self.answers),
            join(&self.authorities),
            join(&self.additionals),
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

/// SIP message (request or response line + headers).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sip {
    pub timestamp: String,
    pub version: String,
    pub method: String,
    pub headers: Vec<String>,
    pub is_response: bool,
    pub response_code: u32,
    pub response_status: String,
    pub context: Option<PacketContext>,
}

impl Sip {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Version",
        "Method",
        "Headers",
        "IsResponse",
        "ResponseCode",
        "ResponseStatus",
    ];
}

impl AuditRecord for Sip {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.version.clone(),
            self.method.clone(),
            join(&self.headers),
            self.is_response.to_string(),
            self.response_code.to_string(),
            self.response_status.clone(),
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

/// Bidirectional forwarding detection control packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bfd {
    pub timestamp: String,
    pub version: u32,
    pub diagnostic: u32,
    pub state: u32,
    pub detect_multiplier: u32,
    pub my_discriminator: u32,
    pub your_discriminator: u32,
    pub desired_min_tx_interval: u32,
    pub required_min_rx_interval: u32,
    pub required_min_echo_rx_interval: u32,
    pub context: Option<PacketContext>,
}

impl Bfd {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Version",
        "Diagnostic",
        "State",
        "DetectMultiplier",
        "MyDiscriminator",
        "YourDiscriminator",
        "DesiredMinTxInterval",
        "RequiredMinRxInterval",
        "RequiredMinEchoRxInterval",
    ];
}

impl AuditRecord for Bfd {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.version.to_string(),
            self.diagnostic.to_string(),
            self.state.to_string(),
            self.detect_multiplier.to_string(),
            self.my_discriminator.to_string(),
            self.your_discriminator.to_string(),
            self.desired_min_tx_interval.to_string(),
            self.required_min_rx_interval.to_string(),
            self.required_min_echo_rx_interval.to_string(),
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

/// Common industrial protocol message header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cip {
    pub timestamp: String,
    pub response: bool,
    pub service_id: u32,
    pub class_id: u32,
    pub instance_id: u32,
    pub status: u32,
    pub additional_status: Vec<u32>,
    pub data: Vec<u8>,
    pub context: Option<PacketContext>,
}

impl Cip {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Response",
        "ServiceID",
        "ClassID",
        "InstanceID",
        "Status",
        "AdditionalStatus",
        "DataLength",
    ];
}

impl AuditRecord for Cip {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.response.to_string(),
            self.service_id.to_string(),
            self.class_id.to_string(),
            self.instance_id.to_string(),
            self.status.to_string(),
            join(&self.additional_status),
            self.data.len().to_string(),
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

/// USB request block captured from a usbmon link-layer trace,
/// including the control-transfer setup block when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usb {
    pub timestamp: String,
    pub id: u64,
    pub event_type: u32,
    pub transfer_type: u32,
    pub direction: u32,
    pub endpoint_number: u32,
    pub device_address: u32,
    pub bus_id: u32,
    pub setup_flag: bool,
    pub data_flag: bool,
    pub status: i32,
    pub urb_length: u32,
    pub urb_data_length: u32,
    /// Setup block, valid when `setup_flag` is set.
    pub bm_request_type: u32,
    pub b_request: u32,
    pub w_value: u32,
    pub w_index: u32,
    pub w_length: u32,
    pub payload_entropy: f64,
    pub payload_size: u32,
    pub payload: Vec<u8>,
}

impl Usb {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "ID",
        "EventType",
        "TransferType",
        "Direction",
        "EndpointNumber",
        "DeviceAddress",
        "BusID",
        "SetupFlag",
        "DataFlag",
        "Status",
        "UrbLength",
        "UrbDataLength",
        "BmRequestType",
        "BRequest",
        "WValue",
        "WIndex",
        "WLength",
        "PayloadEntropy",
        "PayloadSize",
    ];
}

impl AuditRecord for Usb {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.id.to_string(),
            self.event_type.to_string(),
            self.transfer_type.to_string(),
            self.direction.to_string(),
            self.endpoint_number.to_string(),
            self.device_address.to_string(),
            self.bus_id.to_string(),
            self.setup_flag.to_string(),
            self.data_flag.to_string(),
            self.status.to_string(),
            self.urb_length.to_string(),
            self.urb_data_length.to_string(),
            self.bm_request_type.to_string(),
            self.b_request.to_string(),
            self.w_value.to_string(),
            self.w_index.to_string(),
            self.w_length.to_string(),
            format!("{:.6}", self.payload_entropy),
            self.payload_size.to_string(),
        ]
    }

    fn time(&self) -> &str {
        &self.timestamp
    }

    fn src(&self) -> String {
        self.bus_id.to_string()
    }

    fn dst(&self) -> String {
        self.device_address.to_string()
    }
}
