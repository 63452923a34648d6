//! Transport-layer audit records.
//!
//! Transport records carry the enclosing network layer's addresses via the
//! packet context, attached by the collector before write.

use serde::{Deserialize, Serialize};

use super::{AuditRecord, PacketContext};

/// A single TCP option as seen on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpOption {
    pub kind: u32,
    pub length: u32,
    pub data: Vec<u8>,
}

/// TCP segment header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tcp {
    pub timestamp: String,
    pub src_port: u32,
    pub dst_port: u32,
    pub seq_num: u32,
    pub ack_num: u32,
    pub data_offset: u32,
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
    pub ns: bool,
    pub window: u32,
    pub checksum: u32,
    pub urgent: u32,
    pub options: Vec<TcpOption>,
    pub payload_entropy: f64,
    pub payload_size: u32,
    /// Raw payload, populated only when payload capture is enabled.
    pub payload: Vec<u8>,
    pub context: Option<PacketContext>,
}

impl Tcp {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "SrcPort",
        "DstPort",
        "SeqNum",
        "AckNum",
        "DataOffset",
        "FIN",
        "SYN",
        "RST",
        "PSH",
        "ACK",
        "URG",
        "ECE",
        "CWR",
        "NS",
        "Window",
        "Checksum",
        "Urgent",
        "PayloadEntropy",
        "PayloadSize",
        "SrcIP",
        "DstIP",
    ];

    /// Flags as a compact string, e.g. `SA` for SYN+ACK.
    pub fn flags_string(&self) -> String {
        let mut s = String::new();
        if self.syn {
            s.push('S');
        }
        if self.ack {
            s.push('A');
        }
        if self.fin {
            s.push('F');
        }
        if self.rst {
            s.push('R');
        }
        if self.psh {
            s.push('P');
        }
        if self.urg {
            s.push('U');
        }
        if s.is_empty() {
            s.push('.');
        }
        s
    }
}

impl AuditRecord for Tcp {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        let (src_ip, dst_ip) = match &self.context {
            Some(c) => (c.src_ip.clone(), c.dst_ip.clone()),
            None => (String::new(), String::new()),
        };
        vec![
            self.timestamp.clone(),
            self.src_port.to_string(),
            self.dst_port.to_string(),
            self.seq_num.to_string(),
            self.ack_num.to_string(),
            self.data_offset.to_string(),
            self.fin.to_string(),
            self.syn.to_string(),
            self.rst.to_string(),
            self.psh.to_string(),
            self.ack.to_string(),
            self.urg.to_string(),
            self.ece.to_string(),
            self.cwr.to_string(),
            self.ns.to_string(),
            self.window.to_string(),
            self.checksum.to_string(),
            self.urgent.to_string(),
            format!("{:.6}", self.payload_entropy),
            self.payload_size.to_string(),
            src_ip,
            dst_ip,
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

/// UDP datagram header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Udp {
    pub timestamp: String,
    pub src_port: u32,
    pub dst_port: u32,
    pub length: u32,
    pub checksum: u32,
    pub payload_entropy: f64,
    pub payload_size: u32,
    pub payload: Vec<u8>,
    pub context: Option<PacketContext>,
}

impl Udp {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "SrcPort",
        "DstPort",
        "Length",
        "Checksum",
        "PayloadEntropy",
        "PayloadSize",
        "SrcIP",
        "DstIP",
    ];
}

impl AuditRecord for Udp {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        let (src_ip, dst_ip) = match &self.context {
            Some(c) => (c.src_ip.clone(), c.dst_ip.clone()),
            None => (String::new(), String::new()),
        };
        vec![
            self.timestamp.clone(),
            self.src_port.to_string(),
            self.dst_port.to_string(),
            self.length.to_string(),
            self.checksum.to_string(),
            format!("{:.6}", self.payload_entropy),
            self.payload_size.to_string(),
            src_ip,
            dst_ip,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_string() {
        let seg = Tcp {
            syn: true,
            ack: true,
            ..Default::default()
        };
        assert_eq!(seg.flags_string(), "SA");
        assert_eq!(Tcp::default().flags_string(), ".");
    }

    #[test]
    fn test_csv_lengths_match() {
        let tcp = Tcp::default();
        assert_eq!(tcp.csv_header().len(), tcp.csv_record().len());
        let udp = Udp::default();
        assert_eq!(udp.csv_header().len(), udp.csv_record().len());
    }
}
