//! Flow-derived audit records for application sessions (HTTP, SSH).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{join_map, AuditRecord};

/// One HTTP request/response pair observed on a TCP connection.
///
/// Requests without a matched response are emitted with `status_code` 0
/// and empty response fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Http {
    pub timestamp: String,
    pub proto: String,
    pub method: String,
    pub host: String,
    pub user_agent: String,
    pub referer: String,
    pub url: String,
    pub status_code: u32,
    pub req_content_length: i64,
    pub req_content_encoding: String,
    pub res_content_length: i64,
    pub res_content_encoding: String,
    /// Declared response content type.
    pub content_type: String,
    /// Content type sniffed from the response body.
    pub content_type_detected: String,
    pub server_name: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub request_header: BTreeMap<String, String>,
    pub response_header: BTreeMap<String, String>,
    /// Bodies are populated only when payload capture is enabled.
    pub request_body: Vec<u8>,
    pub response_body: Vec<u8>,
}

impl Http {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "Proto",
        "Method",
        "Host",
        "UserAgent",
        "Referer",
        "URL",
        "StatusCode",
        "ReqContentLength",
        "ReqContentEncoding",
        "ResContentLength",
        "ResContentEncoding",
        "ContentType",
        "ContentTypeDetected",
        "ServerName",
        "SrcIP",
        "DstIP",
        "RequestHeader",
        "ResponseHeader",
    ];
}

impl AuditRecord for Http {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.proto.clone(),
            self.method.clone(),
            self.host.clone(),
            self.user_agent.clone(),
            self.referer.clone(),
            self.url.clone(),
            self.status_code.to_string(),
            self.req_content_length.to_string(),
            self.req_content_encoding.clone(),
            self.res_content_length.to_string(),
            self.res_content_encoding.clone(),
            self.content_type.clone(),
            self.content_type_detected.clone(),
            self.server_name.clone(),
            self.src_ip.clone(),
            self.dst_ip.clone(),
            join_map(&self.request_header),
            join_map(&self.response_header),
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

/// SSH handshake fingerprint for one direction of a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ssh {
    pub timestamp: String,
    /// HASSH (client) or HASSH-server digest, hex-encoded MD5.
    pub hassh: String,
    /// Flow identifier, oriented in the direction of this record.
    pub flow: String,
    /// Protocol ident line, e.g. `SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.1`.
    pub ident: String,
    /// The raw semicolon-joined algorithm lists the digest was computed from.
    pub algorithms: String,
    pub is_client: bool,
}

impl Ssh {
    pub const CSV_HEADER: &'static [&'static str] = &[
        "Timestamp",
        "HASSH",
        "Flow",
        "Ident",
        "Algorithms",
        "IsClient",
    ];
}

impl AuditRecord for Ssh {
    fn csv_header(&self) -> &'static [&'static str] {
        Self::CSV_HEADER
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.hassh.clone(),
            self.flow.clone(),
            self.ident.clone(),
            self.algorithms.clone(),
            self.is_client.to_string(),
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
