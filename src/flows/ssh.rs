//! SSH flow reader: ident parsing and HASSH handshake fingerprinting.
//!
//! Only the leading bytes of each direction are inspected: enough for the
//! ident line (at most 255 bytes) plus the KEXINIT message (usually
//! 1200-1700 bytes). Everything after the key exchange is encrypted and
//! carries no fingerprintable material.

use std::sync::Arc;

use regex::Regex;
use tracing::trace;

use crate::profile::SERVICE_SSH;
use crate::reassembly::{ConnectionSummary, Direction, StreamDecoder, StreamFragment};
use crate::types::{Record, Software, Ssh};
use crate::utils::reverse_ident;

use super::{direction_bytes, FlowContext};

/// Upper bound on inspected bytes per direction: ident + KEXINIT.
const HANDSHAKE_BYTES: usize = 2255;

/// SSH_MSG_KEXINIT message number.
const MSG_KEXINIT: u8 = 0x14;

/// Parsed `SSH-2.0-Product_1.2p3 os` ident line.
#[derive(Debug, Clone, PartialEq)]
pub struct SshIdent {
    pub ssh_version: String,
    pub product: String,
    pub version: String,
    pub os: String,
}

/// The KEXINIT algorithm name-lists needed for HASSH.
#[derive(Debug, Default, Clone)]
pub struct KexInit {
    pub kex_algorithms: String,
    pub ciphers_client_server: String,
    pub macs_client_server: String,
    pub compression_client_server: String,
}

impl KexInit {
    /// The canonical string the HASSH digest is computed from.
    pub fn hassh_input(&self) -> String {
        format!(
            "{};{};{};{}",
            self.kex_algorithms,
            self.ciphers_client_server,
            self.macs_client_server,
            self.compression_client_server
        )
    }

    /// MD5 hex digest plus the raw input string.
    pub fn hassh(&self) -> (String, String) {
        let input = self.hassh_input();
        (format!("{:x}", md5::compute(input.as_bytes())), input)
    }
}

/// Stateful SSH reader for one connection.
pub struct SshReader {
    ctx: Arc<FlowContext>,
    re_ident: Regex,
}

impl SshReader {
    pub fn new(ctx: Arc<FlowContext>) -> Self {
        Self {
            ctx,
            re_ident: Regex::new(r"^(SSH-\d\.\d?)-([\w.]*)_([\d.\w]+)\s?(\w*)")
                .expect("static regex"),
        }
    }

    fn parse_ident(&self, line: &str) -> Option<SshIdent> {
        let caps = self.re_ident.captures(line)?;
        Some(SshIdent {
            ssh_version: caps[1].to_string(),
            product: caps[2].to_string(),
            version: caps[3].to_string(),
            os: caps.get(4).map(|m| m.as_str()).unwrap_or("").to_string(),
        })
    }

    fn process_direction(
        &self,
        summary: &ConnectionSummary,
        data: &[u8],
        is_client: bool,
    ) -> Vec<Software> {
        let mut software = Vec::new();
        if data.is_empty() {
            return software;
        }

        let entity = if is_client { "client" } else { "server" };
        let flow = if is_client {
            summary.ident.clone()
        } else {
            reverse_ident(&summary.ident)
        };

        let (ident_line, rest) = split_ident(data);
        let ident_line = ident_line.trim().to_string();

        if let Some(ident) = self.parse_ident(&ident_line) {
            software.push(Software {
                timestamp: summary.timestamp.clone(),
                product: ident.product.clone(),
                version: ident.version.clone(),
                source_name: format!("SSH {} Ident", entity),
                source_data: ident_line.clone(),
                service: SERVICE_SSH.into(),
                flows: vec![flow.clone()],
                notes: format!("SSH version: {} OS: {}", ident.ssh_version, ident.os),
                ..Default::default()
            });
        }

        let Some(kex) = find_kex_init(rest) else {
            trace!(ident = %summary.ident, entity, "no KEXINIT in handshake bytes");
            return software;
        };
        let (hash, raw) = kex.hassh();

        self.ctx.sinks.write(
            &Ssh {
                timestamp: summary.timestamp.clone(),
                hassh: hash.clone(),
                flow,
                ident: ident_line,
                algorithms: raw,
                is_client,
            }
            .into(),
        );

        software.extend(
            self.ctx
                .software
                .from_hassh(&summary.timestamp, &summary.ident, &hash),
        );
        software
    }
}

impl StreamDecoder for SshReader {
    fn decode(&mut self, summary: &ConnectionSummary, fragments: &[StreamFragment]) {
        let client = direction_bytes(fragments, Direction::ClientToServer, HANDSHAKE_BYTES);
        let server = direction_bytes(fragments, Direction::ServerToClient, HANDSHAKE_BYTES);

        let mut software = self.process_direction(summary, &client, true);
        software.extend(self.process_direction(summary, &server, false));

        self.ctx.register_software(software);
    }
}

// Split the CRLF-terminated ident line off the stream.
fn split_ident(data: &[u8]) -> (String, &[u8]) {
    match data.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => (
            String::from_utf8_lossy(&data[..pos]).to_string(),
            &data[pos + 2..],
        ),
        None => (String::from_utf8_lossy(data).to_string(), &[]),
    }
}

// Walk SSH binary packets until a KEXINIT message is found.
fn find_kex_init(mut data: &[u8]) -> Option<KexInit> {
    // a handful of packets at most before KEXINIT
    for _ in 0..8 {
        if data.len() < 6 {
            return None;
        }
        let packet_length =
            u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let padding = data[4] as usize;
        if packet_length < padding + 1 || packet_length > 65535 {
            return None;
        }

        let payload_len = packet_length - padding - 1;
        if data.len() < 5 + payload_len {
            return None;
        }
        let payload = &data[5..5 + payload_len];

        if payload.first() == Some(&MSG_KEXINIT) {
            return parse_kex_init(payload);
        }

        let advance = 4 + packet_length;
        if data.len() < advance {
            return None;
        }
        data = &data[advance..];
    }
    None
}

// KEXINIT payload: msg byte, 16-byte cookie, then the algorithm
// name-lists in fixed order.
fn parse_kex_init(payload: &[u8]) -> Option<KexInit> {
    let mut offset = 1 + 16;
    let mut next_list = || -> Option<String> {
        if payload.len() < offset + 4 {
            return None;
        }
        let len = u32::from_be_bytes([
            payload[offset],
            payload[offset + 1],
            payload[offset + 2],
            payload[offset + 3],
        ]) as usize;
        offset += 4;
        if payload.len() < offset + len {
            return None;
        }
        let s = String::from_utf8_lossy(&payload[offset..offset + len]).to_string();
        offset += len;
        Some(s)
    };

    let kex_algorithms = next_list()?;
    let _server_host_key = next_list()?;
    let ciphers_client_server = next_list()?;
    let _ciphers_server_client = next_list()?;
    let macs_client_server = next_list()?;
    let _macs_server_client = next_list()?;
    let compression_client_server = next_list()?;

    Some(KexInit {
        kex_algorithms,
        ciphers_client_server,
        macs_client_server,
        compression_client_server,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{read_records, test_context};
    use super::*;
    use chrono::Utc;

    fn summary() -> ConnectionSummary {
        ConnectionSummary {
            ident: "10.0.0.5:51000->10.0.0.9:22".into(),
            client_ip: "10.0.0.5".parse().unwrap(),
            client_port: 51000,
            server_ip: "10.0.0.9".parse().unwrap(),
            server_port: 22,
            first_packet: Utc::now(),
            timestamp: "1580806571.988737".into(),
            client_skipped: 0,
            server_skipped: 0,
            banner: Vec::new(),
        }
    }

    fn name_list(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    fn build_kexinit_packet(kex: &str, enc: &str, mac: &str, comp: &str) -> Vec<u8> {
        let mut payload = vec![MSG_KEXINIT];
        payload.extend_from_slice(&[0u8; 16]); // cookie
        payload.extend(name_list(kex));
        payload.extend(name_list("ssh-ed25519")); // host key algos
        payload.extend(name_list(enc));
        payload.extend(name_list(enc)); // s2c
        payload.extend(name_list(mac));
        payload.extend(name_list(mac)); // s2c
        payload.extend(name_list(comp));
        payload.extend(name_list(comp)); // s2c
        payload.extend(name_list("")); // languages
        payload.extend(name_list(""));

        let padding = 4u8;
        let packet_length = (payload.len() + padding as usize + 1) as u32;
        let mut packet = packet_length.to_be_bytes().to_vec();
        packet.push(padding);
        packet.extend_from_slice(&payload);
        packet.extend_from_slice(&vec![0u8; padding as usize]);
        packet
    }

    fn stream(ident: &str, packet: &[u8], direction: Direction) -> StreamFragment {
        let mut data = ident.as_bytes().to_vec();
        data.extend_from_slice(b"\r\n");
        data.extend_from_slice(packet);
        StreamFragment {
            direction,
            data,
            timestamp: Utc::now(),
        }
    }

    const KEX: &str = "curve25519-sha256,ecdh-sha2-nistp256";
    const ENC: &str = "chacha20-poly1305@openssh.com,aes128-ctr";
    const MAC: &str = "umac-64-etm@openssh.com,hmac-sha2-256";
    const COMP: &str = "none,zlib@openssh.com";

    #[test]
    fn test_ident_regex() {
        let dir = std::env::temp_dir().join("netaudit-ssh-ident");
        let reader = SshReader::new(test_context(&dir));

        let ident = reader
            .parse_ident("SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.1")
            .unwrap();
        assert_eq!(ident.ssh_version, "SSH-2.0");
        assert_eq!(ident.product, "OpenSSH");
        assert_eq!(ident.version, "8.2p1");
        assert_eq!(ident.os, "Ubuntu");

        assert!(reader.parse_ident("HTTP/1.1 200 OK").is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_hassh_digest_matches_definition() {
        let packet = build_kexinit_packet(KEX, ENC, MAC, COMP);
        let kex = find_kex_init(&packet).unwrap();
        let (hash, raw) = kex.hassh();

        let expected_input = format!("{};{};{};{}", KEX, ENC, MAC, COMP);
        assert_eq!(raw, expected_input);
        assert_eq!(hash, format!("{:x}", md5::compute(expected_input.as_bytes())));
    }

    #[test]
    fn test_ssh_records_per_direction() {
        let dir = std::env::temp_dir().join("netaudit-ssh-records");
        std::fs::remove_dir_all(&dir).ok();
        let ctx = test_context(&dir);
        let store = ctx.software.clone();
        let mut reader = SshReader::new(ctx);

        let packet = build_kexinit_packet(KEX, ENC, MAC, COMP);
        let fragments = vec![
            stream(
                "SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.1",
                &packet,
                Direction::ClientToServer,
            ),
            stream("SSH-2.0-OpenSSH_7.9", &packet, Direction::ServerToClient),
        ];
        reader.decode(&summary(), &fragments);

        let records = read_records(&dir, crate::types::RecordType::Ssh);
        assert_eq!(records.len(), 2);
        match (&records[0], &records[1]) {
            (Record::Ssh(client), Record::Ssh(server)) => {
                assert!(client.is_client);
                assert!(!server.is_client);
                assert_eq!(client.flow, "10.0.0.5:51000->10.0.0.9:22");
                assert_eq!(server.flow, "10.0.0.9:22->10.0.0.5:51000");
                assert_eq!(client.hassh, server.hassh);
                assert!(client.ident.starts_with("SSH-2.0-OpenSSH_8.2p1"));
            }
            other => panic!("unexpected {:?}", other),
        }

        // client ident registered a software product
        let products = store.snapshot();
        let openssh = products.iter().any(|r| match r {
            Record::Software(s) => s.product == "OpenSSH" && s.version == "8.2p1",
            _ => false,
        });
        assert!(openssh);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_kexinit_after_other_packet() {
        // an ignorable packet first, then KEXINIT
        let mut data = vec![0u8, 0, 0, 12, 10]; // length 12, padding 10
        data.push(0x15); // not KEXINIT
        data.extend_from_slice(&[0u8; 10]);
        data.extend(build_kexinit_packet(KEX, ENC, MAC, COMP));

        assert!(find_kex_init(&data).is_some());
    }

    #[test]
    fn test_garbage_yields_nothing() {
        assert!(find_kex_init(b"not ssh at all").is_none());
        assert!(find_kex_init(&[]).is_none());
    }
}
