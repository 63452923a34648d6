//! Transport-layer decoders.

use etherparse::{TcpSlice, UdpSlice};

use crate::types::{Record, Tcp, TcpOption, Udp};
use crate::utils::entropy;

/// Decode a TCP segment header. `payload` is the segment payload (the IP
/// payload past the TCP header).
pub fn decode_tcp(tcp: &TcpSlice, payload: &[u8], ts: &str, include_payload: bool) -> Option<Record> {
    Some(
        Tcp {
            timestamp: ts.to_string(),
            src_port: tcp.source_port() as u32,
            dst_port: tcp.destination_port() as u32,
            seq_num: tcp.sequence_number(),
            ack_num: tcp.acknowledgment_number(),
            data_offset: tcp.data_offset() as u32,
            fin: tcp.fin(),
            syn: tcp.syn(),
            rst: tcp.rst(),
            psh: tcp.psh(),
            ack: tcp.ack(),
            urg: tcp.urg(),
            ece: tcp.ece(),
            cwr: tcp.cwr(),
            ns: tcp.ns(),
            window: tcp.window_size() as u32,
            checksum: tcp.checksum() as u32,
            urgent: tcp.urgent_pointer() as u32,
            options: parse_tcp_options(tcp.options()),
            payload_entropy: entropy(payload),
            payload_size: payload.len() as u32,
            payload: if include_payload {
                payload.to_vec()
            } else {
                Vec::new()
            },
            context: None,
        }
        .into(),
    )
}

// Walk the raw options bytes: kind, then length for kinds above 1.
fn parse_tcp_options(mut data: &[u8]) -> Vec<TcpOption> {
    let mut options = Vec::new();
    while !data.is_empty() {
        let kind = data[0];
        match kind {
            0 => {
                // end of options list
                options.push(TcpOption {
                    kind: 0,
                    length: 1,
                    data: Vec::new(),
                });
                break;
            }
            1 => {
                options.push(TcpOption {
                    kind: 1,
                    length: 1,
                    data: Vec::new(),
                });
                data = &data[1..];
            }
            _ => {
                if data.len() < 2 {
                    break;
                }
                let len = data[1] as usize;
                if len < 2 || len > data.len() {
                    break;
                }
                options.push(TcpOption {
                    kind: kind as u32,
                    length: len as u32,
                    data: data[2..len].to_vec(),
                });
                data = &data[len..];
            }
        }
    }
    options
}

/// Decode a UDP datagram header.
pub fn decode_udp(udp: &UdpSlice, payload: &[u8], ts: &str, include_payload: bool) -> Option<Record> {
    Some(
        Udp {
            timestamp: ts.to_string(),
            src_port: udp.source_port() as u32,
            dst_port: udp.destination_port() as u32,
            length: udp.length() as u32,
            checksum: udp.checksum() as u32,
            payload_entropy: entropy(payload),
            payload_size: payload.len() as u32,
            payload: if include_payload {
                payload.to_vec()
            } else {
                Vec::new()
            },
            context: None,
        }
        .into(),
    )
}
