//! Application-layer decoders for protocols identified per packet
//! (datagram protocols and usbmon captures).

use crate::types::{
    Bfd, Cip, DhcpOption, Dhcpv4, Dhcpv6, Dns, DnsQuestion, DnsResourceRecord, Record, Sip, Usb,
};
use crate::utils::{entropy, mac_to_string};

const DHCP_MAGIC: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

fn ipv4_str(b: &[u8]) -> String {
    format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
}

/// Decode a DHCPv4 message (UDP ports 67/68).
pub fn decode_dhcpv4(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 240 || data[236..240] != DHCP_MAGIC {
        return None;
    }

    let hlen = (data[2] as usize).min(16);
    let mut rec = Dhcpv4 {
        timestamp: ts.to_string(),
        operation: data[0] as u32,
        hardware_type: data[1] as u32,
        hardware_len: data[2] as u32,
        hardware_opts: data[3] as u32,
        xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        secs: u16::from_be_bytes([data[8], data[9]]) as u32,
        flags: u16::from_be_bytes([data[10], data[11]]) as u32,
        client_ip: ipv4_str(&data[12..16]),
        your_ip: ipv4_str(&data[16..20]),
        server_ip: ipv4_str(&data[20..24]),
        relay_ip: ipv4_str(&data[24..28]),
        client_hw_address: mac_to_string(&data[28..28 + hlen.max(1)]),
        server_name: null_terminated(&data[44..108]),
        file: null_terminated(&data[108..236]),
        ..Default::default()
    };

    let mut off = 240;
    while off < data.len() {
        let opt = data[off];
        match opt {
            0 => {
                off += 1;
            }
            255 => break,
            _ => {
                if off + 1 >= data.len() {
                    break;
                }
                let len = data[off + 1] as usize;
                if off + 2 + len > data.len() {
                    break;
                }
                let value = &data[off + 2..off + 2 + len];

                // option 55 is the parameter request list, kept separately
                // as the DHCP fingerprint
                if opt == 55 {
                    rec.fingerprint = value
                        .iter()
                        .map(|b| b.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                }

                rec.options.push(DhcpOption {
                    option_type: opt as u32,
                    length: len as u32,
                    data: printable_or_hex(value),
                });
                off += 2 + len;
            }
        }
    }

    Some(rec.into())
}

/// Decode a DHCPv6 message (UDP ports 546/547).
pub fn decode_dhcpv6(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 4 {
        return None;
    }

    let mut rec = Dhcpv6 {
        timestamp: ts.to_string(),
        msg_type: data[0] as u32,
        transaction_id: format!("{:02x}{:02x}{:02x}", data[1], data[2], data[3]),
        ..Default::default()
    };

    let mut off = 4;
    while off + 4 <= data.len() {
        let code = u16::from_be_bytes([data[off], data[off + 1]]);
        let len = u16::from_be_bytes([data[off + 2], data[off + 3]]) as usize;
        if off + 4 + len > data.len() {
            break;
        }
        rec.options.push(DhcpOption {
            option_type: code as u32,
            length: len as u32,
            data: printable_or_hex(&data[off + 4..off + 4 + len]),
        });
        off += 4 + len;
    }

    Some(rec.into())
}

fn null_terminated(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

fn printable_or_hex(data: &[u8]) -> String {
    if data.iter().all(|b| b.is_ascii_graphic() || *b == b' ') && !data.is_empty() {
        String::from_utf8_lossy(data).to_string()
    } else {
        data.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Decode a DNS message (UDP port 53).
pub fn decode_dns(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 12 {
        return None;
    }

    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qd = u16::from_be_bytes([data[4], data[5]]) as usize;
    let an = u16::from_be_bytes([data[6], data[7]]) as usize;
    let ns = u16::from_be_bytes([data[8], data[9]]) as usize;
    let ar = u16::from_be_bytes([data[10], data[11]]) as usize;

    let mut rec = Dns {
        timestamp: ts.to_string(),
        id: u16::from_be_bytes([data[0], data[1]]) as u32,
        qr: flags & 0x8000 != 0,
        op_code: ((flags >> 11) & 0x0f) as u32,
        authoritative: flags & 0x0400 != 0,
        truncated: flags & 0x0200 != 0,
        recursion_desired: flags & 0x0100 != 0,
        recursion_available: flags & 0x0080 != 0,
        response_code: (flags & 0x000f) as u32,
        ..Default::default()
    };

    let mut off = 12;
    for _ in 0..qd {
        let (name, next) = read_name(data, off)?;
        if next + 4 > data.len() {
            return None;
        }
        rec.questions.push(DnsQuestion {
            name,
            record_type: u16::from_be_bytes([data[next], data[next + 1]]) as u32,
            class: u16::from_be_bytes([data[next + 2], data[next + 3]]) as u32,
        });
        off = next + 4;
    }

    let mut truncated_sections = false;
    {
        let sections = [
            (an, &mut rec.answers),
            (ns, &mut rec.authorities),
            (ar, &mut rec.additionals),
        ];
        for (count, out) in sections {
            for _ in 0..count {
                match read_resource_record(data, off) {
                    Some((rr, next)) => {
                        out.push(rr);
                        off = next;
                    }
                    // tolerate truncated record sections, keep what was parsed
                    None => {
                        truncated_sections = true;
                        break;
                    }
                }
            }
            if truncated_sections {
                break;
            }
        }
    }

    Some(rec.into())
}

fn read_resource_record(data: &[u8], off: usize) -> Option<(DnsResourceRecord, usize)> {
    let (name, mut off) = read_name(data, off)?;
    if off + 10 > data.len() {
        return None;
    }

    let record_type = u16::from_be_bytes([data[off], data[off + 1]]);
    let class = u16::from_be_bytes([data[off + 2], data[off + 3]]);
    let ttl = u32::from_be_bytes([data[off + 4], data[off + 5], data[off + 6], data[off + 7]]);
    let rd_len = u16::from_be_bytes([data[off + 8], data[off + 9]]) as usize;
    off += 10;
    if off + rd_len > data.len() {
        return None;
    }
    let rdata = &data[off..off + rd_len];

    let rendered = match record_type {
        1 if rd_len == 4 => ipv4_str(rdata),
        28 if rd_len == 16 => {
            let mut arr = [0u8; 16];
            arr.copy_from_slice(rdata);
            std::net::Ipv6Addr::from(arr).to_string()
        }
        // NS, CNAME, PTR carry a domain name
        2 | 5 | 12 => read_name(data, off).map(|(n, _)| n).unwrap_or_default(),
        _ => printable_or_hex(rdata),
    };

    Some((
        DnsResourceRecord {
            name,
            record_type: record_type as u32,
            class: class as u32,
            ttl,
            data: rendered,
        },
        off + rd_len,
    ))
}

// Read a (possibly compressed) DNS name. Returns the name and the offset
// just past it in the original buffer.
fn read_name(data: &[u8], mut off: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    let mut jumps = 0;
    let mut end = None;

    loop {
        let len = *data.get(off)? as usize;
        if len == 0 {
            off += 1;
            break;
        }
        if len & 0xc0 == 0xc0 {
            // compression pointer
            let ptr = ((len & 0x3f) << 8) | *data.get(off + 1)? as usize;
            if end.is_none() {
                end = Some(off + 2);
            }
            jumps += 1;
            if jumps > 32 {
                return None; // pointer loop
            }
            off = ptr;
            continue;
        }
        let label = data.get(off + 1..off + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).to_string());
        off += 1 + len;
    }

    Some((labels.join("."), end.unwrap_or(off)))
}

/// Decode a SIP message (UDP port 5060).
pub fn decode_sip(data: &[u8], ts: &str) -> Option<Record> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");
    let first = lines.next()?;

    let mut rec = Sip {
        timestamp: ts.to_string(),
        ..Default::default()
    };

    if let Some(rest) = first.strip_prefix("SIP/") {
        // response: SIP/2.0 200 OK
        let mut parts = rest.splitn(3, ' ');
        rec.version = format!("SIP/{}", parts.next()?);
        rec.is_response = true;
        rec.response_code = parts.next()?.parse().ok()?;
        rec.response_status = parts.next().unwrap_or("").to_string();
    } else {
        // request: INVITE sip:bob@example.com SIP/2.0
        let mut parts = first.splitn(3, ' ');
        rec.method = parts.next()?.to_string();
        let _uri = parts.next()?;
        let version = parts.next()?;
        if !version.starts_with("SIP/") {
            return None;
        }
        rec.version = version.to_string();
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        rec.headers.push(line.to_string());
    }

    Some(rec.into())
}

/// Decode a BFD control packet (UDP port 3784).
pub fn decode_bfd(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 24 {
        return None;
    }

    let length = data[3] as usize;
    if length > data.len() {
        return None;
    }

    Some(
        Bfd {
            timestamp: ts.to_string(),
            version: (data[0] >> 5) as u32,
            diagnostic: (data[0] & 0x1f) as u32,
            state: (data[1] >> 6) as u32,
            detect_multiplier: data[2] as u32,
            my_discriminator: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            your_discriminator: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            desired_min_tx_interval: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            required_min_rx_interval: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            required_min_echo_rx_interval: u32::from_be_bytes([
                data[20], data[21], data[22], data[23],
            ]),
            context: None,
        }
        .into(),
    )
}

/// Decode a CIP message carried in an EtherNet/IP io datagram
/// (UDP ports 2222/44818).
pub fn decode_cip(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 2 {
        return None;
    }

    let service = data[0];
    let response = service & 0x80 != 0;

    let mut rec = Cip {
        timestamp: ts.to_string(),
        response,
        service_id: (service & 0x7f) as u32,
        ..Default::default()
    };

    if response {
        if data.len() < 4 {
            return None;
        }
        rec.status = data[2] as u32;
        let additional = data[3] as usize;
        if data.len() < 4 + additional * 2 {
            return None;
        }
        for i in 0..additional {
            rec.additional_status.push(u16::from_be_bytes([
                data[4 + i * 2],
                data[5 + i * 2],
            ]) as u32);
        }
        rec.data = data[4 + additional * 2..].to_vec();
    } else {
        // request path: walk 8-bit class / instance segments
        let path_words = data[1] as usize;
        let path_len = path_words * 2;
        if data.len() < 2 + path_len {
            return None;
        }
        let mut off = 2;
        while off + 1 < 2 + path_len {
            match data[off] {
                0x20 => rec.class_id = data[off + 1] as u32,
                0x24 => rec.instance_id = data[off + 1] as u32,
                _ => {}
            }
            off += 2;
        }
        rec.data = data[2 + path_len..].to_vec();
    }

    Some(rec.into())
}

/// Decode a Linux usbmon capture record (mmapped 64-byte URB header).
pub fn decode_usb(data: &[u8], ts: &str) -> Option<Record> {
    if data.len() < 64 {
        return None;
    }

    let payload = &data[64..];
    let setup_flag = data[14] == 0;
    let mut rec = Usb {
        timestamp: ts.to_string(),
        id: u64::from_le_bytes(data[0..8].try_into().ok()?),
        event_type: data[8] as u32,
        transfer_type: data[9] as u32,
        direction: (data[10] >> 7) as u32,
        endpoint_number: (data[10] & 0x7f) as u32,
        device_address: data[11] as u32,
        bus_id: u16::from_le_bytes([data[12], data[13]]) as u32,
        setup_flag,
        data_flag: data[15] == 0,
        status: i32::from_le_bytes(data[28..32].try_into().ok()?),
        urb_length: u32::from_le_bytes(data[32..36].try_into().ok()?),
        urb_data_length: u32::from_le_bytes(data[36..40].try_into().ok()?),
        payload_entropy: entropy(payload),
        payload_size: payload.len() as u32,
        payload: Vec::new(),
        ..Default::default()
    };

    if setup_flag {
        rec.bm_request_type = data[40] as u32;
        rec.b_request = data[41] as u32;
        rec.w_value = u16::from_le_bytes([data[42], data[43]]) as u32;
        rec.w_index = u16::from_le_bytes([data[44], data[45]]) as u32;
        rec.w_length = u16::from_le_bytes([data[46], data[47]]) as u32;
    }

    Some(rec.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "1580806571.988737";

    fn build_dns_query() -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&0x1234u16.to_be_bytes()); // id
        pkt.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
        pkt.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        pkt.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        pkt.extend_from_slice(&[7]);
        pkt.extend_from_slice(b"example");
        pkt.extend_from_slice(&[3]);
        pkt.extend_from_slice(b"com");
        pkt.push(0);
        pkt.extend_from_slice(&1u16.to_be_bytes()); // A
        pkt.extend_from_slice(&1u16.to_be_bytes()); // IN
        pkt
    }

    #[test]
    fn test_decode_dns_query() {
        match decode_dns(&build_dns_query(), TS) {
            Some(Record::Dns(d)) => {
                assert_eq!(d.id, 0x1234);
                assert!(!d.qr);
                assert!(d.recursion_desired);
                assert_eq!(d.questions.len(), 1);
                assert_eq!(d.questions[0].name, "example.com");
                assert_eq!(d.questions[0].record_type, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_dns_response_with_compression() {
        let mut pkt = build_dns_query();
        pkt[2] = 0x81; // QR + RD
        pkt[3] = 0x80; // RA
        pkt[7] = 1; // ancount
        pkt.extend_from_slice(&[0xc0, 0x0c]); // pointer to question name
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&300u32.to_be_bytes());
        pkt.extend_from_slice(&4u16.to_be_bytes());
        pkt.extend_from_slice(&[93, 184, 216, 34]);

        match decode_dns(&pkt, TS) {
            Some(Record::Dns(d)) => {
                assert!(d.qr);
                assert_eq!(d.answers.len(), 1);
                assert_eq!(d.answers[0].name, "example.com");
                assert_eq!(d.answers[0].data, "93.184.216.34");
                assert_eq!(d.answers[0].ttl, 300);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_dhcpv4_discover() {
        let mut pkt = vec![0u8; 236];
        pkt[0] = 1; // BOOTREQUEST
        pkt[1] = 1; // ethernet
        pkt[2] = 6;
        pkt[4..8].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        pkt[28..34].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        pkt.extend_from_slice(&DHCP_MAGIC);
        pkt.extend_from_slice(&[53, 1, 1]); // message type: discover
        pkt.extend_from_slice(&[55, 3, 1, 3, 6]); // parameter request list
        pkt.push(255);

        match decode_dhcpv4(&pkt, TS) {
            Some(Record::Dhcpv4(d)) => {
                assert_eq!(d.operation, 1);
                assert_eq!(d.xid, 0xdeadbeef);
                assert_eq!(d.client_hw_address, "aa:bb:cc:dd:ee:ff");
                assert_eq!(d.fingerprint, "1,3,6");
                assert_eq!(d.options.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_sip_request() {
        let msg = b"INVITE sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/UDP host\r\nFrom: alice\r\n\r\n";
        match decode_sip(msg, TS) {
            Some(Record::Sip(s)) => {
                assert_eq!(s.method, "INVITE");
                assert!(!s.is_response);
                assert_eq!(s.headers.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_sip_response() {
        let msg = b"SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP host\r\n\r\n";
        match decode_sip(msg, TS) {
            Some(Record::Sip(s)) => {
                assert!(s.is_response);
                assert_eq!(s.response_code, 200);
                assert_eq!(s.response_status, "OK");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_bfd() {
        let mut pkt = vec![0u8; 24];
        pkt[0] = 0x20; // version 1
        pkt[1] = 0xc0; // state up
        pkt[2] = 3;
        pkt[3] = 24;
        pkt[4..8].copy_from_slice(&1u32.to_be_bytes());
        pkt[8..12].copy_from_slice(&2u32.to_be_bytes());

        match decode_bfd(&pkt, TS) {
            Some(Record::Bfd(b)) => {
                assert_eq!(b.version, 1);
                assert_eq!(b.state, 3);
                assert_eq!(b.my_discriminator, 1);
                assert_eq!(b.your_discriminator, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
