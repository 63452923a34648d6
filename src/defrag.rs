//! IPv4 datagram defragmentation.
//!
//! Runs in front of the decode path: non-fragment packets pass through
//! untouched, fragments are held until the datagram is complete, then a
//! reconstructed frame is handed back. Duplicate or overlapping fragments
//! are resolved by keeping the first-seen bytes for any offset. Idle
//! entries expire after a configurable timeout.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use etherparse::Ipv4HeaderSlice;
use tracing::{debug, trace};

/// Fragments sharing this key belong to one datagram.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    protocol: u8,
}

#[derive(Debug)]
struct Fragment {
    /// Byte offset of this fragment's payload within the datagram.
    offset: usize,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Entry {
    fragments: Vec<Fragment>,
    /// Link-layer prefix + IP header from the first fragment (offset 0),
    /// reused for the reconstructed frame.
    head: Option<Vec<u8>>,
    /// Total datagram payload length, known once the last fragment arrives.
    total_len: Option<usize>,
    last_seen: DateTime<Utc>,
}

impl Entry {
    fn new(ts: DateTime<Utc>) -> Self {
        Self {
            fragments: Vec::new(),
            head: None,
            total_len: None,
            last_seen: ts,
        }
    }

    // A datagram is complete when the tail length is known and offsets
    // 0..total are covered by the held fragments.
    fn assemble(&self) -> Option<Vec<u8>> {
        let total = self.total_len?;
        let head = self.head.as_ref()?;

        let mut payload = vec![0u8; total];
        let mut covered = vec![false; total];

        for frag in &self.fragments {
            for (i, b) in frag.data.iter().enumerate() {
                let pos = frag.offset + i;
                if pos >= total {
                    break;
                }
                // first-seen bytes win for any offset
                if !covered[pos] {
                    payload[pos] = *b;
                    covered[pos] = true;
                }
            }
        }

        if !covered.iter().all(|c| *c) {
            return None;
        }

        Some(rebuild_frame(head, &payload))
    }
}

// The reconstructed frame reuses the stored link prefix + IP header with
// patched length, cleared fragment fields and a zeroed checksum. The head
// buffer carries the IP header length as its trailing tag byte.
fn rebuild_frame(head: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut frame = head.to_vec();
    let header_len = match frame.pop() {
        Some(b) => b as usize,
        None => return frame,
    };
    let ip_start = frame.len() - header_len;

    let total_len = (header_len + payload.len()) as u16;
    frame[ip_start + 2..ip_start + 4].copy_from_slice(&total_len.to_be_bytes());
    // clear flags + fragment offset
    frame[ip_start + 6] = 0;
    frame[ip_start + 7] = 0;
    // checksum is stale after patching, zero it
    frame[ip_start + 10] = 0;
    frame[ip_start + 11] = 0;

    frame.extend_from_slice(payload);
    frame
}

/// Datagram-level IPv4 reassembly keyed by `(src, dst, id, proto)`.
pub struct Ipv4Defragmenter {
    entries: HashMap<FragmentKey, Entry>,
    timeout: Duration,
    /// Completed datagrams handed back to the decode path.
    pub datagrams_reassembled: u64,
    /// Fragments currently held.
    pub fragments_held: u64,
}

impl Ipv4Defragmenter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
            datagrams_reassembled: 0,
            fragments_held: 0,
        }
    }

    /// Feed one link-layer frame. Returns the frame to decode (possibly a
    /// reconstructed datagram), or `None` when the fragment was absorbed.
    pub fn process(&mut self, frame: &[u8], ts: DateTime<Utc>) -> Option<Vec<u8>> {
        let ip_start = ip_offset(frame)?;
        let header = match Ipv4HeaderSlice::from_slice(&frame[ip_start..]) {
            Ok(h) => h,
            // not IPv4 or malformed: let the decode path handle it
            Err(_) => return Some(frame.to_vec()),
        };

        let more_fragments = header.more_fragments();
        let frag_offset = header.fragments_offset().value() as usize * 8;
        if !more_fragments && frag_offset == 0 {
            return Some(frame.to_vec());
        }

        self.expire(ts);

        let key = FragmentKey {
            src: header.source_addr(),
            dst: header.destination_addr(),
            id: header.identification(),
            protocol: header.protocol().0,
        };

        let header_len = header.ihl() as usize * 4;
        let payload_start = ip_start + header_len;
        if frame.len() < payload_start {
            return Some(frame.to_vec());
        }
        let payload = &frame[payload_start..];

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(ts));
        entry.last_seen = ts;

        if frag_offset == 0 && entry.head.is_none() {
            // remember link prefix + IP header, tagging the header length
            let mut head = frame[..payload_start].to_vec();
            head.push(header_len as u8);
            entry.head = Some(head);
        }
        if !more_fragments {
            entry.total_len = Some(frag_offset + payload.len());
        }

        entry.fragments.push(Fragment {
            offset: frag_offset,
            data: payload.to_vec(),
        });
        self.fragments_held += 1;

        if let Some(frame) = entry.assemble() {
            trace!(id = key.id, "datagram reassembled");
            self.fragments_held -= entry.fragments.len() as u64;
            self.entries.remove(&key);
            self.datagrams_reassembled += 1;
            return Some(frame);
        }

        None
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::seconds(30));
        let before = self.entries.len();
        self.entries.retain(|_, e| now - e.last_seen <= timeout);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(dropped, "expired incomplete fragment entries");
        }
    }

    /// Number of datagrams currently being assembled.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

fn ip_offset(frame: &[u8]) -> Option<usize> {
    let mut offset = 14;
    if frame.len() < offset {
        return None;
    }
    let mut ether_type = u16::from_be_bytes([frame[12], frame[13]]);
    while ether_type == 0x8100 || ether_type == 0x88a8 {
        if frame.len() < offset + 4 {
            return None;
        }
        ether_type = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += 4;
    }
    if ether_type != 0x0800 {
        return None;
    }
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Build a raw fragment frame by hand so the flags/offset fields are
    // exactly controlled.
    fn fragment(id: u16, frag_offset_bytes: usize, more: bool, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08; // IPv4

        let total_len = (20 + payload.len()) as u16;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[4..6].copy_from_slice(&id.to_be_bytes());
        let frag_field =
            ((more as u16) << 13) | ((frag_offset_bytes / 8) as u16 & 0x1fff);
        ip[6..8].copy_from_slice(&frag_field.to_be_bytes());
        ip[8] = 64; // ttl
        ip[9] = 17; // udp
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        frame.extend_from_slice(&ip);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_passthrough_unfragmented() {
        let mut defrag = Ipv4Defragmenter::new(Duration::from_secs(30));
        let frame = fragment(1, 0, false, b"hello");
        let out = defrag.process(&frame, Utc::now()).unwrap();
        assert_eq!(out, frame);
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn test_two_fragment_reassembly() {
        let mut defrag = Ipv4Defragmenter::new(Duration::from_secs(30));
        let now = Utc::now();

        let first = fragment(7, 0, true, &[0xaa; 16]);
        let second = fragment(7, 16, false, &[0xbb; 8]);

        assert!(defrag.process(&first, now).is_none());
        let full = defrag.process(&second, now).expect("reassembled");

        // 14 link + 20 ip + 24 payload
        assert_eq!(full.len(), 58);
        assert_eq!(&full[34..50], &[0xaa; 16]);
        assert_eq!(&full[50..58], &[0xbb; 8]);

        // flags cleared, length patched
        assert_eq!(full[20], 0);
        assert_eq!(full[21], 0);
        assert_eq!(u16::from_be_bytes([full[16], full[17]]), 44);
        assert_eq!(defrag.datagrams_reassembled, 1);
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn test_out_of_order_fragments() {
        let mut defrag = Ipv4Defragmenter::new(Duration::from_secs(30));
        let now = Utc::now();

        assert!(defrag
            .process(&fragment(9, 16, false, &[2u8; 8]), now)
            .is_none());
        let full = defrag
            .process(&fragment(9, 0, true, &[1u8; 16]), now)
            .expect("reassembled");
        assert_eq!(&full[34..50], &[1u8; 16]);
        assert_eq!(&full[50..58], &[2u8; 8]);
    }

    #[test]
    fn test_duplicate_fragment_first_seen_wins() {
        let mut defrag = Ipv4Defragmenter::new(Duration::from_secs(30));
        let now = Utc::now();

        assert!(defrag
            .process(&fragment(3, 0, true, &[0x11; 8]), now)
            .is_none());
        // duplicate of the first fragment with different bytes
        assert!(defrag
            .process(&fragment(3, 0, true, &[0x99; 8]), now)
            .is_none());
        let full = defrag
            .process(&fragment(3, 8, false, &[0x22; 8]), now)
            .expect("reassembled");
        assert_eq!(&full[34..42], &[0x11; 8]);
    }

    #[test]
    fn test_idle_entry_expires() {
        let mut defrag = Ipv4Defragmenter::new(Duration::from_secs(1));
        let start = Utc::now();

        assert!(defrag
            .process(&fragment(5, 0, true, &[1u8; 8]), start)
            .is_none());
        assert_eq!(defrag.pending(), 1);

        // a later unrelated fragment triggers expiry of the stale entry
        let later = start + chrono::Duration::seconds(10);
        assert!(defrag
            .process(&fragment(6, 0, true, &[1u8; 8]), later)
            .is_none());
        assert_eq!(defrag.pending(), 1);
    }
}
