//! Per-connection TCP reassembly state.
//!
//! A connection holds two half-connections, one per direction. Each half
//! keeps a cursor of the next expected sequence number and a sorted queue
//! of out-of-order segments; contiguous bytes are committed to the
//! direction's stream channel as soon as they become available.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

/// How long a live capture waits on a saturated stream reader before
/// dropping the segment; file replay blocks instead.
const LIVE_SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Direction of a fragment relative to the connection initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn reverse(&self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// A chunk of committed stream bytes handed to a stream reader.
#[derive(Debug, Clone)]
pub struct StreamFragment {
    pub direction: Direction,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Simple TCP connection state machine:
/// closed -> syn-sent -> established -> fin-wait -> closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    #[default]
    Closed,
    SynSent,
    Established,
    FinWait,
    Terminated,
}

impl TcpState {
    /// Advance the state machine for an observed segment.
    pub fn advance(&mut self, syn: bool, ack: bool, fin: bool, rst: bool) {
        *self = match (*self, syn, ack, fin, rst) {
            (_, _, _, _, true) => TcpState::Terminated,
            (TcpState::Closed, true, false, _, _) => TcpState::SynSent,
            (TcpState::SynSent, true, true, _, _) => TcpState::Established,
            (TcpState::SynSent, false, true, _, _) => TcpState::Established,
            (TcpState::Established, _, _, true, _) => TcpState::FinWait,
            (TcpState::FinWait, _, _, true, _) => TcpState::Terminated,
            // data on an unseen connection counts as established
            (TcpState::Closed, false, _, false, _) => TcpState::Established,
            (s, ..) => s,
        };
    }
}

/// Sanity checks applied to each segment before reassembly.
///
/// Segments failing the check are dropped and counted rather than
/// corrupting the stream.
#[derive(Debug, Default)]
pub struct OptionChecker {
    pub rejected: u64,
}

impl OptionChecker {
    /// A single segment payload can never legitimately exceed the maximum
    /// IP datagram size.
    pub fn accept(&mut self, payload_len: usize) -> bool {
        if payload_len > 65535 {
            self.rejected += 1;
            return false;
        }
        true
    }
}

/// Counters describing how cleanly one direction reassembled.
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfStats {
    /// Bytes intentionally dropped due to unrecoverable gaps.
    pub skipped_bytes: u64,
    /// Bytes that arrived more than once.
    pub overlap_bytes: u64,
    /// Overlaps where the duplicate bytes differed from what was kept.
    pub overlap_conflicts: u64,
    /// Total bytes committed to the stream.
    pub committed_bytes: u64,
    pub segments: u64,
}

struct PendingSegment {
    data: Vec<u8>,
    timestamp: DateTime<Utc>,
}

/// One direction of a connection: cursor + out-of-order queue.
pub struct HalfConnection {
    direction: Direction,
    ident: String,
    /// Sequence number base; queue keys are relative to this.
    base: u32,
    /// Next expected relative sequence number, `None` until initialized.
    expected: Option<u64>,
    pending: BTreeMap<u64, PendingSegment>,
    sender: Option<Sender<StreamFragment>>,
    keep_newer: bool,
    pending_limit: usize,
    live: bool,
    /// Set once FIN or RST was seen in this direction.
    pub terminal: bool,
    pub stats: HalfStats,
}

impl HalfConnection {
    pub fn new(
        direction: Direction,
        ident: String,
        sender: Sender<StreamFragment>,
        keep_newer: bool,
        pending_limit: usize,
        live: bool,
    ) -> Self {
        Self {
            direction,
            ident,
            base: 0,
            expected: None,
            pending: BTreeMap::new(),
            sender: Some(sender),
            keep_newer,
            pending_limit: pending_limit.max(1),
            live,
            terminal: false,
            stats: HalfStats::default(),
        }
    }

    /// Process one segment of this direction.
    pub fn insert(&mut self, seq: u32, syn: bool, data: &[u8], ts: DateTime<Utc>) {
        self.stats.segments += 1;

        let expected = match self.expected {
            Some(e) => e,
            None => {
                // first segment initializes the cursor; a SYN consumes one
                // sequence number
                self.base = if syn { seq.wrapping_add(1) } else { seq };
                self.expected = Some(0);
                0
            }
        };

        if data.is_empty() {
            return;
        }

        // payload bytes of a SYN segment start one past the SYN's own
        // sequence number
        let data_seq = if syn { seq.wrapping_add(1) } else { seq };
        let rel = u64::from(data_seq.wrapping_sub(self.base));

        if rel == expected {
            self.commit(data.to_vec(), ts);
            self.drain();
            return;
        }

        if rel < expected {
            // partial or total overlap with already-committed bytes; the
            // committed prefix cannot be rewritten, only the tail is new
            let overlap = (expected - rel).min(data.len() as u64);
            self.stats.overlap_bytes += overlap;
            if (data.len() as u64) > overlap {
                self.commit(data[overlap as usize..].to_vec(), ts);
                self.drain();
            }
            return;
        }

        // future segment: queue it
        self.queue(rel, data, ts);

        if self.pending.len() > self.pending_limit {
            self.declare_gap();
        }
    }

    // Insert an out-of-order segment, resolving overlaps with already
    // queued ones according to the configured policy.
    fn queue(&mut self, rel: u64, data: &[u8], ts: DateTime<Utc>) {
        let mut rel = rel;
        let mut data = data.to_vec();

        // duplicate start offset: keep the longer segment; on equal
        // lengths with differing payload keep the first seen
        if let Some(existing) = self.pending.get(&rel) {
            let overlap = existing.data.len().min(data.len()) as u64;
            self.stats.overlap_bytes += overlap;
            if existing.data.len() >= data.len() {
                if existing.data[..data.len()] != data[..] {
                    self.stats.overlap_conflicts += 1;
                    if self.keep_newer && existing.data.len() == data.len() {
                        // same span, newer payload wins
                        self.pending.insert(
                            rel,
                            PendingSegment {
                                data,
                                timestamp: ts,
                            },
                        );
                    }
                }
                return;
            }
            // new segment is longer, replaces the queued one
            if data[..existing.data.len()] != existing.data[..] {
                self.stats.overlap_conflicts += 1;
            }
            self.pending.insert(
                rel,
                PendingSegment {
                    data,
                    timestamp: ts,
                },
            );
            return;
        }

        // head overlap with a queued predecessor
        if let Some((prev_rel, prev)) = self.pending.range_mut(..rel).next_back() {
            let prev_end = prev_rel + prev.data.len() as u64;
            if prev_end > rel {
                let overlap = (prev_end - rel).min(data.len() as u64);
                self.stats.overlap_bytes += overlap;
                self.stats.overlap_conflicts += 1;
                if self.keep_newer {
                    // trim the predecessor's tail so the new bytes win
                    prev.data.truncate((rel - prev_rel) as usize);
                } else {
                    // trim our head, the queued bytes win
                    if overlap as usize >= data.len() {
                        return;
                    }
                    data.drain(..overlap as usize);
                    rel += overlap;
                }
            }
        }

        // tail overlap with queued successors
        let end = rel + data.len() as u64;
        let covered: Vec<u64> = self
            .pending
            .range(rel..end)
            .map(|(k, _)| *k)
            .collect();
        for key in covered {
            let seg_len = self.pending[&key].data.len() as u64;
            let overlap = (end - key).min(seg_len);
            self.stats.overlap_bytes += overlap;
            self.stats.overlap_conflicts += 1;
            if self.keep_newer {
                if key + seg_len <= end {
                    // fully covered by the newer segment
                    self.pending.remove(&key);
                } else {
                    // trim the successor's head and re-key it
                    let mut seg = match self.pending.remove(&key) {
                        Some(s) => s,
                        None => continue,
                    };
                    seg.data.drain(..overlap as usize);
                    self.pending.insert(key + overlap, seg);
                }
            } else {
                // older queued bytes win: stop our data at the successor
                data.truncate((key - rel) as usize);
                break;
            }
        }

        if !data.is_empty() {
            self.pending.insert(
                rel,
                PendingSegment {
                    data,
                    timestamp: ts,
                },
            );
        }
    }

    // Commit queued segments that have become contiguous.
    fn drain(&mut self) {
        loop {
            let expected = match self.expected {
                Some(e) => e,
                None => return,
            };
            let first = match self.pending.keys().next().copied() {
                Some(k) => k,
                None => return,
            };
            if first > expected {
                return;
            }

            let seg = match self.pending.remove(&first) {
                Some(s) => s,
                None => return,
            };
            let overlap = expected - first;
            if (seg.data.len() as u64) <= overlap {
                self.stats.overlap_bytes += seg.data.len() as u64;
                continue;
            }
            if overlap > 0 {
                self.stats.overlap_bytes += overlap;
            }
            self.commit(seg.data[overlap as usize..].to_vec(), seg.timestamp);
        }
    }

    /// Give up waiting for the lowest missing range: advance the cursor to
    /// the first queued segment and record the skipped bytes.
    pub fn declare_gap(&mut self) {
        let expected = match self.expected {
            Some(e) => e,
            None => return,
        };
        let first = match self.pending.keys().next().copied() {
            Some(k) => k,
            None => return,
        };
        if first <= expected {
            self.drain();
            return;
        }

        let skipped = first - expected;
        self.stats.skipped_bytes += skipped;
        debug!(
            target: "reassembly",
            ident = %self.ident,
            skipped,
            "declaring gap"
        );
        self.expected = Some(first);
        self.drain();
    }

    fn commit(&mut self, data: Vec<u8>, ts: DateTime<Utc>) {
        let len = data.len() as u64;
        self.expected = self.expected.map(|e| e + len);
        self.stats.committed_bytes += len;

        if let Some(sender) = &self.sender {
            let fragment = StreamFragment {
                direction: self.direction,
                data,
                timestamp: ts,
            };
            if self.live {
                // a live source cannot be paused: drop the segment if
                // the stream reader stays saturated
                if sender.send_timeout(fragment, LIVE_SEND_TIMEOUT).is_err() {
                    warn!(target: "reassembly", ident = %self.ident, "stream reader saturated, dropping segment");
                }
            } else {
                // block until the stream reader catches up; backpressure
                // naturally slows a pcap file source
                if sender.send(fragment).is_err() {
                    trace!(target: "reassembly", ident = %self.ident, "stream reader gone");
                }
            }
        }
    }

    /// Flush all queued segments regardless of gaps and close the stream.
    pub fn flush(&mut self) {
        while !self.pending.is_empty() {
            self.declare_gap();
        }
        self.sender = None;
    }

    /// True once there is no more pending data.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn half(keep_newer: bool) -> (HalfConnection, crossbeam_channel::Receiver<StreamFragment>) {
        let (tx, rx) = unbounded();
        (
            HalfConnection::new(
                Direction::ClientToServer,
                "test".into(),
                tx,
                keep_newer,
                64,
                false,
            ),
            rx,
        )
    }

    fn collect(rx: &crossbeam_channel::Receiver<StreamFragment>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.extend_from_slice(&f.data);
        }
        out
    }

    #[test]
    fn test_in_order_delivery() {
        let (mut h, rx) = half(true);
        let now = Utc::now();
        h.insert(1000, false, b"hello ", now);
        h.insert(1006, false, b"world", now);
        assert_eq!(collect(&rx), b"hello world");
        assert_eq!(h.stats.committed_bytes, 11);
        assert_eq!(h.stats.skipped_bytes, 0);
    }

    #[test]
    fn test_out_of_order_reordering() {
        let (mut h, rx) = half(true);
        let now = Utc::now();
        h.insert(1000, false, b"abc", now);
        h.insert(1006, false, b"ghi", now);
        assert_eq!(collect(&rx), b"abc");
        h.insert(1003, false, b"def", now);
        assert_eq!(collect(&rx), b"defghi");
    }

    #[test]
    fn test_syn_consumes_sequence_number() {
        let (mut h, rx) = half(true);
        let now = Utc::now();
        h.insert(999, true, b"", now);
        h.insert(1000, false, b"data", now);
        assert_eq!(collect(&rx), b"data");
    }

    #[test]
    fn test_retransmission_counted_as_overlap() {
        let (mut h, rx) = half(true);
        let now = Utc::now();
        h.insert(1000, false, b"abcd", now);
        h.insert(1000, false, b"abcd", now);
        assert_eq!(collect(&rx), b"abcd");
        assert_eq!(h.stats.overlap_bytes, 4);
        assert_eq!(h.stats.overlap_conflicts, 0);
    }

    #[test]
    fn test_partial_overlap_with_committed() {
        let (mut h, rx) = half(true);
        let now = Utc::now();
        h.insert(1000, false, b"abcd", now);
        // 2 old bytes + 2 new
        h.insert(1002, false, b"cdEF", now);
        assert_eq!(collect(&rx), b"abcdEF");
        assert_eq!(h.stats.overlap_bytes, 2);
    }

    #[test]
    fn test_queued_overlap_keep_newer() {
        let (mut h, rx) = half(true);
        let now = Utc::now();
        h.insert(999, true, b"", now); // cursor starts at 1000
        // queue two conflicting versions of the same future range
        h.insert(1004, false, b"XXXX", now);
        h.insert(1004, false, b"YYYY", now);
        h.insert(1000, false, b"head", now);
        assert_eq!(collect(&rx), b"headYYYY");
        assert_eq!(h.stats.overlap_conflicts, 1);
        assert_eq!(h.stats.overlap_bytes, 4);
    }

    #[test]
    fn test_queued_overlap_keep_older() {
        let (mut h, rx) = half(false);
        let now = Utc::now();
        h.insert(999, true, b"", now);
        h.insert(1004, false, b"XXXX", now);
        h.insert(1004, false, b"YYYY", now);
        h.insert(1000, false, b"head", now);
        assert_eq!(collect(&rx), b"headXXXX");
        assert_eq!(h.stats.overlap_conflicts, 1);
    }

    #[test]
    fn test_equal_seq_longer_wins() {
        let (mut h, rx) = half(false);
        let now = Utc::now();
        h.insert(999, true, b"", now);
        h.insert(1004, false, b"ab", now);
        h.insert(1004, false, b"abcdef", now);
        h.insert(1000, false, b"head", now);
        assert_eq!(collect(&rx), b"headabcdef");
    }

    #[test]
    fn test_gap_declared_on_flush() {
        let (mut h, rx) = half(true);
        let now = Utc::now();
        h.insert(1000, false, b"abcd", now);
        // 4-byte hole at 1004
        h.insert(1008, false, b"efgh", now);
        assert_eq!(collect(&rx), b"abcd");

        h.flush();
        assert_eq!(collect(&rx), b"efgh");
        assert_eq!(h.stats.skipped_bytes, 4);
    }

    #[test]
    fn test_gap_declared_on_queue_pressure() {
        let (tx, rx) = unbounded();
        let mut h = HalfConnection::new(Direction::ClientToServer, "t".into(), tx, true, 2, false);
        let now = Utc::now();
        h.insert(1000, false, b"ab", now);
        // hole at 1002, then three queued segments exceed the limit of 2
        h.insert(1004, false, b"cd", now);
        h.insert(1008, false, b"ef", now);
        h.insert(1012, false, b"gh", now);

        let delivered = collect(&rx);
        assert!(delivered.starts_with(b"ab"));
        assert!(h.stats.skipped_bytes >= 2);
    }

    #[test]
    fn test_sequence_wraparound() {
        let (mut h, rx) = half(true);
        let now = Utc::now();
        h.insert(u32::MAX - 1, false, b"ab", now);
        h.insert(0, false, b"cd", now);
        assert_eq!(collect(&rx), b"abcd");
        assert_eq!(h.stats.skipped_bytes, 0);
    }

    #[test]
    fn test_fsm_transitions() {
        let mut state = TcpState::Closed;
        state.advance(true, false, false, false);
        assert_eq!(state, TcpState::SynSent);
        state.advance(true, true, false, false);
        assert_eq!(state, TcpState::Established);
        state.advance(false, true, true, false);
        assert_eq!(state, TcpState::FinWait);
        state.advance(false, true, true, false);
        assert_eq!(state, TcpState::Terminated);
    }

    #[test]
    fn test_fsm_rst_terminates() {
        let mut state = TcpState::Established;
        state.advance(false, false, false, true);
        assert_eq!(state, TcpState::Terminated);
    }
}
