//! Packet worker pool.
//!
//! Each worker owns one bounded channel of packet envelopes and decodes
//! synchronously: layer records are written to the sinks, the device
//! profile store is updated, and TCP segments are routed into the
//! reassembly pool. Packets are distributed round-robin by the collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender, TrySendError};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use tracing::{trace, warn};

use crate::decode::{LinkLayer, PacketDecoder};
use crate::profile::DeviceProfileStore;
use crate::reassembly::{StreamPool, WaitGroup};
use crate::sink::SinkSet;
use crate::utils::time_to_string;

use super::errlog::{ErrorLog, PcapSink};
use super::source::PacketEnvelope;

/// Timeout for handing a packet to a stuck worker during live capture.
const LIVE_DISPATCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything a worker needs to process packets.
pub struct WorkerContext {
    pub decoder: Arc<PacketDecoder>,
    pub pool: Arc<StreamPool>,
    pub sinks: Arc<SinkSet>,
    pub devices: Arc<DeviceProfileStore>,
    pub link: LinkLayer,
    pub unknown_pcap: Arc<PcapSink>,
    pub errors_pcap: Arc<PcapSink>,
    pub error_log: Arc<ErrorLog>,
    /// Packets fully processed by workers.
    pub packets_processed: Arc<AtomicU64>,
}

/// Round-robin pool of packet worker threads.
pub struct WorkerPool {
    senders: Vec<Sender<PacketEnvelope>>,
    wait: WaitGroup,
    next: usize,
    live: bool,
    /// Packets dropped on live dispatch timeouts.
    pub dropped: AtomicU64,
}

impl WorkerPool {
    /// Spawn `n` workers with the given per-worker queue depth.
    pub fn spawn(n: usize, queue_depth: usize, live: bool, ctx: Arc<WorkerContext>) -> Self {
        let wait = WaitGroup::default();
        let mut senders = Vec::with_capacity(n);

        for id in 0..n {
            let (tx, rx) = bounded::<PacketEnvelope>(queue_depth.max(1));
            senders.push(tx);

            let ctx = ctx.clone();
            let wait = wait.clone();
            wait.add(1);
            thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || {
                    for envelope in rx.iter() {
                        process_packet(&ctx, &envelope);
                    }
                    wait.done();
                })
                .expect("failed to spawn packet worker");
        }

        Self {
            senders,
            wait,
            next: 0,
            live,
            dropped: AtomicU64::new(0),
        }
    }

    /// Hand one packet to the next worker, round-robin. File sources
    /// block on a full queue (the source slows down naturally); live
    /// sources drop the packet after a timeout and log the flow.
    pub fn dispatch(&mut self, envelope: PacketEnvelope) {
        let sender = &self.senders[self.next];

        if self.live {
            match sender.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(envelope)) => {
                    match sender.send_timeout(envelope, LIVE_DISPATCH_TIMEOUT) {
                        Ok(()) => {}
                        Err(e) => {
                            let envelope = match e {
                                crossbeam_channel::SendTimeoutError::Timeout(v) => v,
                                crossbeam_channel::SendTimeoutError::Disconnected(v) => v,
                            };
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                worker = self.next,
                                flow = %describe_flow(&envelope.data),
                                "worker stuck, dropping packet"
                            );
                        }
                    }
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        } else if sender.send(envelope).is_err() {
            warn!(worker = self.next, "worker channel closed");
        }

        self.next = (self.next + 1) % self.senders.len();
    }

    /// Close all queues and wait for the workers to drain, best-effort
    /// 5 seconds per worker.
    pub fn shutdown(self) -> bool {
        let n = self.senders.len() as u32;
        drop(self.senders);
        self.wait.wait_timeout(Duration::from_secs(5) * n.max(1))
    }
}

fn process_packet(ctx: &WorkerContext, envelope: &PacketEnvelope) {
    let ts = time_to_string(envelope.timestamp);

    match ctx.decoder.decode(&envelope.data, envelope.timestamp, ctx.link) {
        Ok(decoded) => {
            for record in &decoded.records {
                ctx.sinks.write(record);
            }

            ctx.devices.update(&decoded, &ts, envelope.orig_len as u64);

            if decoded.unknown_layer {
                ctx.unknown_pcap.write(envelope);
            }

            if !decoded.error_tags.is_empty() {
                ctx.errors_pcap.write(envelope);
                for tag in &decoded.error_tags {
                    ctx.error_log.log(&ts, tag, &envelope.data);
                }
            }

            if let Some(segment) = decoded.tcp_segment {
                ctx.pool.process(segment);
            }
        }
        Err(e) => {
            trace!(error = %e, "packet decode failed");
            ctx.errors_pcap.write(envelope);
            ctx.error_log.log(&ts, &e.to_string(), &envelope.data);
        }
    }

    ctx.packets_processed.fetch_add(1, Ordering::Relaxed);
}

// Best-effort 5-tuple description of a raw frame for timeout logging.
fn describe_flow(data: &[u8]) -> String {
    let Ok(sliced) = SlicedPacket::from_ethernet(data) else {
        return "unparseable".into();
    };

    let (src, dst) = match &sliced.net {
        Some(InternetSlice::Ipv4(ip)) => (
            ip.header().source_addr().to_string(),
            ip.header().destination_addr().to_string(),
        ),
        Some(InternetSlice::Ipv6(ip)) => (
            ip.header().source_addr().to_string(),
            ip.header().destination_addr().to_string(),
        ),
        _ => return "non-ip".into(),
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(t)) => format!(
            "{}:{}->{}:{} (TCP)",
            src,
            t.source_port(),
            dst,
            t.destination_port()
        ),
        Some(TransportSlice::Udp(u)) => format!(
            "{}:{}->{}:{} (UDP)",
            src,
            u.source_port(),
            dst,
            u.destination_port()
        ),
        _ => format!("{}->{}", src, dst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::{DecoderFactory, ReassemblyConfig};
    use crate::resolvers::Resolvers;
    use crate::sink::WriterConfig;
    use crate::types::RecordType;
    use chrono::Utc;
    use etherparse::PacketBuilder;

    fn test_ctx(dir: &std::path::Path) -> Arc<WorkerContext> {
        std::fs::create_dir_all(dir).unwrap();
        let writer_config = WriterConfig {
            out_dir: dir.to_path_buf(),
            buffer: false,
            ..Default::default()
        };
        let sinks = Arc::new(
            SinkSet::create(
                &[RecordType::Ethernet, RecordType::IPv4, RecordType::Tcp],
                &writer_config,
            )
            .unwrap(),
        );
        let factory: DecoderFactory = Arc::new(|_, _| None);

        Arc::new(WorkerContext {
            decoder: Arc::new(PacketDecoder::new(false)),
            pool: Arc::new(StreamPool::new(ReassemblyConfig::default(), factory)),
            sinks,
            devices: Arc::new(DeviceProfileStore::new(Arc::new(Resolvers::embedded()))),
            link: LinkLayer::Ethernet,
            unknown_pcap: Arc::new(PcapSink::new(dir.join("unknown.pcap"))),
            errors_pcap: Arc::new(PcapSink::new(dir.join("errors.pcap"))),
            error_log: Arc::new(ErrorLog::new(dir.join("errors.log"))),
            packets_processed: Arc::new(AtomicU64::new(0)),
        })
    }

    fn tcp_frame() -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 1, 14], [172, 217, 6, 163], 64)
            .tcp(49209, 443, 1000, 65535);
        let mut frame = Vec::with_capacity(builder.size(4));
        builder.write(&mut frame, &[1, 2, 3, 4]).unwrap();
        frame
    }

    #[test]
    fn test_worker_pool_processes_packets() {
        let dir = std::env::temp_dir().join("netaudit-worker-pool");
        std::fs::remove_dir_all(&dir).ok();
        let ctx = test_ctx(&dir);
        let processed = ctx.packets_processed.clone();
        let pool = ctx.pool.clone();

        let mut workers = WorkerPool::spawn(2, 16, false, ctx);
        for _ in 0..10 {
            workers.dispatch(PacketEnvelope {
                data: tcp_frame(),
                timestamp: Utc::now(),
                orig_len: 70,
                capture_len: 70,
                interface_index: 0,
            });
        }
        assert!(workers.shutdown());
        assert_eq!(processed.load(Ordering::Relaxed), 10);
        assert!(pool.flush_all(Duration::from_secs(5)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_describe_flow() {
        let desc = describe_flow(&tcp_frame());
        assert_eq!(desc, "192.168.1.14:49209->172.217.6.163:443 (TCP)");
        assert_eq!(describe_flow(&[0u8; 3]), "unparseable");
    }
}
