//! Capture orchestration.
//!
//! The collector owns the packet source, the defragmenter, the worker
//! pool, the reassembly pool and the record sinks, and drives the packet
//! loop: read, defragment, dispatch round-robin, and on EOF or signal run
//! the ordered shutdown (drain workers, flush connections, flush stores,
//! close sinks, write stats).

pub mod errlog;
pub mod source;
pub mod worker;

use std::fs::File;
use std::io::Write as IoWrite;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tabled::builder::Builder as TableBuilder;
use tabled::settings::Style;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::decode::{LinkLayer, PacketDecoder};
use crate::defrag::Ipv4Defragmenter;
use crate::flows::{decoder_factory, FlowContext};
use crate::profile::{DeviceProfileStore, HttpMetaStore, SoftwareStore};
use crate::reassembly::StreamPool;
use crate::resolvers::Resolvers;
use crate::sink::{SinkSet, WriterConfig};
use crate::types::RecordType;
use crate::utils::{progress, time_to_string};

use errlog::{ErrorLog, PcapSink};
use source::open_source;
use worker::{WorkerContext, WorkerPool};

/// Overall ceiling for the shutdown sequence.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives one capture run from source open to stats output.
pub struct Collector {
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl Collector {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between packets; the signal handler sets it.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run the capture to completion (source EOF or shutdown signal).
    pub fn run(&mut self) -> Result<()> {
        let start = Instant::now();
        let start_time = time_to_string(Utc::now());

        std::fs::create_dir_all(&self.config.output.out_dir)
            .with_context(|| "failed to create output directory")?;

        let mut run_log = File::create(self.config.output.out_dir.join("netaudit.log"))
            .context("failed to create netaudit.log")?;
        writeln!(
            run_log,
            "netaudit v{}\npid: {}\nstarted: {}\n\nconfiguration:\n{}\n",
            env!("CARGO_PKG_VERSION"),
            std::process::id(),
            start_time,
            serde_json::to_string_pretty(&self.config).unwrap_or_default(),
        )?;

        let mut source = open_source(&self.config.capture)?;
        let live = source.is_live();
        let link = source.link_layer();
        let total_packets = source.total_packets();

        // shared state
        let resolvers = Arc::new(Resolvers::load(
            self.config.resolvers.data_source.as_deref(),
        ));
        let writer_config = WriterConfig {
            out_dir: self.config.output.out_dir.clone(),
            buffer: self.config.output.buffer,
            compress: self.config.output.compress,
            compression_level: self.config.output.compression_level,
            mem_buffer_size: self.config.output.mem_buffer_size,
            source: source.name().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            includes_payloads: self.config.output.include_payloads,
            start_time: start_time.clone(),
        };
        let sinks = Arc::new(
            SinkSet::create(RecordType::ALL, &writer_config)
                .context("failed to create audit record writers")?,
        );

        let devices = Arc::new(DeviceProfileStore::new(resolvers.clone()));
        let software = Arc::new(SoftwareStore::new(resolvers.clone()));
        let http_meta = Arc::new(HttpMetaStore::new());

        let flow_ctx = Arc::new(FlowContext {
            sinks: sinks.clone(),
            software: software.clone(),
            http_meta: http_meta.clone(),
            resolvers: resolvers.clone(),
            include_payloads: self.config.output.include_payloads,
            file_storage: self.config.output.file_storage.clone(),
            write_incomplete: self.config.output.write_incomplete,
        });
        let mut reassembly_config = self.config.reassembly.to_reassembly_config();
        reassembly_config.live = live;
        if live {
            // idle connections live longer during live capture
            reassembly_config.connection_timeout = reassembly_config.connection_timeout * 12;
        }
        let pool = Arc::new(StreamPool::new(
            reassembly_config,
            decoder_factory(flow_ctx),
        ));

        let decoder = Arc::new(PacketDecoder::new(self.config.output.include_payloads));
        let unknown_pcap = Arc::new(PcapSink::new(
            self.config.output.out_dir.join("unknown.pcap"),
        ));
        let errors_pcap = Arc::new(PcapSink::new(
            self.config.output.out_dir.join("errors.pcap"),
        ));
        let error_log = Arc::new(ErrorLog::new(self.config.output.out_dir.join("errors.log")));

        let worker_ctx = Arc::new(WorkerContext {
            decoder: decoder.clone(),
            pool: pool.clone(),
            sinks: sinks.clone(),
            devices: devices.clone(),
            link,
            unknown_pcap: unknown_pcap.clone(),
            errors_pcap: errors_pcap.clone(),
            error_log: error_log.clone(),
            packets_processed: Arc::new(AtomicU64::new(0)),
        });

        let num_workers = self.config.capture.actual_workers();
        let mut workers = WorkerPool::spawn(
            num_workers,
            self.config.capture.packet_buffer_size,
            live,
            worker_ctx.clone(),
        );
        info!(workers = num_workers, live, "collector started");

        // periodic maintenance: flush device profiles, expire idle
        // connections
        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let stop = ticker_stop.clone();
            let devices = devices.clone();
            let sinks = sinks.clone();
            let pool = pool.clone();
            let flush_interval = self.config.capture.profile_flush_interval.max(1);
            thread::Builder::new()
                .name("maintenance".into())
                .spawn(move || {
                    let mut tick: u64 = 0;
                    while !stop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_secs(1));
                        tick += 1;
                        if tick % flush_interval == 0 {
                            for record in devices.snapshot() {
                                sinks.write(&record);
                            }
                        }
                        pool.expire_idle(Utc::now());
                    }
                })
                .expect("failed to spawn maintenance thread")
        };

        // packet loop
        let mut defrag = Ipv4Defragmenter::new(Duration::from_secs(
            self.config.reassembly.defrag_timeout,
        ));
        let mut current: u64 = 0;
        let quiet = self.config.capture.quiet;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping packet intake");
                break;
            }

            let envelope = match source.next_packet() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    if live {
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    error!(error = %e, "source read error");
                    break;
                }
            };

            current += 1;
            if !quiet && current % 1000 == 0 {
                print!(
                    "\rdecoding packets... ({}) profiles: {} packets: {}",
                    progress(current as i64, total_packets.unwrap_or(0) as i64),
                    devices.size(),
                    current,
                );
                let _ = std::io::stdout().flush();
            }

            // IPv4 fragments are reassembled before dispatch so one
            // worker always sees the whole datagram
            let data = if link == LinkLayer::Ethernet {
                match defrag.process(&envelope.data, envelope.timestamp) {
                    Some(data) => data,
                    None => continue,
                }
            } else {
                envelope.data.clone()
            };

            workers.dispatch(source::PacketEnvelope { data, ..envelope });
        }

        if !quiet && current > 0 {
            println!();
        }

        // ordered shutdown
        ticker_stop.store(true, Ordering::Relaxed);
        let _ = ticker.join();

        if !workers.shutdown() {
            warn!("worker queues did not drain in time");
        }
        if !pool.flush_all(CLEANUP_TIMEOUT) {
            warn!("stream readers did not finalize in time");
        }

        // final store flushes
        for record in devices.snapshot() {
            sinks.write(&record);
        }
        for record in software.snapshot() {
            sinks.write(&record);
        }

        for (ip, agents) in http_meta.user_agent_rows() {
            info!(target: "debug", ip = %ip, user_agents = %agents);
        }
        for (ip, names) in http_meta.server_name_rows() {
            info!(target: "debug", ip = %ip, server_names = %names);
        }

        // ancillary outputs
        error_log
            .close(&decoder.errors.snapshot())
            .context("failed to close errors.log")?;
        errors_pcap.sync().context("failed to sync errors.pcap")?;
        unknown_pcap.sync().context("failed to sync unknown.pcap")?;

        // release every remaining sink handle so the set can be closed:
        // the worker context directly, and the pool through its decoder
        // factory
        let connections_closed = pool.stats.connections_closed.load(Ordering::Relaxed);
        let record_counts = sinks.record_counts();
        drop(worker_ctx);
        drop(pool);
        let sinks = Arc::into_inner(sinks)
            .ok_or_else(|| anyhow::anyhow!("audit record writers still referenced at shutdown"))?;
        let files = sinks.close().context("failed to close audit record files")?;
        let total_bytes: u64 = files.iter().map(|(_, size)| size).sum();

        let stats = self.render_stats(
            current,
            &decoder,
            &record_counts,
            total_bytes,
            &unknown_pcap,
            &errors_pcap,
        );
        if !quiet {
            println!("{}", stats);
        }
        writeln!(run_log, "{}", stats)?;
        writeln!(run_log, "finished in {:?}", start.elapsed())?;
        run_log.sync_all()?;

        info!(
            packets = current,
            connections = connections_closed,
            elapsed = ?start.elapsed(),
            "capture finished"
        );
        Ok(())
    }

    fn render_stats(
        &self,
        num_packets: u64,
        decoder: &PacketDecoder,
        record_counts: &[(RecordType, i64)],
        total_bytes: u64,
        unknown_pcap: &PcapSink,
        errors_pcap: &PcapSink,
    ) -> String {
        let share = |count: u64| -> String {
            if num_packets == 0 {
                return "0%".into();
            }
            format!("{:.3}%", count as f64 / num_packets as f64 * 100.0)
        };

        let mut builder = TableBuilder::default();
        builder.push_record(["Layer", "NumRecords", "Share"]);
        for (layer, count) in decoder.stats.snapshot() {
            builder.push_record([layer, count.to_string(), share(count)]);
        }
        let layer_table = builder.build().with(Style::sharp()).to_string();

        let mut builder = TableBuilder::default();
        builder.push_record(["RecordType", "NumRecords"]);
        for (ty, count) in record_counts {
            if *count > 0 {
                builder.push_record([ty.name().to_string(), count.to_string()]);
            }
        }
        let record_table = builder.build().with(Style::sharp()).to_string();

        let mut out = format!("{}\n{}\n", layer_table, record_table);
        out.push_str(&format!(
            "-> total bytes of data written to disk: {}\n",
            total_bytes
        ));
        if unknown_pcap.count() > 0 {
            out.push_str(&format!(
                "-> {} of packets ({}) written to unknown.pcap\n",
                share(unknown_pcap.count()),
                unknown_pcap.count()
            ));
        }
        if errors_pcap.count() > 0 {
            out.push_str(&format!(
                "-> {} of packets ({}) written to errors.pcap\n",
                share(errors_pcap.count()),
                errors_pcap.count()
            ));
        }
        if !decoder.errors.is_empty() {
            for (tag, count) in decoder.errors.snapshot() {
                out.push_str(&format!("[ERROR] {} COUNT: {}\n", tag, count));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use etherparse::PacketBuilder;
    use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
    use pcap_file::DataLink;
    use std::path::Path;

    fn tcp_packet(
        src: [u8; 4],
        dst: [u8; 4],
        sport: u16,
        dport: u16,
        seq: u32,
        syn: bool,
        ack: bool,
        fin: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4(src, dst, 64)
            .tcp(sport, dport, seq, 65535);
        if syn {
            builder = builder.syn();
        }
        if ack {
            builder = builder.ack(1);
        }
        if fin {
            builder = builder.fin();
        }
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn write_pcap(path: &Path, frames: &[Vec<u8>]) {
        let header = PcapHeader {
            datalink: DataLink::ETHERNET,
            ..Default::default()
        };
        let mut writer = PcapWriter::with_header(File::create(path).unwrap(), header).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            writer
                .write_packet(&PcapPacket::new(
                    Duration::from_micros(1580806571_000000 + i as u64 * 1000),
                    frame.len() as u32,
                    frame,
                ))
                .unwrap();
        }
    }

    // A SYN/SYN-ACK/ACK handshake plus one 15 byte payload segment.
    #[test]
    fn test_end_to_end_tcp_handshake() {
        let dir = std::env::temp_dir().join("netaudit-collector-e2e");
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();

        let client = [192, 168, 1, 14];
        let server = [172, 217, 6, 163];
        let frames = vec![
            tcp_packet(client, server, 49209, 443, 1000, true, false, false, b""),
            tcp_packet(server, client, 443, 49209, 5000, true, true, false, b""),
            tcp_packet(client, server, 49209, 443, 1001, false, true, false, b""),
            tcp_packet(client, server, 49209, 443, 1001, false, true, false, &[0x16; 15]),
        ];
        let pcap_path = dir.join("input.pcap");
        write_pcap(&pcap_path, &frames);

        let mut config = Config::default();
        config.capture.read = Some(pcap_path);
        config.capture.workers = 1;
        config.capture.quiet = true;
        config.output.out_dir = dir.clone();
        config.validate().unwrap();

        Collector::new(config).run().unwrap();

        // 4 TCP records, 4 Ethernet records, 4 IPv4 records
        let read = |name: &str| -> Vec<crate::types::Record> {
            let path = dir.join(format!("{}.ncap", name));
            if !path.exists() {
                return Vec::new();
            }
            let mut reader = crate::sink::RecordReader::open(&path).unwrap();
            let mut out = Vec::new();
            while let Some(r) = reader.next_record().unwrap() {
                out.push(r);
            }
            out
        };

        assert_eq!(read("Tcp").len(), 4);
        assert_eq!(read("Ethernet").len(), 4);
        assert_eq!(read("IPv4").len(), 4);
        assert!(read("Http").is_empty());
        assert!(read("Ssh").is_empty());
        assert!(read("Credentials").is_empty());

        // no unknown layers were seen
        assert!(!dir.join("unknown.pcap").exists());
        // run log exists
        assert!(dir.join("netaudit.log").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    // A full HTTP conversation produces an HTTP record and an extracted
    // file artifact.
    #[test]
    fn test_end_to_end_http() {
        let dir = std::env::temp_dir().join("netaudit-collector-http");
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();

        let client = [192, 168, 1, 14];
        let server = [93, 184, 216, 34];
        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let response =
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 15\r\n\r\n<html>hi</html>";

        let frames = vec![
            tcp_packet(client, server, 49300, 80, 100, true, false, false, b""),
            tcp_packet(server, client, 80, 49300, 900, true, true, false, b""),
            tcp_packet(client, server, 49300, 80, 101, false, true, false, request),
            tcp_packet(server, client, 80, 49300, 901, false, true, false, response),
            tcp_packet(
                client,
                server,
                49300,
                80,
                101 + request.len() as u32,
                false,
                true,
                true,
                b"",
            ),
            tcp_packet(
                server,
                client,
                80,
                49300,
                901 + response.len() as u32,
                false,
                true,
                true,
                b"",
            ),
        ];
        let pcap_path = dir.join("input.pcap");
        write_pcap(&pcap_path, &frames);

        let storage = dir.join("storage");
        let mut config = Config::default();
        config.capture.read = Some(pcap_path);
        config.capture.workers = 1;
        config.capture.quiet = true;
        config.output.out_dir = dir.clone();
        config.output.file_storage = Some(storage.clone());
        config.validate().unwrap();

        Collector::new(config).run().unwrap();

        let mut reader = crate::sink::RecordReader::open(dir.join("Http.ncap")).unwrap();
        let record = reader.next_record().unwrap().expect("one http record");
        match record {
            crate::types::Record::Http(h) => {
                assert_eq!(h.method, "GET");
                assert_eq!(h.status_code, 200);
                assert_eq!(h.res_content_length, 15);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut reader = crate::sink::RecordReader::open(dir.join("File.ncap")).unwrap();
        let record = reader.next_record().unwrap().expect("one file record");
        match record {
            crate::types::Record::File(f) => {
                assert_eq!(f.content_type_detected, "text/html");
                assert_eq!(f.length, 15);
                assert_eq!(f.hash, format!("{:x}", md5::compute(b"<html>hi</html>")));
                assert!(std::path::Path::new(&f.location).exists());
            }
            other => panic!("unexpected {:?}", other),
        }

        std::fs::remove_dir_all(&dir).ok();
    }
}
