//! Ancillary failure outputs: `unknown.pcap`, `errors.pcap` and
//! `errors.log`.
//!
//! The pcap sinks are created lazily so runs without unknown or failing
//! packets leave no files behind.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use pcap_file::pcap::{PcapPacket, PcapWriter};
use tracing::warn;

use crate::utils::hexdump;

use super::source::PacketEnvelope;

/// A lazily created pcap file for packets the pipeline cannot process.
pub struct PcapSink {
    path: PathBuf,
    writer: Mutex<Option<PcapWriter<File>>>,
    count: AtomicU64,
}

impl PcapSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(None),
            count: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Append one packet, creating the file on first use.
    pub fn write(&self, envelope: &PacketEnvelope) {
        let mut guard = self.writer.lock();
        if guard.is_none() {
            match File::create(&self.path).and_then(|f| {
                PcapWriter::new(f).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            }) {
                Ok(w) => *guard = Some(w),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "cannot create pcap sink");
                    return;
                }
            }
        }

        if let Some(writer) = guard.as_mut() {
            let ts = std::time::Duration::new(
                envelope.timestamp.timestamp().max(0) as u64,
                envelope.timestamp.timestamp_subsec_nanos(),
            );
            let packet = PcapPacket::new(ts, envelope.orig_len, &envelope.data);
            if let Err(e) = writer.write_packet(&packet) {
                warn!(path = %self.path.display(), error = %e, "pcap sink write failed");
            }
        }

        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Flush and sync the file, if it was ever created.
    pub fn sync(&self) -> io::Result<()> {
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let file = writer.into_writer();
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Plain-text error log: one entry per failed packet, plus the final
/// error counter summary.
pub struct ErrorLog {
    path: PathBuf,
    file: Mutex<Option<BufWriter<File>>>,
}

impl ErrorLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    /// Append one error entry: timestamp, tag, packet hexdump.
    pub fn log(&self, timestamp: &str, tag: &str, packet: &[u8]) {
        let mut guard = self.file.lock();
        if guard.is_none() {
            match File::create(&self.path) {
                Ok(f) => *guard = Some(BufWriter::new(f)),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "cannot create error log");
                    return;
                }
            }
        }

        if let Some(file) = guard.as_mut() {
            let _ = write!(
                file,
                "{}\nError: {}\nPacket:\n{}\n",
                timestamp,
                tag,
                hexdump(packet)
            );
        }
    }

    /// Append the error counter summary and sync the file.
    pub fn close(&self, counters: &[(String, u64)]) -> io::Result<()> {
        let mut guard = self.file.lock();
        if guard.is_none() && counters.is_empty() {
            return Ok(());
        }
        if guard.is_none() {
            *guard = Some(BufWriter::new(File::create(&self.path)?));
        }

        let file = guard.as_mut().expect("just created");
        for (tag, count) in counters {
            writeln!(file, "[ERROR] {} COUNT: {}", tag, count)?;
        }
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn envelope() -> PacketEnvelope {
        PacketEnvelope {
            data: vec![0xau8; 20],
            timestamp: Utc::now(),
            orig_len: 20,
            capture_len: 20,
            interface_index: 0,
        }
    }

    #[test]
    fn test_pcap_sink_lazy_creation() {
        let path = std::env::temp_dir().join("netaudit-errlog-unknown.pcap");
        std::fs::remove_file(&path).ok();

        let sink = PcapSink::new(path.clone());
        assert!(!path.exists());
        assert_eq!(sink.count(), 0);

        sink.write(&envelope());
        sink.sync().unwrap();
        assert!(path.exists());
        assert_eq!(sink.count(), 1);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_error_log_format() {
        let path = std::env::temp_dir().join("netaudit-errlog-errors.log");
        std::fs::remove_file(&path).ok();

        let log = ErrorLog::new(path.clone());
        log.log("1580806571.988737", "decode/tcp", b"\x01\x02");
        log.close(&[("decode/tcp".into(), 1)]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("1580806571.988737\nError: decode/tcp\nPacket:\n"));
        assert!(content.contains("[ERROR] decode/tcp COUNT: 1"));

        std::fs::remove_file(&path).unwrap();
    }
}
