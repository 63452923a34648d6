//! Packet sources: pcap file replay and live interface capture.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use tracing::info;

use crate::config::CaptureConfig;
use crate::decode::LinkLayer;

/// One captured packet plus its metadata, handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct PacketEnvelope {
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub orig_len: u32,
    pub capture_len: u32,
    pub interface_index: u32,
}

/// A source of packets: pcap file or live interface.
pub trait PacketSource: Send {
    /// Next packet, or `None` at end of input. Live sources return
    /// `Ok(None)` on read timeouts.
    fn next_packet(&mut self) -> Result<Option<PacketEnvelope>>;

    /// Base link layer of this source.
    fn link_layer(&self) -> LinkLayer;

    /// Human-readable source name, recorded in file headers.
    fn name(&self) -> &str;

    /// Total packet count when known upfront (file sources).
    fn total_packets(&self) -> Option<u64>;

    /// True for live captures (affects timeout policies).
    fn is_live(&self) -> bool;
}

/// Pcap file replay source.
pub struct PcapFileSource {
    reader: PcapReader<BufReader<File>>,
    name: String,
    link: LinkLayer,
    total: Option<u64>,
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open capture file: {}", path.display()))?;
        let reader = PcapReader::new(BufReader::new(file))
            .with_context(|| format!("not a valid pcap file: {}", path.display()))?;

        let link = match reader.header().datalink {
            DataLink::ETHERNET => LinkLayer::Ethernet,
            DataLink::USB_LINUX_MMAPPED => LinkLayer::UsbLinuxMmapped,
            other => bail!("unsupported link type in capture file: {:?}", other),
        };

        let total = count_packets(path).ok();
        info!(
            path = %path.display(),
            packets = total,
            "opened capture file"
        );

        Ok(Self {
            reader,
            name: path.to_string_lossy().to_string(),
            link,
            total,
        })
    }
}

impl PacketSource for PcapFileSource {
    fn next_packet(&mut self) -> Result<Option<PacketEnvelope>> {
        match self.reader.next_packet() {
            Some(Ok(packet)) => Ok(Some(PacketEnvelope {
                timestamp: duration_to_datetime(packet.timestamp),
                orig_len: packet.orig_len,
                capture_len: packet.data.len() as u32,
                data: packet.data.into_owned(),
                interface_index: 0,
            })),
            Some(Err(e)) => Err(e).context("pcap read error"),
            None => Ok(None),
        }
    }

    fn link_layer(&self) -> LinkLayer {
        self.link
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn total_packets(&self) -> Option<u64> {
        self.total
    }

    fn is_live(&self) -> bool {
        false
    }
}

fn duration_to_datetime(d: std::time::Duration) -> DateTime<Utc> {
    Utc.timestamp_opt(d.as_secs() as i64, d.subsec_nanos())
        .single()
        .unwrap_or_else(Utc::now)
}

// Pre-scan the file once so progress can be shown as a percentage.
fn count_packets(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let mut reader = PcapReader::new(BufReader::new(file))?;
    let mut count = 0;
    while let Some(packet) = reader.next_packet() {
        packet?;
        count += 1;
    }
    Ok(count)
}

/// Live interface capture via libpcap.
#[cfg(feature = "live")]
pub struct LiveSource {
    capture: pcap::Capture<pcap::Active>,
    name: String,
}

#[cfg(feature = "live")]
impl LiveSource {
    pub fn open(iface: &str, config: &CaptureConfig) -> Result<Self> {
        let mut capture = pcap::Capture::from_device(iface)
            .with_context(|| format!("unknown capture device: {}", iface))?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .timeout(500)
            .open()
            .with_context(|| format!("failed to open device: {}", iface))?;

        if let Some(bpf) = &config.bpf {
            capture
                .filter(bpf, true)
                .with_context(|| format!("invalid BPF filter: {}", bpf))?;
        }

        info!(iface, "live capture started");
        Ok(Self {
            capture,
            name: iface.to_string(),
        })
    }
}

#[cfg(feature = "live")]
impl PacketSource for LiveSource {
    fn next_packet(&mut self) -> Result<Option<PacketEnvelope>> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Some(PacketEnvelope {
                timestamp: Utc
                    .timestamp_opt(
                        packet.header.ts.tv_sec as i64,
                        (packet.header.ts.tv_usec as u32) * 1000,
                    )
                    .single()
                    .unwrap_or_else(Utc::now),
                orig_len: packet.header.len,
                capture_len: packet.header.caplen,
                data: packet.data.to_vec(),
                interface_index: 0,
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(e) => Err(e).context("live capture error"),
        }
    }

    fn link_layer(&self) -> LinkLayer {
        LinkLayer::Ethernet
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn total_packets(&self) -> Option<u64> {
        None
    }

    fn is_live(&self) -> bool {
        true
    }
}

/// Open the configured packet source.
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn PacketSource>> {
    if let Some(path) = &config.read {
        if config.bpf.is_some() {
            tracing::warn!("BPF filters only apply to live captures, ignoring");
        }
        return Ok(Box::new(PcapFileSource::open(path)?));
    }

    if let Some(iface) = &config.iface {
        #[cfg(feature = "live")]
        return Ok(Box::new(LiveSource::open(iface, config)?));

        #[cfg(not(feature = "live"))]
        bail!(
            "live capture on {} requires the `live` feature (libpcap)",
            iface
        );
    }

    bail!("no capture source configured")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};

    fn write_test_pcap(path: &Path, packets: &[&[u8]]) {
        let file = File::create(path).unwrap();
        let header = PcapHeader {
            datalink: DataLink::ETHERNET,
            ..Default::default()
        };
        let mut writer = PcapWriter::with_header(file, header).unwrap();
        for (i, data) in packets.iter().enumerate() {
            let packet = PcapPacket::new(
                std::time::Duration::from_secs(1580806571 + i as u64),
                data.len() as u32,
                data,
            );
            writer.write_packet(&packet).unwrap();
        }
    }

    #[test]
    fn test_pcap_file_source() {
        let path = std::env::temp_dir().join("netaudit-source-test.pcap");
        write_test_pcap(&path, &[&[1u8; 60], &[2u8; 42]]);

        let mut source = PcapFileSource::open(&path).unwrap();
        assert_eq!(source.link_layer(), LinkLayer::Ethernet);
        assert_eq!(source.total_packets(), Some(2));
        assert!(!source.is_live());

        let first = source.next_packet().unwrap().unwrap();
        assert_eq!(first.data.len(), 60);
        assert_eq!(first.orig_len, 60);
        let second = source.next_packet().unwrap().unwrap();
        assert_eq!(second.data.len(), 42);
        assert!(source.next_packet().unwrap().is_none());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_open_source_missing_file() {
        assert!(PcapFileSource::open(Path::new("/nonexistent.pcap")).is_err());
    }
}
