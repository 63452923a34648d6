//! Configuration
//!
//! Layered: built-in defaults, optional TOML file, then `NA_*`
//! environment overrides (e.g. `NA_WORKERS=4` or `NA_COMPRESS=true`).
//! Invalid configuration is fatal at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::reassembly::ReassemblyConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub reassembly: ReassemblySection,

    #[serde(default)]
    pub resolvers: ResolverConfig,
}

/// Capture source and scheduling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Pcap file to read.
    pub read: Option<PathBuf>,
    /// Network interface for live capture.
    pub iface: Option<String>,
    /// Worker threads (0 = number of cores).
    pub workers: usize,
    /// BPF filter expression.
    pub bpf: Option<String>,
    /// Suppress progress output and stats on stdout.
    pub quiet: bool,
    /// Queue depth per worker, in packets.
    pub packet_buffer_size: usize,
    /// Snapshot length for live capture.
    pub snaplen: i32,
    /// Promiscuous mode for live capture.
    pub promiscuous: bool,
    /// Seconds between device-profile flushes.
    pub profile_flush_interval: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read: None,
            iface: None,
            workers: 0,
            bpf: None,
            quiet: false,
            packet_buffer_size: 100,
            snaplen: 65535,
            promiscuous: true,
            profile_flush_interval: 10,
        }
    }
}

impl CaptureConfig {
    /// Resolved worker count.
    pub fn actual_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    /// True when capturing from a live interface.
    pub fn is_live(&self) -> bool {
        self.read.is_none() && self.iface.is_some()
    }
}

/// Audit-record output options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory for audit-record files and logs.
    pub out_dir: PathBuf,
    /// Gzip-compress the audit-record files.
    pub compress: bool,
    /// Gzip compression level (0-9).
    pub compression_level: u32,
    /// Buffer writes in memory.
    pub buffer: bool,
    /// Buffered writer capacity in bytes.
    pub mem_buffer_size: usize,
    /// Retain raw payload bytes in transport and HTTP records.
    pub include_payloads: bool,
    /// Root directory for extracted file artifacts (None = disabled).
    pub file_storage: Option<PathBuf>,
    /// Also store artifacts whose stream ended mid-body.
    pub write_incomplete: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            compress: false,
            compression_level: 6,
            buffer: true,
            mem_buffer_size: 1024 * 1024 * 12,
            include_payloads: false,
            file_storage: None,
            write_incomplete: false,
        }
    }
}

/// TCP reassembly and defragmentation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassemblySection {
    /// Track connections whose SYN was not captured.
    pub allow_missing_init: bool,
    /// Overlap winner: newer bytes (true) or first-seen bytes (false).
    pub keep_newer_overlaps: bool,
    /// Queued out-of-order segments per direction before declaring a gap.
    pub pending_limit: usize,
    /// Channel capacity towards each stream reader.
    pub stream_channel_size: usize,
    /// Bytes of leading server stream kept as the service banner.
    pub banner_size: usize,
    /// Seconds before an idle connection is flushed.
    pub connection_timeout: u64,
    /// Seconds before incomplete IPv4 fragments are dropped.
    pub defrag_timeout: u64,
}

impl Default for ReassemblySection {
    fn default() -> Self {
        Self {
            allow_missing_init: true,
            keep_newer_overlaps: true,
            pending_limit: 64,
            stream_channel_size: 256,
            banner_size: 512,
            connection_timeout: 5,
            defrag_timeout: 30,
        }
    }
}

impl ReassemblySection {
    pub fn to_reassembly_config(&self) -> ReassemblyConfig {
        ReassemblyConfig {
            allow_missing_init: self.allow_missing_init,
            keep_newer_overlaps: self.keep_newer_overlaps,
            pending_limit: self.pending_limit,
            stream_channel_size: self.stream_channel_size,
            banner_size: self.banner_size,
            connection_timeout: Duration::from_secs(self.connection_timeout),
            live: false,
        }
    }
}

/// Resolver database options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Database directory; `NETAUDIT_DATA_SOURCE` overrides.
    pub data_source: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Apply `NA_*` environment variable overrides.
    pub fn apply_env(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(format!("NA_{}", name)).ok().filter(|v| !v.is_empty())
        }
        fn flag(name: &str) -> Option<bool> {
            var(name).map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        }

        if let Some(v) = var("READ") {
            self.capture.read = Some(PathBuf::from(v));
        }
        if let Some(v) = var("IFACE") {
            self.capture.iface = Some(v);
        }
        if let Some(v) = var("WORKERS").and_then(|v| v.parse().ok()) {
            self.capture.workers = v;
        }
        if let Some(v) = var("BPF") {
            self.capture.bpf = Some(v);
        }
        if let Some(v) = flag("QUIET") {
            self.capture.quiet = v;
        }
        if let Some(v) = var("OUT_DIR") {
            self.output.out_dir = PathBuf::from(v);
        }
        if let Some(v) = flag("COMPRESS") {
            self.output.compress = v;
        }
        if let Some(v) = flag("PAYLOADS") {
            self.output.include_payloads = v;
        }
        if let Some(v) = var("FILE_STORAGE") {
            self.output.file_storage = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MEMBUF_SIZE").and_then(|v| v.parse().ok()) {
            self.output.mem_buffer_size = v;
        }
        if let Some(v) = flag("WRITE_INCOMPLETE") {
            self.output.write_incomplete = v;
        }
        if let Some(v) = var("DATA_SOURCE") {
            self.resolvers.data_source = Some(PathBuf::from(v));
        }
    }

    /// Validate the configuration; errors here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.capture.read.is_none() && self.capture.iface.is_none() {
            bail!("no capture source: set capture.read or capture.iface");
        }
        if let Some(read) = &self.capture.read {
            if !read.exists() {
                bail!("capture file does not exist: {}", read.display());
            }
        }
        if self.output.out_dir.exists() && !self.output.out_dir.is_dir() {
            bail!(
                "output path is not a directory: {}",
                self.output.out_dir.display()
            );
        }
        if self.output.compression_level > 9 {
            bail!("compression level must be 0-9");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.capture.actual_workers() >= 1);
        assert!(config.reassembly.keep_newer_overlaps);
        assert_eq!(config.reassembly.banner_size, 512);
        assert!(!config.output.compress);
    }

    #[test]
    fn test_validate_requires_source() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.iface = Some("eth0".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
            [capture]
            workers = 4
            quiet = true

            [output]
            compress = true
            include_payloads = true

            [reassembly]
            keep_newer_overlaps = false
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.capture.workers, 4);
        assert!(config.capture.quiet);
        assert!(config.output.compress);
        assert!(!config.reassembly.keep_newer_overlaps);
        // untouched sections keep defaults
        assert_eq!(config.reassembly.pending_limit, 64);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("NA_WORKERS", "7");
        std::env::set_var("NA_COMPRESS", "true");
        let mut config = Config::default();
        config.apply_env();
        assert_eq!(config.capture.workers, 7);
        assert!(config.output.compress);
        std::env::remove_var("NA_WORKERS");
        std::env::remove_var("NA_COMPRESS");
    }
}
