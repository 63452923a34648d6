//! netaudit - passive traffic analysis framework
//!
//! Ingests packets from a pcap file or a live network interface and
//! produces typed, length-delimited binary audit-record streams, one file
//! per protocol or entity type, for offline forensic analysis, intrusion
//! detection research and passive asset discovery.
//!
//! Pipeline: source -> IPv4 defragmentation -> worker fan-out -> per-layer
//! decoding + TCP reassembly -> flow readers (HTTP, SSH, POP3) ->
//! profiling stores -> record sinks.

pub mod collector;
pub mod config;
pub mod decode;
pub mod defrag;
pub mod delimited;
pub mod flows;
pub mod profile;
pub mod reassembly;
pub mod resolvers;
pub mod sink;
pub mod types;
pub mod utils;

/// Framework version, recorded in every audit-record file header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
