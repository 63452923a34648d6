//! Capture driver: read packets from a pcap file or live interface and
//! produce audit-record streams.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netaudit::collector::Collector;
use netaudit::config::Config;

#[derive(Parser)]
#[command(name = "netaudit-capture")]
#[command(author, version, about = "Passive traffic analysis: capture and decode")]
struct Cli {
    /// Read packets from a pcap file
    #[arg(short, long, conflicts_with = "iface")]
    read: Option<PathBuf>,

    /// Capture live from a network interface (requires the `live` feature)
    #[arg(short, long)]
    iface: Option<String>,

    /// Worker threads (0 = number of cores)
    #[arg(short, long, default_value_t = 0)]
    workers: usize,

    /// BPF filter expression for live capture
    #[arg(short, long)]
    bpf: Option<String>,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Retain raw payload bytes in transport and HTTP records
    #[arg(long)]
    payloads: bool,

    /// Extract transferred files into this directory
    #[arg(long, value_name = "DIR")]
    file_storage: Option<PathBuf>,

    /// Also store artifacts whose stream ended mid-body
    #[arg(long)]
    write_incomplete: bool,

    /// Gzip-compress the audit record files
    #[arg(short, long)]
    compress: bool,

    /// Memory buffer size in bytes for the record writers
    #[arg(long, value_name = "BYTES")]
    membuf_size: Option<usize>,

    /// Suppress progress output and stats on stdout
    #[arg(short, long)]
    quiet: bool,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config, cli.debug) {
        eprintln!("failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    let mut collector = Collector::new(config);

    // first signal initiates graceful shutdown, a second one force-exits
    let shutdown = collector.shutdown_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        if shutdown.swap(true, Ordering::SeqCst) {
            eprintln!("\nforce quitting");
            std::process::exit(1);
        }
        eprintln!("\nreceived signal, shutting down gracefully");
    }) {
        eprintln!("failed to install signal handler: {}", e);
    }

    if let Err(e) = collector.run() {
        eprintln!("error: {:#}", e);
        std::process::exit(2);
    }
}

// stderr gets the env-filtered live log; debug.log collects everything at
// debug level, reassembly.log only the reassembly diagnostics.
fn init_logging(config: &Config, debug: bool) -> Result<()> {
    let out_dir = &config.output.out_dir;
    std::fs::create_dir_all(out_dir)?;
    let debug_log = std::fs::File::create(out_dir.join("debug.log"))?;
    let reassembly_log = std::fs::File::create(out_dir.join("reassembly.log"))?;

    let stderr_filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(debug_log))
                .with_filter(LevelFilter::DEBUG),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(reassembly_log))
                .with_filter(filter_fn(|meta| meta.target() == "reassembly")),
        )
        .init();
    Ok(())
}

fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env();
            config
        }
    };

    if let Some(read) = &cli.read {
        config.capture.read = Some(read.clone());
    }
    if let Some(iface) = &cli.iface {
        config.capture.iface = Some(iface.clone());
    }
    if cli.workers != 0 {
        config.capture.workers = cli.workers;
    }
    if let Some(bpf) = &cli.bpf {
        config.capture.bpf = Some(bpf.clone());
    }
    if cli.out != PathBuf::from(".") {
        config.output.out_dir = cli.out.clone();
    }
    if cli.payloads {
        config.output.include_payloads = true;
    }
    if let Some(storage) = &cli.file_storage {
        config.output.file_storage = Some(storage.clone());
    }
    if cli.write_incomplete {
        config.output.write_incomplete = true;
    }
    if cli.compress {
        config.output.compress = true;
    }
    if let Some(size) = cli.membuf_size {
        config.output.mem_buffer_size = size;
    }
    if cli.quiet {
        config.capture.quiet = true;
    }

    config.validate()?;
    Ok(config)
}
