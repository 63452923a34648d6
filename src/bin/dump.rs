//! Dump driver: read audit-record files and print CSV, JSON or a table.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tabled::builder::Builder as TableBuilder;
use tabled::settings::Style;

use netaudit::sink::RecordReader;
use netaudit::utils::timestamp_to_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Csv,
    Json,
    Table,
}

#[derive(Parser)]
#[command(name = "netaudit-dump")]
#[command(author, version, about = "Dump audit record files as CSV, JSON or a table")]
struct Cli {
    /// Audit record file (.ncap or .ncap.gz)
    file: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Csv)]
    format: Format,

    /// Comma-separated list of fields to select
    #[arg(short, long)]
    select: Option<String>,

    /// Print the file header and exit
    #[arg(long)]
    header: bool,

    /// Rewrite timestamps as milliseconds since epoch (JSON only)
    #[arg(long)]
    time_ms: bool,

    /// Maximum number of records to print (0 = all)
    #[arg(short, long, default_value_t = 0)]
    limit: u64,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(2);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut reader = RecordReader::open(&cli.file)
        .with_context(|| format!("failed to open {}", cli.file.display()))?;

    if cli.header {
        let h = reader.header();
        println!("record type: {}", reader.record_type());
        println!("created:     {}", h.created);
        println!("source:      {}", h.input_source);
        println!("version:     {}", h.version);
        println!("payloads:    {}", h.contains_payloads);
        return Ok(());
    }

    let full_header: Vec<String> = reader
        .record_type()
        .csv_header()
        .iter()
        .map(|s| s.to_string())
        .collect();

    // resolve the field selection into column indices
    let selection: Option<Vec<usize>> = match &cli.select {
        Some(fields) => {
            let mut indices = Vec::new();
            for field in fields.split(',') {
                let field = field.trim();
                match full_header.iter().position(|h| h.eq_ignore_ascii_case(field)) {
                    Some(i) => indices.push(i),
                    None => bail!(
                        "invalid field: {} (available: {})",
                        field,
                        full_header.join(",")
                    ),
                }
            }
            Some(indices)
        }
        None => None,
    };

    let project = |values: Vec<String>| -> Vec<String> {
        match &selection {
            Some(indices) => indices.iter().map(|i| values[*i].clone()).collect(),
            None => values,
        }
    };
    let header: Vec<String> = project(full_header.clone());

    let mut table = TableBuilder::default();
    match cli.format {
        Format::Csv => println!("{}", header.join(",")),
        Format::Table => table.push_record(header.clone()),
        Format::Json => {}
    }

    let mut count = 0u64;
    while let Some(record) = reader.next_record()? {
        if cli.limit > 0 && count >= cli.limit {
            break;
        }
        count += 1;

        match cli.format {
            Format::Csv => {
                let values = project(record.audit().csv_record());
                println!("{}", values.join(","));
            }
            Format::Table => {
                table.push_record(project(record.audit().csv_record()));
            }
            Format::Json => {
                let mut json = record.to_json()?;
                if cli.time_ms {
                    if let Some(millis) = timestamp_to_millis(record.audit().time()) {
                        // rewrite the timestamp field in place
                        json = json.replacen(
                            &format!("\"timestamp\":\"{}\"", record.audit().time()),
                            &format!("\"timestamp\":{}", millis),
                            1,
                        );
                    }
                }
                println!("{}", json);
            }
        }
    }

    if cli.format == Format::Table {
        println!("{}", table.build().with(Style::sharp()));
        println!("{} records", count);
    }

    Ok(())
}
