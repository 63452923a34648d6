//! Small shared helpers: timestamp formatting, payload entropy, hexdumps.

use chrono::{DateTime, TimeZone, Utc};

/// Format a capture timestamp as `seconds.microseconds`.
///
/// This is the canonical timestamp representation carried by every audit
/// record. Sub-second precision is kept at microseconds to match pcap
/// capture resolution.
pub fn time_to_string(ts: DateTime<Utc>) -> String {
    format!("{}.{:06}", ts.timestamp(), ts.timestamp_subsec_micros())
}

/// Parse a `seconds.microseconds` timestamp back into a UTC datetime.
pub fn string_to_time(s: &str) -> Option<DateTime<Utc>> {
    let (secs, micros) = s.split_once('.')?;
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = micros.parse().ok()?;
    Utc.timestamp_opt(secs, micros * 1000).single()
}

/// Convert a `seconds.microseconds` timestamp to milliseconds since epoch.
/// Used by the dumper when JSON output is requested with `-time-ms`.
pub fn timestamp_to_millis(s: &str) -> Option<i64> {
    let (secs, micros) = s.split_once('.')?;
    let secs: i64 = secs.parse().ok()?;
    let micros: i64 = micros.parse().ok()?;
    Some(secs * 1000 + micros / 1000)
}

/// Shannon entropy of a byte slice in bits per symbol (0.0..=8.0).
pub fn entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0u64; 256];
    for b in data {
        counts[*b as usize] += 1;
    }

    let len = data.len() as f64;
    let mut h = 0.0;
    for c in counts.iter().filter(|c| **c > 0) {
        let p = *c as f64 / len;
        h -= p * p.log2();
    }
    h
}

/// Render a buffer as a classic 16-bytes-per-line hexdump for error logs.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4);
    for (i, chunk) in data.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", i * 16));
        for j in 0..16 {
            match chunk.get(j) {
                Some(b) => out.push_str(&format!("{:02x} ", b)),
                None => out.push_str("   "),
            }
            if j == 7 {
                out.push(' ');
            }
        }
        out.push(' ');
        out.push('|');
        for b in chunk {
            out.push(if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            });
        }
        out.push('|');
        out.push('\n');
    }
    out
}

/// Format progress as a percentage string, e.g. `42.7%`.
pub fn progress(current: i64, total: i64) -> String {
    if total <= 0 {
        return format!("{} packets", current);
    }
    format!("{:.1}%", current as f64 / total as f64 * 100.0)
}

/// Format a MAC address from its raw bytes.
pub fn mac_to_string(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Reverse a flow identifier of the form `a:pA->b:pB` into `b:pB->a:pA`.
pub fn reverse_ident(ident: &str) -> String {
    match ident.split_once("->") {
        Some((a, b)) => format!("{}->{}", b, a),
        None => ident.to_string(),
    }
}
