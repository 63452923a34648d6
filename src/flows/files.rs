//! File artifact extraction.
//!
//! Response and request bodies are written into a deduplicating on-disk
//! tree rooted at `<storage>/<detected-content-type>/`, then described by
//! a `File` audit record carrying the MD5 of the stored bytes.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::{GzDecoder, ZlibDecoder};
use tracing::{debug, warn};

use crate::reassembly::ConnectionSummary;
use crate::types::{File, PacketContext, Record};

use super::FlowContext;

/// Sniff the content type from leading magic bytes, falling back to
/// text/plain vs application/octet-stream.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    if data.len() >= 4 {
        match &data[..4] {
            [0x89, b'P', b'N', b'G'] => return "image/png",
            [0xff, 0xd8, 0xff, _] => return "image/jpeg",
            [b'G', b'I', b'F', b'8'] => return "image/gif",
            [b'%', b'P', b'D', b'F'] => return "application/pdf",
            [b'P', b'K', 0x03, 0x04] => return "application/zip",
            [0x7f, b'E', b'L', b'F'] => return "application/octet-stream",
            _ => {}
        }
    }
    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        return "application/gzip";
    }

    let head = &data[..data.len().min(512)];
    let trimmed: &[u8] = {
        let start = head
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(0);
        &head[start..]
    };
    let lower: Vec<u8> = trimmed
        .iter()
        .take(64)
        .map(|b| b.to_ascii_lowercase())
        .collect();
    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        return "text/html";
    }
    if lower.starts_with(b"<?xml") {
        return "text/xml";
    }
    if lower.starts_with(b"{") || lower.starts_with(b"[") {
        // heuristic, misfires on plain text starting with a brace
        return "application/json";
    }

    let printable = head
        .iter()
        .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
        .count();
    if !head.is_empty() && printable * 100 / head.len() >= 95 {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

/// File extension for a MIME type.
pub fn extension_for_content_type(content_type: &str) -> &'static str {
    let base = content_type.split(';').next().unwrap_or(content_type);
    match base {
        "text/html" => ".html",
        "text/plain" => ".txt",
        "text/css" => ".css",
        "text/csv" => ".csv",
        "text/xml" | "application/xml" => ".xml",
        "text/javascript" | "application/javascript" => ".js",
        "application/json" => ".json",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "application/gzip" | "application/x-gzip" => ".gz",
        "application/octet-stream" => ".bin",
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/gif" => ".gif",
        "image/svg+xml" => ".svg",
        "image/x-icon" | "image/vnd.microsoft.icon" => ".ico",
        "image/webp" => ".webp",
        "audio/mpeg" => ".mp3",
        "video/mp4" => ".mp4",
        "font/woff" => ".woff",
        "font/woff2" => ".woff2",
        _ => "",
    }
}

fn trim_encoding(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or(content_type).trim()
}

/// Store one extracted body and emit the matching `File` record.
///
/// `declared_type` is the protocol-declared content type, `encoding` the
/// Content-Encoding; gzip/deflate bodies are decoded before storage and
/// the content type re-detected afterwards. `incomplete` marks bodies cut
/// short by a stream gap; their source string gets the `incomplete-`
/// prefix and the hash reflects the truncated bytes.
#[allow(clippy::too_many_arguments)]
pub fn save_file(
    ctx: &FlowContext,
    summary: &ConnectionSummary,
    source: &str,
    name: &str,
    body: &[u8],
    encoding: &str,
    declared_type: &str,
    host: &str,
    incomplete: bool,
) {
    if body.is_empty() {
        return;
    }
    let Some(storage) = &ctx.file_storage else {
        return;
    };
    if incomplete && !ctx.write_incomplete {
        return;
    }

    // decode compressed bodies before sniffing and hashing
    let decoded: Vec<u8> = match encoding {
        "gzip" | "x-gzip" => {
            let mut out = Vec::new();
            match GzDecoder::new(body).read_to_end(&mut out) {
                Ok(_) => out,
                Err(e) => {
                    debug!(error = %e, "gzip body decode failed, storing raw");
                    body.to_vec()
                }
            }
        }
        "deflate" => {
            let mut out = Vec::new();
            match ZlibDecoder::new(body).read_to_end(&mut out) {
                Ok(_) => out,
                Err(e) => {
                    debug!(error = %e, "deflate body decode failed, storing raw");
                    body.to_vec()
                }
            }
        }
        _ => body.to_vec(),
    };

    let detected = detect_content_type(&decoded);
    let ext = extension_for_content_type(detected);

    let mut name = sanitize(name);
    if name.is_empty() || name == "/" {
        name = "unknown".to_string();
    }

    let dir = storage.join(detected);
    if let Err(e) = fs::create_dir_all(&dir) {
        warn!(path = %dir.display(), error = %e, "cannot create file storage path");
        return;
    }

    let prefix = if incomplete { "incomplete-" } else { "" };
    let base = format!("{}{}-{}{}", prefix, name, sanitize(&summary.ident), ext);
    let target = unique_target(&dir, &base, ext);

    if let Err(e) = fs::write(&target, &decoded) {
        warn!(path = %target.display(), error = %e, "cannot store extracted file");
        return;
    }
    debug!(path = %target.display(), bytes = decoded.len(), "stored extracted file");

    let source = format!("{}{}", prefix, source);
    let record: Record = File {
        timestamp: summary.timestamp.clone(),
        name: if Path::new(&name).extension().is_none() {
            format!("{}{}", name, ext)
        } else {
            name
        },
        length: decoded.len() as i64,
        hash: format!("{:x}", md5::compute(&decoded)),
        location: target.to_string_lossy().to_string(),
        ident: summary.ident.clone(),
        source,
        content_type: trim_encoding(declared_type).to_string(),
        content_type_detected: detected.to_string(),
        host: host.to_string(),
        context: Some(PacketContext {
            src_ip: summary.client_ip.to_string(),
            dst_ip: summary.server_ip.to_string(),
            src_port: summary.client_port.to_string(),
            dst_port: summary.server_port.to_string(),
        }),
    }
    .into();

    ctx.sinks.write(&record);
}

// Collision avoidance: append -N until the target does not exist.
fn unique_target(dir: &Path, base: &str, ext: &str) -> PathBuf {
    let mut target = dir.join(base);
    let stem = base.strip_suffix(ext).unwrap_or(base).to_string();
    let mut n = 0;
    while target.exists() {
        target = dir.join(format!("{}-{}{}", stem, n, ext));
        n += 1;
    }
    target
}

// Keep artifact names shell- and path-safe.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches('-').chars().take(120).collect()
}
