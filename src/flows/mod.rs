//! Flow readers: stateful consumers of reassembled TCP conversations.
//!
//! A flow reader is selected per connection by server port when the
//! connection is created, receives the full reassembled conversation at
//! teardown, and emits application-level audit records plus side effects
//! (credentials, extracted files, software observations).

pub mod files;
pub mod http;
pub mod pop3;
pub mod service;
pub mod ssh;

use std::path::PathBuf;
use std::sync::Arc;

use crate::profile::{HttpMetaStore, SoftwareStore};
use crate::reassembly::{DecoderFactory, Direction, StreamDecoder, StreamFragment};
use crate::resolvers::Resolvers;
use crate::sink::SinkSet;
use crate::types::Software;

pub use http::HttpReader;
pub use pop3::Pop3Reader;
pub use service::ServiceReader;
pub use ssh::SshReader;

/// Shared context handed to every flow reader.
pub struct FlowContext {
    pub sinks: Arc<SinkSet>,
    pub software: Arc<SoftwareStore>,
    pub http_meta: Arc<HttpMetaStore>,
    pub resolvers: Arc<Resolvers>,
    pub include_payloads: bool,
    /// Root of the extracted-file tree; `None` disables file extraction.
    pub file_storage: Option<PathBuf>,
    /// Also store artifacts whose stream ended mid-body.
    pub write_incomplete: bool,
}

impl FlowContext {
    /// Register software observations, writing Vulnerability / Exploit
    /// records for products never seen before.
    pub fn register_software(&self, observations: Vec<Software>) {
        let new_products = self.software.register(observations);
        for soft in &new_products {
            for record in self.software.lookup_known_issues(soft) {
                self.sinks.write(&record);
            }
        }
    }
}

/// Build the decoder factory the stream pool consults for new
/// connections. Protocol readers are selected by the server port;
/// everything else gets the generic service reader, which identifies
/// software from the captured banner.
pub fn decoder_factory(ctx: Arc<FlowContext>) -> DecoderFactory {
    Arc::new(move |client_port, server_port| {
        let select = |port: u16| -> Option<Box<dyn StreamDecoder>> {
            match port {
                80 | 8000 | 8008 | 8080 | 8081 => {
                    Some(Box::new(HttpReader::new(ctx.clone())))
                }
                22 => Some(Box::new(SshReader::new(ctx.clone()))),
                110 => Some(Box::new(Pop3Reader::new(ctx.clone()))),
                _ => None,
            }
        };
        select(server_port)
            .or_else(|| select(client_port))
            .or_else(|| Some(Box::new(ServiceReader::new(ctx.clone()))))
    })
}

/// Concatenate the committed bytes of one direction, bounded by `limit`
/// (0 = unbounded).
pub fn direction_bytes(fragments: &[StreamFragment], direction: Direction, limit: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for f in fragments.iter().filter(|f| f.direction == direction) {
        if limit > 0 && out.len() >= limit {
            break;
        }
        let room = if limit > 0 {
            limit - out.len()
        } else {
            f.data.len()
        };
        out.extend_from_slice(&f.data[..room.min(f.data.len())]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::testutil::test_context;
    use super::*;

    #[test]
    fn test_factory_always_yields_a_decoder() {
        let dir = std::env::temp_dir().join("netaudit-flows-factory");
        let factory = decoder_factory(test_context(&dir));

        // dedicated readers on their ports, generic service reader on
        // everything else
        assert!(factory(49209, 80).is_some());
        assert!(factory(49209, 22).is_some());
        assert!(factory(49209, 110).is_some());
        assert!(factory(49209, 443).is_some());
        assert!(factory(12345, 54321).is_some());

        std::fs::remove_dir_all(&dir).ok();
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::sink::WriterConfig;
    use crate::types::RecordType;
    use std::path::Path;

    /// Flow context writing into a temp directory, for reader tests.
    pub fn test_context(dir: &Path) -> Arc<FlowContext> {
        std::fs::create_dir_all(dir).unwrap();
        let config = WriterConfig {
            out_dir: dir.to_path_buf(),
            source: "test".into(),
            start_time: "0.000000".into(),
            // unbuffered so tests can read the files without closing
            buffer: false,
            ..Default::default()
        };
        let sinks = Arc::new(
            SinkSet::create(
                &[
                    RecordType::Http,
                    RecordType::Ssh,
                    RecordType::Credentials,
                    RecordType::File,
                    RecordType::Software,
                    RecordType::Vulnerability,
                    RecordType::Exploit,
                ],
                &config,
            )
            .unwrap(),
        );
        let resolvers = Arc::new(Resolvers::embedded());
        Arc::new(FlowContext {
            sinks,
            software: Arc::new(SoftwareStore::new(resolvers.clone())),
            http_meta: Arc::new(HttpMetaStore::new()),
            resolvers,
            include_payloads: false,
            file_storage: None,
            write_incomplete: true,
        })
    }

    /// Read every record out of a sink directory file, if present.
    pub fn read_records(dir: &Path, ty: RecordType) -> Vec<crate::types::Record> {
        let path = dir.join(format!("{}.ncap", ty.name()));
        if !path.exists() {
            return Vec::new();
        }
        let mut reader = crate::sink::RecordReader::open(&path).unwrap();
        let mut out = Vec::new();
        while let Some(r) = reader.next_record().unwrap() {
            out.push(r);
        }
        out
    }
}
