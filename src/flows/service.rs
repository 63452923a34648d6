//! Generic service reader for connections without a dedicated protocol
//! reader.
//!
//! Consumes the service banner captured by the reassembler, resolves the
//! service name from the server port, and applies the generic version
//! harvester. Software running behind ports the framework has no parser
//! for still surfaces in the Software stream this way.

use std::sync::Arc;

use tracing::trace;

use crate::reassembly::{ConnectionSummary, Direction, StreamDecoder, StreamFragment};

use super::{direction_bytes, FlowContext};

/// Bytes of the client stream inspected when the server never spoke.
const CLIENT_PREVIEW_BYTES: usize = 512;

/// Fallback reader attached to connections no protocol reader claimed.
pub struct ServiceReader {
    ctx: Arc<FlowContext>,
}

impl ServiceReader {
    pub fn new(ctx: Arc<FlowContext>) -> Self {
        Self { ctx }
    }
}

impl StreamDecoder for ServiceReader {
    fn decode(&mut self, summary: &ConnectionSummary, fragments: &[StreamFragment]) {
        // the banner holds the leading server bytes; fall back to the
        // client side for protocols where the client speaks first
        let data = if !summary.banner.is_empty() {
            summary.banner.clone()
        } else {
            direction_bytes(fragments, Direction::ClientToServer, CLIENT_PREVIEW_BYTES)
        };
        if data.is_empty() {
            return;
        }

        let mut service = self.ctx.resolvers.lookup_service(summary.server_port);
        if service.is_empty() {
            service = format!("tcp/{}", summary.server_port);
        }

        let observations = self.ctx.software.harvest_versions(
            &data,
            &summary.timestamp,
            &summary.ident,
            &service,
        );
        if observations.is_empty() {
            return;
        }
        trace!(
            ident = %summary.ident,
            service = %service,
            found = observations.len(),
            "version harvester matched banner"
        );

        self.ctx.register_software(observations);
    }
}
