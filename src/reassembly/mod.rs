//! TCP stream reassembly.
//!
//! The [`StreamPool`] owns all live connections, keyed by the canonical
//! (smaller-endpoint-first) address pair. Each connection runs two stream
//! reader tasks, one per direction, fed through bounded channels; the
//! reassembled conversation is handed to a flow decoder when the
//! connection tears down.

pub mod connection;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::decode::TcpSegment;
use crate::utils::time_to_string;

pub use connection::{
    Direction, HalfConnection, HalfStats, OptionChecker, StreamFragment, TcpState,
};

/// Reassembly tuning knobs.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Create connections for segments without an observed SYN.
    pub allow_missing_init: bool,
    /// Overlap resolution: newer bytes win (flip for keep-older).
    pub keep_newer_overlaps: bool,
    /// Out-of-order segments queued per direction before a gap is declared.
    pub pending_limit: usize,
    /// Bounded channel capacity between reassembler and stream readers.
    pub stream_channel_size: usize,
    /// Bytes of the leading server stream captured as the service banner.
    pub banner_size: usize,
    /// Idle connection timeout.
    pub connection_timeout: Duration,
    /// Live capture: saturated stream readers drop segments after a
    /// timeout instead of blocking the dispatch worker.
    pub live: bool,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            allow_missing_init: true,
            keep_newer_overlaps: true,
            pending_limit: 64,
            stream_channel_size: 256,
            banner_size: 512,
            connection_timeout: Duration::from_secs(5),
            live: false,
        }
    }
}

/// Canonical connection key: the smaller endpoint always comes first so
/// both directions map to the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    a: (IpAddr, u16),
    b: (IpAddr, u16),
}

impl ConnectionKey {
    pub fn new(src: (IpAddr, u16), dst: (IpAddr, u16)) -> Self {
        if src <= dst {
            Self { a: src, b: dst }
        } else {
            Self { a: dst, b: src }
        }
    }
}

/// Immutable connection facts handed to flow decoders at teardown.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    /// `client:port->server:port`
    pub ident: String,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub first_packet: DateTime<Utc>,
    /// Timestamp string of the first packet.
    pub timestamp: String,
    /// Bytes skipped over gaps, per direction.
    pub client_skipped: u64,
    pub server_skipped: u64,
    /// Leading bytes of the server stream.
    pub banner: Vec<u8>,
}

/// A flow decoder consumes the reassembled conversation of one connection.
pub trait StreamDecoder: Send {
    fn decode(&mut self, summary: &ConnectionSummary, fragments: &[StreamFragment]);
}

/// Selects a flow decoder for a new connection based on its ports.
pub type DecoderFactory =
    Arc<dyn Fn(u16, u16) -> Option<Box<dyn StreamDecoder>> + Send + Sync>;

/// Counts outstanding stream reader tasks.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl WaitGroup {
    pub fn add(&self, n: usize) {
        *self.inner.0.lock() += n;
    }

    pub fn done(&self) {
        let mut count = self.inner.0.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.1.notify_all();
        }
    }

    /// Wait until the count reaches zero or the timeout elapses; returns
    /// false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.inner.0.lock();
        while *count > 0 {
            if self.inner.1.wait_for(&mut count, timeout).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

struct Connection {
    key: ConnectionKey,
    ident: String,
    client_addr: (IpAddr, u16),
    server_addr: (IpAddr, u16),
    first_packet: DateTime<Utc>,
    last_activity: AtomicI64,
    state: Mutex<TcpState>,
    optchecker: Mutex<OptionChecker>,
    client: Mutex<HalfConnection>,
    server: Mutex<HalfConnection>,
    /// Merged committed fragments in arrival order, built by the readers.
    fragments: Mutex<Vec<StreamFragment>>,
    /// Leading server-stream bytes for service identification.
    banner: Mutex<Vec<u8>>,
    banner_size: usize,
    /// Flow decoder, taken by the reader that finishes last.
    decoder: Mutex<Option<Box<dyn StreamDecoder>>>,
    live_readers: AtomicUsize,
}

impl Connection {
    fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            ident: self.ident.clone(),
            client_ip: self.client_addr.0,
            client_port: self.client_addr.1,
            server_ip: self.server_addr.0,
            server_port: self.server_addr.1,
            first_packet: self.first_packet,
            timestamp: time_to_string(self.first_packet),
            client_skipped: self.client.lock().stats.skipped_bytes,
            server_skipped: self.server.lock().stats.skipped_bytes,
            banner: self.banner.lock().clone(),
        }
    }
}

/// Pool statistics.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub segments_processed: AtomicU64,
    pub segments_ignored: AtomicU64,
}

/// Owns all live TCP connections and their stream reader tasks.
pub struct StreamPool {
    config: ReassemblyConfig,
    factory: DecoderFactory,
    connections: Mutex<HashMap<ConnectionKey, Arc<Connection>>>,
    readers: WaitGroup,
    pub stats: PoolStats,
}

impl StreamPool {
    pub fn new(config: ReassemblyConfig, factory: DecoderFactory) -> Self {
        Self {
            config,
            factory,
            connections: Mutex::new(HashMap::new()),
            readers: WaitGroup::default(),
            stats: PoolStats::default(),
        }
    }

    /// Number of live connections.
    pub fn active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Route one TCP segment into its connection.
    pub fn process(&self, segment: TcpSegment) {
        self.stats.segments_processed.fetch_add(1, Ordering::Relaxed);

        let key = ConnectionKey::new(
            (segment.src_ip, segment.src_port),
            (segment.dst_ip, segment.dst_port),
        );

        let conn = {
            let mut map = self.connections.lock();
            match map.get(&key) {
                Some(conn) => conn.clone(),
                None => {
                    // creation requires a SYN unless missing-init is allowed
                    if !segment.syn && !self.config.allow_missing_init {
                        self.stats.segments_ignored.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    let conn = self.create_connection(&key, &segment);
                    map.insert(key, conn.clone());
                    conn
                }
            }
        };

        conn.last_activity
            .store(segment.timestamp.timestamp(), Ordering::Relaxed);
        conn.state
            .lock()
            .advance(segment.syn, segment.ack, segment.fin, segment.rst);

        if !conn.optchecker.lock().accept(segment.payload.len()) {
            return;
        }

        let from_client = (segment.src_ip, segment.src_port) == conn.client_addr;
        {
            let mut half = if from_client {
                conn.client.lock()
            } else {
                conn.server.lock()
            };
            half.insert(segment.seq, segment.syn, &segment.payload, segment.timestamp);

            if segment.fin || segment.rst {
                half.terminal = true;
                half.flush();
            }
        }

        // RST kills both directions at once
        if segment.rst {
            let mut other = if from_client {
                conn.server.lock()
            } else {
                conn.client.lock()
            };
            other.terminal = true;
            other.flush();
        }

        let both_terminal = conn.client.lock().terminal && conn.server.lock().terminal;
        if both_terminal {
            self.teardown(&conn.key);
        }
    }

    fn create_connection(&self, key: &ConnectionKey, segment: &TcpSegment) -> Arc<Connection> {
        self.stats.connections_created.fetch_add(1, Ordering::Relaxed);

        let client_addr = (segment.src_ip, segment.src_port);
        let server_addr = (segment.dst_ip, segment.dst_port);
        let ident = format!(
            "{}:{}->{}:{}",
            client_addr.0, client_addr.1, server_addr.0, server_addr.1
        );
        trace!(target: "reassembly", %ident, "new connection");

        let (client_tx, client_rx) = bounded(self.config.stream_channel_size);
        let (server_tx, server_rx) = bounded(self.config.stream_channel_size);

        let conn = Arc::new(Connection {
            key: *key,
            ident: ident.clone(),
            client_addr,
            server_addr,
            first_packet: segment.timestamp,
            last_activity: AtomicI64::new(segment.timestamp.timestamp()),
            state: Mutex::new(TcpState::Closed),
            optchecker: Mutex::new(OptionChecker::default()),
            client: Mutex::new(HalfConnection::new(
                Direction::ClientToServer,
                ident.clone(),
                client_tx,
                self.config.keep_newer_overlaps,
                self.config.pending_limit,
                self.config.live,
            )),
            server: Mutex::new(HalfConnection::new(
                Direction::ServerToClient,
                ident.clone(),
                server_tx,
                self.config.keep_newer_overlaps,
                self.config.pending_limit,
                self.config.live,
            )),
            fragments: Mutex::new(Vec::new()),
            banner: Mutex::new(Vec::new()),
            banner_size: self.config.banner_size,
            decoder: Mutex::new((self.factory)(client_addr.1, server_addr.1)),
            live_readers: AtomicUsize::new(2),
        });

        self.spawn_reader(conn.clone(), client_rx);
        self.spawn_reader(conn.clone(), server_rx);

        conn
    }

    // One stream reader task per direction: drains committed fragments
    // into the shared conversation buffer; the reader that finishes last
    // runs the flow decoder.
    fn spawn_reader(&self, conn: Arc<Connection>, rx: Receiver<StreamFragment>) {
        self.readers.add(1);
        let wait = self.readers.clone();

        thread::Builder::new()
            .name(format!("stream-{}", conn.ident))
            .spawn(move || {
                for fragment in rx.iter() {
                    if fragment.direction == Direction::ServerToClient {
                        let mut banner = conn.banner.lock();
                        let room = conn.banner_size.saturating_sub(banner.len());
                        if room > 0 {
                            let take = room.min(fragment.data.len());
                            banner.extend_from_slice(&fragment.data[..take]);
                        }
                    }
                    conn.fragments.lock().push(fragment);
                }

                // channel closed: this direction is done
                if conn.live_readers.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let decoder = conn.decoder.lock().take();
                    if let Some(mut decoder) = decoder {
                        let summary = conn.summary();
                        let fragments = conn.fragments.lock();
                        decoder.decode(&summary, &fragments);
                    }
                }
                wait.done();
            })
            .expect("failed to spawn stream reader");
    }

    // Remove the connection from the pool and close both stream channels,
    // which lets the readers finalize.
    fn teardown(&self, key: &ConnectionKey) {
        let conn = self.connections.lock().remove(key);
        if let Some(conn) = conn {
            debug!(target: "reassembly", ident = %conn.ident, "connection teardown");
            conn.client.lock().flush();
            conn.server.lock().flush();
            self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Tear down connections idle longer than the configured timeout.
    pub fn expire_idle(&self, now: DateTime<Utc>) {
        let cutoff = now.timestamp() - self.config.connection_timeout.as_secs() as i64;
        let idle: Vec<ConnectionKey> = self
            .connections
            .lock()
            .values()
            .filter(|c| c.last_activity.load(Ordering::Relaxed) < cutoff)
            .map(|c| c.key)
            .collect();
        for key in idle {
            self.teardown(&key);
        }
    }

    /// Flush all connections regardless of FSM state and wait for the
    /// stream readers to finalize. Called on source EOF or shutdown.
    pub fn flush_all(&self, timeout: Duration) -> bool {
        let keys: Vec<ConnectionKey> = self.connections.lock().keys().copied().collect();
        debug!(target: "reassembly", connections = keys.len(), "flushing all connections");
        for key in keys {
            self.teardown(&key);
        }
        self.readers.wait_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn segment(
        src: (&str, u16),
        dst: (&str, u16),
        seq: u32,
        flags: (bool, bool, bool, bool),
        payload: &[u8],
    ) -> TcpSegment {
        let (syn, ack, fin, rst) = flags;
        TcpSegment {
            src_ip: src.0.parse().unwrap(),
            dst_ip: dst.0.parse().unwrap(),
            src_port: src.1,
            dst_port: dst.1,
            seq,
            syn,
            fin,
            rst,
            ack,
            payload: payload.to_vec(),
            timestamp: Utc::now(),
        }
    }

    struct Capture {
        calls: Arc<AtomicUsize>,
        bytes: Arc<Mutex<Vec<u8>>>,
    }

    impl StreamDecoder for Capture {
        fn decode(&mut self, _summary: &ConnectionSummary, fragments: &[StreamFragment]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut bytes = self.bytes.lock();
            for f in fragments {
                bytes.extend_from_slice(&f.data);
            }
        }
    }

    fn pool_with_capture() -> (StreamPool, Arc<AtomicUsize>, Arc<Mutex<Vec<u8>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let bytes2 = bytes.clone();
        let factory: DecoderFactory = Arc::new(move |_c, _s| {
            Some(Box::new(Capture {
                calls: calls2.clone(),
                bytes: bytes2.clone(),
            }) as Box<dyn StreamDecoder>)
        });
        (
            StreamPool::new(ReassemblyConfig::default(), factory),
            calls,
            bytes,
        )
    }

    const CLIENT: (&str, u16) = ("192.168.1.14", 49209);
    const SERVER: (&str, u16) = ("172.217.6.163", 443);

    #[test]
    fn test_handshake_data_teardown() {
        let (pool, calls, bytes) = pool_with_capture();

        pool.process(segment(CLIENT, SERVER, 100, (true, false, false, false), b""));
        pool.process(segment(SERVER, CLIENT, 500, (true, true, false, false), b""));
        pool.process(segment(CLIENT, SERVER, 101, (false, true, false, false), b""));
        assert_eq!(pool.active_connections(), 1);

        pool.process(segment(CLIENT, SERVER, 101, (false, true, false, false), b"hello server"));
        pool.process(segment(SERVER, CLIENT, 501, (false, true, false, false), b"hello client"));

        pool.process(segment(CLIENT, SERVER, 113, (false, true, true, false), b""));
        pool.process(segment(SERVER, CLIENT, 513, (false, true, true, false), b""));

        assert!(pool.flush_all(Duration::from_secs(5)));
        assert_eq!(pool.active_connections(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let collected = bytes.lock().clone();
        assert_eq!(collected.len(), 24);
    }

    #[test]
    fn test_rst_tears_down() {
        let (pool, calls, _) = pool_with_capture();

        pool.process(segment(CLIENT, SERVER, 100, (true, false, false, false), b""));
        pool.process(segment(CLIENT, SERVER, 101, (false, true, false, false), b"data"));
        pool.process(segment(SERVER, CLIENT, 500, (false, false, false, true), b""));

        assert!(pool.flush_all(Duration::from_secs(5)));
        assert_eq!(pool.active_connections(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_init_policy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory: DecoderFactory = Arc::new(|_, _| None);

        let mut config = ReassemblyConfig::default();
        config.allow_missing_init = false;
        let pool = StreamPool::new(config, factory.clone());
        pool.process(segment(CLIENT, SERVER, 100, (false, true, false, false), b"no syn"));
        assert_eq!(pool.active_connections(), 0);
        assert_eq!(pool.stats.segments_ignored.load(Ordering::Relaxed), 1);

        let mut config = ReassemblyConfig::default();
        config.allow_missing_init = true;
        let pool = StreamPool::new(config, factory);
        pool.process(segment(CLIENT, SERVER, 100, (false, true, false, false), b"no syn"));
        assert_eq!(pool.active_connections(), 1);
        assert!(pool.flush_all(Duration::from_secs(5)));
        drop(calls);
    }

    #[test]
    fn test_flush_all_finalizes_open_connections() {
        let (pool, calls, bytes) = pool_with_capture();

        pool.process(segment(CLIENT, SERVER, 100, (true, false, false, false), b""));
        pool.process(segment(CLIENT, SERVER, 101, (false, true, false, false), b"unfinished"));

        assert!(pool.flush_all(Duration::from_secs(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bytes.lock().as_slice(), b"unfinished");
    }

    #[test]
    fn test_expire_idle() {
        let (pool, calls, _) = pool_with_capture();

        pool.process(segment(CLIENT, SERVER, 100, (true, false, false, false), b""));
        assert_eq!(pool.active_connections(), 1);

        let future = Utc::now() + chrono::Duration::seconds(60);
        pool.expire_idle(future);
        assert_eq!(pool.active_connections(), 0);

        assert!(pool.flush_all(Duration::from_secs(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
