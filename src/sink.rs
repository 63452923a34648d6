//! Concurrency-safe audit-record sinks.
//!
//! A [`RecordWriter`] owns the output file for exactly one record type:
//! it writes the file header on creation, appends length-delimited
//! records under an internal mutex, and prunes the file on close if no
//! records were ever written. [`RecordReader`] is the matching read side
//! used by the dumper and by tests.

use std::fs::{self, File as FsFile};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tracing::debug;

use crate::delimited::{read_frame, write_frame};
use crate::types::{Header, Record, RecordType};

/// File extension for uncompressed audit-record files.
pub const FILE_EXTENSION: &str = ".ncap";
/// File extension for gzip-compressed audit-record files.
pub const FILE_EXTENSION_COMPRESSED: &str = ".ncap.gz";

/// Options controlling a single record sink.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Target directory for the output file.
    pub out_dir: PathBuf,
    /// Wrap the file in a buffered writer.
    pub buffer: bool,
    /// Apply a gzip wrapper around the whole file.
    pub compress: bool,
    /// Gzip compression level (0-9).
    pub compression_level: u32,
    /// Capacity of the buffered writer.
    pub mem_buffer_size: usize,
    /// Capture source recorded in the header.
    pub source: String,
    /// Framework version recorded in the header.
    pub version: String,
    /// Whether records carry payload bytes, recorded in the header.
    pub includes_payloads: bool,
    /// Capture start time, `seconds.microseconds`.
    pub start_time: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            buffer: true,
            compress: false,
            compression_level: 6,
            mem_buffer_size: 1024 * 1024 * 12,
            source: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            includes_payloads: false,
            start_time: String::new(),
        }
    }
}

enum Sink {
    Plain(FsFile),
    Buffered(BufWriter<FsFile>),
    Gzip(GzEncoder<BufWriter<FsFile>>),
    /// Placeholder while tearing down.
    Closed,
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Sink::Plain(f) => f,
            Sink::Buffered(b) => b,
            Sink::Gzip(g) => g,
            Sink::Closed => unreachable!("write after close"),
        }
    }

    /// Unwind the writer stack down to the file, flushing every layer.
    fn finish(self) -> io::Result<FsFile> {
        match self {
            Sink::Plain(f) => Ok(f),
            Sink::Buffered(b) => b.into_inner().map_err(|e| e.into_error()),
            Sink::Gzip(g) => g.finish()?.into_inner().map_err(|e| e.into_error()),
            Sink::Closed => Err(io::Error::new(io::ErrorKind::Other, "sink already closed")),
        }
    }
}

/// Length-delimited, optionally gzipped, concurrency-safe writer for one
/// audit-record type.
pub struct RecordWriter {
    record_type: RecordType,
    path: PathBuf,
    sink: Mutex<Sink>,
    num_records: AtomicI64,
}

impl RecordWriter {
    /// Create the output file and write the header frame.
    pub fn create(record_type: RecordType, config: &WriterConfig) -> io::Result<Self> {
        let ext = if config.compress {
            FILE_EXTENSION_COMPRESSED
        } else {
            FILE_EXTENSION
        };
        let path = config.out_dir.join(format!("{}{}", record_type.name(), ext));

        let file = FsFile::create(&path)?;
        let buffered = BufWriter::with_capacity(config.mem_buffer_size.max(4096), file);

        let mut sink = if config.compress {
            Sink::Gzip(GzEncoder::new(
                buffered,
                Compression::new(config.compression_level.min(9)),
            ))
        } else if config.buffer {
            Sink::Buffered(buffered)
        } else {
            Sink::Plain(buffered.into_inner().map_err(|e| e.into_error())?)
        };

        let header = Header {
            record_type: record_type as i32,
            created: config.start_time.clone(),
            input_source: config.source.clone(),
            version: config.version.clone(),
            contains_payloads: config.includes_payloads,
        };
        let bytes = bincode::serialize(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(sink.writer(), &bytes)?;

        Ok(Self {
            record_type,
            path,
            sink: Mutex::new(sink),
            num_records: AtomicI64::new(0),
        })
    }

    /// The record type this writer accepts.
    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    /// Number of records written so far.
    pub fn num_records(&self) -> i64 {
        self.num_records.load(Ordering::Relaxed)
    }

    /// Append one record. Safe under concurrent callers.
    pub fn write(&self, record: &Record) -> io::Result<()> {
        if record.record_type() != self.record_type {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "record type mismatch: writer is {}, record is {}",
                    self.record_type,
                    record.record_type()
                ),
            ));
        }

        let bytes = record
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut sink = self.sink.lock();
        write_frame(sink.writer(), &bytes)?;
        drop(sink);

        self.num_records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush all buffers, sync the file, and return its name and size.
    ///
    /// A file that holds only the header is deleted and reported with
    /// size 0, so protocols never seen on the wire leave no output behind.
    pub fn close(self) -> io::Result<(PathBuf, u64)> {
        let sink = {
            let mut guard = self.sink.lock();
            std::mem::replace(&mut *guard, Sink::Closed)
        };

        let file = sink.finish()?;
        file.sync_all()?;
        drop(file);

        if self.num_records.load(Ordering::Relaxed) == 0 {
            debug!(file = %self.path.display(), "pruning empty audit record file");
            fs::remove_file(&self.path)?;
            return Ok((self.path, 0));
        }

        let size = fs::metadata(&self.path)?.len();
        Ok((self.path, size))
    }
}

/// One writer per record type, shared across all decoders and flow
/// readers.
///
/// Output write failures are fatal: a capture cannot be rewound, so a
/// failed append means silent data loss from that point on. The process
/// logs the error and exits with code 2.
pub struct SinkSet {
    writers: std::collections::HashMap<RecordType, RecordWriter>,
}

impl SinkSet {
    /// Create writers for the given record types.
    pub fn create(types: &[RecordType], config: &WriterConfig) -> io::Result<Self> {
        let mut writers = std::collections::HashMap::new();
        for ty in types {
            writers.insert(*ty, RecordWriter::create(*ty, config)?);
        }
        Ok(Self { writers })
    }

    /// Append a record to its type's file. Panics on unknown type
    /// (a decoder emitting a type it never registered is a programming
    /// error); exits the process on I/O failure.
    pub fn write(&self, record: &Record) {
        let ty = record.record_type();
        let writer = match self.writers.get(&ty) {
            Some(w) => w,
            None => {
                tracing::error!(record_type = %ty, "record type has no registered writer");
                return;
            }
        };
        if let Err(e) = writer.write(record) {
            tracing::error!(record_type = %ty, error = %e, "audit record write failed");
            std::process::exit(2);
        }
    }

    /// Record counts per type, for the final stats table.
    pub fn record_counts(&self) -> Vec<(RecordType, i64)> {
        let mut counts: Vec<_> = self
            .writers
            .values()
            .map(|w| (w.record_type(), w.num_records()))
            .collect();
        counts.sort_by_key(|(ty, _)| *ty);
        counts
    }

    /// Close all writers; returns `(path, size)` for every non-empty file.
    pub fn close(self) -> io::Result<Vec<(PathBuf, u64)>> {
        let mut results = Vec::new();
        for (_, writer) in self.writers {
            let (path, size) = writer.close()?;
            if size > 0 {
                results.push((path, size));
            }
        }
        results.sort();
        Ok(results)
    }
}

/// Reader for a single audit-record file.
pub struct RecordReader {
    record_type: RecordType,
    header: Header,
    reader: Box<dyn Read + Send>,
}

impl RecordReader {
    /// Open an audit-record file, transparently handling the gzip wrapper
    /// based on the file extension.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = FsFile::open(path)?;
        let buffered = BufReader::new(file);

        let mut reader: Box<dyn Read + Send> =
            if path.extension().map(|e| e == "gz").unwrap_or(false) {
                Box::new(GzDecoder::new(buffered))
            } else {
                Box::new(buffered)
            };

        let header_bytes = read_frame(&mut reader)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "missing file header")
        })?;
        let header: Header = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let record_type = RecordType::from_tag(header.record_type).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown record type tag {}", header.record_type),
            )
        })?;

        Ok(Self {
            record_type,
            header,
            reader,
        })
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Read the next record, or `None` at end of file.
    pub fn next_record(&mut self) -> io::Result<Option<Record>> {
        match read_frame(&mut self.reader)? {
            Some(bytes) => {
                let record = Record::decode(self.record_type, &bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credentials;
    use std::sync::Arc;

    fn test_config(dir: &Path) -> WriterConfig {
        WriterConfig {
            out_dir: dir.to_path_buf(),
            source: "test.pcap".into(),
            start_time: "1580806571.988737".into(),
            ..Default::default()
        }
    }

    fn sample(i: usize) -> Record {
        Credentials {
            timestamp: format!("{}.000000", i),
            service: "HTTP".into(),
            flow: "1.2.3.4:1024->5.6.7.8:80".into(),
            user: format!("user{}", i),
            password: "hunter2".into(),
            notes: String::new(),
        }
        .into()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = std::env::temp_dir().join("netaudit-sink-roundtrip");
        fs::create_dir_all(&dir).unwrap();

        let writer = RecordWriter::create(RecordType::Credentials, &test_config(&dir)).unwrap();
        let records: Vec<Record> = (0..10).map(sample).collect();
        for r in &records {
            writer.write(r).unwrap();
        }
        let (path, size) = writer.close().unwrap();
        assert!(size > 0);

        let mut reader = RecordReader::open(&path).unwrap();
        assert_eq!(reader.header().input_source, "test.pcap");
        let mut got = Vec::new();
        while let Some(r) = reader.next_record().unwrap() {
            got.push(r);
        }
        assert_eq!(got, records);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_compressed_roundtrip() {
        let dir = std::env::temp_dir().join("netaudit-sink-gz");
        fs::create_dir_all(&dir).unwrap();

        let mut config = test_config(&dir);
        config.compress = true;

        let writer = RecordWriter::create(RecordType::Credentials, &config).unwrap();
        writer.write(&sample(1)).unwrap();
        let (path, size) = writer.close().unwrap();
        assert!(size > 0);
        assert!(path.to_string_lossy().ends_with(FILE_EXTENSION_COMPRESSED));

        let mut reader = RecordReader::open(&path).unwrap();
        assert_eq!(reader.next_record().unwrap(), Some(sample(1)));
        assert_eq!(reader.next_record().unwrap(), None);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_empty_file_pruned() {
        let dir = std::env::temp_dir().join("netaudit-sink-empty");
        fs::create_dir_all(&dir).unwrap();

        let writer = RecordWriter::create(RecordType::Ssh, &test_config(&dir)).unwrap();
        let (path, size) = writer.close().unwrap();
        assert_eq!(size, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let dir = std::env::temp_dir().join("netaudit-sink-mismatch");
        fs::create_dir_all(&dir).unwrap();

        let writer = RecordWriter::create(RecordType::Ssh, &test_config(&dir)).unwrap();
        assert!(writer.write(&sample(0)).is_err());
        let _ = writer.close();
    }

    #[test]
    fn test_concurrent_writers_well_framed() {
        let dir = std::env::temp_dir().join("netaudit-sink-concurrent");
        fs::create_dir_all(&dir).unwrap();

        let writer =
            Arc::new(RecordWriter::create(RecordType::Credentials, &test_config(&dir)).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let w = writer.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        w.write(&sample(t * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let writer = Arc::into_inner(writer).unwrap();
        let (path, _) = writer.close().unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let mut count = 0;
        while let Some(_) = reader.next_record().unwrap() {
            count += 1;
        }
        assert_eq!(count, 200);

        fs::remove_file(path).unwrap();
    }
}
