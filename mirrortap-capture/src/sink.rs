//! Append-only pcap capture sink
//!
//! Every packet that crosses the engine boundary is recorded to a legacy
//! pcap file (global header followed by per-packet records). Recording is
//! best-effort: the hot path hands records to a bounded queue and never
//! blocks on disk I/O; a dedicated drain thread appends records in arrival
//! order. When secure-capture mode is enabled a second stream receives a
//! duplicate of every record and can additionally be fed a decrypted view
//! through [`CaptureHandle::record_secure`].

use crate::error::{CaptureError, Result};
use bytes::Bytes;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::DataLink;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default bound for the record queue
pub const DEFAULT_QUEUE_DEPTH: usize = 8192;

/// Default capture length per record
pub const DEFAULT_SNAPLEN: u32 = 65535;

/// Capture sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Primary capture file
    pub path: PathBuf,
    /// Secondary stream, written when secure capture is enabled
    pub secure_path: Option<PathBuf>,
    /// Bound of the record queue; overflow drops records (counted)
    pub queue_depth: usize,
    /// Bytes captured per record; longer packets are truncated
    pub snaplen: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mirrortap.pcap"),
            secure_path: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            snaplen: DEFAULT_SNAPLEN,
        }
    }
}

/// Counters shared between the handle and the drain thread
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub records_written: AtomicU64,
    pub records_dropped: AtomicU64,
    pub write_errors: AtomicU64,
}

/// Which stream(s) a record targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    /// Primary, plus the secondary duplicate when one is open
    Primary,
    /// Secondary only (decrypted view)
    SecureOnly,
}

enum SinkMessage {
    Record {
        ts: Duration,
        data: Bytes,
        stream: Stream,
    },
    Close,
}

/// Cloneable, non-blocking front end of the sink
#[derive(Clone)]
pub struct CaptureHandle {
    tx: Option<mpsc::Sender<SinkMessage>>,
    stats: Arc<CaptureStats>,
}

impl CaptureHandle {
    /// A handle that records nothing; used where capture is turned off
    pub fn disabled() -> Self {
        Self {
            tx: None,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Append one packet to the capture. Never blocks: on queue overflow
    /// the record is dropped and counted.
    pub fn record(&self, packet: &[u8]) {
        self.enqueue(packet, Stream::Primary);
    }

    /// Append one packet to the secondary (secure) stream only.
    pub fn record_secure(&self, packet: &[u8]) {
        self.enqueue(packet, Stream::SecureOnly);
    }

    fn enqueue(&self, packet: &[u8], stream: Stream) {
        let Some(tx) = &self.tx else { return };
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let data = Bytes::copy_from_slice(packet);
        let msg = SinkMessage::Record { ts, data, stream };
        if tx.try_send(msg).is_err() {
            self.stats.records_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn records_written(&self) -> u64 {
        self.stats.records_written.load(Ordering::Relaxed)
    }

    pub fn records_dropped(&self) -> u64 {
        self.stats.records_dropped.load(Ordering::Relaxed)
    }
}

/// Owns the drain thread; closing flushes both streams
pub struct CaptureSink {
    tx: mpsc::Sender<SinkMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureSink {
    /// Open the capture file(s) and start the drain thread.
    pub fn spawn(config: CaptureConfig) -> Result<(CaptureHandle, CaptureSink)> {
        if config.path.as_os_str().is_empty() {
            return Err(CaptureError::NoPath);
        }

        let primary = open_stream(&config.path, config.snaplen)?;
        let secondary = match &config.secure_path {
            Some(path) => Some(open_stream(path, config.snaplen)?),
            None => None,
        };

        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let stats = Arc::new(CaptureStats::default());

        let drain_stats = stats.clone();
        let snaplen = config.snaplen as usize;
        let thread = thread::Builder::new()
            .name("mirrortap-capture".into())
            .spawn(move || drain(rx, primary, secondary, drain_stats, snaplen))?;

        info!("capture sink opened: {}", config.path.display());

        let handle = CaptureHandle {
            tx: Some(tx.clone()),
            stats,
        };
        let sink = CaptureSink {
            tx,
            thread: Some(thread),
        };
        Ok((handle, sink))
    }

    /// Flush and close both streams. Records already queued are written
    /// before the files are closed.
    pub fn close(mut self) {
        let _ = self.tx.blocking_send(SinkMessage::Close);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

type Writer = PcapWriter<BufWriter<File>>;

fn open_stream(path: &std::path::Path, snaplen: u32) -> Result<Writer> {
    let file = File::create(path)?;
    let header = PcapHeader {
        snaplen,
        datalink: DataLink::RAW,
        ..Default::default()
    };
    Ok(PcapWriter::with_header(BufWriter::new(file), header)?)
}

fn drain(
    mut rx: mpsc::Receiver<SinkMessage>,
    mut primary: Writer,
    mut secondary: Option<Writer>,
    stats: Arc<CaptureStats>,
    snaplen: usize,
) {
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            SinkMessage::Record { ts, data, stream } => {
                let captured = &data[..data.len().min(snaplen)];
                let record = PcapPacket::new(ts, data.len() as u32, captured);

                let mut wrote = false;
                if stream == Stream::Primary {
                    wrote |= write_record(&mut primary, &record, &stats);
                }
                if let Some(sec) = secondary.as_mut() {
                    wrote |= write_record(sec, &record, &stats);
                }
                if wrote {
                    stats.records_written.fetch_add(1, Ordering::Relaxed);
                }
            }
            SinkMessage::Close => break,
        }
    }

    flush_stream(primary);
    if let Some(sec) = secondary {
        flush_stream(sec);
    }
    debug!(
        "capture sink closed: {} records written, {} dropped, {} write errors",
        stats.records_written.load(Ordering::Relaxed),
        stats.records_dropped.load(Ordering::Relaxed),
        stats.write_errors.load(Ordering::Relaxed),
    );
}

/// Best-effort append; a failed write is logged and counted, never raised.
fn write_record(writer: &mut Writer, record: &PcapPacket<'_>, stats: &CaptureStats) -> bool {
    match writer.write_packet(record) {
        Ok(_) => true,
        Err(e) => {
            stats.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!("capture write failed: {}", e);
            false
        }
    }
}

fn flush_stream(writer: Writer) {
    let mut inner = writer.into_writer();
    if let Err(e) = inner.flush() {
        warn!("capture flush failed: {}", e);
    }
}
