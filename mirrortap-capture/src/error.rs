//! Error types for the capture sink

use std::io;
use thiserror::Error;

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Main error type for the capture sink
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("pcap error: {0}")]
    Pcap(#[from] pcap_file::PcapError),

    #[error("capture path not set")]
    NoPath,

    #[error("sink already closed")]
    Closed,
}
