//! MirrorTap capture sink
//!
//! Persists every packet crossing the session-engine boundary to a legacy
//! pcap file (global header + per-packet records) for later offline
//! analysis. Writes are append-only and preserve arrival order per stream;
//! failures are counted and logged but never abort the data path.
//!
//! ```rust,ignore
//! use mirrortap_capture::{CaptureConfig, CaptureSink};
//!
//! let (handle, sink) = CaptureSink::spawn(CaptureConfig::default())?;
//! handle.record(&packet_bytes);
//! // ...
//! sink.close();
//! ```

pub mod error;
pub mod sink;

pub use error::{CaptureError, Result};
pub use sink::{CaptureConfig, CaptureHandle, CaptureSink, CaptureStats};
