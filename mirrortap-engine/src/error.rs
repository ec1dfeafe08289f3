//! Error types for the MirrorTap session engine

use std::io;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the session engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("unsupported IP protocol: {0}")]
    UnsupportedProtocol(u8),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("capture error: {0}")]
    Capture(#[from] mirrortap_capture::CaptureError),

    #[error("socket registration failed: {0}")]
    Registration(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine not running")]
    NotRunning,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl EngineError {
    /// True for the per-packet parse error family; these are logged and the
    /// offending packet is dropped without stopping the reader loop.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            EngineError::PacketTooShort { .. }
                | EngineError::InvalidIpVersion(_)
                | EngineError::UnsupportedProtocol(_)
                | EngineError::InvalidPacket(_)
        )
    }
}
