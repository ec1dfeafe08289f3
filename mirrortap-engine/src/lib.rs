//! MirrorTap session engine
//!
//! A userspace TCP/IP session engine: it receives a device's raw IP
//! traffic through a local virtual-interface tunnel, terminates every TCP
//! and UDP flow itself, relays the application data to the real remote
//! endpoints over ordinary outbound sockets, and records a byte-exact pcap
//! trace of everything exchanged. To the client the engine is
//! indistinguishable from the real peer: handshakes, acknowledgements and
//! teardowns are synthesized locally.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                          Engine                              |
//! |                                                              |
//! |  tunnel ──> TunnelReader ──> uplink pump ──> SessionHandler  |
//! |                              (throttle,          |           |
//! |                               capture)           v           |
//! |                                            SessionTable      |
//! |                                            (LRU, cap 50)     |
//! |                                                  |           |
//! |                                                  v           |
//! |                                       SocketIOMultiplexer    |
//! |                                       (one thread owns all   |
//! |                                        outbound sockets)     |
//! |                                                  |           |
//! |  tunnel <── TunnelWriter <── downlink pump <─────+           |
//! |                              (throttle,                      |
//! |                               capture)                       |
//! +--------------------------------------------------------------+
//!                                 |
//!                                 v
//!                          CaptureSink (pcap)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use mirrortap_engine::{Engine, EngineBuilder};
//!
//! let engine = Engine::builder()
//!     .capture_path("/tmp/trace.pcap")
//!     .uplink_kbps(-1)
//!     .downlink_kbps(512)
//!     .socket_protector(|fd| vpn_service.protect(fd))
//!     .build()?;
//!
//! // The launcher supplies the tunnel handle (blocking read/write)
//! engine.start(tun_reader, tun_writer)?;
//! // ...
//! engine.stop()?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod limiter;
pub mod logging;
pub mod mux;
pub mod packet;
pub mod pump;
pub mod session;
pub mod stats;
pub mod table;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use config::{EngineConfig, LogLevel};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
pub use handler::SessionHandler;
pub use limiter::{Admission, RateLimiter};
pub use mux::{MuxHandle, SocketIOMultiplexer, SocketProtector};
pub use packet::{build_ipv4_tcp, build_ipv4_udp, parse_packet, ParsedPacket, TcpFlags, TcpOptions};
pub use pump::{TunnelRead, TunnelWrite};
pub use session::{Protocol, Session, SessionKey, TcpState};
pub use stats::{EngineStats, StatsSnapshot};
pub use table::SessionTable;

pub use mirrortap_capture::{CaptureConfig, CaptureHandle, CaptureSink};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::{EngineError, Result};
    pub use crate::pump::{TunnelRead, TunnelWrite};
}
