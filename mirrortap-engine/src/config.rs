//! Engine configuration

use crate::error::{EngineError, Result};
use mirrortap_capture::CaptureConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default session-table capacity
pub const DEFAULT_SESSION_CAPACITY: usize = 50;

/// Log verbosity, mapped onto `tracing` levels by [`crate::logging`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

/// Engine configuration
///
/// Rate limits follow the launcher's convention: a negative value means
/// unlimited, zero means paused (no bytes admitted), positive is a kbps
/// budget for that direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tunnel MTU; one read buffer per datagram
    pub mtu: usize,
    /// Bound of the session table (LRU eviction past this)
    pub session_capacity: usize,
    /// Uplink (client -> remote) budget in kbps
    pub uplink_kbps: i64,
    /// Downlink (remote -> client) budget in kbps
    pub downlink_kbps: i64,
    /// Capture sink settings; `secure_path` enables the second stream
    pub capture: CaptureConfig,
    /// Receive window advertised to the client
    pub recv_window: u16,
    /// MSS offered on SYN-ACK; clamped against the client's offer
    pub mss: u16,
    /// Cap on a session's pending outbound buffer
    pub max_pending_buffer: usize,
    /// Outbound connect timeout
    pub connect_timeout: Duration,
    /// Idle timeout for established TCP sessions
    pub tcp_idle_timeout: Duration,
    /// Idle timeout for UDP sessions
    pub udp_idle_timeout: Duration,
    /// Interval of the maintenance sweep
    pub sweep_interval: Duration,
    /// Bound of the uplink packet queue
    pub uplink_queue_depth: usize,
    /// Bound of the downlink packet queue
    pub downlink_queue_depth: usize,
    /// Log verbosity
    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            session_capacity: DEFAULT_SESSION_CAPACITY,
            uplink_kbps: -1,
            downlink_kbps: -1,
            capture: CaptureConfig::default(),
            recv_window: 65535,
            // Conservative MSS for better compatibility
            mss: 1360,
            max_pending_buffer: 1024 * 1024,
            connect_timeout: Duration::from_secs(30),
            tcp_idle_timeout: Duration::from_secs(300),
            udp_idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            uplink_queue_depth: 4096,
            downlink_queue_depth: 4096,
            log_level: LogLevel::Info,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mtu < 576 {
            return Err(EngineError::Config(format!(
                "mtu {} below IPv4 minimum of 576",
                self.mtu
            )));
        }
        if self.session_capacity == 0 {
            return Err(EngineError::Config("session_capacity must be > 0".into()));
        }
        if usize::from(self.mss) + 40 > self.mtu {
            return Err(EngineError::Config(format!(
                "mss {} does not fit mtu {} with IP+TCP headers",
                self.mss, self.mtu
            )));
        }
        if self.uplink_queue_depth == 0 || self.downlink_queue_depth == 0 {
            return Err(EngineError::Config("queue depths must be > 0".into()));
        }
        Ok(())
    }
}
