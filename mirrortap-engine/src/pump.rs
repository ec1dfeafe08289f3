//! Tunnel pumps
//!
//! The tunnel handle has blocking read/write semantics, so each side gets a
//! dedicated OS thread coupled to an async pump task through a bounded
//! queue. Throttling happens in the pump tasks: the limiter itself never
//! blocks, and delays are awaited asynchronously so the blocking threads
//! only ever do I/O. The downlink is a single FIFO — a throttled session
//! delays delivery for unrelated sessions sharing the direction, a known
//! limitation inherited from the design.

use crate::handler::SessionHandler;
use crate::limiter::{Admission, RateLimiter};
use crate::stats::EngineStats;
use bytes::{Bytes, BytesMut};
use mirrortap_capture::CaptureHandle;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// How often a paused direction re-checks its rate setting
const PAUSE_POLL: Duration = Duration::from_millis(250);

/// Blocking read side of the tunnel handle supplied by the launcher
pub trait TunnelRead: Send {
    /// Read the next tunnel datagram; `Ok(0)` means the tunnel is gone.
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Blocking write side of the tunnel handle
pub trait TunnelWrite: Send {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

impl<R: io::Read + Send> TunnelRead for R {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

impl<W: io::Write + Send> TunnelWrite for W {
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.write_all(packet)?;
        self.flush()
    }
}

/// Blocking tunnel-read loop on its own thread. Exits on tunnel EOF/error,
/// on shutdown, or when the uplink queue is gone.
pub fn spawn_tunnel_reader<R: TunnelRead + 'static>(
    mut tunnel: R,
    tx: mpsc::Sender<BytesMut>,
    running: Arc<AtomicBool>,
    mtu: usize,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("mirrortap-tunnel-rx".into())
        .spawn(move || {
            loop {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let mut buf = BytesMut::zeroed(mtu);
                match tunnel.read_packet(&mut buf) {
                    Ok(0) => {
                        debug!("tunnel read side closed");
                        break;
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        if tx.blocking_send(buf).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if running.load(Ordering::Relaxed) {
                            warn!("tunnel read error: {}", e);
                        }
                        break;
                    }
                }
            }
            debug!("tunnel reader stopped");
        })
}

/// Blocking tunnel-write loop; drains already-throttled packets in FIFO
/// order.
pub fn spawn_tunnel_writer<W: TunnelWrite + 'static>(
    mut tunnel: W,
    mut rx: mpsc::Receiver<Bytes>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("mirrortap-tunnel-tx".into())
        .spawn(move || {
            while let Some(packet) = rx.blocking_recv() {
                if let Err(e) = tunnel.write_packet(&packet) {
                    warn!("tunnel write error: {}", e);
                    break;
                }
            }
            debug!("tunnel writer stopped");
        })
}

/// Uplink: tunnel datagrams -> throttle -> capture -> handler.
pub async fn run_uplink_pump(
    mut rx: mpsc::Receiver<BytesMut>,
    handler: Arc<SessionHandler>,
    limiter: Arc<RateLimiter>,
    capture: CaptureHandle,
    stats: Arc<EngineStats>,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            _ = shutdown.changed() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        if !throttle(&limiter, packet.len(), &running).await {
            break;
        }
        stats.record_received(packet.len());
        capture.record(&packet);

        if let Err(e) = handler.handle_tunnel_packet(&packet).await {
            if e.is_parse_error() {
                stats.record_parse_error();
                debug!("dropping packet: {}", e);
            } else {
                warn!("packet handling failed: {}", e);
            }
        }
    }
    debug!("uplink pump stopped");
}

/// Downlink: handler replies -> throttle -> capture -> tunnel writer.
pub async fn run_downlink_pump(
    mut rx: mpsc::Receiver<Bytes>,
    writer: mpsc::Sender<Bytes>,
    limiter: Arc<RateLimiter>,
    capture: CaptureHandle,
    stats: Arc<EngineStats>,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            _ = shutdown.changed() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        if !throttle(&limiter, packet.len(), &running).await {
            break;
        }
        stats.record_sent(packet.len());
        capture.record(&packet);

        if writer.send(packet).await.is_err() {
            break;
        }
    }
    debug!("downlink pump stopped");
}

/// Wait out the limiter's verdict. Returns false when the engine stopped
/// while waiting.
async fn throttle(limiter: &RateLimiter, len: usize, running: &AtomicBool) -> bool {
    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        match limiter.admit(len) {
            Admission::Granted => return true,
            Admission::Delayed(delay) => {
                tokio::time::sleep(delay).await;
                return running.load(Ordering::Relaxed);
            }
            // Paused: re-check the rate setting periodically
            Admission::Paused => tokio::time::sleep(PAUSE_POLL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn any_reader_is_a_tunnel_read() {
        let mut tunnel = Cursor::new(vec![1u8, 2, 3, 4]);
        let mut buf = [0u8; 16];
        let n = TunnelRead::read_packet(&mut tunnel, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);
    }

    #[test]
    fn any_writer_is_a_tunnel_write() {
        let mut out = Vec::new();
        TunnelWrite::write_packet(&mut out, &[9u8, 8, 7]).unwrap();
        assert_eq!(out, vec![9, 8, 7]);
    }

    #[tokio::test]
    async fn throttle_grants_when_unlimited() {
        let limiter = RateLimiter::unlimited();
        let running = AtomicBool::new(true);
        assert!(throttle(&limiter, 1_000_000, &running).await);
    }

    #[tokio::test]
    async fn paused_throttle_unblocks_on_engine_stop() {
        let limiter = Arc::new(RateLimiter::from_kbps(0));
        let running = Arc::new(AtomicBool::new(true));

        let limiter2 = limiter.clone();
        let running2 = running.clone();
        let waiter = tokio::spawn(async move { throttle(&limiter2, 100, &running2).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        running.store(false, Ordering::Relaxed);
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn paused_throttle_resumes_on_rate_change() {
        let limiter = Arc::new(RateLimiter::from_kbps(0));
        let running = Arc::new(AtomicBool::new(true));

        let limiter2 = limiter.clone();
        let running2 = running.clone();
        let waiter = tokio::spawn(async move { throttle(&limiter2, 100, &running2).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.set_rate_kbps(-1);
        assert!(waiter.await.unwrap());
    }
}
