//! Engine context and lifecycle
//!
//! The engine is an explicit context object: it owns the session table, the
//! per-direction rate limiters, the capture sink and the statistics, and
//! wires them into the pumps and the multiplexer at start. Nothing here is
//! a process-wide singleton, so multiple engine instances can coexist (the
//! tests rely on that). A stopped engine is not restartable; construct a
//! new one.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::handler::SessionHandler;
use crate::limiter::RateLimiter;
use crate::logging;
use crate::mux::{MuxHandle, SocketIOMultiplexer, SocketProtector};
use crate::pump::{self, TunnelRead, TunnelWrite};
use crate::session::Protocol;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::table::SessionTable;
use mirrortap_capture::{CaptureHandle, CaptureSink};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

enum EngineState {
    Idle,
    Running(EngineRuntime),
    Stopped,
}

struct EngineRuntime {
    runtime: tokio::runtime::Runtime,
    shutdown: watch::Sender<bool>,
    mux: MuxHandle,
    mux_thread: thread::JoinHandle<()>,
    /// Not joined on stop: it may be blocked in a tunnel read until the
    /// launcher closes the handle.
    _reader_thread: thread::JoinHandle<()>,
    writer_thread: thread::JoinHandle<()>,
    capture: CaptureHandle,
    capture_sink: CaptureSink,
}

/// The session engine
pub struct Engine {
    config: EngineConfig,
    table: Arc<SessionTable>,
    stats: Arc<EngineStats>,
    uplink_limiter: Arc<RateLimiter>,
    downlink_limiter: Arc<RateLimiter>,
    protector: Option<Arc<SocketProtector>>,
    running: Arc<AtomicBool>,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            table: Arc::new(SessionTable::new(config.session_capacity)),
            stats: Arc::new(EngineStats::new()),
            uplink_limiter: Arc::new(RateLimiter::from_kbps(config.uplink_kbps)),
            downlink_limiter: Arc::new(RateLimiter::from_kbps(config.downlink_kbps)),
            protector: None,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(EngineState::Idle),
            config,
        })
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Start the engine on the launcher-supplied tunnel handle.
    pub fn start<R, W>(&self, tunnel_rx: R, tunnel_tx: W) -> Result<()>
    where
        R: TunnelRead + 'static,
        W: TunnelWrite + 'static,
    {
        let mut state = self.state.lock();
        match *state {
            EngineState::Idle => {}
            _ => return Err(EngineError::AlreadyStarted),
        }

        logging::init_logging(self.config.log_level)?;

        let (capture, capture_sink) = CaptureSink::spawn(self.config.capture.clone())?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("mirrortap-worker")
            .enable_all()
            .build()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (uplink_tx, uplink_rx) = mpsc::channel(self.config.uplink_queue_depth);
        let (downlink_tx, downlink_rx) = mpsc::channel(self.config.downlink_queue_depth);
        let (writer_tx, writer_rx) = mpsc::channel(self.config.downlink_queue_depth);

        let (mux_handle, mux) =
            SocketIOMultiplexer::new(self.protector.clone(), self.config.connect_timeout);
        let handler = Arc::new(SessionHandler::new(
            self.table.clone(),
            mux_handle.clone(),
            downlink_tx,
            self.stats.clone(),
            &self.config,
        ));
        let mux_thread = mux.spawn(handler.clone())?;

        self.running.store(true, Ordering::Relaxed);

        let reader_thread = pump::spawn_tunnel_reader(
            tunnel_rx,
            uplink_tx,
            self.running.clone(),
            self.config.mtu,
        )?;
        let writer_thread = pump::spawn_tunnel_writer(tunnel_tx, writer_rx)?;

        runtime.spawn(pump::run_uplink_pump(
            uplink_rx,
            handler,
            self.uplink_limiter.clone(),
            capture.clone(),
            self.stats.clone(),
            self.running.clone(),
            shutdown_rx.clone(),
        ));
        runtime.spawn(pump::run_downlink_pump(
            downlink_rx,
            writer_tx,
            self.downlink_limiter.clone(),
            capture.clone(),
            self.stats.clone(),
            self.running.clone(),
            shutdown_rx.clone(),
        ));
        runtime.spawn(run_sweep(
            self.table.clone(),
            mux_handle.clone(),
            self.stats.clone(),
            self.config.tcp_idle_timeout,
            self.config.udp_idle_timeout,
            self.config.sweep_interval,
            shutdown_rx,
        ));

        *state = EngineState::Running(EngineRuntime {
            runtime,
            shutdown: shutdown_tx,
            mux: mux_handle,
            mux_thread,
            _reader_thread: reader_thread,
            writer_thread,
            capture,
            capture_sink,
        });

        info!(
            "engine started (capacity {}, uplink {} kbps, downlink {} kbps)",
            self.config.session_capacity, self.config.uplink_kbps, self.config.downlink_kbps
        );
        Ok(())
    }

    /// Stop the engine: close every live session's socket, stop the loops
    /// and flush the capture sink. The engine cannot be started again.
    pub fn stop(&self) -> Result<()> {
        let runtime = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, EngineState::Stopped) {
                EngineState::Running(runtime) => runtime,
                other => {
                    *state = other;
                    return Err(EngineError::NotRunning);
                }
            }
        };

        info!("engine stopping");
        self.running.store(false, Ordering::Relaxed);
        let _ = runtime.shutdown.send(true);

        // Close all live sessions
        for (key, session) in self.table.snapshot() {
            session.write().aborting = true;
            runtime.mux.close(key);
            self.table.remove(&key);
            self.stats.record_session_closed();
        }
        runtime.mux.shutdown();
        let _ = runtime.mux_thread.join();

        runtime.runtime.shutdown_timeout(Duration::from_secs(5));
        let _ = runtime.writer_thread.join();

        runtime.capture_sink.close();
        debug!(
            "capture: {} records written, {} dropped",
            runtime.capture.records_written(),
            runtime.capture.records_dropped()
        );

        let snapshot = self.stats.snapshot();
        info!(
            "engine stopped: {} packets in, {} packets out, {} sessions total",
            snapshot.packets_received, snapshot.packets_sent, snapshot.sessions_created
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// Change the uplink budget at runtime (negative = unlimited, 0 = paused).
    pub fn set_uplink_kbps(&self, kbps: i64) {
        self.uplink_limiter.set_rate_kbps(kbps);
    }

    /// Change the downlink budget at runtime.
    pub fn set_downlink_kbps(&self, kbps: i64) {
        self.downlink_limiter.set_rate_kbps(kbps);
    }
}

/// Periodic maintenance: close sessions idle past their protocol timeout.
async fn run_sweep(
    table: Arc<SessionTable>,
    mux: MuxHandle,
    stats: Arc<EngineStats>,
    tcp_idle: Duration,
    udp_idle: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        for (key, session) in table.snapshot() {
            let (protocol, idle) = {
                let s = session.read();
                (s.protocol, s.idle_for())
            };
            let timeout = match protocol {
                Protocol::Tcp => tcp_idle,
                Protocol::Udp => udp_idle,
            };
            if idle > timeout {
                debug!("closing idle session: {} ({:?})", key, idle);
                session.write().aborting = true;
                mux.close(key);
                if table.remove_if_same(&key, &session) {
                    stats.record_session_closed();
                }
            }
        }
    }
}

/// Fluent engine construction
pub struct EngineBuilder {
    config: EngineConfig,
    protector: Option<Arc<SocketProtector>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            protector: None,
        }
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn session_capacity(mut self, capacity: usize) -> Self {
        self.config.session_capacity = capacity;
        self
    }

    pub fn uplink_kbps(mut self, kbps: i64) -> Self {
        self.config.uplink_kbps = kbps;
        self
    }

    pub fn downlink_kbps(mut self, kbps: i64) -> Self {
        self.config.downlink_kbps = kbps;
        self
    }

    pub fn capture_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.capture.path = path.into();
        self
    }

    /// Enable secure capture: every record is duplicated into this second
    /// stream.
    pub fn secure_capture(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.capture.secure_path = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn log_level(mut self, level: crate::config::LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Install the callback that excludes outbound sockets from the tunnel.
    pub fn socket_protector<F>(mut self, protect: F) -> Self
    where
        F: Fn(i32) -> bool + Send + Sync + 'static,
    {
        self.protector = Some(Arc::new(protect));
        self
    }

    pub fn build(self) -> Result<Engine> {
        let mut engine = Engine::new(self.config)?;
        engine.protector = self.protector;
        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{self, TcpFlags, TcpOptions, TransportInfo};
    use std::io::{self, Read, Write};
    use std::net::Ipv4Addr;
    use std::sync::mpsc as std_mpsc;

    /// In-memory tunnel: one packet per read
    struct PipeReader(std_mpsc::Receiver<Vec<u8>>);

    impl Read for PipeReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                Err(_) => Ok(0),
            }
        }
    }

    struct PipeWriter(std_mpsc::Sender<Vec<u8>>);

    impl Write for PipeWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _ = self.0.send(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn tcp_to(
        dst_ip: Ipv4Addr,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Vec<u8> {
        packet::build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            dst_ip,
            5000,
            dst_port,
            seq,
            ack,
            flags,
            65535,
            payload,
            &TcpOptions::none(),
        )
    }

    #[test]
    fn engine_relays_a_tcp_flow_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let capture_path = dir.path().join("smoke.pcap");

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dst_ip = Ipv4Addr::new(127, 0, 0, 1);

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });

        let engine = Engine::builder()
            .capture_path(&capture_path)
            .build()
            .unwrap();

        let (tx_in, rx_in) = std_mpsc::channel::<Vec<u8>>();
        let (tx_out, rx_out) = std_mpsc::channel::<Vec<u8>>();
        engine
            .start(PipeReader(rx_in), PipeWriter(tx_out))
            .unwrap();

        // Scenario A: SYN -> SYN-ACK with ack = client_seq + 1
        tx_in
            .send(tcp_to(
                dst_ip,
                addr.port(),
                100,
                0,
                TcpFlags {
                    syn: true,
                    ..Default::default()
                },
                &[],
            ))
            .unwrap();

        let syn_ack = rx_out.recv_timeout(Duration::from_secs(5)).unwrap();
        let parsed = packet::parse_packet(&syn_ack).unwrap();
        let TransportInfo::Tcp(info) = parsed.transport else {
            panic!("expected TCP");
        };
        assert!(info.flags.syn && info.flags.ack);
        assert_eq!(info.ack, 101);
        let iss = info.seq;

        // Handshake ACK, then a PSH segment
        tx_in
            .send(tcp_to(
                dst_ip,
                addr.port(),
                101,
                iss.wrapping_add(1),
                TcpFlags::ack_only(),
                &[],
            ))
            .unwrap();
        tx_in
            .send(tcp_to(
                dst_ip,
                addr.port(),
                101,
                iss.wrapping_add(1),
                TcpFlags::psh_ack(),
                b"ping",
            ))
            .unwrap();

        // Scenario B: ACK covering exactly the pushed bytes
        let ack = rx_out.recv_timeout(Duration::from_secs(5)).unwrap();
        let parsed = packet::parse_packet(&ack).unwrap();
        let TransportInfo::Tcp(info) = parsed.transport else {
            panic!("expected TCP");
        };
        assert_eq!(info.ack, 105);

        // The server's reply arrives as a data segment
        let data = rx_out.recv_timeout(Duration::from_secs(5)).unwrap();
        let parsed = packet::parse_packet(&data).unwrap();
        assert_eq!(parsed.payload(&data), b"pong");

        assert_eq!(engine.session_count(), 1);
        engine.stop().unwrap();
        server.join().unwrap();

        // Both directions made it into the capture file
        let file = std::fs::File::open(&capture_path).unwrap();
        let mut reader = pcap_file::pcap::PcapReader::new(file).unwrap();
        let mut records = 0;
        while let Some(record) = reader.next_packet() {
            record.unwrap();
            records += 1;
        }
        assert!(records >= 5, "expected full exchange in capture, got {}", records);

        // A stopped engine is not restartable
        let (_tx2, rx2) = std_mpsc::channel::<Vec<u8>>();
        let (tx3, _rx3) = std_mpsc::channel::<Vec<u8>>();
        assert!(matches!(
            engine.start(PipeReader(rx2), PipeWriter(tx3)),
            Err(EngineError::AlreadyStarted)
        ));
    }

    #[test]
    fn stop_without_start_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder()
            .capture_path(dir.path().join("idle.pcap"))
            .build()
            .unwrap();
        assert!(matches!(engine.stop(), Err(EngineError::NotRunning)));
    }
}
