//! Socket I/O multiplexer
//!
//! One OS thread owns every outbound socket. It runs a current-thread tokio
//! runtime with a `LocalSet`: each session's socket lives in a task on that
//! thread and is never touched from outside it. Other threads interact only
//! through the request queue — open a socket, flush a session's pending
//! data, close a session, shut down — and sending a request wakes the loop.
//! Socket errors abort the owning session via the handler's RST path and
//! never propagate out of the loop.

use crate::error::{EngineError, Result};
use crate::handler::{ReadGate, SessionHandler};
use crate::session::{Protocol, SessionKey, SocketState};
use crate::table::SessionRef;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, trace, warn};

/// Callback applied to every outbound socket before it connects, so relay
/// traffic can be excluded from the tunnel (VPN "protect" on Android, mark
/// or bind elsewhere). Returns false when protection failed.
pub type SocketProtector = dyn Fn(i32) -> bool + Send + Sync;

/// Cross-thread requests into the multiplexer loop
#[derive(Debug)]
pub enum MuxRequest {
    /// Open the outbound socket for a new session
    Open {
        key: SessionKey,
        session: SessionRef,
    },
    /// Drain the session's pending data into its socket
    Flush(SessionKey),
    /// Tear the session's socket down
    Close(SessionKey),
    /// Stop the loop and close every socket
    Shutdown,
}

/// Cloneable front end used by the handler and the engine
#[derive(Clone)]
pub struct MuxHandle {
    tx: mpsc::UnboundedSender<MuxRequest>,
}

impl MuxHandle {
    pub fn open(&self, key: SessionKey, session: SessionRef) -> Result<()> {
        self.tx
            .send(MuxRequest::Open { key, session })
            .map_err(|_| EngineError::Registration("multiplexer is gone".into()))
    }

    pub fn flush(&self, key: SessionKey) {
        let _ = self.tx.send(MuxRequest::Flush(key));
    }

    pub fn close(&self, key: SessionKey) {
        let _ = self.tx.send(MuxRequest::Close(key));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(MuxRequest::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<MuxRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Per-session bookkeeping inside the loop
struct SessionIo {
    stop: Arc<Notify>,
    flush: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

pub struct SocketIOMultiplexer {
    rx: mpsc::UnboundedReceiver<MuxRequest>,
    protector: Option<Arc<SocketProtector>>,
    connect_timeout: Duration,
}

impl SocketIOMultiplexer {
    pub fn new(
        protector: Option<Arc<SocketProtector>>,
        connect_timeout: Duration,
    ) -> (MuxHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MuxHandle { tx },
            Self {
                rx,
                protector,
                connect_timeout,
            },
        )
    }

    /// Start the multiplexer thread.
    pub fn spawn(self, handler: Arc<SessionHandler>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("mirrortap-mux".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("multiplexer runtime failed: {}", e);
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, self.run(handler));
            })
    }

    async fn run(mut self, handler: Arc<SessionHandler>) {
        let mut sessions: HashMap<SessionKey, SessionIo> = HashMap::new();

        while let Some(request) = self.rx.recv().await {
            match request {
                MuxRequest::Open { key, session } => {
                    sessions.retain(|_, io| !io.task.is_finished());

                    let stop = Arc::new(Notify::new());
                    let (flush, protocol) = {
                        let s = session.read();
                        (s.flush.clone(), s.protocol)
                    };
                    let task = match protocol {
                        Protocol::Tcp => tokio::task::spawn_local(run_tcp_session(
                            handler.clone(),
                            key,
                            session,
                            stop.clone(),
                            self.protector.clone(),
                            self.connect_timeout,
                        )),
                        Protocol::Udp => tokio::task::spawn_local(run_udp_session(
                            handler.clone(),
                            key,
                            session,
                            stop.clone(),
                            self.protector.clone(),
                        )),
                    };
                    sessions.insert(key, SessionIo { stop, flush, task });
                }
                MuxRequest::Flush(key) => {
                    if let Some(io) = sessions.get(&key) {
                        io.flush.notify_one();
                    }
                }
                MuxRequest::Close(key) => {
                    if let Some(io) = sessions.remove(&key) {
                        trace!("closing socket for {}", key);
                        io.stop.notify_one();
                    }
                }
                MuxRequest::Shutdown => {
                    debug!("multiplexer shutting down, {} sockets open", sessions.len());
                    for (_, io) in sessions.drain() {
                        io.stop.notify_one();
                    }
                    break;
                }
            }
        }

        // Let socket tasks observe the stop signal; whatever remains is
        // dropped with the LocalSet, which closes the sockets.
        tokio::time::sleep(Duration::from_millis(50)).await;
        debug!("multiplexer stopped");
    }
}

#[cfg(unix)]
fn apply_protector(protector: &Option<Arc<SocketProtector>>, fd: i32, key: &SessionKey) {
    if let Some(protect) = protector {
        if !protect(fd) {
            warn!("socket protection failed for {}", key);
        }
    }
}

async fn connect_tcp(
    key: &SessionKey,
    protector: &Option<Arc<SocketProtector>>,
    connect_timeout: Duration,
    stop: &Notify,
) -> io::Result<Option<TcpStream>> {
    let remote = match key.dst {
        SocketAddr::V4(_) => key.dst,
        SocketAddr::V6(_) => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IPv6 destinations are not relayed",
            ))
        }
    };

    let socket = TcpSocket::new_v4()?;
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        apply_protector(protector, socket.as_raw_fd(), key);
    }
    #[cfg(not(unix))]
    let _ = protector;

    tokio::select! {
        _ = stop.notified() => Ok(None),
        result = tokio::time::timeout(connect_timeout, socket.connect(remote)) => match result {
            Ok(Ok(stream)) => Ok(Some(stream)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        },
    }
}

/// Drain the session's pending byte stream into the socket.
async fn drain_stream(session: &SessionRef, writer: &mut OwnedWriteHalf) -> io::Result<()> {
    loop {
        let data = session.write().take_pending_stream();
        match data {
            Some(chunk) => {
                writer.write_all(&chunk).await?;
                trace!("flushed {} bytes to remote", chunk.len());
            }
            None => return Ok(()),
        }
    }
}

async fn run_tcp_session(
    handler: Arc<SessionHandler>,
    key: SessionKey,
    session: SessionRef,
    stop: Arc<Notify>,
    protector: Option<Arc<SocketProtector>>,
    connect_timeout: Duration,
) {
    let flush = session.read().flush.clone();
    session.write().socket = SocketState::Connecting;

    let stream = match connect_tcp(&key, &protector, connect_timeout, &stop).await {
        Ok(Some(stream)) => stream,
        Ok(None) => {
            session.write().socket = SocketState::Closed;
            return;
        }
        Err(e) => {
            session.write().socket = SocketState::Closed;
            handler.on_remote_error(&key, &session, &e).await;
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    session.write().socket = SocketState::Connected;
    debug!("remote connected: {}", key);

    let (mut reader, mut writer) = stream.into_split();

    // Flush anything the client sent while we were connecting
    if let Err(e) = drain_stream(&session, &mut writer).await {
        handler.on_remote_error(&key, &session, &e).await;
        return;
    }

    let mut buf = vec![0u8; 65536];
    loop {
        // Respect the client's receive window before reading more
        if session.read().client_window_full {
            tokio::select! {
                _ = stop.notified() => break,
                _ = flush.notified() => {}
            }
            if let Err(e) = drain_stream(&session, &mut writer).await {
                handler.on_remote_error(&key, &session, &e).await;
                return;
            }
            continue;
        }

        tokio::select! {
            _ = stop.notified() => break,
            _ = flush.notified() => {
                if let Err(e) = drain_stream(&session, &mut writer).await {
                    handler.on_remote_error(&key, &session, &e).await;
                    return;
                }
            }
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    handler.on_remote_eof(&key, &session).await;
                    break;
                }
                Ok(n) => {
                    if handler.on_remote_data(&key, &session, &buf[..n]).await == ReadGate::Stop {
                        break;
                    }
                }
                Err(e) => {
                    handler.on_remote_error(&key, &session, &e).await;
                    break;
                }
            }
        }
    }

    session.write().socket = SocketState::Closed;
    trace!("socket task finished: {}", key);
}

/// Drain pending datagrams into the socket.
async fn drain_datagrams(session: &SessionRef, socket: &UdpSocket) -> io::Result<()> {
    loop {
        let datagram = session.write().take_pending_datagram();
        match datagram {
            Some(payload) => {
                socket.send(&payload).await?;
                trace!("forwarded {} byte datagram", payload.len());
            }
            None => return Ok(()),
        }
    }
}

async fn run_udp_session(
    handler: Arc<SessionHandler>,
    key: SessionKey,
    session: SessionRef,
    stop: Arc<Notify>,
    protector: Option<Arc<SocketProtector>>,
) {
    let flush = session.read().flush.clone();

    let socket = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            apply_protector(&protector, socket.as_raw_fd(), &key);
        }
        #[cfg(not(unix))]
        let _ = &protector;
        socket.connect(key.dst).await?;
        Ok::<_, io::Error>(socket)
    }
    .await;

    let socket = match socket {
        Ok(socket) => socket,
        Err(e) => {
            session.write().socket = SocketState::Closed;
            handler.on_remote_error(&key, &session, &e).await;
            return;
        }
    };
    session.write().socket = SocketState::Connected;
    debug!("UDP channel open: {}", key);

    if let Err(e) = drain_datagrams(&session, &socket).await {
        handler.on_remote_error(&key, &session, &e).await;
        return;
    }

    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            _ = flush.notified() => {
                if let Err(e) = drain_datagrams(&session, &socket).await {
                    handler.on_remote_error(&key, &session, &e).await;
                    return;
                }
            }
            result = socket.recv(&mut buf) => match result {
                Ok(n) => handler.on_remote_datagram(&key, &session, &buf[..n]).await,
                Err(e) => {
                    handler.on_remote_error(&key, &session, &e).await;
                    break;
                }
            }
        }
    }

    session.write().socket = SocketState::Closed;
    trace!("UDP task finished: {}", key);
}
