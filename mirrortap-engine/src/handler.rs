//! Protocol logic: the per-packet decision table
//!
//! The handler interprets decoded tunnel packets against the session table,
//! drives each session's state machine and decides what synthetic reply (if
//! any) goes back toward the client. It also turns bytes read from the real
//! remote sockets into client-bound segments. Every reply is enqueued to
//! the tunnel writer in production order; the downlink pump records them to
//! the capture sink on their way out.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::mux::MuxHandle;
use crate::packet::{self, ParsedPacket, TcpFlags, TcpInfo, TcpOptions, TransportInfo};
use crate::session::{Protocol, Session, SessionKey, TcpState};
use crate::stats::EngineStats;
use crate::table::{SessionRef, SessionTable};
use bytes::Bytes;
use parking_lot::RwLock;
use smoltcp::wire::IpVersion;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Tells a socket task whether to keep reading from the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadGate {
    Continue,
    /// Client's receive window is full; wait for an ACK before reading more
    WaitWindow,
    /// Session is gone; stop the socket task
    Stop,
}

pub struct SessionHandler {
    table: Arc<SessionTable>,
    mux: MuxHandle,
    downlink: mpsc::Sender<Bytes>,
    stats: Arc<EngineStats>,
    recv_window: u16,
    mss: u16,
    max_pending: usize,
}

impl SessionHandler {
    pub fn new(
        table: Arc<SessionTable>,
        mux: MuxHandle,
        downlink: mpsc::Sender<Bytes>,
        stats: Arc<EngineStats>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            table,
            mux,
            downlink,
            stats,
            recv_window: config.recv_window,
            mss: config.mss,
            max_pending: config.max_pending_buffer,
        }
    }

    /// Entry point for one raw packet read from the tunnel.
    pub async fn handle_tunnel_packet(&self, frame: &[u8]) -> Result<()> {
        let parsed = packet::parse_packet(frame)?;

        // IPv6 flows are classified but not relayed
        if parsed.version == IpVersion::Ipv6 {
            trace!(
                "dropping IPv6 {:?} packet {} -> {}",
                parsed.protocol,
                parsed.src_addr,
                parsed.dst_addr
            );
            self.stats.record_dropped();
            return Ok(());
        }

        let payload = parsed.payload(frame);
        match parsed.transport.clone() {
            TransportInfo::Tcp(info) => {
                self.stats.record_tcp();
                self.handle_tcp(&parsed, &info, payload).await
            }
            TransportInfo::Udp(_) => {
                self.stats.record_udp();
                self.handle_udp(&parsed, payload).await
            }
        }
    }

    async fn handle_tcp(&self, pkt: &ParsedPacket, info: &TcpInfo, payload: &[u8]) -> Result<()> {
        let key = SessionKey::new(pkt.src_socket(), pkt.dst_socket());

        if info.flags.syn && !info.flags.ack {
            return self.handle_tcp_syn(key, info).await;
        }

        match self.table.get(&key) {
            Some(session) => self.handle_tcp_segment(key, session, info, payload).await,
            None => self.handle_tcp_stray(key, info).await,
        }
    }

    /// Packets for which no session exists. RST everything except RST
    /// itself and FIN, which is acked and ignored to stay inert to
    /// stray packets.
    async fn handle_tcp_stray(&self, key: SessionKey, info: &TcpInfo) -> Result<()> {
        let Some((server_ip, server_port, client_ip, client_port)) = reply_endpoints(&key) else {
            return Ok(());
        };

        if info.flags.rst {
            trace!("stray RST ignored: {}", key);
            return Ok(());
        }

        if info.flags.fin {
            let ack = info
                .seq
                .wrapping_add(info.payload_len as u32)
                .wrapping_add(1);
            trace!("stray FIN acked: {}", key);
            let reply = packet::build_ipv4_tcp(
                server_ip, client_ip, server_port, client_port,
                info.ack, ack,
                TcpFlags::ack_only(),
                self.recv_window,
                &[],
                &TcpOptions::none(),
            );
            self.send_to_client(reply).await;
            return Ok(());
        }

        debug!("no session for {}, sending RST", key);
        let reply = packet::build_ipv4_tcp(
            server_ip, client_ip, server_port, client_port,
            info.ack, info.seq.wrapping_add(1),
            TcpFlags::rst_ack(),
            0,
            &[],
            &TcpOptions::none(),
        );
        self.send_to_client(reply).await;
        Ok(())
    }

    async fn handle_tcp_syn(&self, key: SessionKey, info: &TcpInfo) -> Result<()> {
        if let Some(existing) = self.table.get(&key) {
            let is_duplicate = {
                let session = existing.read();
                session.protocol == Protocol::Tcp && session.client_isn() == info.seq
            };
            if is_duplicate {
                // Retransmitted SYN: the SYN-ACK is already on its way or
                // was lost; creation is idempotent and nothing is resent.
                trace!("duplicate SYN ignored: {}", key);
                return Ok(());
            }
            // Conflicting reuse of a live key
            warn!("conflicting SYN for live session {}, aborting old", key);
            existing.write().aborting = true;
            self.mux.close(key);
            if self.table.remove_if_same(&key, &existing) {
                self.stats.record_session_aborted();
            }
            return Ok(());
        }

        let session = Arc::new(RwLock::new(Session::new_tcp(
            key,
            info,
            self.mss,
            self.max_pending,
        )));

        // Register the outbound socket first: a failed registration answers
        // the SYN with RST instead of leaving a half-initialized session.
        if let Err(e) = self.mux.open(key, session.clone()) {
            warn!("socket registration failed for {}: {}", key, e);
            if let Some((server_ip, server_port, client_ip, client_port)) = reply_endpoints(&key) {
                let reply = packet::build_ipv4_tcp(
                    server_ip, client_ip, server_port, client_port,
                    0, info.seq.wrapping_add(1),
                    TcpFlags::rst_ack(),
                    0,
                    &[],
                    &TcpOptions::none(),
                );
                self.send_to_client(reply).await;
            }
            return Ok(());
        }

        if let Some((victim_key, victim)) = self.table.put(key, session.clone()) {
            victim.write().aborting = true;
            self.mux.close(victim_key);
            self.stats.record_session_evicted();
            debug!("evicted {} to admit {}", victim_key, key);
        }
        self.stats.record_session_created();
        info!("new TCP session: {}", key);

        let (iss, ack, mss, ts) = {
            let s = session.read();
            (
                s.snd_nxt().wrapping_sub(1),
                s.rcv_nxt(),
                s.mss(),
                s.echo_timestamp(),
            )
        };
        let Some((server_ip, server_port, client_ip, client_port)) = reply_endpoints(&key) else {
            return Ok(());
        };
        let options = TcpOptions {
            mss: Some(mss),
            window_scale: None,
            timestamp: ts,
        };
        let reply = packet::build_ipv4_tcp(
            server_ip, client_ip, server_port, client_port,
            iss, ack,
            TcpFlags::syn_ack(),
            self.recv_window,
            &[],
            &options,
        );
        self.send_to_client(reply).await;
        Ok(())
    }

    async fn handle_tcp_segment(
        &self,
        key: SessionKey,
        session: SessionRef,
        info: &TcpInfo,
        payload: &[u8],
    ) -> Result<()> {
        let mut replies: Vec<Vec<u8>> = Vec::new();
        let mut flush = false;
        let mut close_remote = false;
        let mut remove = false;
        let mut aborted = false;

        {
            let mut s = session.write();

            if s.protocol != Protocol::Tcp {
                // TCP packet on a live UDP key: conflicting reuse
                warn!("protocol conflict on {}, aborting session", key);
                s.aborting = true;
                aborted = true;
                remove = true;
                close_remote = true;
            } else if info.flags.rst {
                debug!("client RST: {}", key);
                s.aborting = true;
                s.set_state(TcpState::Closed);
                aborted = true;
                remove = true;
                close_remote = true;
            } else {
                s.touch();
                s.note_timestamp(info);
                s.update_client_window(info.window);

                if info.flags.ack {
                    let valid = s.process_ack(info.ack);
                    if valid && s.state() == TcpState::SynReceived {
                        s.set_state(TcpState::Established);
                        info!("TCP established: {}", key);
                    }
                    // Final ACK of the close handshake
                    if s.state() == TcpState::Closing
                        && s.fin_sent
                        && !info.flags.fin
                        && payload.is_empty()
                        && info.ack == s.snd_nxt()
                    {
                        s.set_state(TcpState::Closed);
                        remove = true;
                        close_remote = true;
                        debug!("TCP closed: {}", key);
                    }
                }

                if !remove && !payload.is_empty() {
                    let appended = s.accept_payload(info.seq, payload);
                    if appended > 0 {
                        // ACK covers exactly the newly appended bytes
                        replies.push(self.build_ack(&s));
                        if info.flags.psh {
                            flush = true;
                        }
                    } else {
                        // Duplicate or reordered segment: dropped silently,
                        // the engine is a terminating endpoint and does not
                        // attempt retransmission recovery.
                        trace!(
                            "stale segment dropped: {} seq={} len={}",
                            key,
                            info.seq,
                            payload.len()
                        );
                    }
                }

                if !remove && info.flags.fin {
                    // FIN consumes one sequence number after any payload
                    s.consume_sequence();
                    replies.push(self.build_ack(&s));
                    if !s.fin_sent {
                        let fin = self.build_fin_ack(&s);
                        s.advance_snd_nxt(1);
                        s.fin_sent = true;
                        replies.push(fin);
                    }
                    s.set_state(TcpState::Closing);
                    close_remote = true;
                    debug!("client FIN, closing: {}", key);
                }
            }
        }

        if remove && self.table.remove_if_same(&key, &session) {
            if aborted {
                self.stats.record_session_aborted();
            } else {
                self.stats.record_session_closed();
            }
        }
        if close_remote {
            self.mux.close(key);
        }
        if flush {
            self.mux.flush(key);
        }
        for reply in replies {
            self.send_to_client(reply).await;
        }
        Ok(())
    }

    async fn handle_udp(&self, pkt: &ParsedPacket, payload: &[u8]) -> Result<()> {
        let key = SessionKey::new(pkt.src_socket(), pkt.dst_socket());

        if let Some(session) = self.table.get(&key) {
            let conflict = session.read().protocol != Protocol::Udp;
            if conflict {
                warn!("protocol conflict on {}, aborting session", key);
                session.write().aborting = true;
                self.mux.close(key);
                if self.table.remove_if_same(&key, &session) {
                    self.stats.record_session_aborted();
                }
                return Ok(());
            }
            {
                let mut s = session.write();
                s.touch();
                if !s.push_datagram(payload) {
                    debug!("UDP pending buffer full, dropping datagram: {}", key);
                    self.stats.record_dropped();
                    return Ok(());
                }
            }
            self.mux.flush(key);
            return Ok(());
        }

        // First datagram creates the session; UDP has no handshake
        let session = Arc::new(RwLock::new(Session::new_udp(key, self.max_pending)));
        session.write().push_datagram(payload);

        if let Err(e) = self.mux.open(key, session.clone()) {
            warn!("socket registration failed for {}: {}", key, e);
            return Ok(());
        }
        if let Some((victim_key, victim)) = self.table.put(key, session) {
            victim.write().aborting = true;
            self.mux.close(victim_key);
            self.stats.record_session_evicted();
            debug!("evicted {} to admit {}", victim_key, key);
        }
        self.stats.record_session_created();
        debug!("new UDP session: {}", key);
        self.mux.flush(key);
        Ok(())
    }

    /// Remote socket delivered `data`; emit it toward the client as
    /// MSS-sized segments. Returns whether the socket task should keep
    /// reading.
    pub async fn on_remote_data(
        &self,
        key: &SessionKey,
        session: &SessionRef,
        data: &[u8],
    ) -> ReadGate {
        let Some((server_ip, server_port, client_ip, client_port)) = reply_endpoints(key) else {
            return ReadGate::Stop;
        };

        let mut segments: Vec<Vec<u8>> = Vec::new();
        let gate;
        {
            let mut s = session.write();
            if s.aborting || s.state() == TcpState::Closed {
                return ReadGate::Stop;
            }
            s.touch();

            let mss = s.mss() as usize;
            let ack = s.rcv_nxt();
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + mss).min(data.len());
                let chunk = &data[offset..end];
                // PSH on the final segment for immediate delivery
                let flags = if end == data.len() {
                    TcpFlags::psh_ack()
                } else {
                    TcpFlags::ack_only()
                };
                let options = TcpOptions {
                    timestamp: s.echo_timestamp(),
                    ..TcpOptions::none()
                };
                let seg = packet::build_ipv4_tcp(
                    server_ip, client_ip, server_port, client_port,
                    s.snd_nxt(), ack,
                    flags,
                    self.recv_window,
                    chunk,
                    &options,
                );
                s.advance_snd_nxt(chunk.len() as u32);
                segments.push(seg);
                offset = end;
            }

            if s.window_bytes() > 0 && (s.in_flight() as u64) >= s.window_bytes() {
                s.client_window_full = true;
                debug!("client window full: {}", key);
            }
            gate = if s.client_window_full {
                ReadGate::WaitWindow
            } else {
                ReadGate::Continue
            };
        }

        for seg in segments {
            if !self.send_to_client(seg).await {
                return ReadGate::Stop;
            }
        }
        gate
    }

    /// Remote closed its side; initiate the close toward the client.
    pub async fn on_remote_eof(&self, key: &SessionKey, session: &SessionRef) {
        let reply = {
            let mut s = session.write();
            if s.aborting || s.fin_sent || s.state() == TcpState::Closed {
                None
            } else {
                let fin = self.build_fin_ack(&s);
                s.advance_snd_nxt(1);
                s.fin_sent = true;
                s.set_state(TcpState::Closing);
                Some(fin)
            }
        };
        if let Some(reply) = reply {
            debug!("remote EOF, sending FIN: {}", key);
            self.send_to_client(reply).await;
        }
    }

    /// Remote socket failed; abort the owning session only.
    pub async fn on_remote_error(&self, key: &SessionKey, session: &SessionRef, err: &io::Error) {
        warn!("remote socket error for {}: {}", key, err);
        let reply = {
            let mut s = session.write();
            if s.state() == TcpState::Closed {
                None
            } else {
                s.aborting = true;
                let is_tcp = s.protocol == Protocol::Tcp;
                let snd_nxt = s.snd_nxt();
                s.set_state(TcpState::Closed);
                if is_tcp {
                    reply_endpoints(key).map(|(server_ip, server_port, client_ip, client_port)| {
                        packet::build_ipv4_tcp(
                            server_ip, client_ip, server_port, client_port,
                            snd_nxt, 0,
                            TcpFlags::rst_only(),
                            0,
                            &[],
                            &TcpOptions::none(),
                        )
                    })
                } else {
                    None
                }
            }
        };
        if self.table.remove_if_same(key, session) {
            self.stats.record_session_aborted();
        }
        if let Some(reply) = reply {
            self.send_to_client(reply).await;
        }
        self.mux.close(*key);
    }

    /// Remote UDP datagram; wrap and forward to the client.
    pub async fn on_remote_datagram(&self, key: &SessionKey, session: &SessionRef, data: &[u8]) {
        {
            let mut s = session.write();
            if s.aborting {
                return;
            }
            s.touch();
        }
        let Some((server_ip, server_port, client_ip, client_port)) = reply_endpoints(key) else {
            return;
        };
        let reply = packet::build_ipv4_udp(server_ip, client_ip, server_port, client_port, data);
        self.send_to_client(reply).await;
    }

    fn build_ack(&self, s: &Session) -> Vec<u8> {
        let (server_ip, server_port, client_ip, client_port) =
            reply_endpoints(&s.key).expect("sessions are IPv4 only");
        let options = TcpOptions {
            timestamp: s.echo_timestamp(),
            ..TcpOptions::none()
        };
        packet::build_ipv4_tcp(
            server_ip, client_ip, server_port, client_port,
            s.snd_nxt(), s.rcv_nxt(),
            TcpFlags::ack_only(),
            self.recv_window,
            &[],
            &options,
        )
    }

    fn build_fin_ack(&self, s: &Session) -> Vec<u8> {
        let (server_ip, server_port, client_ip, client_port) =
            reply_endpoints(&s.key).expect("sessions are IPv4 only");
        let options = TcpOptions {
            timestamp: s.echo_timestamp(),
            ..TcpOptions::none()
        };
        packet::build_ipv4_tcp(
            server_ip, client_ip, server_port, client_port,
            s.snd_nxt(), s.rcv_nxt(),
            TcpFlags::fin_ack(),
            self.recv_window,
            &[],
            &options,
        )
    }

    async fn send_to_client(&self, reply: Vec<u8>) -> bool {
        if self.downlink.send(Bytes::from(reply)).await.is_err() {
            debug!("downlink queue closed");
            return false;
        }
        true
    }
}

/// (server_ip, server_port, client_ip, client_port) for reply construction
fn reply_endpoints(key: &SessionKey) -> Option<(Ipv4Addr, u16, Ipv4Addr, u16)> {
    match (key.dst.ip(), key.src.ip()) {
        (IpAddr::V4(server), IpAddr::V4(client)) => {
            Some((server, key.dst.port(), client, key.src.port()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxRequest;
    use std::net::{Ipv4Addr, SocketAddr};

    const CLIENT: &str = "10.0.0.2:5000";
    const SERVER: &str = "93.184.216.34:443";

    struct Fixture {
        handler: SessionHandler,
        table: Arc<SessionTable>,
        stats: Arc<EngineStats>,
        downlink: mpsc::Receiver<Bytes>,
        mux_rx: mpsc::UnboundedReceiver<MuxRequest>,
    }

    fn fixture_with_capacity(capacity: usize) -> Fixture {
        let config = EngineConfig {
            session_capacity: capacity,
            ..Default::default()
        };
        let table = Arc::new(SessionTable::new(capacity));
        let stats = Arc::new(EngineStats::new());
        let (downlink_tx, downlink) = mpsc::channel(64);
        let (mux, mux_rx) = MuxHandle::test_pair();
        let handler = SessionHandler::new(
            table.clone(),
            mux,
            downlink_tx,
            stats.clone(),
            &config,
        );
        Fixture {
            handler,
            table,
            stats,
            downlink,
            mux_rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_capacity(50)
    }

    fn client() -> SocketAddr {
        CLIENT.parse().unwrap()
    }

    fn server() -> SocketAddr {
        SERVER.parse().unwrap()
    }

    fn v4(addr: SocketAddr) -> Ipv4Addr {
        match addr.ip() {
            IpAddr::V4(ip) => ip,
            _ => unreachable!(),
        }
    }

    fn tcp_packet(seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
        packet::build_ipv4_tcp(
            v4(client()),
            v4(server()),
            client().port(),
            server().port(),
            seq,
            ack,
            flags,
            65535,
            payload,
            &TcpOptions::none(),
        )
    }

    fn syn_packet(seq: u32) -> Vec<u8> {
        packet::build_ipv4_tcp(
            v4(client()),
            v4(server()),
            client().port(),
            server().port(),
            seq,
            0,
            TcpFlags {
                syn: true,
                ..Default::default()
            },
            65535,
            &[],
            &TcpOptions {
                mss: Some(1460),
                ..TcpOptions::none()
            },
        )
    }

    fn parse_reply(bytes: &Bytes) -> (TcpInfo, Vec<u8>) {
        let parsed = packet::parse_packet(bytes).unwrap();
        let payload = parsed.payload(bytes).to_vec();
        match parsed.transport {
            TransportInfo::Tcp(info) => (info, payload),
            _ => panic!("expected TCP reply"),
        }
    }

    fn key() -> SessionKey {
        SessionKey::new(client(), server())
    }

    /// Drive a fixture through SYN + handshake ACK into ESTABLISHED.
    async fn establish(fx: &mut Fixture, isn: u32) -> u32 {
        fx.handler.handle_tunnel_packet(&syn_packet(isn)).await.unwrap();
        let syn_ack = fx.downlink.recv().await.unwrap();
        let (info, _) = parse_reply(&syn_ack);
        let engine_iss = info.seq;
        fx.handler
            .handle_tunnel_packet(&tcp_packet(
                isn.wrapping_add(1),
                engine_iss.wrapping_add(1),
                TcpFlags::ack_only(),
                &[],
            ))
            .await
            .unwrap();
        engine_iss
    }

    #[tokio::test]
    async fn syn_creates_session_and_replies_syn_ack() {
        let mut fx = fixture();
        fx.handler.handle_tunnel_packet(&syn_packet(100)).await.unwrap();

        assert_eq!(fx.table.len(), 1);
        assert_eq!(fx.stats.sessions_created.load(std::sync::atomic::Ordering::Relaxed), 1);

        let reply = fx.downlink.recv().await.unwrap();
        let (info, payload) = parse_reply(&reply);
        assert!(info.flags.syn && info.flags.ack);
        assert_eq!(info.ack, 101);
        assert!(payload.is_empty());
        assert_eq!(info.mss, Some(1360));

        match fx.mux_rx.recv().await.unwrap() {
            MuxRequest::Open { key: k, .. } => assert_eq!(k, key()),
            other => panic!("expected Open, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn handshake_ack_establishes_the_session() {
        let mut fx = fixture();
        establish(&mut fx, 100).await;

        let session = fx.table.get(&key()).unwrap();
        assert_eq!(session.read().state(), TcpState::Established);
    }

    #[tokio::test]
    async fn duplicate_syn_is_idempotent() {
        let mut fx = fixture();
        fx.handler.handle_tunnel_packet(&syn_packet(100)).await.unwrap();
        let _ = fx.downlink.recv().await.unwrap();

        fx.handler.handle_tunnel_packet(&syn_packet(100)).await.unwrap();
        assert_eq!(fx.table.len(), 1);
        assert!(fx.downlink.try_recv().is_err());
    }

    #[tokio::test]
    async fn conflicting_syn_aborts_the_old_session() {
        let mut fx = fixture();
        fx.handler.handle_tunnel_packet(&syn_packet(100)).await.unwrap();
        let _ = fx.downlink.recv().await.unwrap();
        let _ = fx.mux_rx.recv().await.unwrap(); // Open

        // Same key, different ISN
        fx.handler.handle_tunnel_packet(&syn_packet(9999)).await.unwrap();
        assert!(fx.table.get(&key()).is_none());
        assert!(matches!(
            fx.mux_rx.recv().await.unwrap(),
            MuxRequest::Close(_)
        ));
        assert_eq!(
            fx.stats.sessions_aborted.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn ack_without_session_draws_rst() {
        let mut fx = fixture();
        fx.handler
            .handle_tunnel_packet(&tcp_packet(500, 600, TcpFlags::ack_only(), &[]))
            .await
            .unwrap();

        let reply = fx.downlink.recv().await.unwrap();
        let (info, _) = parse_reply(&reply);
        assert!(info.flags.rst);
        assert_eq!(info.ack, 501);
        assert!(fx.table.is_empty());
    }

    #[tokio::test]
    async fn stray_fin_is_acked_and_ignored() {
        let mut fx = fixture();
        fx.handler
            .handle_tunnel_packet(&tcp_packet(
                700,
                0,
                TcpFlags {
                    fin: true,
                    ..Default::default()
                },
                &[],
            ))
            .await
            .unwrap();

        let reply = fx.downlink.recv().await.unwrap();
        let (info, _) = parse_reply(&reply);
        assert!(info.flags.ack && !info.flags.rst);
        assert_eq!(info.ack, 701);
        // No session created, no crash
        assert!(fx.table.is_empty());
    }

    #[tokio::test]
    async fn psh_payload_is_buffered_and_acked_exactly() {
        let mut fx = fixture();
        establish(&mut fx, 100).await;
        // Drain the Open request
        let _ = fx.mux_rx.recv().await.unwrap();

        let payload = vec![0x42u8; 500];
        fx.handler
            .handle_tunnel_packet(&tcp_packet(101, 0, TcpFlags::psh_ack(), &payload))
            .await
            .unwrap();

        let reply = fx.downlink.recv().await.unwrap();
        let (info, _) = parse_reply(&reply);
        assert!(info.flags.ack && !info.flags.syn);
        assert_eq!(info.ack, 101 + 500);

        let session = fx.table.get(&key()).unwrap();
        assert_eq!(session.read().pending_len(), 500);

        assert!(matches!(
            fx.mux_rx.recv().await.unwrap(),
            MuxRequest::Flush(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_segment_is_dropped_without_reply() {
        let mut fx = fixture();
        establish(&mut fx, 100).await;

        let payload = vec![0x42u8; 100];
        fx.handler
            .handle_tunnel_packet(&tcp_packet(101, 0, TcpFlags::psh_ack(), &payload))
            .await
            .unwrap();
        let _ = fx.downlink.recv().await.unwrap();

        // Retransmission of the same segment
        fx.handler
            .handle_tunnel_packet(&tcp_packet(101, 0, TcpFlags::psh_ack(), &payload))
            .await
            .unwrap();
        assert!(fx.downlink.try_recv().is_err());

        let session = fx.table.get(&key()).unwrap();
        assert_eq!(session.read().pending_len(), 100);
    }

    #[tokio::test]
    async fn client_rst_removes_the_session() {
        let mut fx = fixture();
        establish(&mut fx, 100).await;
        let _ = fx.mux_rx.recv().await.unwrap(); // Open

        fx.handler
            .handle_tunnel_packet(&tcp_packet(101, 0, TcpFlags::rst_only(), &[]))
            .await
            .unwrap();

        assert!(fx.table.is_empty());
        assert!(matches!(
            fx.mux_rx.recv().await.unwrap(),
            MuxRequest::Close(_)
        ));
    }

    #[tokio::test]
    async fn fin_handshake_closes_and_removes_the_session() {
        let mut fx = fixture();
        let engine_iss = establish(&mut fx, 100).await;

        // Client FIN
        fx.handler
            .handle_tunnel_packet(&tcp_packet(
                101,
                engine_iss.wrapping_add(1),
                TcpFlags::fin_ack(),
                &[],
            ))
            .await
            .unwrap();

        // ACK of the FIN, then our own FIN-ACK
        let ack = fx.downlink.recv().await.unwrap();
        let (ack_info, _) = parse_reply(&ack);
        assert!(ack_info.flags.ack && !ack_info.flags.fin);
        assert_eq!(ack_info.ack, 102);

        let fin = fx.downlink.recv().await.unwrap();
        let (fin_info, _) = parse_reply(&fin);
        assert!(fin_info.flags.fin && fin_info.flags.ack);

        // Final handshake ACK from the client
        fx.handler
            .handle_tunnel_packet(&tcp_packet(
                102,
                fin_info.seq.wrapping_add(1),
                TcpFlags::ack_only(),
                &[],
            ))
            .await
            .unwrap();

        assert!(fx.table.is_empty());
    }

    #[tokio::test]
    async fn eviction_closes_the_oldest_session() {
        let mut fx = fixture_with_capacity(2);
        for port in [5000u16, 5001, 5002] {
            let syn = packet::build_ipv4_tcp(
                v4(client()),
                v4(server()),
                port,
                server().port(),
                100,
                0,
                TcpFlags {
                    syn: true,
                    ..Default::default()
                },
                65535,
                &[],
                &TcpOptions::none(),
            );
            fx.handler.handle_tunnel_packet(&syn).await.unwrap();
        }

        assert_eq!(fx.table.len(), 2);
        assert_eq!(
            fx.stats.sessions_evicted.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        // The first session's key is no longer present
        let first = SessionKey::new("10.0.0.2:5000".parse().unwrap(), server());
        assert!(fx.table.get(&first).is_none());
    }

    #[tokio::test]
    async fn remote_data_becomes_mss_sized_segments() {
        let mut fx = fixture();
        establish(&mut fx, 100).await;
        let session = fx.table.get(&key()).unwrap();
        let snd_start = session.read().snd_nxt();

        // 3000 bytes at MSS 1360 -> three segments, PSH on the last
        let data = vec![0x55u8; 3000];
        let gate = fx
            .handler
            .on_remote_data(&key(), &session, &data)
            .await;
        assert_eq!(gate, ReadGate::Continue);

        let mut seq = snd_start;
        let mut total = 0usize;
        let mut last_psh = false;
        for _ in 0..3 {
            let seg = fx.downlink.recv().await.unwrap();
            let (info, payload) = parse_reply(&seg);
            assert_eq!(info.seq, seq);
            assert_eq!(info.ack, 101);
            seq = seq.wrapping_add(payload.len() as u32);
            total += payload.len();
            last_psh = info.flags.psh;
        }
        assert_eq!(total, 3000);
        assert!(last_psh);
        assert_eq!(session.read().snd_nxt(), snd_start.wrapping_add(3000));
    }

    #[tokio::test]
    async fn remote_eof_initiates_close() {
        let mut fx = fixture();
        establish(&mut fx, 100).await;
        let session = fx.table.get(&key()).unwrap();

        fx.handler.on_remote_eof(&key(), &session).await;

        let reply = fx.downlink.recv().await.unwrap();
        let (info, _) = parse_reply(&reply);
        assert!(info.flags.fin && info.flags.ack);
        assert!(session.read().fin_sent);
        assert_eq!(session.read().state(), TcpState::Closing);
    }

    #[tokio::test]
    async fn remote_error_aborts_with_rst() {
        let mut fx = fixture();
        establish(&mut fx, 100).await;
        let session = fx.table.get(&key()).unwrap();

        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        fx.handler.on_remote_error(&key(), &session, &err).await;

        let reply = fx.downlink.recv().await.unwrap();
        let (info, _) = parse_reply(&reply);
        assert!(info.flags.rst);
        assert!(fx.table.is_empty());
        assert_eq!(
            fx.stats.sessions_aborted.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn udp_datagram_creates_session_and_queues_payload() {
        let mut fx = fixture();
        let datagram = packet::build_ipv4_udp(
            v4(client()),
            v4(server()),
            5000,
            53,
            b"query",
        );
        fx.handler.handle_tunnel_packet(&datagram).await.unwrap();

        let udp_key = SessionKey::new(client(), "93.184.216.34:53".parse().unwrap());
        let session = fx.table.get(&udp_key).unwrap();
        assert_eq!(session.read().protocol, Protocol::Udp);
        assert_eq!(session.read().pending_len(), 5);

        assert!(matches!(
            fx.mux_rx.recv().await.unwrap(),
            MuxRequest::Open { .. }
        ));
        assert!(matches!(
            fx.mux_rx.recv().await.unwrap(),
            MuxRequest::Flush(_)
        ));
    }

    #[tokio::test]
    async fn remote_datagram_is_wrapped_for_the_client() {
        let mut fx = fixture();
        let datagram = packet::build_ipv4_udp(v4(client()), v4(server()), 5000, 53, b"query");
        fx.handler.handle_tunnel_packet(&datagram).await.unwrap();
        let udp_key = SessionKey::new(client(), "93.184.216.34:53".parse().unwrap());
        let session = fx.table.get(&udp_key).unwrap();

        fx.handler
            .on_remote_datagram(&udp_key, &session, b"answer")
            .await;

        let reply = fx.downlink.recv().await.unwrap();
        let parsed = packet::parse_packet(&reply).unwrap();
        assert_eq!(parsed.payload(&reply), b"answer");
        let TransportInfo::Udp(udp) = parsed.transport else {
            panic!("expected UDP");
        };
        assert_eq!(udp.src_port, 53);
        assert_eq!(udp.dst_port, 5000);
    }
}
