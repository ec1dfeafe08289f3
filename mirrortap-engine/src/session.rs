//! Per-flow session state
//!
//! A [`Session`] models one client-initiated TCP or UDP flow: its sequence
//! counters, negotiated options, pending outbound data and the registration
//! state of its outbound socket. Sessions are keyed by the 4-tuple and live
//! in the [`crate::table::SessionTable`]; a removed session is never reused.

use crate::packet::{TcpInfo, DEFAULT_MSS_V4};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Flow key: the (source, destination) socket-address pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Client side (the tunneled device)
    pub src: SocketAddr,
    /// Real remote endpoint
    pub dst: SocketAddr,
}

impl SessionKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// TCP session state; `Listen` is implicit (no session in the table yet)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// SYN accepted, SYN-ACK sent
    SynReceived,
    /// First valid ACK accepted
    Established,
    /// A FIN was observed in either direction
    Closing,
    /// Terminal; the table entry is being discarded
    Closed,
}

/// Registration state of the outbound socket with the multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Created, not yet handed to the multiplexer
    Pending,
    Connecting,
    Connected,
    Closed,
}

/// Outbound bytes waiting for the real socket
#[derive(Debug)]
pub enum SendBuffer {
    /// TCP byte stream
    Stream(VecDeque<u8>),
    /// UDP datagrams, boundaries preserved
    Datagrams(VecDeque<Vec<u8>>),
}

impl SendBuffer {
    pub fn len(&self) -> usize {
        match self {
            SendBuffer::Stream(buf) => buf.len(),
            SendBuffer::Datagrams(queue) => queue.iter().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One logical flow through the engine
pub struct Session {
    pub key: SessionKey,
    pub protocol: Protocol,
    state: TcpState,
    /// Client's initial sequence number; used to tell a retransmitted SYN
    /// from a conflicting reuse of the key
    client_isn: u32,
    /// Next sequence expected from the client
    rcv_nxt: u32,
    /// Next sequence the engine will send
    snd_nxt: u32,
    /// Last acknowledged engine sequence
    snd_una: u32,
    client_window: u16,
    window_shift: u8,
    mss: u16,
    /// Timestamp option negotiated on the SYN
    ts_enabled: bool,
    /// Client's last TSval, echoed back as TSecr
    last_tsval: u32,
    epoch: Instant,
    pending: SendBuffer,
    max_pending: usize,
    pub socket: SocketState,
    /// Wakes the owning socket task to drain `pending`
    pub flush: Arc<Notify>,
    pub aborting: bool,
    pub fin_sent: bool,
    pub client_window_full: bool,
    bytes_tx: u64,
    bytes_rx: u64,
    last_activity: Instant,
}

impl Session {
    /// Create a TCP session from the client's SYN.
    pub fn new_tcp(key: SessionKey, syn: &TcpInfo, our_mss: u16, max_pending: usize) -> Self {
        let iss: u32 = rand::random();
        let mss = syn.mss.unwrap_or(DEFAULT_MSS_V4).min(our_mss);
        let now = Instant::now();

        Self {
            key,
            protocol: Protocol::Tcp,
            state: TcpState::SynReceived,
            client_isn: syn.seq,
            rcv_nxt: syn.seq.wrapping_add(1),
            // SYN-ACK consumes one sequence number
            snd_nxt: iss.wrapping_add(1),
            snd_una: iss,
            client_window: syn.window,
            window_shift: syn.window_scale.unwrap_or(0).min(14),
            mss,
            ts_enabled: syn.tsval.is_some(),
            last_tsval: syn.tsval.unwrap_or(0),
            epoch: now,
            pending: SendBuffer::Stream(VecDeque::new()),
            max_pending,
            socket: SocketState::Pending,
            flush: Arc::new(Notify::new()),
            aborting: false,
            fin_sent: false,
            client_window_full: false,
            bytes_tx: 0,
            bytes_rx: 0,
            last_activity: now,
        }
    }

    /// Create a UDP session from the first datagram.
    pub fn new_udp(key: SessionKey, max_pending: usize) -> Self {
        let now = Instant::now();
        Self {
            key,
            protocol: Protocol::Udp,
            state: TcpState::Established,
            client_isn: 0,
            rcv_nxt: 0,
            snd_nxt: 0,
            snd_una: 0,
            client_window: 0,
            window_shift: 0,
            mss: 0,
            ts_enabled: false,
            last_tsval: 0,
            epoch: now,
            pending: SendBuffer::Datagrams(VecDeque::new()),
            max_pending,
            socket: SocketState::Pending,
            flush: Arc::new(Notify::new()),
            aborting: false,
            fin_sent: false,
            client_window_full: false,
            bytes_tx: 0,
            bytes_rx: 0,
            last_activity: now,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn set_state(&mut self, state: TcpState) {
        self.state = state;
    }

    pub fn is_established(&self) -> bool {
        self.state == TcpState::Established
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    pub fn client_isn(&self) -> u32 {
        self.client_isn
    }

    /// Advance `rcv_nxt` past a control flag (SYN/FIN consume one number).
    pub fn consume_sequence(&mut self) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
    }

    /// Advance `snd_nxt` by sent payload (or one for SYN/FIN).
    pub fn advance_snd_nxt(&mut self, len: u32) {
        self.snd_nxt = self.snd_nxt.wrapping_add(len);
        self.bytes_tx += len as u64;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Client receive window in bytes, scale applied
    pub fn window_bytes(&self) -> u64 {
        (self.client_window as u64) << self.window_shift
    }

    /// Unacknowledged bytes in flight toward the client
    pub fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    pub fn update_client_window(&mut self, window: u16) {
        self.client_window = window;
    }

    /// Accept a cumulative ACK if it falls in (snd_una, snd_nxt].
    pub fn process_ack(&mut self, ack: u32) -> bool {
        let (una, nxt) = (self.snd_una, self.snd_nxt);
        let valid = if una <= nxt {
            ack > una && ack <= nxt
        } else {
            ack > una || ack <= nxt
        };
        if valid {
            self.snd_una = ack;
            if self.client_window_full && (self.in_flight() as u64) < self.window_bytes() {
                self.client_window_full = false;
                // Un-gate the socket task's read loop
                self.flush.notify_one();
            }
        }
        valid
    }

    /// Engine TSval clock (milliseconds since session start)
    pub fn tsval_now(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// (TSval, TSecr) pair for replies, when the client negotiated timestamps
    pub fn echo_timestamp(&self) -> Option<(u32, u32)> {
        self.ts_enabled.then(|| (self.tsval_now(), self.last_tsval))
    }

    pub fn note_timestamp(&mut self, info: &TcpInfo) {
        if let Some(tsval) = info.tsval {
            self.last_tsval = tsval;
        }
    }

    /// Append client payload that is new relative to `rcv_nxt`.
    ///
    /// Returns the number of bytes actually appended (and acknowledged by
    /// the caller). Segments entirely below `rcv_nxt` are duplicates and
    /// yield zero; a partial overlap appends only the new suffix. Segments
    /// beyond `rcv_nxt` (reordered in flight) are dropped whole — the engine
    /// terminates the connection and does not reassemble.
    pub fn accept_payload(&mut self, seq: u32, payload: &[u8]) -> usize {
        if payload.is_empty() {
            return 0;
        }
        let seq_end = seq.wrapping_add(payload.len() as u32);
        if seq_before_or_eq(seq_end, self.rcv_nxt) {
            return 0;
        }
        if seq_after(seq, self.rcv_nxt) {
            return 0;
        }

        let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
        let new_data = &payload[skip..];

        let SendBuffer::Stream(buf) = &mut self.pending else {
            return 0;
        };
        let room = self.max_pending.saturating_sub(buf.len());
        let take = new_data.len().min(room);
        if take == 0 {
            return 0;
        }
        buf.extend(&new_data[..take]);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(take as u32);
        self.bytes_rx += take as u64;
        take
    }

    /// Queue one UDP datagram for the remote endpoint.
    pub fn push_datagram(&mut self, payload: &[u8]) -> bool {
        let SendBuffer::Datagrams(queue) = &mut self.pending else {
            return false;
        };
        let queued: usize = queue.iter().map(Vec::len).sum();
        if queued + payload.len() > self.max_pending {
            return false;
        }
        queue.push_back(payload.to_vec());
        self.bytes_rx += payload.len() as u64;
        true
    }

    /// Drain the whole pending byte stream.
    pub fn take_pending_stream(&mut self) -> Option<Vec<u8>> {
        match &mut self.pending {
            SendBuffer::Stream(buf) if !buf.is_empty() => Some(buf.drain(..).collect()),
            _ => None,
        }
    }

    /// Pop the next pending datagram.
    pub fn take_pending_datagram(&mut self) -> Option<Vec<u8>> {
        match &mut self.pending {
            SendBuffer::Datagrams(queue) => queue.pop_front(),
            _ => None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.bytes_tx, self.bytes_rx)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("snd_nxt", &self.snd_nxt)
            .field("snd_una", &self.snd_una)
            .field("pending", &self.pending.len())
            .field("aborting", &self.aborting)
            .finish()
    }
}

/// True when `seq1` precedes `seq2` in sequence space (wraparound-aware)
pub fn seq_before(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// True when `seq1` follows `seq2` in sequence space
pub fn seq_after(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

pub fn seq_before_or_eq(seq1: u32, seq2: u32) -> bool {
    seq1 == seq2 || seq_before(seq1, seq2)
}
