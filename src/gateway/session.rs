//! Per-flow TCP termination.
//!
//! Each session owns one end of a connection that a tunneled application
//! opened: the application's segments arrive from the tunnel, payload is
//! relayed to a SOCKS5-tunneled upstream stream, and every segment sent
//! back into the tunnel is synthesized here. The subset of RFC 793 needed
//! for a client-driven open and either-side close is implemented; windows
//! are fixed and retransmission is left to the peer, which we re-ACK at the
//! highest in-order byte.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::packet::tcp::{
    mss_option, TcpSegment, FLAG_ACK, FLAG_FIN, FLAG_PSH, FLAG_RST, FLAG_SYN,
};
use super::packet::{Ipv4Packet, PROTO_TCP};
use super::socks::Dialer;
use super::tun::TunDevice;

/// Advertised receive window on every synthesized segment.
pub const WINDOW_SIZE: u16 = 65535;

/// Largest payload per synthesized segment; also the MSS advertised in the
/// SYN+ACK.
pub const MSS: usize = 1400;

const UPSTREAM_READ_BUF: usize = 8192;

/// Flow identity: structural equality over the 4-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    TimeWait,
    Closed,
}

struct SessionState {
    tcp: TcpState,
    client_isn: u32,
    our_isn: u32,
    /// Next in-order sequence number expected from the client.
    client_seq: u32,
    /// Next sequence number we will send.
    our_seq: u32,
    upstream: Option<OwnedWriteHalf>,
    upstream_connected: bool,
    /// The client's handshake ACK arrived (promotion may still be waiting
    /// on the upstream connect).
    handshake_acked: bool,
    connector: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    last_activity: Instant,
}

pub struct TcpSession {
    key: SessionKey,
    tun: Arc<dyn TunDevice>,
    dialer: Arc<dyn Dialer>,
    connect_permits: Arc<Semaphore>,
    ident: AtomicU16,
    state: Mutex<SessionState>,
}

impl TcpSession {
    pub fn new(
        key: SessionKey,
        tun: Arc<dyn TunDevice>,
        dialer: Arc<dyn Dialer>,
        connect_permits: Arc<Semaphore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            tun,
            dialer,
            connect_permits,
            ident: AtomicU16::new(rand::random()),
            state: Mutex::new(SessionState {
                tcp: TcpState::Listen,
                client_isn: 0,
                our_isn: 0,
                client_seq: 0,
                our_seq: 0,
                upstream: None,
                upstream_connected: false,
                handshake_acked: false,
                connector: None,
                reader: None,
                last_activity: Instant::now(),
            }),
        })
    }

    /// Current state and idle timestamp, for the reaper.
    pub async fn snapshot(&self) -> (TcpState, Instant) {
        let st = self.state.lock().await;
        (st.tcp, st.last_activity)
    }

    pub async fn tcp_state(&self) -> TcpState {
        self.state.lock().await.tcp
    }

    /// Feed one inbound segment. The session manager routes all segments
    /// for this key through a single dispatch, so calls never overlap.
    pub async fn handle_segment(self: &Arc<Self>, seg: TcpSegment<'_>) {
        let mut st = self.state.lock().await;
        st.last_activity = Instant::now();

        match st.tcp {
            TcpState::Listen => {
                if seg.is_syn() && !seg.is_ack() {
                    st.client_isn = seg.seq;
                    st.client_seq = seg.seq.wrapping_add(1);
                    st.our_isn = rand::random();
                    st.our_seq = st.our_isn.wrapping_add(1); // SYN consumes one
                    st.tcp = TcpState::SynReceived;

                    let (syn_seq, ack) = (st.our_isn, st.client_seq);
                    // Emit before the connector can run, so a fast dial
                    // failure cannot put its RST ahead of the SYN+ACK.
                    self.emit_options(FLAG_SYN | FLAG_ACK, syn_seq, ack, &mss_option(MSS as u16))
                        .await;
                    st.connector = Some(tokio::spawn(self.clone().connect_upstream()));
                }
            }

            TcpState::SynReceived => {
                if seg.is_rst() {
                    self.close_locked(&mut st);
                } else if seg.is_ack() && !seg.is_syn() && !seg.is_fin() {
                    st.handshake_acked = true;
                    if st.upstream_connected {
                        st.tcp = TcpState::Established;
                        trace!(key = ?self.key, "session established");
                    }
                }
            }

            TcpState::Established => {
                if seg.is_rst() {
                    self.close_locked(&mut st);
                } else if seg.is_fin() {
                    self.handle_client_fin(&mut st, &seg).await;
                } else if !seg.payload.is_empty() {
                    self.handle_client_data(&mut st, &seg).await;
                }
                // A pure ACK carries nothing to do: there is no local
                // retransmit queue to trim.
            }

            TcpState::FinWait1 => {
                if seg.is_rst() {
                    self.close_locked(&mut st);
                } else if seg.is_fin() {
                    st.client_seq = seg
                        .seq
                        .wrapping_add(seg.payload.len() as u32)
                        .wrapping_add(1);
                    st.tcp = TcpState::TimeWait;
                    let (seq, ack) = (st.our_seq, st.client_seq);
                    drop(st);
                    self.emit(FLAG_ACK, seq, ack, &[]).await;
                } else if seg.is_ack() {
                    st.tcp = TcpState::FinWait2;
                }
            }

            TcpState::FinWait2 => {
                if seg.is_rst() {
                    self.close_locked(&mut st);
                } else if seg.is_fin() {
                    st.client_seq = seg
                        .seq
                        .wrapping_add(seg.payload.len() as u32)
                        .wrapping_add(1);
                    st.tcp = TcpState::TimeWait;
                    let (seq, ack) = (st.our_seq, st.client_seq);
                    drop(st);
                    self.emit(FLAG_ACK, seq, ack, &[]).await;
                }
            }

            TcpState::LastAck => {
                if seg.is_rst() || seg.is_ack() {
                    self.close_locked(&mut st);
                }
            }

            // Anything arriving in TimeWait is ignored; the reaper removes
            // the entry on timeout.
            TcpState::TimeWait | TcpState::CloseWait | TcpState::Closed => {}
        }
    }

    async fn handle_client_data(&self, st: &mut SessionState, seg: &TcpSegment<'_>) {
        if seg.seq == st.client_seq {
            if let Some(upstream) = st.upstream.as_mut() {
                if let Err(e) = upstream.write_all(seg.payload).await {
                    debug!(key = ?self.key, "upstream write failed: {}", e);
                    let (seq, ack) = (st.our_seq, st.client_seq);
                    self.close_locked(st);
                    self.emit(FLAG_RST | FLAG_ACK, seq, ack, &[]).await;
                    return;
                }
                st.client_seq = st.client_seq.wrapping_add(seg.payload.len() as u32);
            }
            // No upstream write half yet: fall through and re-ACK the old
            // high water mark; the client will retransmit.
        }
        // Out-of-window data is acknowledged at the current in-order byte
        // and not delivered; the peer's retransmission closes any gap.
        let (seq, ack) = (st.our_seq, st.client_seq);
        self.emit(FLAG_ACK, seq, ack, &[]).await;
    }

    async fn handle_client_fin(&self, st: &mut SessionState, seg: &TcpSegment<'_>) {
        // Deliver any in-order payload that rode along with the FIN.
        if !seg.payload.is_empty() && seg.seq == st.client_seq {
            if let Some(upstream) = st.upstream.as_mut() {
                if upstream.write_all(seg.payload).await.is_ok() {
                    st.client_seq = st.client_seq.wrapping_add(seg.payload.len() as u32);
                }
            }
        }

        // Their FIN consumes one sequence number.
        st.client_seq = st.client_seq.wrapping_add(1);
        st.tcp = TcpState::CloseWait;
        let (seq, ack) = (st.our_seq, st.client_seq);
        self.emit(FLAG_ACK, seq, ack, &[]).await;

        // Half-close the upstream: the client will send no more payload.
        if let Some(mut upstream) = st.upstream.take() {
            let _ = upstream.shutdown().await;
        }
        // The byte pump must not synthesize data after our FIN.
        if let Some(reader) = st.reader.take() {
            reader.abort();
        }

        let fin_seq = st.our_seq;
        st.our_seq = st.our_seq.wrapping_add(1);
        st.tcp = TcpState::LastAck;
        let ack = st.client_seq;
        self.emit(FLAG_FIN | FLAG_ACK, fin_seq, ack, &[]).await;
    }

    /// Establish the upstream stream; runs as its own task from the SYN.
    async fn connect_upstream(self: Arc<Self>) {
        let dst = SocketAddrV4::new(self.key.dst_ip, self.key.dst_port);
        let result = {
            // Bound how many upstream connects are in flight at once.
            let _permit = self.connect_permits.acquire().await;
            self.dialer.dial(dst).await
        };

        let mut st = self.state.lock().await;
        if st.tcp == TcpState::Closed {
            // Evicted while connecting; drop the stream if we got one.
            return;
        }

        match result {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                st.upstream = Some(write_half);
                st.upstream_connected = true;
                if st.handshake_acked && st.tcp == TcpState::SynReceived {
                    st.tcp = TcpState::Established;
                    trace!(key = ?self.key, "session established");
                }
                st.reader = Some(tokio::spawn(self.clone().pump_upstream(read_half)));
            }
            Err(e) => {
                debug!(key = ?self.key, "upstream connect failed: {:#}", e);
                let (seq, ack) = (st.our_seq, st.client_seq);
                self.close_locked(&mut st);
                drop(st);
                self.emit(FLAG_RST | FLAG_ACK, seq, ack, &[]).await;
            }
        }
    }

    /// One logical reader over the upstream byte-stream: each read becomes
    /// one or more PSH+ACK segments; EOF becomes our FIN.
    async fn pump_upstream(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; UPSTREAM_READ_BUF];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(key = ?self.key, "upstream read failed: {}", e);
                    break;
                }
            };

            let mut st = self.state.lock().await;
            if !matches!(st.tcp, TcpState::Established | TcpState::SynReceived) {
                return;
            }
            st.last_activity = Instant::now();
            for chunk in buf[..n].chunks(MSS) {
                let seq = st.our_seq;
                st.our_seq = st.our_seq.wrapping_add(chunk.len() as u32);
                let ack = st.client_seq;
                self.emit(FLAG_PSH | FLAG_ACK, seq, ack, chunk).await;
            }
        }

        // Upstream finished sending; pass its close on to the client.
        let mut st = self.state.lock().await;
        if st.tcp == TcpState::Established {
            let fin_seq = st.our_seq;
            st.our_seq = st.our_seq.wrapping_add(1);
            st.tcp = TcpState::FinWait1;
            let ack = st.client_seq;
            drop(st);
            self.emit(FLAG_FIN | FLAG_ACK, fin_seq, ack, &[]).await;
        }
    }

    /// Mark the session closed and release upstream resources that can be
    /// released synchronously. Reader/connector teardown happens in
    /// `close()`.
    fn close_locked(&self, st: &mut SessionState) {
        st.tcp = TcpState::Closed;
        st.upstream = None;
        st.upstream_connected = false;
    }

    /// Tear the session down: abort the connector and the upstream reader
    /// and join both before returning, so no task can write through the
    /// tunnel on behalf of a dropped session.
    pub async fn close(&self) {
        let (connector, reader) = {
            let mut st = self.state.lock().await;
            self.close_locked(&mut st);
            (st.connector.take(), st.reader.take())
        };
        if let Some(connector) = connector {
            connector.abort();
            let _ = connector.await;
        }
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
    }

    async fn emit(&self, flags: u8, seq: u32, ack: u32, payload: &[u8]) {
        self.send_segment(flags, seq, ack, &[], payload).await
    }

    async fn emit_options(&self, flags: u8, seq: u32, ack: u32, options: &[u8]) {
        self.send_segment(flags, seq, ack, options, &[]).await
    }

    /// Synthesize one segment from the flow's remote end back to the
    /// client and write it into the tunnel.
    async fn send_segment(&self, flags: u8, seq: u32, ack: u32, options: &[u8], payload: &[u8]) {
        let segment = TcpSegment::serialize(
            self.key.dst_ip,
            self.key.src_ip,
            self.key.dst_port,
            self.key.src_port,
            seq,
            ack,
            flags,
            WINDOW_SIZE,
            options,
            payload,
        );
        let packet = Ipv4Packet::serialize(
            self.key.dst_ip,
            self.key.src_ip,
            PROTO_TCP,
            self.ident.fetch_add(1, Ordering::Relaxed),
            64,
            &segment,
        );
        if let Err(e) = self.tun.send(&packet).await {
            debug!(key = ?self.key, "tunnel write failed: {}", e);
        }
    }
}
