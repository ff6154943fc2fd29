//! Session table and segment dispatch.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::packet::tcp::{TcpSegment, FLAG_ACK, FLAG_RST};
use super::packet::{Ipv4Packet, PROTO_TCP};
use super::session::{SessionKey, TcpSession, TcpState, WINDOW_SIZE};
use super::socks::Dialer;
use super::tun::TunDevice;

/// Hard cap on tracked flows.
pub const MAX_SESSIONS: usize = 1024;

/// Upstream connects allowed in flight at once.
const CONNECT_PARALLELISM: usize = 64;

const REAP_INTERVAL: Duration = Duration::from_secs(30);
const SYN_RECEIVED_TTL: Duration = Duration::from_secs(10);
const TIME_WAIT_TTL: Duration = Duration::from_secs(60);
const IDLE_TTL: Duration = Duration::from_secs(300);

pub struct SessionManager {
    tun: Arc<dyn TunDevice>,
    dialer: Arc<dyn Dialer>,
    connect_permits: Arc<Semaphore>,
    sessions: Mutex<HashMap<SessionKey, Arc<TcpSession>>>,
}

impl SessionManager {
    pub fn new(tun: Arc<dyn TunDevice>, dialer: Arc<dyn Dialer>) -> Arc<Self> {
        Arc::new(Self {
            tun,
            dialer,
            connect_permits: Arc::new(Semaphore::new(CONNECT_PARALLELISM)),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Look up the live session for a key, if any.
    pub async fn session(&self, key: &SessionKey) -> Option<Arc<TcpSession>> {
        self.sessions.lock().await.get(key).cloned()
    }

    /// Route one inbound TCP segment.
    ///
    /// All segments for a key pass through here sequentially, which is what
    /// lets the per-session state machine run without per-packet locking
    /// games.
    pub async fn handle_segment(&self, src: Ipv4Addr, dst: Ipv4Addr, seg: TcpSegment<'_>) {
        let key = SessionKey {
            src_ip: src,
            src_port: seg.src_port,
            dst_ip: dst,
            dst_port: seg.dst_port,
        };

        // A fresh SYN opens a flow, evicting any prior tracking of the key.
        if seg.is_syn() && !seg.is_ack() {
            let (evicted, session) = {
                let mut sessions = self.sessions.lock().await;
                let evicted = sessions.remove(&key);
                if evicted.is_none() && sessions.len() >= MAX_SESSIONS {
                    drop(sessions);
                    debug!(?key, "session table full, refusing SYN");
                    self.send_rst(&key, &seg).await;
                    return;
                }
                let session = TcpSession::new(
                    key,
                    self.tun.clone(),
                    self.dialer.clone(),
                    self.connect_permits.clone(),
                );
                sessions.insert(key, session.clone());
                (evicted, session)
            };

            if let Some(old) = evicted {
                trace!(?key, "evicting prior session for fresh SYN");
                old.close().await;
            }
            session.handle_segment(seg).await;
            return;
        }

        let existing = self.sessions.lock().await.get(&key).cloned();
        match existing {
            Some(session) => {
                session.handle_segment(seg).await;
                if session.tcp_state().await == TcpState::Closed {
                    self.sessions.lock().await.remove(&key);
                    session.close().await;
                }
            }
            None => {
                // Unknown flow: answer with one RST so the sender abandons
                // quickly, and keep no state.
                self.send_rst(&key, &seg).await;
            }
        }
    }

    /// Periodically remove flows by state-dependent idleness thresholds.
    /// Cooperative: runs between packets, never preempting a dispatch.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(REAP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            self.reap().await;
        }
    }

    /// One reap pass; exposed for tests.
    pub async fn reap(&self) {
        let now = Instant::now();
        let mut stale = Vec::new();
        {
            let sessions = self.sessions.lock().await;
            for (key, session) in sessions.iter() {
                let (state, last_activity) = session.snapshot().await;
                let idle = now.saturating_duration_since(last_activity);
                let dead = match state {
                    TcpState::Closed => true,
                    TcpState::SynReceived => idle > SYN_RECEIVED_TTL,
                    TcpState::TimeWait => idle > TIME_WAIT_TTL,
                    _ => idle > IDLE_TTL,
                };
                if dead {
                    stale.push((*key, session.clone()));
                }
            }
        }

        for (key, session) in stale {
            debug!(?key, "reaping session");
            self.sessions.lock().await.remove(&key);
            session.close().await;
        }
    }

    /// One RST per offending segment: ack the segment's own ack number, or
    /// seq+1 when it was a SYN.
    async fn send_rst(&self, key: &SessionKey, seg: &TcpSegment<'_>) {
        let ack = if seg.is_syn() {
            seg.seq.wrapping_add(1)
        } else {
            seg.ack
        };

        let segment = TcpSegment::serialize(
            key.dst_ip,
            key.src_ip,
            key.dst_port,
            key.src_port,
            0,
            ack,
            FLAG_RST | FLAG_ACK,
            WINDOW_SIZE,
            &[],
            &[],
        );
        let packet = Ipv4Packet::serialize(
            key.dst_ip,
            key.src_ip,
            PROTO_TCP,
            rand::random(),
            64,
            &segment,
        );
        if let Err(e) = self.tun.send(&packet).await {
            debug!("tunnel write failed: {}", e);
        }
    }
}
