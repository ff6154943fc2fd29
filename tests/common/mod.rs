//! Shared fixtures: a recording network adapter, a scriptable hypervisor
//! stub backed by real localhost listeners, a channel-backed tunnel, and
//! test dialers for the gateway.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use torvm::config::Config;
use torvm::gateway::packet::tcp::TcpSegment;
use torvm::gateway::packet::{Ipv4Packet, PROTO_TCP};
use torvm::gateway::{Dialer, TunDevice};
use torvm::network::{NetworkAdapter, SavedConfig};
use torvm::vm::Hypervisor;

// ---------------------------------------------------------------------------
// Network adapter mock
// ---------------------------------------------------------------------------

/// Records every adapter call in order and fails the ops it is told to.
pub struct MockNetwork {
    ops: Mutex<Vec<String>>,
    fail_on: Mutex<HashSet<&'static str>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            fail_on: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_on(self: &Arc<Self>, op: &'static str) -> Arc<Self> {
        self.fail_on.lock().unwrap().insert(op);
        self.clone()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops.lock().unwrap().iter().filter(|o| *o == op).count()
    }

    fn record(&self, op: &'static str) -> Result<()> {
        self.ops.lock().unwrap().push(op.to_string());
        if self.fail_on.lock().unwrap().contains(op) {
            bail!("injected {} failure", op);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl NetworkAdapter for MockNetwork {
    async fn create_tap(
        &self,
        _name: &str,
        _host_ip: Ipv4Addr,
        _vm_ip: Ipv4Addr,
        _mask: Ipv4Addr,
    ) -> Result<()> {
        self.record("create_tap")
    }

    async fn destroy_tap(&self, _name: &str) -> Result<()> {
        self.record("destroy_tap")
    }

    async fn save_config(&self) -> Result<SavedConfig> {
        self.record("save_config")?;
        Ok(SavedConfig {
            platform: "mock",
            data: b"saved-routes".to_vec(),
            hmac: None,
        })
    }

    async fn restore_config(&self, saved: &SavedConfig) -> Result<()> {
        assert_eq!(saved.platform, "mock");
        self.record("restore_config")
    }

    async fn setup_routing(&self, _tap_name: &str, _vm_ip: Ipv4Addr) -> Result<()> {
        self.record("setup_routing")
    }

    async fn teardown_routing(&self) -> Result<()> {
        self.record("teardown_routing")
    }

    async fn flush_dns(&self) -> Result<()> {
        self.record("flush_dns")
    }
}

// ---------------------------------------------------------------------------
// Hypervisor stub
// ---------------------------------------------------------------------------

/// A hypervisor whose "guest services" are localhost listeners that come up
/// after configurable delays. Exit is scriptable.
pub struct StubHypervisor {
    pub control_port: u16,
    pub socks_port: u16,
    control_delay: Option<Duration>,
    socks_delay: Option<Duration>,
    fail_start: bool,
    started: AtomicBool,
    exit_tx: watch::Sender<Option<i32>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

fn reserve_port() -> u16 {
    // Bind-and-drop; the stub rebinds the port when its delay elapses.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

impl StubHypervisor {
    pub fn new() -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            control_port: reserve_port(),
            socks_port: reserve_port(),
            control_delay: None,
            socks_delay: None,
            fail_start: false,
            started: AtomicBool::new(false),
            exit_tx,
            exit_rx,
        }
    }

    /// Open the control port after `delay`.
    pub fn with_control_delay(mut self, delay: Duration) -> Self {
        self.control_delay = Some(delay);
        self
    }

    /// Open the SOCKS port after `delay`.
    pub fn with_socks_delay(mut self, delay: Duration) -> Self {
        self.socks_delay = Some(delay);
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Simulate the child exiting with `code`.
    pub fn exit_with(&self, code: i32) {
        let _ = self.exit_tx.send(Some(code));
    }

    /// Write the stub's ports and loopback addressing into a config the
    /// engine can probe.
    pub fn configure(&self, config: &mut Config) {
        config.vm_ip = "127.0.0.1".to_string();
        config.control_port = self.control_port;
        config.socks_port = self.socks_port;
    }
}

#[async_trait::async_trait]
impl Hypervisor for StubHypervisor {
    async fn start(&self) -> Result<()> {
        if self.fail_start {
            bail!("injected hypervisor launch failure");
        }
        self.started.store(true, Ordering::SeqCst);

        for (port, delay) in [
            (self.control_port, self.control_delay),
            (self.socks_port, self.socks_delay),
        ] {
            let Some(delay) = delay else { continue };
            let mut exit_rx = self.exit_rx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await else {
                    return;
                };
                loop {
                    tokio::select! {
                        _ = exit_rx.wait_for(|v| v.is_some()) => return,
                        accepted = listener.accept() => {
                            let _ = accepted; // accept and drop, a probe only connects
                        }
                    }
                }
            });
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.exit_rx.borrow().is_none()
    }

    async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(code) => code.unwrap_or(-1),
            Err(_) => -1,
        };
        result
    }

    async fn stop(&self, _timeout: Duration) -> Result<()> {
        // Graceful powerdown: the guest obliges immediately.
        self.exit_with(0);
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.exit_with(-9);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tunnel fake
// ---------------------------------------------------------------------------

/// A tunnel whose write side is a channel the test drains; reads pend
/// forever (tests feed packets through the interceptor directly).
pub struct ChannelTun {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTun {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { outbound: tx }), rx)
    }
}

#[async_trait::async_trait]
impl TunDevice for ChannelTun {
    async fn recv(&self) -> std::io::Result<Vec<u8>> {
        std::future::pending().await
    }

    async fn send(&self, packet: &[u8]) -> std::io::Result<()> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tun closed"))
    }
}

// ---------------------------------------------------------------------------
// Dialers
// ---------------------------------------------------------------------------

/// Dials a fixed local endpoint regardless of the flow's destination.
pub struct LoopbackDialer {
    pub target: SocketAddr,
}

#[async_trait::async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, _dst: std::net::SocketAddrV4) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.target).await?)
    }
}

/// Never completes a dial; flows stay in SynReceived.
pub struct PendingDialer;

#[async_trait::async_trait]
impl Dialer for PendingDialer {
    async fn dial(&self, _dst: std::net::SocketAddrV4) -> Result<TcpStream> {
        std::future::pending().await
    }
}

/// Fails every dial immediately.
pub struct RefusingDialer;

#[async_trait::async_trait]
impl Dialer for RefusingDialer {
    async fn dial(&self, _dst: std::net::SocketAddrV4) -> Result<TcpStream> {
        bail!("injected connect failure")
    }
}

// ---------------------------------------------------------------------------
// Packet helpers
// ---------------------------------------------------------------------------

/// Owned view of a synthesized TCP packet pulled out of the tunnel.
#[derive(Debug)]
pub struct OutSegment {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
    pub checksums_ok: bool,
}

pub fn parse_out_tcp(packet: &[u8]) -> OutSegment {
    let ip = Ipv4Packet::parse(packet).expect("outbound packet parses as IPv4");
    assert_eq!(ip.protocol, PROTO_TCP);
    let seg = TcpSegment::parse(ip.payload).expect("outbound packet parses as TCP");
    OutSegment {
        src: ip.src,
        dst: ip.dst,
        src_port: seg.src_port,
        dst_port: seg.dst_port,
        seq: seg.seq,
        ack: seg.ack,
        flags: seg.flags,
        window: seg.window,
        options: seg.options.to_vec(),
        payload: seg.payload.to_vec(),
        checksums_ok: ip.checksum_ok(packet) && seg.checksum_ok(ip.src, ip.dst, ip.payload),
    }
}

/// Build a client→gateway TCP packet as it would arrive from the tunnel.
#[allow(clippy::too_many_arguments)]
pub fn tcp_packet(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let seg = TcpSegment::serialize(
        src, dst, src_port, dst_port, seq, ack, flags, 65535, &[], payload,
    );
    Ipv4Packet::serialize(src, dst, PROTO_TCP, 0x4242, 64, &seg)
}

/// Receive the next packet from the tunnel, bounded by `secs`.
pub async fn next_packet(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, secs: u64) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(secs), rx.recv())
        .await
        .expect("timed out waiting for a tunnel packet")
        .expect("tunnel closed")
}
