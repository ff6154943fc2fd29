//! Userspace TCP/SOCKS gateway.
//!
//! Raw IP packets arrive from an OS point-to-point tunnel; per-flow TCP
//! state machines terminate each connection and relay payload through an
//! upstream SOCKS5 endpoint, while DNS queries are forwarded over UDP to a
//! separate resolver. No kernel socket is ever opened on behalf of the
//! tunneled applications.

pub mod dns;
pub mod interceptor;
pub mod manager;
pub mod packet;
pub mod session;
pub mod socks;
pub mod tun;

pub use dns::DnsRelay;
pub use interceptor::Interceptor;
pub use manager::SessionManager;
pub use session::{SessionKey, TcpSession, TcpState};
pub use socks::{Dialer, SocksDialer};
pub use tun::{FdTun, TunDevice};
