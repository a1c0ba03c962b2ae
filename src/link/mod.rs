//! The narrow contract between the application workers and the underlying link
//!  stack: acquire a pooled buffer, open or accept a connection, read and send
//!  packets, close. Every potentially blocking operation takes an explicit timeout,
//!  and packet buffers transfer ownership at the call boundary, so the transport
//!  behind the contract is swappable without touching worker logic.
//!
//! `udp` contains the reference implementation framing link datagrams inside UDP.

pub mod buffer_pool;
pub mod packet;
pub mod udp;

use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::addr::{NodeAddr, Port};
use crate::link::packet::Packet;

/// Packet priority, the 2-bit wire field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Norm = 2,
    Low = 3,
}

bitflags! {
    /// Connection option flags, the 4-bit wire field. The flags travel on the wire
    ///  so peers can reject what they do not support; none of them is implemented
    ///  by the UDP reference link. `empty()` is the datagram-like default:
    ///  unordered, unacknowledged delivery.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ConnectOptions: u8 {
        const RDP   = 0b0001;
        const HMAC  = 0b0010;
        const XTEA  = 0b0100;
        const CRC32 = 0b1000;
    }
}

/// What a listener binds to: one fixed port, or every port that is not claimed
///  otherwise (the demo server binds `Any` and dispatches per packet).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortBinding {
    Any,
    Port(Port),
}

impl PortBinding {
    pub fn matches(&self, port: Port) -> bool {
        match self {
            PortBinding::Any => true,
            PortBinding::Port(p) => *p == port,
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Link: Debug + Send + Sync + 'static {
    fn local_addr(&self) -> NodeAddr;

    /// Acquire a pooled buffer for a payload of up to `size` bytes. `None` means
    ///  the pool is exhausted (or the request cannot fit a buffer at all); callers
    ///  back off and retry later rather than block.
    fn try_acquire(&self, size: usize) -> Option<Packet>;

    /// Actively open a connection to `port` on `dest`. Bounded by `timeout`;
    ///  failure (no route, no connection slot within the bound, link shut down)
    ///  is an error, and the caller still owns any payload buffer it acquired.
    async fn connect(
        &self,
        priority: Priority,
        dest: NodeAddr,
        port: Port,
        options: ConnectOptions,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn Connection>>;

    /// Create a listening endpoint with a bounded accept backlog. Connections
    ///  beyond the backlog are refused by the link.
    async fn listen(&self, binding: PortBinding, backlog: usize) -> anyhow::Result<Box<dyn Listener>>;

    /// Snapshot of the connection, route and interface tables.
    fn diagnostics(&self) -> LinkDiagnostics;

    /// Stop the router task and tear down all connections. Pending and subsequent
    ///  `accept` / `read` / `connect` calls return an error.
    async fn shutdown(&self);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Listener: Debug + Send {
    /// Wait for an inbound connection. `Ok(None)` means no connection arrived
    ///  within the bound - "no event yet", loop and try again. `Err` means the
    ///  listener is gone (the link was shut down).
    async fn accept(&mut self, timeout: Duration) -> anyhow::Result<Option<Box<dyn Connection>>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Debug + Send {
    fn peer(&self) -> NodeAddr;

    /// The local port of this connection - on an accepted connection this is the
    ///  destination port the peer addressed, which drives dispatch.
    fn local_port(&self) -> Port;

    fn peer_port(&self) -> Port;

    /// Read the next packet. `Ok(None)` means nothing arrived within the bound,
    ///  which ends a server session. `Err` means the connection is gone.
    async fn read(&mut self, timeout: Duration) -> anyhow::Result<Option<Packet>>;

    /// Send a packet, consuming it. The link releases the buffer after
    ///  transmission; on failure the buffer is released on the way out of the
    ///  call. Either way the caller is no longer responsible for it.
    async fn send(&mut self, packet: Packet, timeout: Duration) -> anyhow::Result<()>;

    /// Hand a packet that arrived on a service port to the link's service
    ///  responder, which owns reply semantics. Consumes the packet: the responder
    ///  releases the buffer (or reuses it for its reply).
    async fn service_respond(&mut self, packet: Packet) -> anyhow::Result<()>;

    async fn close(&mut self);
}

/// Diagnostic snapshot backing the `-v` startup dump.
#[derive(Clone, Debug)]
pub struct LinkDiagnostics {
    pub local_addr: NodeAddr,
    pub connections: Vec<ConnectionDiagnostics>,
    pub routes: Vec<RouteDiagnostics>,
    pub interface: IfaceDiagnostics,
}

#[derive(Clone, Debug)]
pub struct ConnectionDiagnostics {
    pub peer: NodeAddr,
    pub peer_port: Port,
    pub local_port: Port,
    pub queued: usize,
}

#[derive(Clone, Debug)]
pub struct RouteDiagnostics {
    pub dest: NodeAddr,
    pub endpoint: SocketAddr,
}

#[derive(Clone, Debug)]
pub struct IfaceDiagnostics {
    pub name: String,
    pub endpoint: SocketAddr,
    pub promiscuous: bool,
    pub rx_datagrams: u64,
    pub tx_datagrams: u64,
    pub rx_dropped: u64,
    pub free_buffers: usize,
    pub total_buffers: usize,
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::any_app(PortBinding::Any, 10, true)]
    #[case::any_service(PortBinding::Any, 1, true)]
    #[case::bound_match(PortBinding::Port(Port::new(10).unwrap()), 10, true)]
    #[case::bound_mismatch(PortBinding::Port(Port::new(10).unwrap()), 11, false)]
    fn test_port_binding_matches(#[case] binding: PortBinding, #[case] port: u8, #[case] expected: bool) {
        assert_eq!(binding.matches(Port::new(port).unwrap()), expected);
    }

    #[rstest]
    #[case::critical(0, Some(Priority::Critical))]
    #[case::norm(2, Some(Priority::Norm))]
    #[case::low(3, Some(Priority::Low))]
    #[case::out_of_range(4, None)]
    fn test_priority_from_wire(#[case] raw: u8, #[case] expected: Option<Priority>) {
        assert_eq!(Priority::try_from(raw).ok(), expected);
    }

    #[test]
    fn test_connect_options_wire_bits() {
        assert_eq!(ConnectOptions::empty().bits(), 0);
        assert_eq!(ConnectOptions::RDP.bits(), 1);
        assert_eq!(ConnectOptions::from_bits(0b1111),
                   Some(ConnectOptions::RDP | ConnectOptions::HMAC | ConnectOptions::XTEA | ConnectOptions::CRC32));
        assert_eq!(ConnectOptions::from_bits(0b1_0000), None);
    }
}
