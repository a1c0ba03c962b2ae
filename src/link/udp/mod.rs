//! Reference implementation of the link contract, framing link datagrams inside
//!  UDP: one datagram per packet, a router task per link demultiplexing inbound
//!  datagrams into per-connection queues, and a static route table mapping node
//!  addresses to UDP endpoints.

pub mod router;
pub mod service;
pub mod wire;

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::addr::{NodeAddr, Port};
use crate::config::{StackConfig, StaticRoute};
use crate::link::buffer_pool::BufferPool;
use crate::link::packet::Packet;
use crate::link::udp::service::ServiceResponder;
use crate::link::udp::wire::{encode_datagram, DatagramHeader};
use crate::link::{
    ConnectOptions, Connection, ConnectionDiagnostics, IfaceDiagnostics, Link, LinkDiagnostics,
    Listener, PortBinding, Priority, RouteDiagnostics,
};

/// `(peer, peer port, local port)` identifies one flow of packets.
pub(crate) type FlowKey = (NodeAddr, Port, Port);

/// Source ports an active connect picks from.
const EPHEMERAL_MIN: u8 = 32;
const EPHEMERAL_RANGE: u8 = 32;

/// Packets one connection may have queued before the router starts dropping.
pub(crate) const CONN_QUEUE_DEPTH: usize = 16;

#[derive(Default)]
struct IfaceStats {
    rx_datagrams: AtomicU64,
    tx_datagrams: AtomicU64,
    rx_dropped: AtomicU64,
}

struct ListenerSlot {
    binding: PortBinding,
    tx: mpsc::Sender<UdpConnection>,
}

#[derive(Default)]
struct FlowTable {
    flows: FxHashMap<FlowKey, mpsc::Sender<Packet>>,
    listeners: Vec<ListenerSlot>,
}

/// State shared between the link handle, its connections and the router task.
pub(crate) struct LinkShared {
    local_addr: NodeAddr,
    iface_name: String,
    promiscuous: bool,
    socket: UdpSocket,
    pool: Arc<BufferPool>,
    responder: ServiceResponder,
    routes: Mutex<FxHashMap<NodeAddr, SocketAddr>>,
    max_connections: usize,
    table: Mutex<FlowTable>,
    slot_freed: Notify,
    cancel_sender: broadcast::Sender<()>,
    closed: AtomicBool,
    stats: IfaceStats,
}

impl LinkShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn route_to(&self, dest: NodeAddr) -> anyhow::Result<SocketAddr> {
        self.routes.lock().unwrap()
            .get(&dest)
            .copied()
            .ok_or_else(|| anyhow!("no route to node {}", dest))
    }

    async fn transmit(&self, header: &DatagramHeader, payload: &[u8]) -> anyhow::Result<()> {
        let endpoint = self.route_to(header.dest)?;
        let buf = encode_datagram(header, payload);
        self.socket.send_to(&buf, endpoint).await?;
        self.stats.tx_datagrams.fetch_add(1, Ordering::Relaxed);

        trace!("transmitted {} bytes to node {} via {}", buf.len(), header.dest, endpoint);
        Ok(())
    }

    fn remove_flow(&self, key: &FlowKey) {
        let removed = self.table.lock().unwrap().flows.remove(key).is_some();
        if removed {
            trace!("removed flow {:?}", key);
            self.slot_freed.notify_one();
        }
    }
}

/// A link over one bound UDP socket. Create with [`UdpLink::new`], then call
///  [`UdpLink::start_router`] to begin moving packets.
pub struct UdpLink {
    shared: Arc<LinkShared>,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpLink {
    pub async fn new(config: &StackConfig) -> anyhow::Result<UdpLink> {
        config.validate()?;

        let pool = Arc::new(BufferPool::new(config.buffer_size, config.buffer_count));
        info!("buffer pool holds {} buffers of {} bytes", config.buffer_count, config.buffer_size);

        let socket = UdpSocket::bind(config.iface.bind).await?;
        info!("bound interface {} to {}", config.iface.name, socket.local_addr()?);

        let (cancel_sender, _) = broadcast::channel(1);

        let link = UdpLink {
            shared: Arc::new(LinkShared {
                local_addr: config.local_addr,
                iface_name: config.iface.name.clone(),
                promiscuous: config.iface.promiscuous,
                socket,
                responder: ServiceResponder::new(pool.clone()),
                pool,
                routes: Mutex::new(FxHashMap::default()),
                max_connections: config.max_connections,
                table: Mutex::new(FlowTable::default()),
                slot_freed: Notify::new(),
                cancel_sender,
                closed: AtomicBool::new(false),
                stats: IfaceStats::default(),
            }),
            router_task: Mutex::new(None),
        };

        for route in &config.routes {
            link.add_route(*route)?;
        }

        Ok(link)
    }

    /// Install (or replace) a static route.
    pub fn add_route(&self, route: StaticRoute) -> anyhow::Result<()> {
        if route.dest == self.shared.local_addr {
            bail!("route to the local address {}", route.dest);
        }

        info!("route: node {} via {} ({})", route.dest, route.endpoint, self.shared.iface_name);
        self.shared.routes.lock().unwrap().insert(route.dest, route.endpoint);
        Ok(())
    }

    /// The interface's actual bound endpoint (relevant when binding port 0).
    pub fn endpoint(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Spawn the router task. Idempotent; the task runs until `shutdown`.
    pub fn start_router(&self) {
        let mut guard = self.router_task.lock().unwrap();
        if guard.is_some() {
            warn!("router task is already running");
            return;
        }

        info!("starting router task");
        // subscribed before the task is spawned: a cancellation sent before the
        //  task's first poll must not be lost
        let cancel_receiver = self.shared.cancel_sender.subscribe();
        *guard = Some(tokio::spawn(router::run_router(self.shared.clone(), cancel_receiver)));
    }
}

impl Debug for UdpLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpLink{{node:{}}}", self.shared.local_addr)
    }
}

#[async_trait]
impl Link for UdpLink {
    fn local_addr(&self) -> NodeAddr {
        self.shared.local_addr
    }

    fn try_acquire(&self, size: usize) -> Option<Packet> {
        Packet::acquire(&self.shared.pool, size)
    }

    async fn connect(
        &self,
        priority: Priority,
        dest: NodeAddr,
        port: Port,
        options: ConnectOptions,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn Connection>> {
        if !options.is_empty() {
            bail!("connection options {:?} are not supported by this link", options);
        }
        // fail fast when there is no way to reach the peer at all
        self.shared.route_to(dest)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let slot_freed = self.shared.slot_freed.notified();

            {
                let mut table = self.shared.table.lock().unwrap();
                // shutdown sets the flag before sweeping the table under this lock
                if self.shared.is_closed() {
                    bail!("link is shut down");
                }
                if table.flows.len() < self.shared.max_connections {
                    let source_port = pick_ephemeral_port(&table.flows, dest, port)?;
                    let (tx, rx) = mpsc::channel(CONN_QUEUE_DEPTH);
                    table.flows.insert((dest, port, source_port), tx);

                    let conn = UdpConnection {
                        shared: self.shared.clone(),
                        peer: dest,
                        peer_port: port,
                        local_port: source_port,
                        priority,
                        options,
                        rx,
                        open: true,
                    };
                    debug!("connected {:?}", conn);
                    return Ok(Box::new(conn));
                }
            }

            debug!("connection table is full, waiting for a slot");
            if tokio::time::timeout_at(deadline, slot_freed).await.is_err() {
                bail!("connect to {}:{} timed out after {:?} waiting for a connection slot",
                      dest, port, timeout);
            }
        }
    }

    async fn listen(&self, binding: PortBinding, backlog: usize) -> anyhow::Result<Box<dyn Listener>> {
        if backlog == 0 {
            bail!("backlog must hold at least one connection");
        }

        let mut table = self.shared.table.lock().unwrap();
        if self.shared.is_closed() {
            bail!("link is shut down");
        }
        table.listeners.retain(|slot| !slot.tx.is_closed());
        if table.listeners.iter().any(|slot| slot.binding == binding) {
            bail!("already listening on {:?}", binding);
        }

        let (tx, rx) = mpsc::channel(backlog);
        table.listeners.push(ListenerSlot { binding, tx });
        info!("listening on {:?} with a backlog of {}", binding, backlog);

        Ok(Box::new(UdpListener {
            shared: self.shared.clone(),
            binding,
            rx,
        }))
    }

    fn diagnostics(&self) -> LinkDiagnostics {
        let mut connections: Vec<_> = {
            let table = self.shared.table.lock().unwrap();
            table.flows.iter()
                .map(|((peer, peer_port, local_port), tx)| ConnectionDiagnostics {
                    peer: *peer,
                    peer_port: *peer_port,
                    local_port: *local_port,
                    queued: tx.max_capacity() - tx.capacity(),
                })
                .collect()
        };
        connections.sort_by_key(|c| (c.peer, c.peer_port, c.local_port));

        let mut routes: Vec<_> = self.shared.routes.lock().unwrap().iter()
            .map(|(dest, endpoint)| RouteDiagnostics { dest: *dest, endpoint: *endpoint })
            .collect();
        routes.sort_by_key(|r| r.dest);

        LinkDiagnostics {
            local_addr: self.shared.local_addr,
            connections,
            routes,
            interface: IfaceDiagnostics {
                name: self.shared.iface_name.clone(),
                endpoint: self.shared.socket.local_addr().unwrap(),
                promiscuous: self.shared.promiscuous,
                rx_datagrams: self.shared.stats.rx_datagrams.load(Ordering::Relaxed),
                tx_datagrams: self.shared.stats.tx_datagrams.load(Ordering::Relaxed),
                rx_dropped: self.shared.stats.rx_dropped.load(Ordering::Relaxed),
                free_buffers: self.shared.pool.available(),
                total_buffers: self.shared.pool.capacity(),
            },
        }
    }

    async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down link of node {}", self.shared.local_addr);

        if let Err(err) = self.shared.cancel_sender.send(()) {
            debug!(?err, "router task is not listening for cancellation");
        }

        {
            let mut table = self.shared.table.lock().unwrap();
            table.flows.clear();
            table.listeners.clear();
        }
        self.shared.slot_freed.notify_waiters();

        let task = self.router_task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(?err, "router task ended abnormally");
            }
        }
    }
}

fn pick_ephemeral_port(
    flows: &FxHashMap<FlowKey, mpsc::Sender<Packet>>,
    dest: NodeAddr,
    dest_port: Port,
) -> anyhow::Result<Port> {
    let offset: u8 = rand::thread_rng().gen_range(0..EPHEMERAL_RANGE);

    for i in 0..EPHEMERAL_RANGE {
        let raw = EPHEMERAL_MIN + (offset + i) % EPHEMERAL_RANGE;
        let candidate = Port::new(raw)?;
        if !flows.contains_key(&(dest, dest_port, candidate)) {
            return Ok(candidate);
        }
    }

    bail!("no free source port for connecting to {}:{}", dest, dest_port)
}

/// One flow of packets between a local port and a peer's port. Created by an
///  active connect or accepted from a listener backlog.
pub struct UdpConnection {
    shared: Arc<LinkShared>,
    peer: NodeAddr,
    peer_port: Port,
    local_port: Port,
    priority: Priority,
    options: ConnectOptions,
    rx: mpsc::Receiver<Packet>,
    open: bool,
}

impl UdpConnection {
    fn key(&self) -> FlowKey {
        (self.peer, self.peer_port, self.local_port)
    }

    fn header_to_peer(&self) -> DatagramHeader {
        DatagramHeader {
            priority: self.priority,
            source: self.shared.local_addr,
            dest: self.peer,
            dest_port: self.peer_port,
            source_port: self.local_port,
            options: self.options,
        }
    }

    fn teardown(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        self.shared.remove_flow(&self.key());
        self.rx.close();
        while let Ok(packet) = self.rx.try_recv() {
            drop(packet);
        }
    }
}

impl Debug for UdpConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpConnection{{{}:{} <-> {}:{}}}",
               self.shared.local_addr, self.local_port, self.peer, self.peer_port)
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[async_trait]
impl Connection for UdpConnection {
    fn peer(&self) -> NodeAddr {
        self.peer
    }

    fn local_port(&self) -> Port {
        self.local_port
    }

    fn peer_port(&self) -> Port {
        self.peer_port
    }

    async fn read(&mut self, timeout: Duration) -> anyhow::Result<Option<Packet>> {
        if !self.open {
            bail!("connection is closed");
        }
        if self.shared.is_closed() {
            bail!("link is shut down");
        }

        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(packet)) => {
                trace!("read {:?} on {:?}", packet, self);
                Ok(Some(packet))
            }
            Ok(None) => bail!("connection torn down by the link"),
        }
    }

    async fn send(&mut self, packet: Packet, timeout: Duration) -> anyhow::Result<()> {
        if !self.open {
            bail!("connection is closed");
        }
        if self.shared.is_closed() {
            bail!("link is shut down");
        }

        let header = self.header_to_peer();
        // the packet is dropped on the way out, which releases its buffer
        match tokio::time::timeout(timeout, self.shared.transmit(&header, packet.payload())).await {
            Err(_) => bail!("send to node {} timed out after {:?}", self.peer, timeout),
            Ok(result) => result,
        }
    }

    async fn service_respond(&mut self, packet: Packet) -> anyhow::Result<()> {
        if self.shared.is_closed() {
            bail!("link is shut down");
        }

        let reply = match self.shared.responder.respond(self.local_port, packet) {
            Some(reply) => reply,
            None => return Ok(()),
        };

        let header = self.header_to_peer();
        self.shared.transmit(&header, reply.payload()).await
    }

    async fn close(&mut self) {
        trace!("closing {:?}", self);
        self.teardown();
    }
}

pub struct UdpListener {
    shared: Arc<LinkShared>,
    binding: PortBinding,
    rx: mpsc::Receiver<UdpConnection>,
}

impl Debug for UdpListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpListener{{{}:{:?}}}", self.shared.local_addr, self.binding)
    }
}

#[async_trait]
impl Listener for UdpListener {
    async fn accept(&mut self, timeout: Duration) -> anyhow::Result<Option<Box<dyn Connection>>> {
        if self.shared.is_closed() {
            bail!("link is shut down");
        }

        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(conn)) => {
                debug!("accepted {:?}", conn);
                Ok(Some(Box::new(conn)))
            }
            Ok(None) => bail!("listener torn down by the link"),
        }
    }
}
