use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;

use crate::link::packet::Packet;
use crate::link::udp::wire::DatagramHeader;
use crate::link::udp::{FlowKey, LinkShared, UdpConnection, CONN_QUEUE_DEPTH};
use crate::link::{ConnectOptions, PortBinding};

/// The router task: moves datagrams from the socket into per-connection queues,
///  offers new flows to a matching listener's backlog, and answers service
///  requests when no listener claims them. Runs until the link shuts down.
pub(crate) async fn run_router(
    shared: Arc<LinkShared>,
    mut cancel_receiver: broadcast::Receiver<()>,
) {
    info!("router task for node {} is up", shared.local_addr);

    // one spare byte so a datagram exceeding the buffer size shows up as oversized
    //  rather than silently truncated
    let mut scratch = vec![0u8; DatagramHeader::SERIALIZED_LEN + shared.pool.buf_size() + 1];

    loop {
        tokio::select! {
            r = shared.socket.recv_from(&mut scratch) => {
                match r {
                    Ok((len, from)) => handle_datagram(&shared, &scratch[..len], from).await,
                    Err(e) => error!("error receiving from the socket: {}", e),
                }
            }
            _ = cancel_receiver.recv() => break,
        }
    }

    info!("router task for node {} is shut down", shared.local_addr);
}

async fn handle_datagram(shared: &Arc<LinkShared>, datagram: &[u8], from: SocketAddr) {
    shared.stats.rx_datagrams.fetch_add(1, Ordering::Relaxed);

    let correlation_id = Uuid::new_v4();
    let received_span = span!(Level::TRACE, "datagram_received", ?correlation_id);
    let _entered = received_span.enter();

    trace!("received {} bytes from {}", datagram.len(), from);

    let mut parse_buf = datagram;
    let header = match DatagramHeader::deser(&mut parse_buf) {
        Ok(header) => header,
        Err(e) => {
            debug!("dropping malformed datagram from {}: {}", from, e);
            shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    let payload = parse_buf;

    trace!("datagram {:?} with a {} byte payload", header, payload.len());

    if !header.options.is_empty() {
        debug!("dropping datagram from node {} - requested options {:?} are not supported",
               header.source, header.options);
        shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    if header.dest != shared.local_addr && !header.dest.is_broadcast() {
        if shared.promiscuous {
            debug!("overheard a datagram for node {} - dropping", header.dest);
        } else {
            trace!("datagram for node {} is not local - dropping", header.dest);
        }
        shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    if payload.len() > shared.pool.buf_size() {
        warn!("payload of {}+ bytes from node {} exceeds the buffer size of {} - dropping",
              payload.len(), header.source, shared.pool.buf_size());
        shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let mut buf = match shared.pool.try_get() {
        Some(buf) => buf,
        None => {
            warn!("buffer pool exhausted - dropping datagram from node {}", header.source);
            shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    buf.extend_from_slice(payload);
    let packet = Packet::from_buf(&shared.pool, buf);

    dispatch(shared, header, packet)
        .instrument(Span::current())
        .await;
}

/// Routing decision for one inbound packet: an existing flow gets it queued, a
///  new flow goes to the matching listener, service ports are answered directly,
///  everything else is dropped.
async fn dispatch(shared: &Arc<LinkShared>, header: DatagramHeader, packet: Packet) {
    let key: FlowKey = (header.source, header.source_port, header.dest_port);

    let flow_tx = {
        let table = shared.table.lock().unwrap();
        table.flows.get(&key).cloned()
    };
    if let Some(tx) = flow_tx {
        match tx.try_send(packet) {
            Ok(()) => trace!("queued packet for flow {:?}", key),
            Err(TrySendError::Full(_)) => {
                warn!("queue of flow {:?} is full - dropping packet", key);
                shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("flow {:?} is closing - dropping packet", key);
                shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        return;
    }

    match offer_to_listener(shared, &header, packet) {
        OfferOutcome::Offered | OfferOutcome::Refused => {}
        OfferOutcome::NoListener(packet) => {
            if header.dest_port.is_service() {
                respond_to_service(shared, &header, packet).await;
            } else {
                debug!("no listener on port {} - dropping packet from node {}",
                       header.dest_port, header.source);
                shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

enum OfferOutcome {
    Offered,
    Refused,
    /// Hands the packet back for service handling.
    NoListener(Packet),
}

fn offer_to_listener(shared: &Arc<LinkShared>, header: &DatagramHeader, packet: Packet) -> OfferOutcome {
    let key: FlowKey = (header.source, header.source_port, header.dest_port);

    // flow registration happens under the lock, the handover to the listener
    //  outside of it: a refused connection re-locks the table on drop
    let (listener_tx, conn) = {
        let mut table = shared.table.lock().unwrap();
        table.listeners.retain(|slot| !slot.tx.is_closed());

        // a listener on exactly this port wins over one bound to `Any`
        let slot = table.listeners.iter()
            .find(|slot| slot.binding == PortBinding::Port(header.dest_port))
            .or_else(|| table.listeners.iter().find(|slot| slot.binding.matches(header.dest_port)));
        let listener_tx = match slot {
            Some(slot) => slot.tx.clone(),
            None => return OfferOutcome::NoListener(packet),
        };

        if table.flows.len() >= shared.max_connections {
            warn!("connection table is full - refusing a connection from node {}", header.source);
            shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return OfferOutcome::Refused;
        }

        let (tx, rx) = mpsc::channel(CONN_QUEUE_DEPTH);
        if let Err(e) = tx.try_send(packet) {
            // cannot happen on a fresh queue, but losing the packet beats losing the buffer
            debug!("dropping the first packet of flow {:?}: {}", key, e);
        }
        table.flows.insert(key, tx);

        let conn = UdpConnection {
            shared: shared.clone(),
            peer: header.source,
            peer_port: header.source_port,
            local_port: header.dest_port,
            priority: header.priority,
            options: header.options,
            rx,
            open: true,
        };
        (listener_tx, conn)
    };

    match listener_tx.try_send(conn) {
        Ok(()) => {
            debug!("offered flow {:?} to the listener", key);
            OfferOutcome::Offered
        }
        Err(TrySendError::Full(conn)) => {
            warn!("accept backlog is full - refusing a connection from node {}", conn.peer);
            shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            drop(conn);
            OfferOutcome::Refused
        }
        Err(TrySendError::Closed(conn)) => {
            debug!("listener went away - refusing a connection from node {}", conn.peer);
            shared.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            drop(conn);
            OfferOutcome::Refused
        }
    }
}

async fn respond_to_service(shared: &Arc<LinkShared>, header: &DatagramHeader, packet: Packet) {
    let reply = match shared.responder.respond(header.dest_port, packet) {
        Some(reply) => reply,
        None => return,
    };

    let reply_header = DatagramHeader {
        priority: header.priority,
        source: shared.local_addr,
        dest: header.source,
        dest_port: header.source_port,
        source_port: header.dest_port,
        options: ConnectOptions::empty(),
    };

    if let Err(e) = shared.transmit(&reply_header, reply.payload()).await {
        debug!("cannot deliver a service reply to node {}: {}", header.source, e);
    }
}
