use std::sync::Arc;

use num_enum::TryFromPrimitive;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::addr::Port;
use crate::link::buffer_pool::BufferPool;
use crate::link::packet::Packet;

/// The service ports every node answers without application involvement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ServicePort {
    Management = 0,
    Ping = 1,
    ProcessList = 2,
    MemFree = 3,
    Reboot = 4,
    BufFree = 5,
    Uptime = 6,
}

/// Answers housekeeping requests on the service ports: ping echo, free buffer
///  count, uptime. Takes ownership of every request packet; a reply reuses the
///  request's buffer, and requests without a reply are dropped, which releases
///  the buffer.
pub struct ServiceResponder {
    pool: Arc<BufferPool>,
    started: Instant,
}

impl ServiceResponder {
    pub fn new(pool: Arc<BufferPool>) -> ServiceResponder {
        ServiceResponder {
            pool,
            started: Instant::now(),
        }
    }

    /// Build the reply for a request on `port`, or `None` if the request has no
    ///  reply and was dropped.
    pub fn respond(&self, port: Port, mut packet: Packet) -> Option<Packet> {
        let service = match ServicePort::try_from(port.value()) {
            Ok(service) => service,
            Err(_) => {
                debug!("no service behind port {}, dropping request", port);
                return None;
            }
        };

        match service {
            ServicePort::Ping => {
                trace!("answering ping, echoing {} bytes", packet.len());
                Some(packet)
            }
            ServicePort::BufFree => {
                let free = self.pool.available() as u32;
                packet.set_payload(&free.to_be_bytes()).ok()?;
                Some(packet)
            }
            ServicePort::Uptime => {
                let seconds = self.started.elapsed().as_secs() as u32;
                packet.set_payload(&seconds.to_be_bytes()).ok()?;
                Some(packet)
            }
            ServicePort::Reboot => {
                warn!("ignoring reboot request from the wire");
                None
            }
            other => {
                debug!("service {:?} not implemented, dropping request", other);
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use tokio::time::advance;
    use std::time::Duration;
    use super::*;

    fn acquire(pool: &Arc<BufferPool>, payload: &[u8]) -> Packet {
        let mut packet = Packet::acquire(pool, payload.len()).unwrap();
        packet.set_payload(payload).unwrap();
        packet
    }

    #[tokio::test]
    async fn test_ping_echoes_payload() {
        let pool = Arc::new(BufferPool::new(300, 4));
        let responder = ServiceResponder::new(pool.clone());

        let request = acquire(&pool, b"\x01\x02\x03ping");

        let reply = responder.respond(Port::new(1).unwrap(), request).unwrap();
        assert_eq!(reply.payload(), b"\x01\x02\x03ping");
    }

    #[tokio::test]
    async fn test_buf_free_reports_pool_occupancy() {
        let pool = Arc::new(BufferPool::new(300, 4));
        let responder = ServiceResponder::new(pool.clone());

        let _held = Packet::acquire(&pool, 10).unwrap();
        let request = acquire(&pool, b"");

        // one held, one in the request itself
        let reply = responder.respond(Port::new(5).unwrap(), request).unwrap();
        assert_eq!(reply.payload(), 2u32.to_be_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_counts_seconds_since_start() {
        let pool = Arc::new(BufferPool::new(300, 4));
        let responder = ServiceResponder::new(pool.clone());

        advance(Duration::from_secs(42)).await;

        let reply = responder.respond(Port::new(6).unwrap(), acquire(&pool, b"")).unwrap();
        assert_eq!(reply.payload(), 42u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_reboot_is_dropped() {
        let pool = Arc::new(BufferPool::new(300, 4));
        let responder = ServiceResponder::new(pool.clone());

        assert!(responder.respond(Port::new(4).unwrap(), acquire(&pool, b"")).is_none());
        assert_eq!(pool.available(), 4, "dropped request must release its buffer");
    }

    #[tokio::test]
    async fn test_unimplemented_and_unknown_services_drop() {
        let pool = Arc::new(BufferPool::new(300, 4));
        let responder = ServiceResponder::new(pool.clone());

        for port in [0u8, 2, 3, 7] {
            assert!(responder.respond(Port::new(port).unwrap(), acquire(&pool, b"x")).is_none());
        }
        assert_eq!(pool.available(), 4);
    }
}
