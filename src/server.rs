//! The server worker: accepts connections from any port, logs application
//!  messages and hands everything else to the link's service responder.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::addr::Port;
use crate::config::ServerConfig;
use crate::link::packet::Packet;
use crate::link::{Connection, Link, PortBinding};

#[derive(Debug, Eq, PartialEq)]
enum HandleOutcome {
    /// Logged and released.
    AppMessage,
    /// Handed to the service responder.
    Forwarded,
}

/// Accepts and serves connections until the link shuts down. Accept timeouts
///  just make the loop poll again.
pub async fn run_server(link: Arc<dyn Link>, config: ServerConfig) -> anyhow::Result<()> {
    config.validate()?;

    let mut listener = link.listen(PortBinding::Any, config.backlog).await?;
    info!("server worker is up, expecting application traffic on port {}", config.app_port);

    loop {
        match listener.accept(config.accept_timeout).await? {
            None => trace!("nothing to accept"),
            Some(mut conn) => serve_connection(conn.as_mut(), &config).await,
        }
    }
}

/// Reads the connection until the peer goes quiet, then closes it. The
///  connection is closed exactly once, whatever ends the session.
async fn serve_connection(conn: &mut dyn Connection, config: &ServerConfig) {
    debug!("serving {:?}", conn);

    loop {
        match conn.read(config.read_timeout).await {
            Ok(Some(packet)) => {
                if let Err(e) = dispatch_packet(conn, packet, config.app_port).await {
                    debug!("dropping packet: {:#}", e);
                }
            }
            Ok(None) => {
                trace!("peer has nothing more to say");
                break;
            }
            Err(e) => {
                warn!("session ended: {:#}", e);
                break;
            }
        }
    }

    conn.close().await;
}

async fn dispatch_packet(
    conn: &mut dyn Connection,
    packet: Packet,
    app_port: Port,
) -> anyhow::Result<HandleOutcome> {
    if conn.local_port() == app_port {
        info!("received from node {}: \"{}\"", conn.peer(), payload_text(packet.payload()));
        Ok(HandleOutcome::AppMessage)
    } else {
        conn.service_respond(packet).await?;
        Ok(HandleOutcome::Forwarded)
    }
}

/// The printable prefix of a payload: everything up to the first NUL byte,
///  lossily decoded.
fn payload_text(payload: &[u8]) -> Cow<'_, str> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end])
}
