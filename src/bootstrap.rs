//! Ordered bring-up of a node: validate the configuration, bind the interface,
//!  install routes, start the router task.

use std::sync::Arc;

use tracing::info;

use crate::config::StackConfig;
use crate::link::udp::UdpLink;
use crate::link::Link;

/// Brings up a UDP link node. Everything is validated before any resource is
///  touched, so a failed bootstrap leaves nothing behind.
pub async fn bootstrap(config: &StackConfig) -> anyhow::Result<Arc<UdpLink>> {
    config.validate()?;
    info!("bringing up node {}", config.local_addr);

    let link = Arc::new(UdpLink::new(config).await?);
    link.start_router();

    info!("node {} is up", config.local_addr);
    Ok(link)
}

/// Logs the connection table, the route table and the interface counters, the
///  way `-v` diagnostics print them.
pub fn log_diagnostics(link: &dyn Link) {
    let diagnostics = link.diagnostics();

    info!("connections of node {}:", diagnostics.local_addr);
    if diagnostics.connections.is_empty() {
        info!("  (none)");
    }
    for c in &diagnostics.connections {
        info!("  {}:{} <-> {}:{} ({} queued)",
              diagnostics.local_addr, c.local_port, c.peer, c.peer_port, c.queued);
    }

    info!("routes of node {}:", diagnostics.local_addr);
    if diagnostics.routes.is_empty() {
        info!("  (none)");
    }
    for r in &diagnostics.routes {
        info!("  node {} via {}", r.dest, r.endpoint);
    }

    let i = &diagnostics.interface;
    info!("interface {} on {}: promisc={} rx={} tx={} dropped={} buffers={}/{}",
          i.name, i.endpoint, i.promiscuous, i.rx_datagrams, i.tx_datagrams, i.rx_dropped,
          i.free_buffers, i.total_buffers);
}
