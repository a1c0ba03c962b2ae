//! The client worker: periodically reads the CPU temperature and reports it to
//!  the server node. Every iteration is self-contained, i.e. a failed iteration
//!  releases whatever it acquired and the next one starts from scratch.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::link::{ConnectOptions, Link, Priority};
use crate::sensor::TemperatureProbe;

/// What a single reporting iteration did. Every outcome implies that the
///  iteration holds no buffer and no connection any more.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IterationOutcome {
    Sent,
    /// The buffer pool was exhausted; no connect was attempted.
    NoBuffer,
    /// No connection came up within the timeout; the buffer was released.
    ConnectFailed,
    /// The send failed or timed out; the connection was still closed.
    SendFailed,
}

/// Runs reporting iterations forever, one every `config.period`.
pub async fn run_client(
    link: Arc<dyn Link>,
    probe: Arc<dyn TemperatureProbe>,
    config: ClientConfig,
) -> anyhow::Result<()> {
    config.validate()?;
    info!("client worker is up, reporting to node {} port {} every {:?}",
          config.server, config.app_port, config.period);

    loop {
        tokio::time::sleep(config.period).await;
        let outcome = client_iteration(link.as_ref(), probe.as_ref(), &config).await;
        trace!(?outcome, "reporting iteration finished");
    }
}

/// One reporting iteration: acquire a buffer, connect, format the reading into
///  the buffer, send, close.
pub async fn client_iteration(
    link: &dyn Link,
    probe: &dyn TemperatureProbe,
    config: &ClientConfig,
) -> IterationOutcome {
    let mut packet = match link.try_acquire(config.buffer_request) {
        Some(packet) => packet,
        None => {
            warn!("no free buffer, skipping this reading");
            return IterationOutcome::NoBuffer;
        }
    };

    let mut conn = match link
        .connect(Priority::Norm, config.server, config.app_port, ConnectOptions::empty(),
                 config.connect_timeout)
        .await
    {
        Ok(conn) => conn,
        Err(e) => {
            // dropping the packet returns its buffer to the pool
            warn!("cannot connect to node {}: {:#}", config.server, e);
            return IterationOutcome::ConnectFailed;
        }
    };

    let temperature = probe.read_temperature().await;
    let message = format_message(&temperature, config.message_capacity);
    if let Err(e) = packet.set_payload(message.as_bytes()) {
        warn!("cannot stage the message: {:#}", e);
        conn.close().await;
        return IterationOutcome::SendFailed;
    }

    let outcome = match conn.send(packet, config.send_timeout).await {
        Ok(()) => {
            debug!("sent \"{}\" to node {}", message, config.server);
            IterationOutcome::Sent
        }
        Err(e) => {
            warn!("cannot send to node {}: {:#}", config.server, e);
            IterationOutcome::SendFailed
        }
    };

    conn.close().await;
    outcome
}

/// Formats the reading the way a fixed-size text buffer would hold it: at most
///  `capacity - 1` bytes, cut at a character boundary.
fn format_message(temperature: &str, capacity: usize) -> String {
    let mut message = format!("FROM SATC CPU {}", temperature);
    if message.len() >= capacity {
        let mut end = capacity - 1;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}
