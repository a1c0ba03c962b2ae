use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::addr::{NodeAddr, Port};

/// Everything the link stack needs to come up: local addressing, buffer pool
///  dimensions, the interface to bind, and the static route table. Passed to
///  `bootstrap`, which validates before touching any resource.
#[derive(Clone, Debug)]
pub struct StackConfig {
    pub local_addr: NodeAddr,

    /// Number of pooled packet buffers, shared by senders and the receive path.
    ///  The pool is strictly bounded, so this is also the upper bound on payloads
    ///  in flight at any time.
    pub buffer_count: usize,

    /// Payload capacity of each pooled buffer in bytes.
    pub buffer_size: usize,

    /// Upper bound on simultaneously open connections, inbound and outbound.
    pub max_connections: usize,

    pub iface: IfaceConfig,

    /// Static routes mapping peer node addresses (and usually the broadcast
    ///  address) to interface endpoints. There is no route discovery.
    pub routes: Vec<StaticRoute>,
}

impl StackConfig {
    /// Defaults sized for a demo node: a pool of 10 x 300 byte buffers and room
    ///  for 10 connections. Routes start empty.
    pub fn new(local_addr: NodeAddr, bind: SocketAddr) -> StackConfig {
        StackConfig {
            local_addr,
            buffer_count: 10,
            buffer_size: 300,
            max_connections: 10,
            iface: IfaceConfig {
                name: "udp0".to_string(),
                bind,
                promiscuous: true,
            },
            routes: Vec::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_addr.is_broadcast() {
            bail!("local address must not be the broadcast address");
        }
        if self.buffer_count == 0 {
            bail!("buffer pool must hold at least one buffer");
        }
        if self.buffer_size < 8 {
            bail!("buffer size of {} bytes is too small", self.buffer_size);
        }
        if self.max_connections == 0 {
            bail!("connection table must have room for at least one connection");
        }
        if self.iface.name.is_empty() {
            bail!("interface name must not be empty");
        }

        for (i, route) in self.routes.iter().enumerate() {
            if route.dest == self.local_addr {
                bail!("route to the local address {}", route.dest);
            }
            if self.routes[..i].iter().any(|r| r.dest == route.dest) {
                bail!("duplicate route for node {}", route.dest);
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct IfaceConfig {
    pub name: String,
    pub bind: SocketAddr,

    /// When set, frames addressed to other nodes are logged before being
    ///  discarded instead of being filtered silently.
    pub promiscuous: bool,
}

/// One static route entry. Parses from `<node>=<host:port>`, e.g.
///  `2=127.0.0.1:9602`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StaticRoute {
    pub dest: NodeAddr,
    pub endpoint: SocketAddr,
}

impl FromStr for StaticRoute {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<StaticRoute> {
        let (dest, endpoint) = s.split_once('=')
            .ok_or_else(|| anyhow!("expected <node>=<host:port>, got {:?}", s))?;

        Ok(StaticRoute {
            dest: dest.trim().parse()?,
            endpoint: endpoint.trim().parse()
                .map_err(|_| anyhow!("invalid route endpoint: {:?}", endpoint))?,
        })
    }
}

/// Settings of the server worker's accept/read loop.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The port application traffic is expected on. Everything else is handed
    ///  to the service responder.
    pub app_port: Port,

    /// Accepted-but-unprocessed connections the listener may hold.
    pub backlog: usize,

    /// How long one accept call waits before the loop polls again.
    pub accept_timeout: Duration,

    /// How long a read waits for the next packet; expiry ends the session.
    pub read_timeout: Duration,
}

impl ServerConfig {
    pub fn new(app_port: Port) -> ServerConfig {
        ServerConfig {
            app_port,
            backlog: 10,
            accept_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.app_port.is_service() {
            bail!("application port {} collides with the service port range", self.app_port);
        }
        if self.backlog == 0 {
            bail!("backlog must hold at least one connection");
        }
        if self.accept_timeout.is_zero() || self.read_timeout.is_zero() {
            bail!("accept and read timeouts must be non-zero");
        }
        Ok(())
    }
}

/// Settings of the client worker's periodic send loop.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server: NodeAddr,
    pub app_port: Port,

    /// Delay between iterations.
    pub period: Duration,

    pub connect_timeout: Duration,
    pub send_timeout: Duration,

    /// Size of the text buffer the outgoing message is formatted into, C-string
    ///  style: at most `message_capacity - 1` bytes of content.
    pub message_capacity: usize,

    /// Payload size requested from the buffer pool each iteration.
    pub buffer_request: usize,
}

impl ClientConfig {
    pub fn new(server: NodeAddr, app_port: Port) -> ClientConfig {
        ClientConfig {
            server,
            app_port,
            period: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(1),
            message_capacity: 50,
            buffer_request: 100,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.app_port.is_service() {
            bail!("application port {} collides with the service port range", self.app_port);
        }
        if self.period.is_zero() {
            bail!("period must be non-zero");
        }
        if self.connect_timeout.is_zero() || self.send_timeout.is_zero() {
            bail!("connect and send timeouts must be non-zero");
        }
        if self.message_capacity < 2 {
            bail!("message capacity of {} cannot hold any content", self.message_capacity);
        }
        if self.buffer_request < self.message_capacity {
            bail!("buffer request of {} bytes cannot fit a message of up to {} bytes",
                  self.buffer_request, self.message_capacity);
        }
        Ok(())
    }
}

/// Settings of the temperature probe subprocess.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// Command line, run through `sh -c`. The first line of stdout is the reading.
    pub command: String,

    /// Upper bound on the subprocess; expiry yields the fallback reading.
    pub timeout: Duration,

    /// Reading used when the command fails, produces nothing, or times out.
    pub fallback: String,
}

impl ProbeConfig {
    pub fn new() -> ProbeConfig {
        ProbeConfig {
            command: "vcgencmd measure_temp".to_string(),
            timeout: Duration::from_secs(1),
            fallback: "temp=n/a".to_string(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.command.trim().is_empty() {
            bail!("probe command must not be empty");
        }
        if self.timeout.is_zero() {
            bail!("probe timeout must be non-zero");
        }
        Ok(())
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::new()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn addr(raw: u8) -> NodeAddr {
        NodeAddr::new(raw).unwrap()
    }

    fn port(raw: u8) -> Port {
        Port::new(raw).unwrap()
    }

    fn bind() -> SocketAddr {
        "127.0.0.1:9602".parse().unwrap()
    }

    #[test]
    fn test_stack_config_defaults_are_valid() {
        let mut config = StackConfig::new(addr(2), bind());
        config.routes.push(StaticRoute { dest: addr(3), endpoint: "127.0.0.1:9603".parse().unwrap() });
        config.routes.push(StaticRoute { dest: NodeAddr::BROADCAST, endpoint: "127.0.0.1:9699".parse().unwrap() });

        config.validate().unwrap();
        assert_eq!(config.buffer_count, 10);
        assert_eq!(config.buffer_size, 300);
        assert_eq!(config.max_connections, 10);
    }

    #[rstest]
    #[case::broadcast_local(|c: &mut StackConfig| c.local_addr = NodeAddr::BROADCAST)]
    #[case::zero_buffers(|c: &mut StackConfig| c.buffer_count = 0)]
    #[case::tiny_buffers(|c: &mut StackConfig| c.buffer_size = 4)]
    #[case::zero_connections(|c: &mut StackConfig| c.max_connections = 0)]
    #[case::unnamed_iface(|c: &mut StackConfig| c.iface.name.clear())]
    #[case::route_to_self(|c: &mut StackConfig| c.routes.push(StaticRoute { dest: NodeAddr::new(2).unwrap(), endpoint: "127.0.0.1:9602".parse().unwrap() }))]
    fn test_stack_config_invalid(#[case] break_it: fn(&mut StackConfig)) {
        let mut config = StackConfig::new(addr(2), bind());
        break_it(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stack_config_duplicate_route() {
        let mut config = StackConfig::new(addr(2), bind());
        config.routes.push(StaticRoute { dest: addr(3), endpoint: "127.0.0.1:9603".parse().unwrap() });
        config.routes.push(StaticRoute { dest: addr(3), endpoint: "127.0.0.1:9700".parse().unwrap() });

        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("duplicate route"));
    }

    #[rstest]
    #[case::plain("3=127.0.0.1:9603", Some((3, "127.0.0.1:9603")))]
    #[case::spaces(" 31 = 127.0.0.1:9699 ", Some((31, "127.0.0.1:9699")))]
    #[case::no_separator("3/127.0.0.1:9603", None)]
    #[case::bad_node("99=127.0.0.1:9603", None)]
    #[case::bad_endpoint("3=localhost", None)]
    fn test_static_route_from_str(#[case] s: &str, #[case] expected: Option<(u8, &str)>) {
        match expected {
            Some((dest, endpoint)) => {
                let route: StaticRoute = s.parse().unwrap();
                assert_eq!(route.dest.value(), dest);
                assert_eq!(route.endpoint, endpoint.parse::<SocketAddr>().unwrap());
            }
            None => assert!(s.parse::<StaticRoute>().is_err()),
        }
    }

    #[test]
    fn test_server_config_defaults_are_valid() {
        let config = ServerConfig::new(port(10));
        config.validate().unwrap();
        assert_eq!(config.backlog, 10);
        assert_eq!(config.accept_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_millis(100));
    }

    #[rstest]
    #[case::service_port(|c: &mut ServerConfig| c.app_port = Port::new(1).unwrap())]
    #[case::zero_backlog(|c: &mut ServerConfig| c.backlog = 0)]
    #[case::zero_accept_timeout(|c: &mut ServerConfig| c.accept_timeout = Duration::ZERO)]
    #[case::zero_read_timeout(|c: &mut ServerConfig| c.read_timeout = Duration::ZERO)]
    fn test_server_config_invalid(#[case] break_it: fn(&mut ServerConfig)) {
        let mut config = ServerConfig::new(port(10));
        break_it(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_config_defaults_are_valid() {
        let config = ClientConfig::new(addr(2), port(10));
        config.validate().unwrap();
        assert_eq!(config.period, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.send_timeout, Duration::from_secs(1));
        assert_eq!(config.message_capacity, 50);
        assert_eq!(config.buffer_request, 100);
    }

    #[rstest]
    #[case::service_port(|c: &mut ClientConfig| c.app_port = Port::new(7).unwrap())]
    #[case::zero_period(|c: &mut ClientConfig| c.period = Duration::ZERO)]
    #[case::zero_connect_timeout(|c: &mut ClientConfig| c.connect_timeout = Duration::ZERO)]
    #[case::zero_send_timeout(|c: &mut ClientConfig| c.send_timeout = Duration::ZERO)]
    #[case::capacity_too_small(|c: &mut ClientConfig| c.message_capacity = 1)]
    #[case::buffer_below_message(|c: &mut ClientConfig| c.buffer_request = 49)]
    fn test_client_config_invalid(#[case] break_it: fn(&mut ClientConfig)) {
        let mut config = ClientConfig::new(addr(2), port(10));
        break_it(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_probe_config_defaults_are_valid() {
        let config = ProbeConfig::new();
        config.validate().unwrap();
        assert_eq!(config.command, "vcgencmd measure_temp");
        assert_eq!(config.fallback, "temp=n/a");
    }

    #[rstest]
    #[case::empty_command(|c: &mut ProbeConfig| c.command = "  ".to_string())]
    #[case::zero_timeout(|c: &mut ProbeConfig| c.timeout = Duration::ZERO)]
    fn test_probe_config_invalid(#[case] break_it: fn(&mut ProbeConfig)) {
        let mut config = ProbeConfig::new();
        break_it(&mut config);
        assert!(config.validate().is_err());
    }
}
