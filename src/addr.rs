use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;

/// A node address on the link: 5 bits, so `0..=31`. Address 31 is reserved as the
///  broadcast address. Each peer on the bus has a fixed, statically assigned address,
///  and routes map peer addresses to interface endpoints.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeAddr(u8);

impl NodeAddr {
    pub const MAX: u8 = 0x1f;
    pub const BROADCAST: NodeAddr = NodeAddr(0x1f);

    pub fn new(value: u8) -> anyhow::Result<NodeAddr> {
        if value > Self::MAX {
            return Err(anyhow!("node address {} is out of range (max {})", value, Self::MAX));
        }
        Ok(NodeAddr(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl TryFrom<u8> for NodeAddr {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> anyhow::Result<NodeAddr> {
        NodeAddr::new(value)
    }
}

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<NodeAddr> {
        let raw: u8 = s.parse()
            .map_err(|_| anyhow!("invalid node address: {:?}", s))?;
        NodeAddr::new(raw)
    }
}

/// A port within a node: 6 bits, so `0..=63`. Ports `0..=7` are service ports,
///  answered by the link's service responder rather than by application code.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Port(u8);

impl Port {
    pub const MAX: u8 = 0x3f;
    pub const MAX_SERVICE: u8 = 7;

    pub fn new(value: u8) -> anyhow::Result<Port> {
        if value > Self::MAX {
            return Err(anyhow!("port {} is out of range (max {})", value, Self::MAX));
        }
        Ok(Port(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_service(&self) -> bool {
        self.0 <= Self::MAX_SERVICE
    }
}

impl TryFrom<u8> for Port {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> anyhow::Result<Port> {
        Port::new(value)
    }
}

impl Debug for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Port {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Port> {
        let raw: u8 = s.parse()
            .map_err(|_| anyhow!("invalid port: {:?}", s))?;
        Port::new(raw)
    }
}
