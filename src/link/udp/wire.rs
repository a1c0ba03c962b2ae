use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};

use crate::addr::{NodeAddr, Port};
use crate::link::{ConnectOptions, Priority};

/// Header of every link datagram on the UDP wire: a protocol version byte followed
///  by the packed 32-bit id word, big endian:
///
/// ```text
///  31 30 | 29 .. 25 | 24 .. 20 | 19 .. 14 | 13 .. 8 | 7 .. 4 | 3 .. 0
///   prio |   source |     dest |    dport |   sport |  rsvd  | option flags
/// ```
///
/// Reserved bits are ignored on receive. The payload follows immediately after.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DatagramHeader {
    pub priority: Priority,
    pub source: NodeAddr,
    pub dest: NodeAddr,
    pub dest_port: Port,
    pub source_port: Port,
    pub options: ConnectOptions,
}

impl DatagramHeader {
    pub const PROTOCOL_VERSION: u8 = 1;
    pub const SERIALIZED_LEN: usize = 1 + size_of::<u32>();

    pub fn ser(&self, buf: &mut BytesMut) {
        let id = ((u8::from(self.priority) as u32) << 30)
            | ((self.source.value() as u32) << 25)
            | ((self.dest.value() as u32) << 20)
            | ((self.dest_port.value() as u32) << 14)
            | ((self.source_port.value() as u32) << 8)
            | (self.options.bits() as u32);

        buf.put_u8(Self::PROTOCOL_VERSION);
        buf.put_u32(id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        let id = buf.try_get_u32()?;

        // the masked fields cannot exceed their types' ranges, so these cannot fail
        let priority = Priority::try_from(((id >> 30) & 0x3) as u8)?;
        let source = NodeAddr::new(((id >> 25) & 0x1f) as u8)?;
        let dest = NodeAddr::new(((id >> 20) & 0x1f) as u8)?;
        let dest_port = Port::new(((id >> 14) & 0x3f) as u8)?;
        let source_port = Port::new(((id >> 8) & 0x3f) as u8)?;
        let options = ConnectOptions::from_bits((id & 0xf) as u8)
            .ok_or_else(|| anyhow!("invalid option flags"))?;

        Ok(DatagramHeader {
            priority,
            source,
            dest,
            dest_port,
            source_port,
            options,
        })
    }
}

/// Assemble the wire form of one datagram: header followed by payload.
pub fn encode_datagram(header: &DatagramHeader, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(DatagramHeader::SERIALIZED_LEN + payload.len());
    header.ser(&mut buf);
    buf.put_slice(payload);
    buf
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn header(priority: Priority, source: u8, dest: u8, dest_port: u8, source_port: u8, options: ConnectOptions) -> DatagramHeader {
        DatagramHeader {
            priority,
            source: NodeAddr::new(source).unwrap(),
            dest: NodeAddr::new(dest).unwrap(),
            dest_port: Port::new(dest_port).unwrap(),
            source_port: Port::new(source_port).unwrap(),
            options,
        }
    }

    #[rstest]
    #[case::client_to_server(header(Priority::Norm, 3, 2, 10, 45, ConnectOptions::empty()))]
    #[case::all_zero(header(Priority::Critical, 0, 0, 0, 0, ConnectOptions::empty()))]
    #[case::all_max(header(Priority::Low, 31, 31, 63, 63, ConnectOptions::all()))]
    #[case::broadcast(header(Priority::High, 4, 31, 10, 32, ConnectOptions::empty()))]
    #[case::rdp_requested(header(Priority::Norm, 3, 2, 10, 33, ConnectOptions::RDP))]
    fn test_ser_deser(#[case] original: DatagramHeader) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), DatagramHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = DatagramHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_wire_layout() {
        let h = header(Priority::Norm, 3, 2, 10, 45, ConnectOptions::empty());

        let mut buf = BytesMut::new();
        h.ser(&mut buf);

        assert_eq!(buf[0], DatagramHeader::PROTOCOL_VERSION);
        let id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(id >> 30, 2, "priority");
        assert_eq!((id >> 25) & 0x1f, 3, "source");
        assert_eq!((id >> 20) & 0x1f, 2, "dest");
        assert_eq!((id >> 14) & 0x3f, 10, "dest port");
        assert_eq!((id >> 8) & 0x3f, 45, "source port");
        assert_eq!(id & 0xff, 0, "reserved and flags");
    }

    #[test]
    fn test_deser_payload_remainder() {
        let buf = encode_datagram(
            &header(Priority::Norm, 3, 2, 10, 45, ConnectOptions::empty()),
            b"FROM SATC CPU temp=42.8'C",
        );

        let mut b: &[u8] = &buf;
        DatagramHeader::deser(&mut b).unwrap();
        assert_eq!(b, b"FROM SATC CPU temp=42.8'C");
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::version_only(&[1u8])]
    #[case::truncated_id(&[1u8, 0x8c, 0x62])]
    fn test_deser_short_buffer(#[case] raw: &[u8]) {
        let mut b: &[u8] = raw;
        assert!(DatagramHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_foreign_version() {
        let mut buf = BytesMut::new();
        header(Priority::Norm, 3, 2, 10, 45, ConnectOptions::empty()).ser(&mut buf);
        buf[0] = 9;

        let mut b: &[u8] = &buf;
        let result = DatagramHeader::deser(&mut b);
        assert!(result.unwrap_err().to_string().contains("protocol version"));
    }

    #[test]
    fn test_reserved_bits_ignored() {
        let mut buf = BytesMut::new();
        let original = header(Priority::Norm, 3, 2, 10, 45, ConnectOptions::empty());
        original.ser(&mut buf);
        buf[4] |= 0xf0;

        let mut b: &[u8] = &buf;
        assert_eq!(DatagramHeader::deser(&mut b).unwrap(), original);
    }
}
