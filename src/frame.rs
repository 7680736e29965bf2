use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::node_addr::NodeAddr;

/// Fixed ASCII prologue exchanged as the very first bytes in both directions. A peer that
///  sends anything else does not speak this protocol, and the pipe faults immediately.
pub const BANNER: &[u8; 13] = b"clustermsg v1";

pub const PROTOCOL_VERSION: u32 = 1;

/// Feature bits advertised in the connect record and negotiated as the intersection of both
///  sides' supported sets.
pub mod features {
    /// Message headers omit the full source address record.
    pub const NOSRCADDR: u64 = 1 << 0;
    /// Message footers carry a signature; outgoing sequence numbers are randomized.
    pub const MSG_AUTH: u64 = 1 << 1;
    /// Reconnects resume at the peer's acknowledged sequence number (`SEQ` handshake reply).
    pub const RECONNECT_SEQ: u64 = 1 << 2;

    pub const ALL: u64 = NOSRCADDR | MSG_AUTH | RECONNECT_SEQ;
}

/// Single-byte frame tags. `Ready` through `Seq` appear in handshake replies; `Close`, `Msg`,
///  `Ack` and `Keepalive` flow in the OPEN state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Tag {
    Ready = 1,
    ResetSession = 2,
    Wait = 3,
    RetrySession = 4,
    RetryGlobal = 5,
    Close = 6,
    Msg = 7,
    Ack = 8,
    Keepalive = 9,
    BadProtoVer = 10,
    BadAuthorizer = 11,
    Features = 12,
    Seq = 13,
}

/// Flag in connect / connect_reply records: the session is lossy (the server decides).
pub const CONNECT_FLAG_LOSSY: u8 = 1;

/// Footer flag: the message was fully written. A footer without it marks an aborted message.
pub const FOOTER_FLAG_COMPLETE: u8 = 1;
/// Footer flag: payload checksums were not computed by the sender.
pub const FOOTER_FLAG_NOCRC: u8 = 2;

const CRC32C: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// The record a connecting client sends for each handshake attempt, optionally followed by
///  `authorizer_len` bytes of authorizer payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRecord {
    pub features: u64,
    pub host_type: u32,
    pub global_seq: u32,
    pub connect_seq: u32,
    pub protocol_version: u32,
    pub authorizer_protocol: u32,
    pub authorizer_len: u32,
    pub flags: u8,
}

impl ConnectRecord {
    pub const SERIALIZED_LEN: usize = 8 + 6 * 4 + 1;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.features);
        buf.put_u32_le(self.host_type);
        buf.put_u32_le(self.global_seq);
        buf.put_u32_le(self.connect_seq);
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.authorizer_protocol);
        buf.put_u32_le(self.authorizer_len);
        buf.put_u8(self.flags);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectRecord> {
        Ok(ConnectRecord {
            features: buf.try_get_u64_le()?,
            host_type: buf.try_get_u32_le()?,
            global_seq: buf.try_get_u32_le()?,
            connect_seq: buf.try_get_u32_le()?,
            protocol_version: buf.try_get_u32_le()?,
            authorizer_protocol: buf.try_get_u32_le()?,
            authorizer_len: buf.try_get_u32_le()?,
            flags: buf.try_get_u8()?,
        })
    }
}

/// The server's reply to a connect record, optionally followed by `authorizer_len` bytes of
///  authorizer reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReply {
    pub tag: u8,
    pub features: u64,
    pub global_seq: u32,
    pub connect_seq: u32,
    pub protocol_version: u32,
    pub authorizer_len: u32,
    pub flags: u8,
}

impl ConnectReply {
    pub const SERIALIZED_LEN: usize = 1 + 8 + 4 * 4 + 1;

    pub fn for_protocol_version(protocol_version: u32) -> ConnectReply {
        ConnectReply {
            tag: 0,
            features: 0,
            global_seq: 0,
            connect_seq: 0,
            protocol_version,
            authorizer_len: 0,
            flags: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag);
        buf.put_u64_le(self.features);
        buf.put_u32_le(self.global_seq);
        buf.put_u32_le(self.connect_seq);
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.authorizer_len);
        buf.put_u8(self.flags);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectReply> {
        Ok(ConnectReply {
            tag: buf.try_get_u8()?,
            features: buf.try_get_u64_le()?,
            global_seq: buf.try_get_u32_le()?,
            connect_seq: buf.try_get_u32_le()?,
            protocol_version: buf.try_get_u32_le()?,
            authorizer_len: buf.try_get_u32_le()?,
            flags: buf.try_get_u8()?,
        })
    }
}

/// The canonical message envelope. On the wire there are two layouts: with `NOSRCADDR`
///  negotiated the source is the sender's 64-bit id alone; without it the header additionally
///  carries the sender's full address record. Both layouts end in a CRC-32C over everything
///  before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub seq: u64,
    pub tid: u64,
    pub msg_type: u16,
    pub priority: i16,
    pub front_len: u32,
    pub middle_len: u32,
    pub data_len: u32,
    pub data_off: u16,
    pub src: u64,
}

impl MessageHeader {
    const FIELDS_LEN: usize = 8 + 8 + 2 + 2 + 4 + 4 + 4 + 2 + 8;

    pub const SERIALIZED_LEN: usize = Self::FIELDS_LEN + 4;
    pub const SERIALIZED_LEN_LEGACY: usize = Self::FIELDS_LEN + NodeAddr::SERIALIZED_LEN + 4;

    pub fn message_size(&self) -> u64 {
        self.front_len as u64 + self.middle_len as u64 + self.data_len as u64
    }

    fn ser_fields(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.seq);
        buf.put_u64_le(self.tid);
        buf.put_u16_le(self.msg_type);
        buf.put_i16_le(self.priority);
        buf.put_u32_le(self.front_len);
        buf.put_u32_le(self.middle_len);
        buf.put_u32_le(self.data_len);
        buf.put_u16_le(self.data_off);
        buf.put_u64_le(self.src);
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        self.ser_fields(buf);
        let crc = crc32c(&buf[start..]);
        buf.put_u32_le(crc);
    }

    /// Legacy layout: the fields are followed by the sender's full address record, then the CRC.
    pub fn ser_legacy(&self, src_addr: &NodeAddr, buf: &mut BytesMut) {
        let start = buf.len();
        self.ser_fields(buf);
        src_addr.ser(buf);
        let crc = crc32c(&buf[start..]);
        buf.put_u32_le(crc);
    }

    fn deser_fields(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        Ok(MessageHeader {
            seq: buf.try_get_u64_le()?,
            tid: buf.try_get_u64_le()?,
            msg_type: buf.try_get_u16_le()?,
            priority: buf.try_get_i16_le()?,
            front_len: buf.try_get_u32_le()?,
            middle_len: buf.try_get_u32_le()?,
            data_len: buf.try_get_u32_le()?,
            data_off: buf.try_get_u16_le()?,
            src: buf.try_get_u64_le()?,
        })
    }

    fn checked_deser(
        buf: &mut impl Buf,
        covered_len: usize,
        parse: impl FnOnce(&mut &[u8]) -> anyhow::Result<MessageHeader>,
    ) -> anyhow::Result<MessageHeader> {
        if buf.remaining() < covered_len + 4 {
            bail!("message header truncated");
        }
        let mut covered = vec![0u8; covered_len];
        buf.copy_to_slice(&mut covered);

        let actual_crc = buf.try_get_u32_le()?;
        if crc32c(&covered) != actual_crc {
            bail!("message header checksum mismatch");
        }

        let mut fields: &[u8] = &covered;
        let header = parse(&mut fields)?;
        Ok(header)
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        Self::checked_deser(buf, Self::FIELDS_LEN, |fields| Self::deser_fields(fields))
    }

    /// Legacy layout; the embedded source address is validated and dropped in favor of the
    ///  canonical record.
    pub fn try_deser_legacy(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        Self::checked_deser(buf, Self::FIELDS_LEN + NodeAddr::SERIALIZED_LEN, |fields| {
            let header = Self::deser_fields(fields)?;
            let _src_addr = NodeAddr::try_deser(fields)?;
            Ok(header)
        })
    }
}

/// The message trailer. With `MSG_AUTH` negotiated it carries a 64-bit signature; the legacy
///  layout omits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFooter {
    pub front_crc: u32,
    pub middle_crc: u32,
    pub data_crc: u32,
    pub sig: u64,
    pub flags: u8,
}

impl MessageFooter {
    pub const SERIALIZED_LEN: usize = 3 * 4 + 8 + 1;
    pub const SERIALIZED_LEN_LEGACY: usize = 3 * 4 + 1;

    pub fn is_complete(&self) -> bool {
        self.flags & FOOTER_FLAG_COMPLETE != 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.front_crc);
        buf.put_u32_le(self.middle_crc);
        buf.put_u32_le(self.data_crc);
        buf.put_u64_le(self.sig);
        buf.put_u8(self.flags);
    }

    pub fn ser_legacy(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.front_crc);
        buf.put_u32_le(self.middle_crc);
        buf.put_u32_le(self.data_crc);
        buf.put_u8(self.flags);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageFooter> {
        Ok(MessageFooter {
            front_crc: buf.try_get_u32_le()?,
            middle_crc: buf.try_get_u32_le()?,
            data_crc: buf.try_get_u32_le()?,
            sig: buf.try_get_u64_le()?,
            flags: buf.try_get_u8()?,
        })
    }

    pub fn try_deser_legacy(buf: &mut impl Buf) -> anyhow::Result<MessageFooter> {
        Ok(MessageFooter {
            front_crc: buf.try_get_u32_le()?,
            middle_crc: buf.try_get_u32_le()?,
            data_crc: buf.try_get_u32_le()?,
            sig: 0,
            flags: buf.try_get_u8()?,
        })
    }
}

pub fn tag_from_byte(raw: u8) -> anyhow::Result<Tag> {
    Tag::try_from(raw).map_err(|_| anyhow!("unknown frame tag: {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_banner_len() {
        assert_eq!(BANNER.len(), 13);
    }

    #[rstest]
    #[case::ready(1, Some(Tag::Ready))]
    #[case::seq(13, Some(Tag::Seq))]
    #[case::keepalive(9, Some(Tag::Keepalive))]
    #[case::zero(0, None)]
    #[case::unknown(14, None)]
    #[case::garbage(255, None)]
    fn test_tag_from_byte(#[case] raw: u8, #[case] expected: Option<Tag>) {
        match tag_from_byte(raw) {
            Ok(tag) => assert_eq!(Some(tag), expected),
            Err(_) => assert!(expected.is_none()),
        }
    }

    #[test]
    fn test_connect_record_exact_bytes() {
        let record = ConnectRecord {
            features: 0x0102030405060708,
            host_type: 2,
            global_seq: 3,
            connect_seq: 4,
            protocol_version: 1,
            authorizer_protocol: 0,
            authorizer_len: 5,
            flags: CONNECT_FLAG_LOSSY,
        };

        let mut buf = BytesMut::new();
        record.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[
                8, 7, 6, 5, 4, 3, 2, 1, // features
                2, 0, 0, 0, // host_type
                3, 0, 0, 0, // global_seq
                4, 0, 0, 0, // connect_seq
                1, 0, 0, 0, // protocol_version
                0, 0, 0, 0, // authorizer_protocol
                5, 0, 0, 0, // authorizer_len
                1, // flags
            ]
        );
        assert_eq!(buf.len(), ConnectRecord::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(ConnectRecord::try_deser(&mut b).unwrap(), record);
        assert!(b.is_empty());
    }

    #[test]
    fn test_connect_reply_roundtrip() {
        let reply = ConnectReply {
            tag: Tag::RetrySession.into(),
            features: features::ALL,
            global_seq: 77,
            connect_seq: 6,
            protocol_version: 1,
            authorizer_len: 0,
            flags: 0,
        };

        let mut buf = BytesMut::new();
        reply.ser(&mut buf);
        assert_eq!(buf.len(), ConnectReply::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(ConnectReply::try_deser(&mut b).unwrap(), reply);
        assert!(b.is_empty());
    }

    fn test_header() -> MessageHeader {
        MessageHeader {
            seq: 42,
            tid: 7,
            msg_type: 3,
            priority: 127,
            front_len: 10,
            middle_len: 0,
            data_len: 4096,
            data_off: 512,
            src: 0xdead,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = test_header();

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(MessageHeader::try_deser(&mut b).unwrap(), header);
        assert!(b.is_empty());
    }

    #[test]
    fn test_header_legacy_roundtrip() {
        let header = test_header();
        let src_addr = NodeAddr::localhost(6800, 99);

        let mut buf = BytesMut::new();
        header.ser_legacy(&src_addr, &mut buf);
        assert_eq!(buf.len(), MessageHeader::SERIALIZED_LEN_LEGACY);

        let mut b: &[u8] = &buf;
        assert_eq!(MessageHeader::try_deser_legacy(&mut b).unwrap(), header);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::first_byte(0)]
    #[case::middle(20)]
    #[case::last_field_byte(41)]
    #[case::crc_byte(43)]
    fn test_header_crc_detects_corruption(#[case] flip: usize) {
        let mut buf = BytesMut::new();
        test_header().ser(&mut buf);
        buf[flip] ^= 0x40;

        let mut b: &[u8] = &buf;
        assert!(MessageHeader::try_deser(&mut b).is_err());
    }

    #[test]
    fn test_header_truncated() {
        let mut buf = BytesMut::new();
        test_header().ser(&mut buf);

        let mut b: &[u8] = &buf[..MessageHeader::SERIALIZED_LEN - 1];
        assert!(MessageHeader::try_deser(&mut b).is_err());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = MessageFooter {
            front_crc: 1,
            middle_crc: 2,
            data_crc: 3,
            sig: 0x1122334455667788,
            flags: FOOTER_FLAG_COMPLETE,
        };

        let mut buf = BytesMut::new();
        footer.ser(&mut buf);
        assert_eq!(buf.len(), MessageFooter::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(MessageFooter::try_deser(&mut b).unwrap(), footer);
        assert!(b.is_empty());
    }

    #[test]
    fn test_footer_legacy_drops_signature() {
        let footer = MessageFooter {
            front_crc: 1,
            middle_crc: 2,
            data_crc: 3,
            sig: 0x1122334455667788,
            flags: FOOTER_FLAG_COMPLETE,
        };

        let mut buf = BytesMut::new();
        footer.ser_legacy(&mut buf);
        assert_eq!(buf.len(), MessageFooter::SERIALIZED_LEN_LEGACY);

        let mut b: &[u8] = &buf;
        let deser = MessageFooter::try_deser_legacy(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser.sig, 0);
        assert!(deser.is_complete());
    }

    #[rstest]
    #[case::complete(FOOTER_FLAG_COMPLETE, true)]
    #[case::aborted(0, false)]
    #[case::complete_nocrc(FOOTER_FLAG_COMPLETE | FOOTER_FLAG_NOCRC, true)]
    fn test_footer_complete_flag(#[case] flags: u8, #[case] expected: bool) {
        let footer = MessageFooter { flags, ..Default::default() };
        assert_eq!(footer.is_complete(), expected);
    }

    #[test]
    fn test_crc32c_known_value() {
        // CRC-32C ("123456789") is the Castagnoli check value
        assert_eq!(crc32c(b"123456789"), 0xe3069283);
    }
}
