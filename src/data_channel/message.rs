//! DCEP (Data Channel Establishment Protocol, RFC 8832) control message codec.
//!
//! Both directions use network byte order throughout; there is no host-order
//! shortcut anywhere in this codec (RFC 8832 mandates big-endian on the wire).

use crate::constants::{DCEP_MSG_ACK, DCEP_MSG_CLOSE, DCEP_MSG_OPEN};
use crate::data_channel::ChannelKind;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A parsed DCEP control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcepMessage {
    Open(DcepOpen),
    Ack,
    Close,
}

/// ```text
/// offset  size  field
/// 0       1     msg_type = 0x03
/// 1       1     chan_type
/// 2       2     priority
/// 4       4     reliability_param
/// 8       2     label_len
/// 10      2     protocol_len
/// 12      L     label bytes (UTF-8, L = label_len)
/// 12+L    P     protocol bytes (UTF-8, P = protocol_len)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcepOpen {
    pub channel_kind: ChannelKind,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: String,
    pub protocol: String,
}

impl DcepMessage {
    pub fn marshal(&self) -> Bytes {
        match self {
            DcepMessage::Ack => Bytes::from_static(&[DCEP_MSG_ACK]),
            DcepMessage::Close => Bytes::from_static(&[DCEP_MSG_CLOSE]),
            DcepMessage::Open(open) => {
                let label = open.label.as_bytes();
                let protocol = open.protocol.as_bytes();
                let mut buf = BytesMut::with_capacity(12 + label.len() + protocol.len());
                buf.put_u8(DCEP_MSG_OPEN);
                buf.put_u8(open.channel_kind.wire_byte());
                buf.put_u16(open.priority);
                buf.put_u32(open.reliability_parameter);
                buf.put_u16(label.len() as u16);
                buf.put_u16(protocol.len() as u16);
                buf.put_slice(label);
                buf.put_slice(protocol);
                buf.freeze()
            }
        }
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(Error::BufferTooShort);
        }
        match buf.get_u8() {
            DCEP_MSG_ACK => Ok(DcepMessage::Ack),
            DCEP_MSG_CLOSE => Ok(DcepMessage::Close),
            DCEP_MSG_OPEN => {
                if buf.remaining() < 11 {
                    return Err(Error::BufferTooShort);
                }
                let channel_kind = ChannelKind::from_wire_byte(buf.get_u8())?;
                let priority = buf.get_u16();
                let reliability_parameter = buf.get_u32();
                let label_len = buf.get_u16() as usize;
                let protocol_len = buf.get_u16() as usize;
                if buf.remaining() < label_len + protocol_len {
                    return Err(Error::BufferTooShort);
                }
                let label = String::from_utf8(buf[..label_len].to_vec())?;
                buf.advance(label_len);
                let protocol = String::from_utf8(buf[..protocol_len].to_vec())?;
                buf.advance(protocol_len);
                Ok(DcepMessage::Open(DcepOpen {
                    channel_kind,
                    priority,
                    reliability_parameter,
                    label,
                    protocol,
                }))
            }
            other => Err(Error::InvalidMessageType(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ack_roundtrip() {
        let msg = DcepMessage::Ack;
        let wire = msg.marshal();
        assert_eq!(&wire[..], &[0x02]);
        assert_eq!(DcepMessage::unmarshal(&wire).unwrap(), msg);
    }

    #[test]
    fn test_close_roundtrip() {
        let msg = DcepMessage::Close;
        let wire = msg.marshal();
        assert_eq!(&wire[..], &[0x04]);
        assert_eq!(DcepMessage::unmarshal(&wire).unwrap(), msg);
    }

    #[test]
    fn test_open_roundtrip() {
        let msg = DcepMessage::Open(DcepOpen {
            channel_kind: ChannelKind::ReliableUnordered,
            priority: 256,
            reliability_parameter: 0,
            label: "data".to_string(),
            protocol: String::new(),
        });
        let wire = msg.marshal();
        assert_eq!(wire[0], 0x03);
        assert_eq!(wire[1], 0x80);
        let parsed = DcepMessage::unmarshal(&wire).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_open_big_endian_fields() {
        let msg = DcepMessage::Open(DcepOpen {
            channel_kind: ChannelKind::ReliableOrdered,
            priority: 0x0102,
            reliability_parameter: 0x01020304,
            label: "ab".to_string(),
            protocol: "c".to_string(),
        });
        let wire = msg.marshal();
        assert_eq!(&wire[2..4], &[0x01, 0x02]);
        assert_eq!(&wire[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&wire[8..10], &[0x00, 0x02]); // label_len
        assert_eq!(&wire[10..12], &[0x00, 0x01]); // protocol_len
        assert_eq!(&wire[12..14], b"ab");
        assert_eq!(&wire[14..15], b"c");
    }

    #[test]
    fn test_unmarshal_unknown_type() {
        let err = DcepMessage::unmarshal(&[0x7f]).unwrap_err();
        assert!(matches!(err, Error::InvalidMessageType(0x7f)));
    }

    #[test]
    fn test_unmarshal_truncated_open() {
        let err = DcepMessage::unmarshal(&[0x03, 0x00]).unwrap_err();
        assert!(matches!(err, Error::BufferTooShort));
    }
}
