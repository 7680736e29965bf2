use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::frame::MessageHeader;
use crate::safe_converter::PrecheckedCast;
use crate::throttle::ThrottleToken;

/// Well-known message priorities. Any `i16` is a valid priority; higher drains first.
pub mod prio {
    pub const LOW: i16 = 64;
    pub const DEFAULT: i16 = 127;
    pub const HIGH: i16 = 196;
    /// Reserved for the transport itself: requeued messages go to the head of this bucket so
    ///  they precede everything submitted later.
    pub const HIGHEST: i16 = 255;
}

/// A typed message with up to three opaque payload regions.
///
/// `front` and `middle` are for the caller's structured data, `data` for bulk payload (its
///  alignment on the receiving side is steered by `data_off`). Payloads are refcounted, so
///  clones share them - the transport keeps a second reference in its resend queue instead of
///  copying.
#[derive(Clone)]
pub struct Message {
    pub msg_type: u16,
    pub priority: i16,
    pub tid: u64,
    pub data_off: u16,

    /// Assigned by the writer just before a message first goes on the wire; zero until then.
    pub(crate) seq: u64,
    /// Sender's node id; filled in by the messenger on submit.
    pub(crate) src: u64,

    pub front: Bytes,
    pub middle: Bytes,
    pub data: Bytes,

    pub(crate) recv_stamp: Option<Instant>,
    pub(crate) throttle_stamp: Option<Instant>,
    pub(crate) recv_complete_stamp: Option<Instant>,

    /// Throttle units held for this (inbound) message's lifetime; shared across clones.
    pub(crate) throttle_tokens: Vec<Arc<ThrottleToken>>,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message(type={} seq={} tid={} prio={} {}+{}+{})",
            self.msg_type,
            self.seq,
            self.tid,
            self.priority,
            self.front.len(),
            self.middle.len(),
            self.data.len(),
        )
    }
}

impl Message {
    pub fn new(msg_type: u16, front: impl Into<Bytes>) -> Message {
        Message {
            msg_type,
            priority: prio::DEFAULT,
            tid: 0,
            data_off: 0,
            seq: 0,
            src: 0,
            front: front.into(),
            middle: Bytes::new(),
            data: Bytes::new(),
            recv_stamp: None,
            throttle_stamp: None,
            recv_complete_stamp: None,
            throttle_tokens: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i16) -> Message {
        self.priority = priority;
        self
    }

    pub fn with_tid(mut self, tid: u64) -> Message {
        self.tid = tid;
        self
    }

    pub fn with_middle(mut self, middle: impl Into<Bytes>) -> Message {
        self.middle = middle.into();
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>, data_off: u16) -> Message {
        self.data = data.into();
        self.data_off = data_off;
        self
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn src(&self) -> u64 {
        self.src
    }

    /// When this message was read off the wire (inbound only).
    pub fn recv_stamp(&self) -> Option<Instant> {
        self.recv_stamp
    }

    /// When this message cleared the throttles (inbound only).
    pub fn throttle_stamp(&self) -> Option<Instant> {
        self.throttle_stamp
    }

    /// When this message was fully decoded (inbound only).
    pub fn recv_complete_stamp(&self) -> Option<Instant> {
        self.recv_complete_stamp
    }

    pub fn payload_len(&self) -> usize {
        self.front.len() + self.middle.len() + self.data.len()
    }

    pub(crate) fn header(&self) -> MessageHeader {
        MessageHeader {
            seq: self.seq,
            tid: self.tid,
            msg_type: self.msg_type,
            priority: self.priority,
            front_len: self.front.len().prechecked_cast(),
            middle_len: self.middle.len().prechecked_cast(),
            data_len: self.data.len().prechecked_cast(),
            data_off: self.data_off,
            src: self.src,
        }
    }

    /// Reconstruct a message from a decoded envelope and its payload regions.
    pub(crate) fn from_wire(header: &MessageHeader, front: Bytes, middle: Bytes, data: Bytes) -> Message {
        Message {
            msg_type: header.msg_type,
            priority: header.priority,
            tid: header.tid,
            data_off: header.data_off,
            seq: header.seq,
            src: header.src,
            front,
            middle,
            data,
            recv_stamp: None,
            throttle_stamp: None,
            recv_complete_stamp: None,
            throttle_tokens: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_header() {
        let m = Message::new(7, Bytes::from_static(b"front"))
            .with_priority(prio::HIGH)
            .with_tid(13)
            .with_middle(Bytes::from_static(b"mid"))
            .with_data(Bytes::from_static(b"payload"), 512);

        let header = m.header();
        assert_eq!(header.msg_type, 7);
        assert_eq!(header.priority, prio::HIGH);
        assert_eq!(header.tid, 13);
        assert_eq!(header.front_len, 5);
        assert_eq!(header.middle_len, 3);
        assert_eq!(header.data_len, 7);
        assert_eq!(header.data_off, 512);
        assert_eq!(header.seq, 0);
        assert_eq!(m.payload_len(), 15);
    }

    #[test]
    fn test_clone_shares_payload() {
        let m = Message::new(1, Bytes::from(vec![0u8; 1024]));
        let clone = m.clone();

        // Bytes clones are views on the same allocation
        assert_eq!(m.front.as_ptr(), clone.front.as_ptr());
    }

    #[test]
    fn test_from_wire_roundtrip() {
        let mut m = Message::new(3, Bytes::from_static(b"abc")).with_tid(5);
        m.seq = 42;
        m.src = 9;

        let rebuilt = Message::from_wire(
            &m.header(),
            m.front.clone(),
            m.middle.clone(),
            m.data.clone(),
        );
        assert_eq!(rebuilt.seq, 42);
        assert_eq!(rebuilt.src, 9);
        assert_eq!(rebuilt.msg_type, 3);
        assert_eq!(rebuilt.front.as_ref(), b"abc");
    }
}
