//! Binary envelope exchanged between peers
//!
//! ```text
//! +--------+----------------+-----------------------+--------+------+--------------+
//! | hlen:1 | header:hlen    | owner:1 | id:31 (BE)  | opcode | tag:1| payload ...  |
//! +--------+----------------+-----------------------+--------+------+--------------+
//! ```
//!
//! The payload tag and payload bytes are omitted when a message carries no payload.
use bytes::{Buf as _, BufMut as _};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::payload::{Payload, PayloadType};
use crate::Error;

#[cfg(test)]
use proptest::strategy::Strategy as _;

pub const MAX_HEADER_LEN: usize = u8::MAX as usize;

/// Mask of the 31 bits that carry the correlation id.
pub const ID_MASK: u32 = !(1 << 31);

const OWNER_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub enum Opcode {
    SessionPing,
    SessionPong,
    RpcRequest,
    RpcResponse,
    RpcFailure,
    StreamOpenDuplex,
    StreamClose,
    StreamSendFromInitiator,
    StreamSendFromResponder,
    StreamFailure,
    StreamPing,
    StreamOpenResponderWrites,
    StreamOpenInitiatorWrites,
    StreamOpenReverseRpc,
    Unknown(#[cfg_attr(test, strategy(30u8..))] u8),
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::SessionPing,
            2 => Self::SessionPong,
            11 => Self::RpcRequest,
            12 => Self::RpcResponse,
            13 => Self::RpcFailure,
            21 => Self::StreamOpenDuplex,
            22 => Self::StreamClose,
            23 => Self::StreamSendFromInitiator,
            24 => Self::StreamSendFromResponder,
            25 => Self::StreamFailure,
            26 => Self::StreamPing,
            27 => Self::StreamOpenResponderWrites,
            28 => Self::StreamOpenInitiatorWrites,
            29 => Self::StreamOpenReverseRpc,
            value => Self::Unknown(value),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::SessionPing => 1,
            Opcode::SessionPong => 2,
            Opcode::RpcRequest => 11,
            Opcode::RpcResponse => 12,
            Opcode::RpcFailure => 13,
            Opcode::StreamOpenDuplex => 21,
            Opcode::StreamClose => 22,
            Opcode::StreamSendFromInitiator => 23,
            Opcode::StreamSendFromResponder => 24,
            Opcode::StreamFailure => 25,
            Opcode::StreamPing => 26,
            Opcode::StreamOpenResponderWrites => 27,
            Opcode::StreamOpenInitiatorWrites => 28,
            Opcode::StreamOpenReverseRpc => 29,
            Opcode::Unknown(value) => value,
        }
    }
}

/// Which peer allocated the id of a message.
///
/// Both peers allocate ids independently. The owner bit keeps a locally allocated id apart from
/// the same number allocated by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub enum Owner {
    /// The sender of the message allocated the id. Set on requests and stream messages sent by
    /// the opener.
    Sender,
    /// The receiver of the message allocated the id. Set on replies.
    Receiver,
}

impl Owner {
    fn from_bit(bit: bool) -> Self {
        if bit {
            Self::Sender
        } else {
            Self::Receiver
        }
    }

    fn bit(self) -> u32 {
        match self {
            Self::Sender => OWNER_BIT,
            Self::Receiver => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(test, derive(test_strategy::Arbitrary))]
pub struct WireMessage {
    #[cfg_attr(test, strategy("[a-zA-Z0-9._/-]{0,255}"))]
    pub header: String,
    #[cfg_attr(test, strategy(0..=ID_MASK))]
    pub id: u32,
    pub owner: Owner,
    pub opcode: Opcode,
    pub payload: Option<Payload>,
}

/// Error returned from [WireMessage::decode].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message is truncated")]
    Truncated,
    #[error("invalid payload type {0}")]
    InvalidPayloadType(u8),
    #[error("header or text payload is not valid UTF-8")]
    InvalidUtf8,
}

impl WireMessage {
    pub fn new(header: impl Into<String>, id: u32, owner: Owner, opcode: Opcode) -> Self {
        Self {
            header: header.into(),
            id,
            owner,
            opcode,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Option<Payload>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let header_len = self.header.len();
        if header_len > MAX_HEADER_LEN {
            return Err(Error::HeaderTooLong(header_len));
        }
        let payload = self.payload.clone().map(Payload::build);
        let payload_len = payload.as_ref().map_or(0, |(_, data)| 1 + data.len());
        let mut buf = Vec::with_capacity(1 + header_len + 4 + 1 + payload_len);
        buf.put_u8(header_len as u8);
        buf.put_slice(self.header.as_bytes());
        buf.put_u32((self.id & ID_MASK) | self.owner.bit());
        buf.put_u8(self.opcode.into());
        if let Some((payload_type, data)) = payload {
            buf.put_u8(payload_type as u8);
            buf.put_slice(&data);
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut data = data;
        if !data.has_remaining() {
            return Err(DecodeError::Truncated);
        }
        let header_len = data.get_u8() as usize;
        if data.remaining() < header_len + 5 {
            return Err(DecodeError::Truncated);
        }
        let header = std::str::from_utf8(&data[..header_len])
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_string();
        data.advance(header_len);
        let id_and_owner = data.get_u32();
        let opcode = Opcode::from(data.get_u8());
        let payload = if data.has_remaining() {
            let tag = data.get_u8();
            let payload_type =
                PayloadType::from_tag(tag).ok_or(DecodeError::InvalidPayloadType(tag))?;
            Some(Payload::parse(payload_type, data.to_vec())?)
        } else {
            None
        };
        Ok(Self {
            header,
            id: id_and_owner & ID_MASK,
            owner: Owner::from_bit(id_and_owner & OWNER_BIT != 0),
            opcode,
            payload,
        })
    }
}

/// Allocates correlation ids for one peer of a session.
///
/// Ids are 31 bits wide and `0` is never handed out.
#[derive(Debug)]
pub struct IdAllocator {
    last: AtomicU32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_after(0)
    }
}

impl IdAllocator {
    pub fn starting_after(last: u32) -> Self {
        Self {
            last: AtomicU32::new(last & ID_MASK),
        }
    }

    pub fn next(&self) -> u32 {
        let mut next = 0;
        // The closure always returns `Some` so the update cannot fail.
        let _ = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                next = last.wrapping_add(1) & ID_MASK;
                if next == 0 {
                    next = 1;
                }
                Some(next)
            });
        next
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test_strategy::proptest]
    fn encode_decode(message: WireMessage) {
        let data = message.encode().unwrap();
        prop_assert_eq!(WireMessage::decode(&data).unwrap(), message);
    }

    #[test_strategy::proptest]
    fn encode_decode_unicode_header(
        #[strategy("\\PC{0,60}".prop_filter("fits", |h: &String| h.len() <= MAX_HEADER_LEN))]
        header: String,
        payload: Option<Payload>,
    ) {
        let message =
            WireMessage::new(header, 7, Owner::Sender, Opcode::RpcRequest).with_payload(payload);
        let data = message.encode().unwrap();
        prop_assert_eq!(WireMessage::decode(&data).unwrap(), message);
    }

    #[test]
    fn header_too_long() {
        let message = WireMessage::new("x".repeat(256), 1, Owner::Sender, Opcode::RpcRequest);
        match message.encode() {
            Err(Error::HeaderTooLong(256)) => {}
            result => panic!("unexpected result {:?}", result),
        }
    }

    #[test_strategy::proptest]
    fn decode_truncated(message: WireMessage, cutoff: proptest::sample::Index) {
        let data = message.encode().unwrap();
        let header_end = 1 + message.header.len() + 5;
        let cutoff = cutoff.index(header_end);
        prop_assert_eq!(
            WireMessage::decode(&data[..cutoff]),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn decode_invalid_payload_type() {
        let message = WireMessage::new("h", 1, Owner::Receiver, Opcode::RpcResponse);
        let mut data = message.encode().unwrap();
        data.push(9);
        assert_eq!(
            WireMessage::decode(&data),
            Err(DecodeError::InvalidPayloadType(9))
        );
    }

    #[test]
    fn empty_payload_is_absent() {
        let message = WireMessage::new("open", 0, Owner::Sender, Opcode::StreamOpenDuplex);
        let data = message.encode().unwrap();
        assert_eq!(data.len(), 1 + 4 + 4 + 1);
        assert_eq!(WireMessage::decode(&data).unwrap().payload, None);
    }

    #[test]
    fn owner_bit_is_most_significant() {
        let message = WireMessage::new("", ID_MASK, Owner::Sender, Opcode::StreamPing);
        let data = message.encode().unwrap();
        assert_eq!(&data[1..5], &[0xff, 0xff, 0xff, 0xff]);

        let message = WireMessage::new("", ID_MASK, Owner::Receiver, Opcode::StreamPing);
        let data = message.encode().unwrap();
        assert_eq!(&data[1..5], &[0x7f, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn id_allocator_skips_zero_on_wrap() {
        let ids = IdAllocator::starting_after(ID_MASK - 1);
        assert_eq!(ids.next(), ID_MASK);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test_strategy::proptest]
    fn id_allocator_never_zero(start: u32, #[strategy(1usize..64)] count: usize) {
        let ids = IdAllocator::starting_after(start);
        for _ in 0..count {
            let id = ids.next();
            prop_assert_ne!(id, 0);
            prop_assert_eq!(id & !ID_MASK, 0);
        }
    }

    #[test]
    fn id_allocator_concurrent_unique() {
        let ids = std::sync::Arc::new(IdAllocator::default());
        let handles = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1000).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();
        let mut all = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
