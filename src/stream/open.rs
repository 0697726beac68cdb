use bytes::{Buf as _, BufMut as _};
use futures::prelude::*;
use std::sync::Arc;
use tracing_futures::Instrument as _;

use super::{Closer, OpenOptions, Origin, Stream, StreamKey, StreamKind};
use crate::auth::AuthInfo;
use crate::message::{DecodeError, Opcode, Owner, WireMessage, MAX_HEADER_LEN};
use crate::payload::{Payload, PayloadType};
use crate::session::SessionInner;
use crate::Error;

/// Payload of a stream open message.
///
/// ```text
/// +-----------+------------------+------------+-------------+
/// | len:4 BE  | auth info (JSON) | [tag:1]    | [payload]   |
/// +-----------+------------------+------------+-------------+
/// ```
#[derive(Debug, Clone, PartialEq)]
struct OpenBody {
    auth_info: AuthInfo,
    payload: Option<Payload>,
}

impl OpenBody {
    fn encode(self) -> Result<Payload, Error> {
        let auth_info = serde_json::to_vec(&self.auth_info)?;
        let mut buf = Vec::with_capacity(4 + auth_info.len());
        buf.put_u32(auth_info.len() as u32);
        buf.put_slice(&auth_info);
        if let Some(payload) = self.payload {
            let (payload_type, data) = payload.build();
            buf.put_u8(payload_type as u8);
            buf.put_slice(&data);
        }
        Ok(Payload::Raw(buf))
    }

    fn decode(payload: Option<Payload>) -> Result<Self, Error> {
        let data = match payload {
            Some(Payload::Raw(data)) => data,
            None => {
                return Ok(Self {
                    auth_info: AuthInfo::new(),
                    payload: None,
                })
            }
            Some(_) => return Err(DecodeError::InvalidPayloadType(PayloadType::Raw as u8).into()),
        };
        let mut data = data.as_slice();
        if data.remaining() < 4 {
            return Err(DecodeError::Truncated.into());
        }
        let auth_len = data.get_u32() as usize;
        if data.remaining() < auth_len {
            return Err(DecodeError::Truncated.into());
        }
        let auth_info = serde_json::from_slice(&data[..auth_len])?;
        data.advance(auth_len);
        let payload = if data.has_remaining() {
            let tag = data.get_u8();
            let payload_type =
                PayloadType::from_tag(tag).ok_or(DecodeError::InvalidPayloadType(tag))?;
            Some(Payload::parse(payload_type, data.to_vec())?)
        } else {
            None
        };
        Ok(Self { auth_info, payload })
    }
}

/// Closes a stream whose open did not complete.
struct OpenGuard(Option<Stream>);

impl OpenGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        if let Some(stream) = self.0.take() {
            stream.close();
        }
    }
}

/// Open a stream and wait for the peer to accept it.
pub(crate) async fn open(
    session: &Arc<SessionInner>,
    kind: StreamKind,
    header: &str,
    payload: Option<Payload>,
    options: OpenOptions,
) -> Result<Stream, Error> {
    if header.len() > MAX_HEADER_LEN {
        return Err(Error::HeaderTooLong(header.len()));
    }
    if session.cancel.is_cancelled() {
        return Err(Error::SessionClosed);
    }
    let key = StreamKey {
        origin: Origin::Local,
        id: session.ids.next(),
    };
    let cancel = match &options.cancel {
        Some(cancel) => crate::utils::Cancel::child_of(&[&session.cancel, cancel]),
        None => session.cancel.child(),
    };
    let stream = Stream::new(session, key, header.to_string(), kind, cancel);
    let span = tracing::debug_span!("open_stream", stream = %stream.id(), header, kind = kind.name());
    async move {
        let ack = stream.expect_ack();
        session.insert_stream(&stream);
        let guard = OpenGuard(Some(stream.clone()));

        let body = OpenBody {
            auth_info: options.auth_info,
            payload,
        }
        .encode()?;
        stream.send_message(kind.open_opcode(), Some(body))?;

        let reply = futures::select! {
            reply = ack.fuse() => match reply {
                Ok(reply) => reply,
                Err(_) => return Err(stream.cancel().reason().unwrap_or(Error::SessionClosed)),
            },
            reason = stream.cancel().cancelled().fuse() => return Err(reason),
        };
        let auth_info = match reply {
            Some(payload) => payload.decode_json::<AuthInfo>()?,
            None => AuthInfo::new(),
        };
        stream.set_peer_auth_info(auth_info);
        stream.activate();
        guard.disarm();
        tracing::debug!("stream opened");

        async_std::task::spawn(
            super::keepalive(stream.clone(), session.settings.stream_ping_interval)
                .instrument(tracing::Span::current()),
        );
        Ok::<_, Error>(stream)
    }
    .instrument(span)
    .await
}

/// Accept a stream the peer opened and spawn its handler.
pub(crate) fn accept(session: &Arc<SessionInner>, message: WireMessage) {
    let kind = match StreamKind::from_open_opcode(message.opcode) {
        Some(kind) => kind,
        None => return,
    };
    let key = StreamKey::incoming(&message);
    if session.has_stream(key) {
        tracing::warn!(id = key.id, header = %message.header, "duplicate stream open");
        return;
    }
    let WireMessage {
        header,
        id,
        payload,
        opcode,
        ..
    } = message;
    let reject = |error: Error| {
        tracing::debug!(id, %header, ?error, "rejecting stream");
        let failure = WireMessage::new(header.as_str(), id, Owner::Receiver, Opcode::StreamFailure)
            .with_payload(Payload::Error(error.to_string()));
        if let Err(error) = session.send(&failure) {
            tracing::trace!(?error, "failed to send stream rejection");
        }
    };

    let body = match OpenBody::decode(payload) {
        Ok(body) => body,
        Err(error) => return reject(error),
    };
    let handler = match session.service.stream_handler(&header, kind) {
        Ok(handler) => handler,
        Err(error) => return reject(error),
    };
    let reply_info = match &session.settings.stream_auth {
        Some(stream_auth) => match stream_auth(&header, &body.auth_info) {
            Ok(reply_info) => reply_info,
            Err(error) => return reject(error),
        },
        None => AuthInfo::new(),
    };
    let ack = match Payload::json(&reply_info) {
        Ok(ack) => ack,
        Err(error) => return reject(error),
    };

    let stream = Stream::new(session, key, header.clone(), kind, session.cancel.child());
    stream.set_peer_auth_info(body.auth_info);
    if kind.queues_open_payload() {
        if let Some(payload) = body.payload {
            stream.queue(payload);
        }
    } else {
        stream.set_bind(body.payload);
    }
    session.insert_stream(&stream);
    stream.activate();
    if let Err(error) = stream.send_message(opcode, Some(ack)) {
        stream.close_with(error, Closer::Session);
        return;
    }

    let span = tracing::debug_span!("stream", stream = %stream.id(), %header, kind = kind.name());
    tracing::debug!(parent: &span, "stream accepted");
    async_std::task::spawn(
        super::keepalive(stream.clone(), session.settings.stream_ping_interval)
            .instrument(span.clone()),
    );
    async_std::task::spawn(handler.run(stream).instrument(span));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_body_with_payload() {
        let body = OpenBody {
            auth_info: AuthInfo::new().with("token", "t"),
            payload: Some(Payload::Text("route".to_string())),
        };
        let decoded = OpenBody::decode(Some(body.clone().encode().unwrap())).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn open_body_without_payload() {
        let body = OpenBody {
            auth_info: AuthInfo::new(),
            payload: None,
        };
        let decoded = OpenBody::decode(Some(body.clone().encode().unwrap())).unwrap();
        assert_eq!(decoded.payload, None);
        assert_eq!(OpenBody::decode(None).unwrap(), body);
    }

    #[test]
    fn open_body_truncated() {
        let data = vec![0, 0, 0, 10, b'{'];
        assert!(matches!(
            OpenBody::decode(Some(Payload::Raw(data))),
            Err(Error::Decode(DecodeError::Truncated))
        ));
    }
}
