use futures::prelude::*;
use std::sync::Arc;
use tracing_futures::Instrument as _;

use super::{Session, SessionInner};
use crate::message::{Opcode, Owner, WireMessage, MAX_HEADER_LEN};
use crate::payload::Payload;
use crate::service::Request;
use crate::utils::Cancel;
use crate::Error;

impl Session {
    /// Call the peer's handler for `header` and wait for its reply.
    pub async fn rpc(&self, header: &str, payload: impl Into<Payload>) -> Result<Payload, Error> {
        self.inner.call(header, payload.into(), None).await
    }

    /// Like [Session::rpc] but gives up with the cancellation reason when `cancel` fires.
    pub async fn rpc_with_cancel(
        &self,
        header: &str,
        payload: impl Into<Payload>,
        cancel: &Cancel,
    ) -> Result<Payload, Error> {
        self.inner.call(header, payload.into(), Some(cancel)).await
    }

    /// Call a handler that takes and returns JSON values.
    pub async fn json_rpc<Req, Resp>(&self, header: &str, request: &Req) -> Result<Resp, Error>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let reply = self.rpc(header, Payload::json(request)?).await?;
        reply.decode_json()
    }
}

impl SessionInner {
    async fn call(
        &self,
        header: &str,
        payload: Payload,
        cancel: Option<&Cancel>,
    ) -> Result<Payload, Error> {
        if header.len() > MAX_HEADER_LEN {
            return Err(Error::HeaderTooLong(header.len()));
        }
        let id = self.ids.next();
        let request =
            WireMessage::new(header, id, Owner::Sender, Opcode::RpcRequest).with_payload(payload);
        let reply = match cancel {
            Some(cancel) => futures::select! {
                reply = self.request(request).fuse() => reply?,
                reason = cancel.cancelled().fuse() => return Err(reason),
            },
            None => self.request(request).await?,
        };
        match reply.opcode {
            Opcode::RpcResponse => Ok(reply.payload.unwrap_or_default()),
            _ => {
                let text = match reply.payload {
                    Some(Payload::Error(text)) | Some(Payload::Text(text)) => text,
                    _ => String::from("rpc failed"),
                };
                Err(Error::Remote(text))
            }
        }
    }
}

/// Run the handler of an incoming request on its own task and send the reply.
pub(super) fn handle_request(session: &Arc<SessionInner>, message: WireMessage) {
    let WireMessage {
        header,
        id,
        payload,
        ..
    } = message;
    let request = Request {
        header: header.clone(),
        payload: payload.unwrap_or_default(),
        auth_info: session.auth_info.clone(),
    };
    let reply = session.service.call(request);
    let session = session.clone();
    let span = tracing::debug_span!("rpc", id, %header);
    async_std::task::spawn(
        async move {
            let reply = match reply.await {
                Ok(payload) => WireMessage::new(header, id, Owner::Receiver, Opcode::RpcResponse)
                    .with_payload(payload),
                Err(error) => {
                    tracing::debug!(?error, "rpc handler failed");
                    WireMessage::new(header, id, Owner::Receiver, Opcode::RpcFailure)
                        .with_payload(Payload::Error(error.to_string()))
                }
            };
            match session.send(&reply) {
                Ok(_) => (),
                Err(Error::Frame(error)) => {
                    tracing::debug!(%error, "rpc reply does not fit into a frame");
                    let failure =
                        WireMessage::new(reply.header, id, Owner::Receiver, Opcode::RpcFailure)
                            .with_payload(Payload::Error(error.to_string()));
                    let _ = session.send(&failure);
                }
                Err(error) => tracing::debug!(?error, "failed to send rpc reply"),
            }
        }
        .instrument(span),
    );
}
