//! RPC calls from the acceptor of a stream back to its opener
//!
//! The opener of a reverse RPC stream serves a [ReverseRoutes] table. The acceptor's handler gets
//! a [ReverseRpc] and calls into that table. Calls and replies travel as JSON payloads of the
//! stream. Nested ids are scoped to the stream.
use chashmap::CHashMap;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing_futures::Instrument as _;

use crate::auth::AuthInfo;
use crate::message::IdAllocator;
use crate::payload::Payload;
use crate::stream::Stream;
use crate::utils::Cancel;
use crate::Error;

const TYPE_MESSAGE: u8 = 0;
const TYPE_ERROR: u8 = 1;

/// Call or reply carried by a reverse RPC stream.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct NestedMessage {
    header: String,
    id: u32,
    #[serde(rename = "type")]
    message_type: u8,
    /// JSON value of a call or reply. The error text for error replies.
    data: serde_json::Value,
}

impl NestedMessage {
    fn into_result<T: serde::de::DeserializeOwned>(self) -> Result<T, Error> {
        match self.message_type {
            TYPE_MESSAGE => Ok(serde_json::from_value(self.data)?),
            TYPE_ERROR => {
                let text = match self.data {
                    serde_json::Value::String(text) => text,
                    data => data.to_string(),
                };
                Err(Error::Remote(text))
            }
            other => Err(Error::Remote(format!("invalid nested message type {}", other))),
        }
    }
}

/// Handle the acceptor of a reverse RPC stream uses to call the opener.
#[derive(Clone)]
pub struct ReverseRpc {
    inner: Arc<Inner>,
}

struct Inner {
    stream: Stream,
    ids: IdAllocator,
    pending: CHashMap<u32, oneshot::Sender<NestedMessage>>,
}

impl ReverseRpc {
    /// Wrap an accepted stream and spawn the task that routes replies to pending calls.
    pub(crate) fn start(stream: Stream) -> Self {
        let this = Self {
            inner: Arc::new(Inner {
                stream,
                ids: IdAllocator::default(),
                pending: CHashMap::new(),
            }),
        };
        let receiver = this.clone();
        async_std::task::spawn(
            async move { receiver.receive_replies().await }.instrument(tracing::Span::current()),
        );
        this
    }

    /// Payload the opener passed when it opened the stream, usually the route key.
    pub async fn bind(&self) -> Result<Payload, Error> {
        self.inner.stream.bind().await
    }

    pub fn auth_info(&self) -> AuthInfo {
        self.inner.stream.peer_auth_info()
    }

    /// Cancelled when the stream closes.
    pub fn cancel(&self) -> &Cancel {
        self.inner.stream.cancel()
    }

    pub fn stream(&self) -> &Stream {
        &self.inner.stream
    }

    /// Call the opener's route for `header` and wait for the reply.
    pub async fn rpc<Req, Resp>(&self, header: &str, request: &Req) -> Result<Resp, Error>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        self.call(header, request, None).await
    }

    /// Like [ReverseRpc::rpc] but gives up with the cancellation reason when `cancel` fires.
    pub async fn rpc_with_cancel<Req, Resp>(
        &self,
        header: &str,
        request: &Req,
        cancel: &Cancel,
    ) -> Result<Resp, Error>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        self.call(header, request, Some(cancel)).await
    }

    async fn call<Req, Resp>(
        &self,
        header: &str,
        request: &Req,
        cancel: Option<&Cancel>,
    ) -> Result<Resp, Error>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let stream = &self.inner.stream;
        if stream.is_closed() {
            return Err(Error::ReverseRpcClosed);
        }
        let id = self.inner.ids.next();
        let message = NestedMessage {
            header: header.to_string(),
            id,
            message_type: TYPE_MESSAGE,
            data: serde_json::to_value(request)?,
        };
        let (sender, receiver) = oneshot::channel();
        self.inner.pending.insert(id, sender);
        let _slot = PendingSlot {
            pending: &self.inner.pending,
            id,
        };
        stream
            .send(Payload::json(&message)?)
            .map_err(closed_to_reverse)?;

        let caller_cancelled = match cancel {
            Some(cancel) => cancel.cancelled().boxed(),
            None => future::pending().boxed(),
        };
        let reply = futures::select! {
            reply = receiver.fuse() => match reply {
                Ok(reply) => reply,
                Err(_) => return Err(Error::ReverseRpcClosed),
            },
            reason = stream.cancel().cancelled().fuse() => return Err(closed_to_reverse(reason)),
            reason = caller_cancelled.fuse() => return Err(reason),
        };
        reply.into_result()
    }

    async fn receive_replies(self) {
        let stream = &self.inner.stream;
        loop {
            let payload = match stream.recv().await {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::debug!(?error, "reverse rpc stream ended");
                    break;
                }
            };
            let reply = match payload.decode_json::<NestedMessage>() {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::warn!(?error, "invalid reverse rpc reply");
                    continue;
                }
            };
            match self.inner.pending.remove(&reply.id) {
                Some(slot) => {
                    let _ = slot.send(reply);
                }
                None => tracing::debug!(
                    id = reply.id,
                    header = %reply.header,
                    "dropping reverse rpc reply for unknown call"
                ),
            }
        }
        self.inner.pending.clear();
        stream.fail(Error::ReverseRpcClosed);
    }
}

impl std::fmt::Debug for ReverseRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseRpc")
            .field("stream", &self.inner.stream)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

fn closed_to_reverse(error: Error) -> Error {
    match error {
        Error::StreamClosed => Error::ReverseRpcClosed,
        error => error,
    }
}

struct PendingSlot<'a> {
    pending: &'a CHashMap<u32, oneshot::Sender<NestedMessage>>,
    id: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

type RouteHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync,
>;

/// Handlers the opener of a reverse RPC stream serves, keyed by header.
#[derive(Clone, Default)]
pub struct ReverseRoutes {
    routes: HashMap<String, RouteHandler>,
}

impl ReverseRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<Args, Ret, Fut>(
        &mut self,
        header: impl ToString,
        f: impl Fn(Args) -> Fut + Send + Sync + 'static,
    ) -> &mut Self
    where
        Args: serde::de::DeserializeOwned,
        Ret: serde::Serialize,
        Fut: Future<Output = anyhow::Result<Ret>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: RouteHandler = Arc::new(move |data| {
            let f = f.clone();
            async move {
                let args = serde_json::from_value::<Args>(data)?;
                let ret = f(args).await?;
                Ok(serde_json::to_value(ret)?)
            }
            .boxed()
        });
        self.routes.insert(header.to_string(), handler);
        self
    }
}

impl std::fmt::Debug for ReverseRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseRoutes")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Serve the calls arriving on a reverse RPC stream we opened until the stream closes.
pub(crate) async fn serve(stream: Stream, routes: ReverseRoutes) -> Result<(), Error> {
    let span =
        tracing::debug_span!("reverse_rpc", stream = %stream.id(), header = %stream.header());
    async move {
        loop {
            let payload = match stream.recv().await {
                Ok(payload) => payload,
                Err(Error::StreamClosed) => return Ok(()),
                Err(error) => return Err(error),
            };
            let call = match payload.decode_json::<NestedMessage>() {
                Ok(call) => call,
                Err(error) => {
                    tracing::warn!(?error, "invalid reverse rpc call");
                    continue;
                }
            };
            let handler = match routes.routes.get(&call.header) {
                Some(handler) => handler.clone(),
                None => {
                    tracing::debug!(
                        id = call.id,
                        header = %call.header,
                        "dropping reverse rpc call without route"
                    );
                    continue;
                }
            };
            let stream = stream.clone();
            async_std::task::spawn(
                async move {
                    let NestedMessage { header, id, data, .. } = call;
                    let (message_type, data) = match handler(data).await {
                        Ok(value) => (TYPE_MESSAGE, value),
                        Err(error) => {
                            tracing::debug!(?error, "reverse rpc route failed");
                            (TYPE_ERROR, serde_json::Value::String(format!("{:#}", error)))
                        }
                    };
                    let reply = NestedMessage {
                        header,
                        id,
                        message_type,
                        data,
                    };
                    let result = Payload::json(&reply).and_then(|payload| stream.send(payload));
                    if let Err(error) = result {
                        tracing::debug!(?error, "failed to send reverse rpc reply");
                    }
                }
                .instrument(tracing::Span::current()),
            );
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::service::Service;
    use crate::stream::OpenOptions;
    use crate::test_utils::{session_pair, settings};
    use std::time::Duration;

    #[test]
    fn nested_message_json() {
        let message = NestedMessage {
            header: "add".to_string(),
            id: 4,
            message_type: TYPE_ERROR,
            data: serde_json::json!("nope"),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"header": "add", "id": 4, "type": 1, "data": "nope"})
        );
        match message.into_result::<u32>() {
            Err(Error::Remote(text)) => assert_eq!(text, "nope"),
            result => panic!("unexpected result {:?}", result),
        }
    }

    fn routes() -> ReverseRoutes {
        let mut routes = ReverseRoutes::new();
        routes.add("add", |(a, b): (i64, i64)| async move { Ok(a + b) });
        routes.add("fail", |_: ()| async { Err::<(), _>(anyhow::anyhow!("route failed")) });
        routes
    }

    #[async_std::test]
    async fn calls_back_into_opener() {
        let (results_sender, results) = async_std::channel::unbounded();
        let mut service = Service::new();
        service.add_reverse_rpc("calc", move |ctx| {
            let results_sender = results_sender.clone();
            async move {
                let route = ctx.bind().await?;
                let sum: i64 = ctx.rpc("add", &(2, 3)).await?;
                let failed = ctx.rpc::<_, ()>("fail", &()).await;
                let _ = results_sender
                    .send((route.as_text().map(ToOwned::to_owned), sum, failed))
                    .await;
                Ok(())
            }
        });
        let (client, _server) = session_pair(service, settings()).await;
        client
            .reverse_rpc("calc", Payload::from("math"), routes(), OpenOptions::new())
            .await
            .unwrap();

        let (route, sum, failed) = results.recv().await.unwrap();
        assert_eq!(route.as_deref(), Some("math"));
        assert_eq!(sum, 5);
        match failed {
            Err(Error::Remote(text)) => assert_eq!(text, "route failed"),
            result => panic!("unexpected result {:?}", result),
        }
    }

    #[async_std::test]
    async fn unknown_nested_id_is_dropped() {
        let (ctx_sender, ctx_receiver) = async_std::channel::bounded(1);
        let mut service = Service::new();
        service.add_reverse_rpc("calc", move |ctx| {
            let ctx_sender = ctx_sender.clone();
            async move {
                let _ = ctx_sender.send(ctx.clone()).await;
                ctx.cancel().cancelled().await;
                Ok(())
            }
        });
        let (client, _server) = session_pair(service, settings()).await;
        let stream = client
            .open_reverse_stream("calc", None, OpenOptions::new())
            .await
            .unwrap();
        let ctx: ReverseRpc = ctx_receiver.recv().await.unwrap();

        let stray = NestedMessage {
            header: "add".to_string(),
            id: 999,
            message_type: TYPE_MESSAGE,
            data: serde_json::json!(1),
        };
        stream.send(Payload::json(&stray).unwrap()).unwrap();
        async_std::task::sleep(Duration::from_millis(20)).await;
        assert!(!ctx.stream().is_closed());
        assert_eq!(ctx.inner.pending.len(), 0);

        // Answer a real call by hand to show the stream still routes replies.
        let call = {
            let ctx = ctx.clone();
            async_std::task::spawn(async move { ctx.rpc::<_, i64>("add", &(1, 1)).await })
        };
        let request = stream.recv().await.unwrap().decode_json::<NestedMessage>().unwrap();
        let reply = NestedMessage {
            data: serde_json::json!(2),
            ..request
        };
        stream.send(Payload::json(&reply).unwrap()).unwrap();
        assert_eq!(call.await.unwrap(), 2);
    }

    #[async_std::test]
    async fn calls_fail_after_close() {
        let (ctx_sender, ctx_receiver) = async_std::channel::bounded(1);
        let mut service = Service::new();
        service.add_reverse_rpc("calc", move |ctx| {
            let ctx_sender = ctx_sender.clone();
            async move {
                let _ = ctx_sender.send(ctx.clone()).await;
                ctx.cancel().cancelled().await;
                Ok(())
            }
        });
        let (client, _server) = session_pair(service, settings()).await;
        let stream = client
            .open_reverse_stream("calc", None, OpenOptions::new())
            .await
            .unwrap();
        let ctx: ReverseRpc = ctx_receiver.recv().await.unwrap();
        let call = {
            let ctx = ctx.clone();
            async_std::task::spawn(async move { ctx.rpc::<_, i64>("add", &(1, 1)).await })
        };
        let _ = stream.recv().await.unwrap();
        stream.close();
        assert!(matches!(call.await, Err(Error::ReverseRpcClosed)));
        assert!(matches!(
            ctx.rpc::<_, i64>("add", &(1, 1)).await,
            Err(Error::ReverseRpcClosed)
        ));
    }
}
