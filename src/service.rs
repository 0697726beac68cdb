//! Registry of the handlers a peer serves
use futures::future::BoxFuture;
use futures::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::AuthInfo;
use crate::payload::Payload;
use crate::reverse::ReverseRpc;
use crate::stream::{Stream, StreamKind};
use crate::Error;

/// RPC request passed to a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub header: String,
    pub payload: Payload,
    /// Auth info of the session the request arrived on.
    pub auth_info: AuthInfo,
}

impl Request {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        self.payload.decode_json()
    }
}

type RpcHandler = Box<dyn Fn(Request) -> BoxFuture<'static, anyhow::Result<Payload>> + Send + Sync>;

type StreamFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum StreamHandler {
    Duplex(StreamFn<Stream>),
    /// The acceptor writes, the opener reads.
    Send(StreamFn<Stream>),
    /// The opener writes. The handler's result is sent back as the single reply.
    Recv(Arc<dyn Fn(Stream) -> BoxFuture<'static, anyhow::Result<Payload>> + Send + Sync>),
    ReverseRpc(StreamFn<ReverseRpc>),
}

impl StreamHandler {
    pub(crate) fn kind(&self) -> StreamKind {
        match self {
            Self::Duplex(_) => StreamKind::FullDuplex,
            Self::Send(_) => StreamKind::ResponderWritesOnly,
            Self::Recv(_) => StreamKind::InitiatorWritesOnly,
            Self::ReverseRpc(_) => StreamKind::ReverseRpc,
        }
    }

    /// Run the handler for an accepted stream and close the stream with its result.
    pub(crate) async fn run(self, stream: Stream) {
        let result = match self {
            Self::Duplex(handler) | Self::Send(handler) => handler(stream.clone()).await,
            Self::Recv(handler) => match handler(stream.clone()).await {
                Ok(reply) => stream.send_reply(reply).map_err(anyhow::Error::from),
                Err(error) => Err(error),
            },
            Self::ReverseRpc(handler) => handler(ReverseRpc::start(stream.clone())).await,
        };
        match result {
            Ok(()) => stream.close(),
            Err(error) => {
                tracing::warn!(header = %stream.header(), error = ?error, "stream handler failed");
                stream.fail(Error::from_handler(error));
            }
        }
    }
}

/// Handlers keyed by message header.
#[derive(Default)]
pub struct Service {
    rpc_handlers: HashMap<String, RpcHandler>,
    stream_handlers: HashMap<String, StreamHandler>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rpc<Fut>(
        &mut self,
        header: impl ToString,
        f: impl Fn(Request) -> Fut + Send + Sync + 'static,
    ) -> &mut Self
    where
        Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
    {
        self.rpc_handlers
            .insert(header.to_string(), Box::new(move |request| f(request).boxed()));
        self
    }

    /// Add an RPC handler that takes and returns JSON values.
    pub fn add_json_rpc<Args, Ret, Fut>(
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
        self.add_rpc(header, move |request: Request| {
            let f = f.clone();
            async move {
                let args = request.json::<Args>()?;
                let ret = f(args).await?;
                Ok(Payload::json(&ret)?)
            }
        })
    }

    /// Add a handler for full duplex streams.
    pub fn add_stream<Fut>(
        &mut self,
        header: impl ToString,
        f: impl Fn(Stream) -> Fut + Send + Sync + 'static,
    ) -> &mut Self
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stream_handlers.insert(
            header.to_string(),
            StreamHandler::Duplex(Arc::new(move |stream| f(stream).boxed())),
        );
        self
    }

    /// Add a handler for streams where only the handler sends. The handler may read the payload
    /// the stream was opened with using [Stream::bind].
    pub fn add_send_stream<Fut>(
        &mut self,
        header: impl ToString,
        f: impl Fn(Stream) -> Fut + Send + Sync + 'static,
    ) -> &mut Self
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stream_handlers.insert(
            header.to_string(),
            StreamHandler::Send(Arc::new(move |stream| f(stream).boxed())),
        );
        self
    }

    /// Add a handler for streams where only the opener sends. The payload returned by the
    /// handler is delivered to the opener.
    pub fn add_recv_stream<Fut>(
        &mut self,
        header: impl ToString,
        f: impl Fn(Stream) -> Fut + Send + Sync + 'static,
    ) -> &mut Self
    where
        Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
    {
        self.stream_handlers.insert(
            header.to_string(),
            StreamHandler::Recv(Arc::new(move |stream| f(stream).boxed())),
        );
        self
    }

    pub fn add_reverse_rpc<Fut>(
        &mut self,
        header: impl ToString,
        f: impl Fn(ReverseRpc) -> Fut + Send + Sync + 'static,
    ) -> &mut Self
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stream_handlers.insert(
            header.to_string(),
            StreamHandler::ReverseRpc(Arc::new(move |ctx| f(ctx).boxed())),
        );
        self
    }

    /// Add all handlers of `service` with their headers prefixed by `group.`.
    pub fn add_service(&mut self, group: impl ToString, service: Self) -> &mut Self {
        let group = group.to_string();
        let Self {
            rpc_handlers,
            stream_handlers,
        } = service;
        self.rpc_handlers.extend(
            rpc_handlers
                .into_iter()
                .map(|(header, handler)| (format!("{}.{}", group, header), handler)),
        );
        self.stream_handlers.extend(
            stream_handlers
                .into_iter()
                .map(|(header, handler)| (format!("{}.{}", group, header), handler)),
        );
        self
    }

    pub(crate) fn call(&self, request: Request) -> BoxFuture<'static, Result<Payload, Error>> {
        match self.rpc_handlers.get(&request.header) {
            Some(handler) => handler(request).map_err(Error::from_handler).boxed(),
            None => {
                tracing::warn!(header = %request.header, "missing rpc handler");
                future::ready(Err(Error::InvalidCall(request.header))).boxed()
            }
        }
    }

    pub(crate) fn stream_handler(&self, header: &str, kind: StreamKind) -> Result<StreamHandler, Error> {
        match self.stream_handlers.get(header) {
            Some(handler) if handler.kind() == kind => Ok(handler.clone()),
            Some(handler) => {
                tracing::warn!(header, ?kind, expected = ?handler.kind(), "stream kind mismatch");
                Err(Error::InvalidCall(header.to_string()))
            }
            None => {
                tracing::warn!(header, "missing stream handler");
                Err(Error::InvalidCall(header.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("rpc_handlers", &self.rpc_handlers.keys().collect::<Vec<_>>())
            .field(
                "stream_handlers",
                &self.stream_handlers.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}
