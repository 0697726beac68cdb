//! Streams multiplexed over a session
//!
//! The opcode used to open a stream determines which side may write. The side that opened the
//! stream is the initiator, the other side is the responder.
use futures::channel::oneshot;
use futures::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::auth::AuthInfo;
use crate::message::{Opcode, Owner, WireMessage};
use crate::payload::Payload;
use crate::session::SessionInner;
use crate::utils::{Cancel, CloseGate, Monitor, MonitorInfo};
use crate::Error;

mod keepalive;
mod open;

pub(crate) use keepalive::keepalive;
pub(crate) use open::{accept, open};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    FullDuplex,
    InitiatorWritesOnly,
    ResponderWritesOnly,
    /// Carries nested RPC messages, see [crate::ReverseRpc].
    ReverseRpc,
}

impl StreamKind {
    pub(crate) fn open_opcode(self) -> Opcode {
        match self {
            Self::FullDuplex => Opcode::StreamOpenDuplex,
            Self::InitiatorWritesOnly => Opcode::StreamOpenInitiatorWrites,
            Self::ResponderWritesOnly => Opcode::StreamOpenResponderWrites,
            Self::ReverseRpc => Opcode::StreamOpenReverseRpc,
        }
    }

    pub(crate) fn from_open_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::StreamOpenDuplex => Some(Self::FullDuplex),
            Opcode::StreamOpenInitiatorWrites => Some(Self::InitiatorWritesOnly),
            Opcode::StreamOpenResponderWrites => Some(Self::ResponderWritesOnly),
            Opcode::StreamOpenReverseRpc => Some(Self::ReverseRpc),
            _ => None,
        }
    }

    fn initiator_writes(self) -> bool {
        !matches!(self, Self::ResponderWritesOnly)
    }

    fn responder_writes(self) -> bool {
        !matches!(self, Self::InitiatorWritesOnly)
    }

    /// Whether the payload of the open message is delivered through [Stream::recv] instead of
    /// [Stream::bind].
    fn queues_open_payload(self) -> bool {
        matches!(self, Self::FullDuplex | Self::InitiatorWritesOnly)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FullDuplex => "full_duplex",
            Self::InitiatorWritesOnly => "initiator_writes_only",
            Self::ResponderWritesOnly => "responder_writes_only",
            Self::ReverseRpc => "reverse_rpc",
        }
    }
}

/// Which peer allocated the id of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey {
    pub origin: Origin,
    pub id: u32,
}

impl StreamKey {
    /// Key of the stream an incoming message is addressed to.
    pub fn incoming(message: &WireMessage) -> Self {
        let origin = match message.owner {
            Owner::Sender => Origin::Remote,
            Owner::Receiver => Origin::Local,
        };
        Self {
            origin,
            id: message.id,
        }
    }

    fn owner(self) -> Owner {
        match self.origin {
            Origin::Local => Owner::Sender,
            Origin::Remote => Owner::Receiver,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Opening,
    Active,
    Closing,
    Closed,
}

/// Who closes a stream. Determines whether the peer is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Closer {
    /// Close or failure message is sent to the peer.
    Local,
    /// The peer sent a close or failure message.
    Peer,
    /// The session is going away.
    Session,
}

/// A stream of a session.
///
/// Cloning the stream returns another handle to the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    key: StreamKey,
    header: String,
    kind: StreamKind,
    session_id: String,
    session: Weak<SessionInner>,
    state: Mutex<StreamState>,
    cancel: Cancel,
    gate: CloseGate,
    closed_locally: AtomicBool,
    queue_sender: async_std::channel::Sender<Payload>,
    queue: async_std::channel::Receiver<Payload>,
    ping_sender: async_std::channel::Sender<()>,
    ping: async_std::channel::Receiver<()>,
    ack: Mutex<Option<oneshot::Sender<Option<Payload>>>>,
    bind: Mutex<Option<Payload>>,
    peer_auth_info: Mutex<AuthInfo>,
    monitor: Monitor,
}

impl Stream {
    pub(crate) fn new(
        session: &Arc<SessionInner>,
        key: StreamKey,
        header: String,
        kind: StreamKind,
        cancel: Cancel,
    ) -> Self {
        let (queue_sender, queue) = async_std::channel::unbounded();
        let (ping_sender, ping) = async_std::channel::bounded(1);
        Self {
            inner: Arc::new(StreamInner {
                key,
                header,
                kind,
                session_id: session.id.clone(),
                session: Arc::downgrade(session),
                state: Mutex::new(StreamState::Opening),
                cancel,
                gate: CloseGate::new(),
                closed_locally: AtomicBool::new(false),
                queue_sender,
                queue,
                ping_sender,
                ping,
                ack: Mutex::new(None),
                bind: Mutex::new(None),
                peer_auth_info: Mutex::new(AuthInfo::new()),
                monitor: Monitor::new(),
            }),
        }
    }

    /// Unique id of the stream in the form `<session id>_<stream id>`.
    pub fn id(&self) -> String {
        format!("{}_{}", self.inner.session_id, self.inner.key.id)
    }

    pub fn header(&self) -> &str {
        &self.inner.header
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    pub fn origin(&self) -> Origin {
        self.inner.key.origin
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.lock()
    }

    /// Auth info the peer sent when the stream was opened or accepted.
    pub fn peer_auth_info(&self) -> AuthInfo {
        self.inner.peer_auth_info.lock().clone()
    }

    /// Cancelled with the close reason when the stream closes.
    pub fn cancel(&self) -> &Cancel {
        &self.inner.cancel
    }

    pub fn monitor_info(&self) -> MonitorInfo {
        self.inner.monitor.info()
    }

    pub(crate) fn key(&self) -> StreamKey {
        self.inner.key
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn can_send(&self) -> bool {
        match self.inner.key.origin {
            Origin::Local => self.inner.kind.initiator_writes(),
            Origin::Remote => self.inner.kind.responder_writes(),
        }
    }

    fn can_recv(&self) -> bool {
        match self.inner.key.origin {
            Origin::Local => self.inner.kind.responder_writes(),
            Origin::Remote => self.inner.kind.initiator_writes(),
        }
    }

    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), Error> {
        if !self.can_send() {
            return Err(Error::StreamInvalidAction);
        }
        self.send_body(payload.into())
    }

    /// Receive the next payload from the peer.
    ///
    /// Payloads that arrived before the peer closed the stream are returned before the close
    /// reason. After [Stream::close] this always fails with [Error::StreamClosed].
    pub async fn recv(&self) -> Result<Payload, Error> {
        if !self.can_recv() {
            return Err(Error::StreamInvalidAction);
        }
        self.next_message().await
    }

    /// Payload the stream was opened with.
    ///
    /// For the opener of a stream where only the opener writes this waits for the reply of the
    /// peer's handler and closes the stream.
    pub async fn bind(&self) -> Result<Payload, Error> {
        match (self.inner.key.origin, self.inner.kind) {
            (Origin::Local, StreamKind::InitiatorWritesOnly) => {
                let reply = self.next_message().await;
                self.close();
                reply
            }
            (Origin::Remote, kind) if !kind.queues_open_payload() => {
                self.inner.bind.lock().clone().ok_or(Error::NoData)
            }
            _ => Err(Error::StreamInvalidAction),
        }
    }

    /// Close the stream and tell the peer. Calling this more than once has no effect.
    pub fn close(&self) {
        self.inner.closed_locally.store(true, Ordering::Release);
        self.close_with(Error::StreamClosed, Closer::Local);
    }

    /// Close the stream with a failure that is reported to the peer.
    pub fn fail(&self, reason: Error) {
        self.close_with(reason, Closer::Local);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.gate.is_closed()
    }

    pub(crate) async fn next_message(&self) -> Result<Payload, Error> {
        if self.inner.closed_locally.load(Ordering::Acquire) {
            return Err(Error::StreamClosed);
        }
        if let Ok(payload) = self.inner.queue.try_recv() {
            return Ok(payload);
        }
        futures::select! {
            payload = self.inner.queue.recv().fuse() => payload.map_err(|_| Error::StreamClosed),
            reason = self.inner.cancel.cancelled().fuse() => {
                if self.inner.closed_locally.load(Ordering::Acquire) {
                    return Err(Error::StreamClosed);
                }
                self.inner.queue.try_recv().map_err(|_| reason)
            }
        }
    }

    pub(crate) fn send_body(&self, payload: Payload) -> Result<(), Error> {
        if self.inner.gate.is_closed() {
            return Err(Error::StreamClosed);
        }
        if let Some(reason) = self.inner.cancel.reason() {
            self.close_with(reason.clone(), Closer::Local);
            return Err(reason);
        }
        let opcode = match self.inner.key.origin {
            Origin::Local => Opcode::StreamSendFromInitiator,
            Origin::Remote => Opcode::StreamSendFromResponder,
        };
        self.send_message(opcode, Some(payload))
    }

    /// Send the reply of a stream where only the opener writes.
    pub(crate) fn send_reply(&self, payload: Payload) -> Result<(), Error> {
        if self.inner.gate.is_closed() {
            return Err(Error::StreamClosed);
        }
        self.send_message(Opcode::StreamSendFromResponder, Some(payload))
    }

    pub(crate) fn send_message(&self, opcode: Opcode, payload: Option<Payload>) -> Result<(), Error> {
        let session = self.inner.session.upgrade().ok_or(Error::SessionClosed)?;
        let message = WireMessage::new(
            self.inner.header.as_str(),
            self.inner.key.id,
            self.inner.key.owner(),
            opcode,
        )
        .with_payload(payload);
        let written = session.send(&message)?;
        self.inner.monitor.add_written(written);
        Ok(())
    }

    pub(crate) fn queue(&self, payload: Payload) {
        // The receiver lives as long as the stream so sending cannot fail.
        let _ = self.inner.queue_sender.try_send(payload);
    }

    pub(crate) fn set_bind(&self, payload: Option<Payload>) {
        *self.inner.bind.lock() = payload;
    }

    pub(crate) fn set_peer_auth_info(&self, auth_info: AuthInfo) {
        *self.inner.peer_auth_info.lock() = auth_info;
    }

    pub(crate) fn expect_ack(&self) -> oneshot::Receiver<Option<Payload>> {
        let (sender, receiver) = oneshot::channel();
        *self.inner.ack.lock() = Some(sender);
        receiver
    }

    pub(crate) fn activate(&self) {
        let mut state = self.inner.state.lock();
        if *state == StreamState::Opening {
            *state = StreamState::Active;
        }
    }

    pub(crate) fn pings(&self) -> async_std::channel::Receiver<()> {
        self.inner.ping.clone()
    }

    pub(crate) fn record_keepalive(&self, session_delay: std::time::Duration) {
        self.inner.monitor.record_speed();
        self.inner.monitor.record_delay(session_delay);
    }

    /// Handle a message the session routed to this stream.
    pub(crate) fn deliver(&self, message: WireMessage, size: usize) {
        self.inner.monitor.add_read(size);
        let origin = self.inner.key.origin;
        let kind = self.inner.kind;
        match message.opcode {
            Opcode::StreamSendFromInitiator
                if origin == Origin::Remote && kind.initiator_writes() =>
            {
                self.queue(message.payload.unwrap_or_default());
            }
            Opcode::StreamSendFromResponder
                if origin == Origin::Local
                    && (kind.responder_writes() || kind == StreamKind::InitiatorWritesOnly) =>
            {
                self.queue(message.payload.unwrap_or_default());
            }
            Opcode::StreamPing => {
                let _ = self.inner.ping_sender.try_send(());
            }
            Opcode::StreamClose => {
                tracing::debug!(stream = %self.id(), "stream closed by peer");
                self.close_with(Error::StreamClosed, Closer::Peer);
            }
            Opcode::StreamFailure => {
                let reason = match message.payload {
                    Some(Payload::Error(text)) | Some(Payload::Text(text)) => text,
                    _ => String::from("stream failed"),
                };
                tracing::debug!(stream = %self.id(), %reason, "stream failed by peer");
                self.close_with(Error::Remote(reason), Closer::Peer);
            }
            opcode if message.owner == Owner::Receiver && opcode == kind.open_opcode() => {
                match self.inner.ack.lock().take() {
                    Some(ack) => {
                        let _ = ack.send(message.payload);
                    }
                    None => tracing::warn!(stream = %self.id(), "unexpected open acknowledgement"),
                }
            }
            opcode => {
                tracing::warn!(
                    stream = %self.id(),
                    ?opcode,
                    ?kind,
                    "dropping message not permitted by stream kind"
                );
            }
        }
    }

    /// Tear the stream down. Only the first call has an effect.
    pub(crate) fn close_with(&self, reason: Error, closer: Closer) {
        if !self.inner.gate.close() {
            return;
        }
        *self.inner.state.lock() = StreamState::Closing;
        // A cancelled parent token decides the reason.
        let reason = self.inner.cancel.reason().unwrap_or(reason);
        tracing::debug!(stream = %self.id(), ?reason, ?closer, "closing stream");

        if closer == Closer::Local {
            let result = match &reason {
                Error::StreamClosed => self.send_message(Opcode::StreamClose, None),
                reason => self.send_message(
                    Opcode::StreamFailure,
                    Some(Payload::Error(reason.to_string())),
                ),
            };
            if let Err(error) = result {
                tracing::trace!(stream = %self.id(), ?error, "failed to notify peer");
            }
        }

        self.inner.monitor.dead();
        *self.inner.state.lock() = StreamState::Closed;
        // Waiters of the token must find the stream already retired.
        if let Some(session) = self.inner.session.upgrade() {
            session.retire_stream(self);
        }
        self.inner.cancel.cancel(reason);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("header", &self.inner.header)
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.key.origin)
            .field("state", &self.state())
            .finish()
    }
}

/// Options for opening a stream.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Sent to the peer with the open message.
    pub auth_info: AuthInfo,
    /// Closes the stream when cancelled.
    pub cancel: Option<Cancel>,
    /// Share pool class used by the `share_*` methods of [crate::Client].
    pub class: Option<String>,
    /// One-off share pool class, used if `class` is not set.
    pub temporary_class: Option<crate::share::ShareStreamClass>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth_info(mut self, auth_info: AuthInfo) -> Self {
        self.auth_info = auth_info;
        self
    }

    pub fn cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn temporary_class(mut self, class: crate::share::ShareStreamClass) -> Self {
        self.temporary_class = Some(class);
        self
    }
}
