//! A session multiplexes RPCs and streams over one connection
//!
//! Every session runs three tasks: the receive loop that dispatches incoming messages, the writer
//! that owns the sending half of the connection and the keepalive that measures the round trip
//! delay.
use chashmap::CHashMap;
use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_futures::Instrument as _;

use crate::auth::{AuthInfo, ConnInfo, SESSION_ID};
use crate::config::SessionSettings;
use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::handshake::Established;
use crate::message::{IdAllocator, Opcode, Owner, WireMessage};
use crate::payload::Payload;
use crate::reverse::ReverseRoutes;
use crate::service::Service;
use crate::stream::{self, Closer, OpenOptions, Origin, Stream, StreamKey, StreamKind};
use crate::transport::Connection;
use crate::utils::{Cancel, CloseGate, Monitor, MonitorInfo};
use crate::view::{SessionView, StreamView};
use crate::Error;

mod rpc;

/// Time the writer gets to flush queued messages when the session closes.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

/// Handle to a session. Cloning returns another handle to the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub id: String,
    role: Role,
    auth_info: AuthInfo,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Largest encoded message the writer can put into a single frame.
    max_message_size: usize,
    pub ids: IdAllocator,
    /// Result slots of RPCs and session pings, keyed by the id we allocated.
    pending: CHashMap<u32, oneshot::Sender<WireMessage>>,
    streams: Mutex<StreamTable>,
    local_streams: AtomicUsize,
    /// Streams the share pool is about to open on this session.
    pub reserved: AtomicUsize,
    pub cancel: Cancel,
    gate: CloseGate,
    pub monitor: Monitor,
    pub service: Arc<Service>,
    pub settings: SessionSettings,
}

#[derive(Default)]
struct StreamTable {
    active: HashMap<StreamKey, Stream>,
    /// Recently closed streams. Messages addressed to them are dropped silently.
    cache: HashMap<StreamKey, Stream>,
}

impl Session {
    /// Start a session on a connection that completed the handshake.
    pub(crate) fn start<Conn: Connection>(
        established: Established<Conn>,
        role: Role,
        service: Arc<Service>,
        settings: SessionSettings,
        parent: &Cancel,
    ) -> Self {
        let Established {
            writer,
            reader,
            mut auth_info,
            crypto,
        } = established;
        let id = new_session_id();
        auth_info.set(SESSION_ID, id.as_str());
        let (outgoing, outgoing_receiver) = mpsc::unbounded();
        let inner = Arc::new(SessionInner {
            id,
            role,
            auth_info,
            outgoing,
            max_message_size: writer.max_item_size(),
            ids: IdAllocator::default(),
            pending: CHashMap::new(),
            streams: Mutex::new(StreamTable::default()),
            local_streams: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            cancel: parent.child(),
            gate: CloseGate::new(),
            monitor: Monitor::new(),
            service,
            settings,
        });
        let span = tracing::debug_span!("session", id = %inner.id, ?role, %crypto);
        tracing::debug!(parent: &span, "session started");
        async_std::task::spawn(
            write_loop(inner.clone(), writer, outgoing_receiver).instrument(span.clone()),
        );
        async_std::task::spawn(receive_loop(inner.clone(), reader).instrument(span.clone()));
        async_std::task::spawn(keep_alive(inner.clone()).instrument(span));
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Auth info negotiated during the handshake.
    pub fn auth_info(&self) -> &AuthInfo {
        &self.inner.auth_info
    }

    pub fn conn_info(&self) -> ConnInfo {
        self.inner.auth_info.conn_info()
    }

    /// Cancelled with [Error::SessionClosed] when the session closes.
    pub fn cancel(&self) -> &Cancel {
        &self.inner.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.inner.gate.is_closed()
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        let _ = self.inner.cancel.cancelled().await;
    }

    /// Close the session and every stream on it. Calling this more than once has no effect.
    pub fn close(&self) {
        self.inner.shutdown(None);
    }

    /// Open a full duplex stream.
    pub async fn stream(&self, header: &str, options: OpenOptions) -> Result<Stream, Error> {
        stream::open(&self.inner, StreamKind::FullDuplex, header, None, options).await
    }

    /// Open a stream that only we write to. The peer's reply is returned by [Stream::bind].
    pub async fn send_stream(&self, header: &str, options: OpenOptions) -> Result<Stream, Error> {
        stream::open(
            &self.inner,
            StreamKind::InitiatorWritesOnly,
            header,
            None,
            options,
        )
        .await
    }

    /// Open a stream that only the peer writes to. `payload` is passed to the peer's handler.
    pub async fn recv_stream(
        &self,
        header: &str,
        payload: impl Into<Option<Payload>>,
        options: OpenOptions,
    ) -> Result<Stream, Error> {
        stream::open(
            &self.inner,
            StreamKind::ResponderWritesOnly,
            header,
            payload.into(),
            options,
        )
        .await
    }

    /// Open a reverse RPC stream and serve the peer's calls with `routes` until the stream
    /// closes.
    pub async fn reverse_rpc(
        &self,
        header: &str,
        payload: impl Into<Option<Payload>>,
        routes: ReverseRoutes,
        options: OpenOptions,
    ) -> Result<(), Error> {
        let stream = self
            .open_reverse_stream(header, payload.into(), options)
            .await?;
        crate::reverse::serve(stream, routes).await
    }

    pub(crate) async fn open_reverse_stream(
        &self,
        header: &str,
        payload: Option<Payload>,
        options: OpenOptions,
    ) -> Result<Stream, Error> {
        stream::open(&self.inner, StreamKind::ReverseRpc, header, payload, options).await
    }

    /// Send a ping and wait for the pong.
    pub async fn round_trip_delay(&self) -> Result<Duration, Error> {
        self.inner.ping().await
    }

    /// Round trip delay measured by the last keepalive ping.
    pub fn delay(&self) -> Duration {
        self.inner.monitor.delay()
    }

    pub fn monitor_info(&self) -> MonitorInfo {
        self.inner.monitor.info()
    }

    /// Number of streams we opened that are still active, plus reservations of the share pool.
    pub(crate) fn load(&self) -> usize {
        self.inner.local_streams.load(Ordering::Acquire)
            + self.inner.reserved.load(Ordering::Acquire)
    }

    pub fn view(&self) -> SessionView {
        let mut streams = {
            let table = self.inner.streams.lock();
            table
                .active
                .values()
                .chain(table.cache.values())
                .map(StreamView::new)
                .collect::<Vec<_>>()
        };
        streams.sort_by(|a, b| {
            a.monitor
                .created
                .cmp(&b.monitor.created)
                .then_with(|| a.id.cmp(&b.id))
        });
        SessionView {
            id: self.inner.id.clone(),
            role: self.inner.role,
            conn_info: self.conn_info(),
            monitor: self.monitor_info(),
            streams,
        }
    }

    /// Whether the stream with `id` is active and whether it is in the cache of closed streams.
    #[cfg(test)]
    pub(crate) fn stream_state(&self, id: &str) -> (bool, bool) {
        let table = self.inner.streams.lock();
        (
            table.active.values().any(|stream| stream.id() == id),
            table.cache.values().any(|stream| stream.id() == id),
        )
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionInner {
    /// Queue a message for the writer. Returns the encoded size.
    ///
    /// Messages that do not fit into a frame are rejected without affecting the session.
    pub fn send(&self, message: &WireMessage) -> Result<usize, Error> {
        let data = message.encode()?;
        if data.len() > self.max_message_size {
            return Err(Error::Frame(Arc::new(FrameError::TooLarge(data.len()))));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        tracing::trace!(
            header = %message.header,
            id = message.id,
            owner = ?message.owner,
            opcode = ?message.opcode,
            "send message"
        );
        let size = data.len();
        self.outgoing
            .unbounded_send(data)
            .map_err(|_| Error::SessionClosed)?;
        Ok(size)
    }

    /// Send a request and wait for the reply with the same id.
    async fn request(&self, message: WireMessage) -> Result<WireMessage, Error> {
        let id = message.id;
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, sender);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };
        self.send(&message)?;
        futures::select! {
            reply = receiver.fuse() => reply.map_err(|_| Error::SessionClosed),
            reason = self.cancel.cancelled().fuse() => Err(reason),
        }
    }

    async fn ping(&self) -> Result<Duration, Error> {
        let start = Instant::now();
        let id = self.ids.next();
        self.request(WireMessage::new("", id, Owner::Sender, Opcode::SessionPing))
            .await?;
        Ok(start.elapsed())
    }

    pub fn has_stream(&self, key: StreamKey) -> bool {
        let table = self.streams.lock();
        table.active.contains_key(&key) || table.cache.contains_key(&key)
    }

    pub fn insert_stream(&self, stream: &Stream) {
        let key = stream.key();
        if key.origin == Origin::Local {
            self.local_streams.fetch_add(1, Ordering::AcqRel);
        }
        self.streams.lock().active.insert(key, stream.clone());
    }

    /// Move a closed stream from the active streams to the cache.
    pub fn retire_stream(self: &Arc<Self>, stream: &Stream) {
        let key = stream.key();
        let mut table = self.streams.lock();
        if table.active.remove(&key).is_some() && key.origin == Origin::Local {
            self.local_streams.fetch_sub(1, Ordering::AcqRel);
        }
        let cache_time = match self.settings.cache_time {
            Some(cache_time) if !self.cancel.is_cancelled() => cache_time,
            _ => return,
        };
        table.cache.insert(key, stream.clone());
        drop(table);

        let session = Arc::downgrade(self);
        let stream = stream.clone();
        async_std::task::spawn(async move {
            async_std::task::sleep(cache_time).await;
            if let Some(session) = session.upgrade() {
                let mut table = session.streams.lock();
                if table.cache.get(&key).map_or(false, |cached| cached.ptr_eq(&stream)) {
                    table.cache.remove(&key);
                }
            }
        });
    }

    fn route_to_stream(&self, message: WireMessage, size: usize) {
        let key = StreamKey::incoming(&message);
        let stream = {
            let table = self.streams.lock();
            match table.active.get(&key) {
                Some(stream) => stream.clone(),
                None => {
                    if table.cache.contains_key(&key) {
                        tracing::trace!(
                            id = key.id,
                            opcode = ?message.opcode,
                            "message for closed stream"
                        );
                    } else {
                        tracing::debug!(
                            id = key.id,
                            opcode = ?message.opcode,
                            "message for unknown stream"
                        );
                    }
                    return;
                }
            }
        };
        if stream.header() != message.header {
            tracing::warn!(id = key.id, header = %message.header, "stream header mismatch");
            return;
        }
        stream.deliver(message, size);
    }

    fn dispatch(self: &Arc<Self>, message: WireMessage, size: usize) {
        tracing::trace!(
            header = %message.header,
            id = message.id,
            owner = ?message.owner,
            opcode = ?message.opcode,
            "received message"
        );
        match message.opcode {
            Opcode::SessionPing => {
                let pong = WireMessage::new(
                    message.header,
                    message.id,
                    Owner::Receiver,
                    Opcode::SessionPong,
                );
                if let Err(error) = self.send(&pong) {
                    tracing::trace!(?error, "failed to send pong");
                }
            }
            Opcode::SessionPong | Opcode::RpcResponse | Opcode::RpcFailure => {
                if message.owner != Owner::Receiver {
                    tracing::warn!(
                        id = message.id,
                        opcode = ?message.opcode,
                        "reply with invalid owner"
                    );
                    return;
                }
                match self.pending.remove(&message.id) {
                    Some(slot) => {
                        let _ = slot.send(message);
                    }
                    None => tracing::debug!(id = message.id, "reply for unknown request"),
                }
            }
            Opcode::RpcRequest => rpc::handle_request(self, message),
            Opcode::StreamOpenDuplex
            | Opcode::StreamOpenInitiatorWrites
            | Opcode::StreamOpenResponderWrites
            | Opcode::StreamOpenReverseRpc
                if message.owner == Owner::Sender =>
            {
                stream::accept(self, message)
            }
            Opcode::StreamOpenDuplex
            | Opcode::StreamOpenInitiatorWrites
            | Opcode::StreamOpenResponderWrites
            | Opcode::StreamOpenReverseRpc
            | Opcode::StreamClose
            | Opcode::StreamSendFromInitiator
            | Opcode::StreamSendFromResponder
            | Opcode::StreamFailure
            | Opcode::StreamPing => self.route_to_stream(message, size),
            Opcode::Unknown(opcode) => {
                tracing::trace!(opcode, "ignoring message with unknown opcode");
            }
        }
    }

    /// Close the session. `cause` is the error that ended the connection, if any.
    pub fn shutdown(&self, cause: Option<Error>) {
        if !self.gate.close() {
            return;
        }
        match cause {
            Some(error) => tracing::debug!(session = %self.id, ?error, "session failed"),
            None => tracing::debug!(session = %self.id, "session closed"),
        }
        let streams = {
            let table = self.streams.lock();
            table.active.values().cloned().collect::<Vec<_>>()
        };
        for stream in streams {
            stream.close_with(Error::SessionClosed, Closer::Session);
        }
        self.cancel.cancel(Error::SessionClosed);
        self.pending.clear();
        self.monitor.dead();
    }
}

/// Removes a result slot when the waiting call returns or is dropped.
struct PendingSlot<'a> {
    pending: &'a CHashMap<u32, oneshot::Sender<WireMessage>>,
    id: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn receive_loop<R: AsyncRead + Unpin>(session: Arc<SessionInner>, mut reader: FrameReader<R>) {
    let cause = loop {
        let frame = futures::select! {
            frame = reader.try_next().fuse() => frame,
            _ = session.cancel.cancelled().fuse() => break None,
        };
        match frame {
            Ok(Some(frame)) => {
                session.monitor.add_read(frame.len());
                match WireMessage::decode(&frame) {
                    Ok(message) => session.dispatch(message, frame.len()),
                    Err(error) => {
                        tracing::warn!(?error, "failed to decode message");
                        break Some(Error::from(error));
                    }
                }
            }
            Ok(None) => {
                tracing::debug!("connection closed by peer");
                break None;
            }
            Err(error) => break Some(Error::from(error)),
        }
    };
    session.shutdown(cause);
}

async fn write_loop<W: AsyncWrite + Unpin>(
    session: Arc<SessionInner>,
    mut writer: FrameWriter<W>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let result: Result<(), Error> = async {
        loop {
            let frame = futures::select! {
                frame = outgoing.next() => frame,
                _ = session.cancel.cancelled().fuse() => None,
            };
            match frame {
                Some(frame) => {
                    session.monitor.add_written(frame.len());
                    writer.send(frame).await?;
                }
                None => return Ok(()),
            }
        }
    }
    .await;
    if let Err(error) = result {
        session.shutdown(Some(error));
    }

    // Flush what was queued before the session closed, then close the connection.
    let flush = async {
        while let Ok(Some(frame)) = outgoing.try_next() {
            writer.feed(frame).await?;
        }
        writer.close().await
    };
    match async_std::future::timeout(FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::trace!(?error, "failed to flush session"),
        Err(_) => tracing::debug!("timed out flushing session"),
    }
}

async fn keep_alive(session: Arc<SessionInner>) {
    let interval = session.settings.keep_alive_interval;
    let mut ticker = async_std::stream::interval(interval);
    loop {
        futures::select! {
            _ = ticker.next().fuse() => {}
            _ = session.cancel.cancelled().fuse() => return,
        }
        match async_std::future::timeout(interval * 4, session.ping()).await {
            Ok(Ok(delay)) => session.monitor.record_delay(delay),
            Ok(Err(_)) => return,
            Err(_) => tracing::debug!("session ping timed out"),
        }
        session.monitor.record_speed();
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    sodiumoxide::randombytes::randombytes_into(&mut bytes);
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

#[cfg(test)]
mod test;
