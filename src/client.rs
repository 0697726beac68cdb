//! Client that connects sessions to a server
use futures::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing_futures::Instrument as _;

use crate::config::ClientConfig;
use crate::handshake;
use crate::payload::Payload;
use crate::reverse::ReverseRoutes;
use crate::service::Service;
use crate::session::{Role, Session};
use crate::share::{self, SharePool};
use crate::stream::{OpenOptions, Stream};
use crate::transport::{Connection, Dialer};
use crate::utils::{Cancel, CloseGate};
use crate::view::SessionView;
use crate::Error;

/// Connects sessions and optionally shares them between calls.
///
/// Cloning the client returns another handle to the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    service: Arc<Service>,
    cancel: Cancel,
    gate: CloseGate,
    sessions: Mutex<HashMap<String, Session>>,
    share: Option<SharePool>,
}

/// Handle that does not keep the client alive.
#[derive(Clone)]
pub(crate) struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        Self::with_service(config, Service::new())
    }

    /// Create a client whose sessions serve `service` to the server.
    pub fn with_service(config: ClientConfig, service: Service) -> Result<Self, Error> {
        let config = config.normalize();
        let classes = share::class_table(&config.share_stream_classes)?;
        let share = config
            .share_dialer
            .as_ref()
            .map(|_| SharePool::new(classes));
        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                service: Arc::new(service),
                cancel: Cancel::new(),
                gate: CloseGate::new(),
                sessions: Mutex::new(HashMap::new()),
                share,
            }),
        };
        if client.inner.share.is_some() {
            async_std::task::spawn(
                share::reap(client.downgrade(), client.inner.cancel.clone())
                    .instrument(tracing::debug_span!("share_pool")),
            );
        }
        Ok(client)
    }

    pub(crate) fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn share_pool(&self) -> Result<&SharePool, Error> {
        self.inner.share.as_ref().ok_or(Error::NoShareDialer)
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.inner.gate.is_closed() {
            Err(Error::ClientClosed)
        } else {
            Ok(())
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Dial `address` and start a session on the connection.
    pub async fn dial(
        &self,
        dialer: &dyn Dialer,
        network: &str,
        address: &str,
    ) -> Result<Session, Error> {
        self.check_open()?;
        let conn = dialer.dial(network, address).await?;
        self.connect(conn).await
    }

    /// Run the handshake on `conn` and start a session.
    pub async fn connect(&self, conn: impl Connection) -> Result<Session, Error> {
        self.check_open()?;
        let config = &self.inner.config;
        let established = handshake::Client {
            crypto_options: &config.crypto_options,
            auth_info: config.auth_info.clone(),
            timeout: config.handshake_timeout,
        }
        .connect(conn)
        .await?;
        let session = Session::start(
            established,
            Role::Client,
            self.inner.service.clone(),
            config.settings(),
            &self.inner.cancel,
        );
        self.inner
            .sessions
            .lock()
            .insert(session.id().to_string(), session.clone());
        if self.inner.gate.is_closed() {
            session.close();
            return Err(Error::ClientClosed);
        }
        self.forget_when_closed(&session);
        Ok(session)
    }

    /// Remove `session` from the session table once it is closed and its cache time passed.
    fn forget_when_closed(&self, session: &Session) {
        let client = self.downgrade();
        let session = session.clone();
        let cache_time = self.inner.config.settings().cache_time;
        async_std::task::spawn(async move {
            session.closed().await;
            if let Some(cache_time) = cache_time {
                async_std::task::sleep(cache_time).await;
            }
            if let Some(client) = client.upgrade() {
                client.inner.sessions.lock().remove(session.id());
            }
        });
    }

    /// Dial a session for the share pool, giving up when `cancel` or the client is cancelled.
    pub(crate) async fn share_dial(&self, cancel: Option<&Cancel>) -> Result<Session, Error> {
        self.check_open()?;
        let share_dialer = self
            .inner
            .config
            .share_dialer
            .as_ref()
            .ok_or(Error::NoShareDialer)?;
        let dial = async {
            let conn = share_dialer
                .dialer
                .dial(&share_dialer.network, &share_dialer.address)
                .await?;
            self.connect(conn).await
        };
        let caller_cancelled = match cancel {
            Some(cancel) => cancel.cancelled().boxed(),
            None => future::pending().boxed(),
        };
        futures::select! {
            result = dial.fuse() => result.map_err(|error| match error {
                Error::ClientClosed => Error::ClientClosed,
                error => Error::ShareDialFailed(Box::new(error)),
            }),
            reason = caller_cancelled.fuse() => Err(reason),
            _ = self.inner.cancel.cancelled().fuse() => Err(Error::ClientClosed),
        }
    }

    /// Call `header` on one of the shared RPC sessions.
    pub async fn share_rpc(&self, header: &str, payload: impl Into<Payload>) -> Result<Payload, Error> {
        let session = self.share_pool()?.rpc_session(self, None).await?;
        session.rpc(header, payload).await
    }

    pub async fn share_json_rpc<Req, Resp>(&self, header: &str, request: &Req) -> Result<Resp, Error>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let session = self.share_pool()?.rpc_session(self, None).await?;
        session.json_rpc(header, request).await
    }

    /// Open a full duplex stream on a shared session.
    pub async fn share_stream(&self, header: &str, options: OpenOptions) -> Result<Stream, Error> {
        let pool = self.share_pool()?;
        let reservation = pool.stream_session(self, &options).await?;
        let stream = reservation.session().stream(header, options).await;
        self.finish_open(pool, reservation, stream)
    }

    pub async fn share_send_stream(&self, header: &str, options: OpenOptions) -> Result<Stream, Error> {
        let pool = self.share_pool()?;
        let reservation = pool.stream_session(self, &options).await?;
        let stream = reservation.session().send_stream(header, options).await;
        self.finish_open(pool, reservation, stream)
    }

    pub async fn share_recv_stream(
        &self,
        header: &str,
        payload: impl Into<Option<Payload>>,
        options: OpenOptions,
    ) -> Result<Stream, Error> {
        let pool = self.share_pool()?;
        let reservation = pool.stream_session(self, &options).await?;
        let stream = reservation
            .session()
            .recv_stream(header, payload, options)
            .await;
        self.finish_open(pool, reservation, stream)
    }

    /// Serve `routes` on a reverse RPC stream of a shared session until the stream closes.
    pub async fn share_reverse_rpc(
        &self,
        header: &str,
        payload: impl Into<Option<Payload>>,
        routes: ReverseRoutes,
        options: OpenOptions,
    ) -> Result<(), Error> {
        let pool = self.share_pool()?;
        let reservation = pool.stream_session(self, &options).await?;
        let stream = reservation
            .session()
            .open_reverse_stream(header, payload.into(), options)
            .await;
        let stream = self.finish_open(pool, reservation, stream)?;
        crate::reverse::serve(stream, routes).await
    }

    fn finish_open(
        &self,
        pool: &SharePool,
        reservation: share::Reservation,
        stream: Result<Stream, Error>,
    ) -> Result<Stream, Error> {
        match &stream {
            Ok(stream) => pool.close_when_done(&reservation, stream),
            Err(_) if reservation.exclusive() => {
                reservation.session().close();
                pool.request_check();
            }
            Err(_) => {}
        }
        stream
    }

    /// Close every session and the share pool. Calling this more than once has no effect.
    pub fn close(&self) {
        if !self.inner.gate.close() {
            return;
        }
        tracing::debug!("closing client");
        let sessions = self
            .inner
            .sessions
            .lock()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for session in sessions {
            session.close();
        }
        self.inner.cancel.cancel(Error::ClientClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.gate.is_closed()
    }

    /// Views of all sessions, including closed sessions within their cache time.
    pub fn session_views(&self) -> Vec<SessionView> {
        let sessions = self
            .inner
            .sessions
            .lock()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        crate::view::session_views(&sessions)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("sessions", &self.inner.sessions.lock().len())
            .field("share", &self.inner.share.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
