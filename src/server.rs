//! Server that accepts connections and runs a session on each of them
use futures::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing_futures::Instrument as _;

use crate::config::ServerConfig;
use crate::handshake;
use crate::service::Service;
use crate::session::{Role, Session};
use crate::transport::{Connection, Listener};
use crate::utils::{Cancel, CloseGate};
use crate::view::SessionView;
use crate::Error;

/// Serves a [Service] to every client that connects.
///
/// Cloning the server returns another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    service: Arc<Service>,
    cancel: Cancel,
    gate: CloseGate,
    running: AtomicBool,
    sessions: Mutex<HashMap<String, Session>>,
}

/// Clears the running flag when [Server::serve] returns.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Server {
    pub fn new(config: ServerConfig, service: Service) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config: config.normalize(),
                service: Arc::new(service),
                cancel: Cancel::new(),
                gate: CloseGate::new(),
                running: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Accept connections from `listener` until the server is closed.
    ///
    /// Returns [Error::ServerClosed] once [Server::close] is called and [Error::ServerRunning] if
    /// another call is still serving.
    pub async fn serve(&self, listener: impl Listener) -> Result<(), Error> {
        if self.inner.gate.is_closed() {
            return Err(Error::ServerClosed);
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ServerRunning);
        }
        let _running = Running(&self.inner.running);

        loop {
            let conn = futures::select! {
                conn = listener.accept().fuse() => conn,
                _ = self.inner.cancel.cancelled().fuse() => return Err(Error::ServerClosed),
            };
            let conn = match conn {
                Ok(conn) => conn,
                Err(error) => {
                    if self.inner.gate.is_closed() {
                        return Err(Error::ServerClosed);
                    }
                    tracing::warn!(%error, "failed to accept connection");
                    return Err(error.into());
                }
            };
            let peer = conn.peer_address();
            tracing::debug!(?peer, "accepted connection");
            let server = self.clone();
            async_std::task::spawn(
                async move {
                    if let Err(error) = server.serve_conn(conn).await {
                        tracing::debug!(%error, "connection failed");
                    }
                }
                .instrument(tracing::debug_span!("connection", ?peer)),
            );
        }
    }

    /// Run the handshake on `conn` and start a session that serves it.
    pub async fn serve_conn(&self, conn: impl Connection) -> Result<Session, Error> {
        if self.inner.gate.is_closed() {
            return Err(Error::ServerClosed);
        }
        let config = &self.inner.config;
        let established = handshake::Server {
            crypto_options: &config.crypto_options,
            auth_info: &config.auth_info,
            session_auth: config.session_auth.as_ref(),
            timeout: config.handshake_timeout,
        }
        .accept(conn)
        .await?;
        let session = Session::start(
            established,
            Role::Server,
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
            return Err(Error::ServerClosed);
        }
        tracing::debug!(session = session.id(), "session started");
        self.forget_when_closed(&session);
        Ok(session)
    }

    fn forget_when_closed(&self, session: &Session) {
        let server = Arc::downgrade(&self.inner);
        let session = session.clone();
        let cache_time = self.inner.config.settings().cache_time;
        async_std::task::spawn(async move {
            session.closed().await;
            if let Some(cache_time) = cache_time {
                async_std::task::sleep(cache_time).await;
            }
            if let Some(server) = Weak::upgrade(&server) {
                server.sessions.lock().remove(session.id());
            }
        });
    }

    /// Stop serving and close every session. Calling this more than once has no effect.
    pub fn close(&self) {
        if !self.inner.gate.close() {
            return;
        }
        tracing::debug!("closing server");
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
        self.inner.cancel.cancel(Error::ServerClosed);
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

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.inner.sessions.lock().len())
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .field("closed", &self.is_closed())
            .finish()
    }
}
