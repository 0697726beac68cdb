//! Client side pool that shares sessions between calls and streams
//!
//! RPCs alternate between two sessions. Streams are placed on the least loaded session of a
//! compatible [ShareStreamClass], and a new session is dialed when none has room. A background
//! reaper replaces dead RPC sessions, closes sessions nobody needs any more and keeps the
//! configured number of idle sessions warm.
use futures::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::{Client, WeakClient};
use crate::session::Session;
use crate::stream::{OpenOptions, Stream};
use crate::utils::Cancel;
use crate::Error;

/// Name of the class used when a call does not name one.
pub const DEFAULT_CLASS: &str = "";

/// Name of the class that gives every stream its own session.
pub const NOT_SHARED_CLASS: &str = "not_shared";

const REAP_INTERVAL: Duration = Duration::from_secs(15);

/// Sessions without streams for longer than this are closed unless they are needed to keep the
/// idle target of their class.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How streams are placed on pooled sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareStreamClass {
    pub name: String,
    /// Sessions may be shared with other mixing classes of the same `max`.
    pub mix: bool,
    /// Maximum number of streams per session. Values below 1 give every stream its own session.
    pub max: usize,
    /// Number of idle sessions kept open for this class.
    pub idle: usize,
}

impl ShareStreamClass {
    pub fn new(name: impl Into<String>, mix: bool, max: usize, idle: usize) -> Self {
        Self {
            name: name.into(),
            mix,
            max,
            idle,
        }
    }

    /// A class for a single call. Its sessions are only reused by other calls if `mix` is set.
    pub fn temporary(mix: bool, max: usize) -> Self {
        Self::new("_", mix, max, 0)
    }

    fn default_class() -> Self {
        Self::new(DEFAULT_CLASS, true, 256, 0)
    }

    fn not_shared() -> Self {
        Self::new(NOT_SHARED_CLASS, false, 0, 0)
    }
}

/// Register `classes` together with the built-in classes, unless they are overridden.
pub(crate) fn class_table(
    classes: &[ShareStreamClass],
) -> Result<HashMap<String, Arc<ShareStreamClass>>, Error> {
    let mut table = HashMap::with_capacity(classes.len() + 2);
    for class in classes {
        if table
            .insert(class.name.clone(), Arc::new(class.clone()))
            .is_some()
        {
            return Err(Error::DuplicateShareClass(class.name.clone()));
        }
    }
    table
        .entry(DEFAULT_CLASS.to_string())
        .or_insert_with(|| Arc::new(ShareStreamClass::default_class()));
    table
        .entry(NOT_SHARED_CLASS.to_string())
        .or_insert_with(|| Arc::new(ShareStreamClass::not_shared()));
    Ok(table)
}

struct PooledSession {
    session: Session,
    class: Arc<ShareStreamClass>,
    last_used: Instant,
}

impl PooledSession {
    fn accepts(&self, class: &Arc<ShareStreamClass>) -> bool {
        Arc::ptr_eq(&self.class, class)
            || (self.class.mix && class.mix && self.class.max == class.max)
    }
}

#[derive(Default)]
struct RpcSlots {
    flip: bool,
    slots: [Option<Session>; 2],
}

/// Identity of a class. Temporary classes with equal fields are still distinct.
fn class_key(class: &Arc<ShareStreamClass>) -> usize {
    Arc::as_ptr(class) as usize
}

fn alive(slot: &Option<Session>) -> Option<Session> {
    slot.as_ref().filter(|session| !session.is_closed()).cloned()
}

/// Counts as load on a pooled session until the stream it was taken for is open.
pub(crate) struct Reservation {
    session: Session,
    class: Arc<ShareStreamClass>,
}

impl Reservation {
    fn new(session: Session, class: Arc<ShareStreamClass>) -> Self {
        session.inner.reserved.fetch_add(1, Ordering::AcqRel);
        Self { session, class }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether the session must be closed once the stream is done.
    pub fn exclusive(&self) -> bool {
        self.class.max < 1
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.session.inner.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct SharePool {
    classes: HashMap<String, Arc<ShareStreamClass>>,
    rpc: async_std::sync::Mutex<RpcSlots>,
    sessions: async_std::sync::Mutex<Vec<PooledSession>>,
    refill_sender: async_std::channel::Sender<()>,
    refill: async_std::channel::Receiver<()>,
    /// `None` asks for a check, `Some(class)` for an additional idle session of `class`.
    check_sender: async_std::channel::Sender<Option<Arc<ShareStreamClass>>>,
    check: async_std::channel::Receiver<Option<Arc<ShareStreamClass>>>,
}

impl SharePool {
    pub fn new(classes: HashMap<String, Arc<ShareStreamClass>>) -> Self {
        let (refill_sender, refill) = async_std::channel::bounded(1);
        let (check_sender, check) = async_std::channel::bounded(1);
        Self {
            classes,
            rpc: async_std::sync::Mutex::new(RpcSlots::default()),
            sessions: async_std::sync::Mutex::new(Vec::new()),
            refill_sender,
            refill,
            check_sender,
            check,
        }
    }

    fn class_for(&self, options: &OpenOptions) -> Result<Arc<ShareStreamClass>, Error> {
        match (&options.class, &options.temporary_class) {
            (Some(name), _) => self
                .classes
                .get(name)
                .cloned()
                .ok_or_else(|| Error::InvalidShareClass(name.clone())),
            (None, Some(class)) => Ok(Arc::new(class.clone())),
            (None, None) => self
                .classes
                .get(DEFAULT_CLASS)
                .cloned()
                .ok_or_else(|| Error::InvalidShareClass(DEFAULT_CLASS.to_string())),
        }
    }

    /// Session for the next RPC.
    pub async fn rpc_session(&self, client: &Client, cancel: Option<&Cancel>) -> Result<Session, Error> {
        let mut slots = self.rpc.lock().await;
        let (first, second) = if slots.flip { (1, 0) } else { (0, 1) };
        slots.flip = !slots.flip;
        if let Some(session) = alive(&slots.slots[first]) {
            return Ok(session);
        }
        let _ = self.refill_sender.try_send(());
        if let Some(session) = alive(&slots.slots[second]) {
            return Ok(session);
        }
        let session = client.share_dial(cancel).await?;
        slots.slots[second] = Some(session.clone());
        Ok(session)
    }

    /// Pick or dial a session for a new stream.
    pub async fn stream_session(
        &self,
        client: &Client,
        options: &OpenOptions,
    ) -> Result<Reservation, Error> {
        let class = self.class_for(options)?;
        let mut sessions = self.sessions.lock().await;
        if class.max > 0 {
            sessions.sort_by_key(|pooled| pooled.session.load());
            let found = sessions.iter_mut().find(|pooled| {
                !pooled.session.is_closed()
                    && pooled.accepts(&class)
                    && pooled.session.load() < class.max
            });
            if let Some(pooled) = found {
                pooled.last_used = Instant::now();
                let reservation = Reservation::new(pooled.session.clone(), class);
                drop(sessions);
                self.request_check();
                return Ok(reservation);
            }
        }

        let session = client.share_dial(options.cancel.as_ref()).await?;
        tracing::debug!(session = %session.id(), class = %class.name, "dialed share session");
        let reservation = Reservation::new(session.clone(), class.clone());
        sessions.push(PooledSession {
            session,
            class,
            last_used: Instant::now(),
        });
        drop(sessions);
        self.request_check();
        Ok(reservation)
    }

    /// Close the session of an exclusive reservation once `stream` is closed.
    pub fn close_when_done(&self, reservation: &Reservation, stream: &Stream) {
        if !reservation.exclusive() {
            return;
        }
        let session = reservation.session.clone();
        let stream = stream.clone();
        let check_sender = self.check_sender.clone();
        async_std::task::spawn(async move {
            let _ = stream.cancel().cancelled().await;
            session.close();
            let _ = check_sender.try_send(None);
        });
    }

    pub fn request_check(&self) {
        let _ = self.check_sender.try_send(None);
    }

    async fn refill_rpc(&self, client: &Client) {
        for index in 0..2 {
            if alive(&self.rpc.lock().await.slots[index]).is_some() {
                continue;
            }
            let session = match client.share_dial(None).await {
                Ok(session) => session,
                Err(error) => {
                    tracing::debug!(?error, "failed to refill rpc session");
                    return;
                }
            };
            let mut slots = self.rpc.lock().await;
            if alive(&slots.slots[index]).is_none() {
                slots.slots[index] = Some(session);
            } else {
                session.close();
            }
        }
    }

    async fn check_streams(&self, client: &Client, dial_for: Option<Arc<ShareStreamClass>>) {
        let dialed = match dial_for {
            Some(class) => match client.share_dial(None).await {
                Ok(session) => Some(PooledSession {
                    session,
                    class,
                    last_used: Instant::now(),
                }),
                Err(error) => {
                    tracing::debug!(?error, "failed to dial idle session");
                    return;
                }
            },
            None => None,
        };

        let mut sessions = self.sessions.lock().await;
        sessions.extend(dialed);
        let mut idle_budget = self
            .classes
            .values()
            .map(|class| (class_key(class), class.idle))
            .collect::<HashMap<_, _>>();
        let now = Instant::now();
        sessions.retain(|pooled| {
            if pooled.session.is_closed() {
                return false;
            }
            if pooled.session.load() > 0 {
                return true;
            }
            if pooled.class.max < 1 {
                pooled.session.close();
                return false;
            }
            let budget = idle_budget.entry(class_key(&pooled.class)).or_insert(0);
            if *budget > 0 {
                *budget -= 1;
                return true;
            }
            if now.duration_since(pooled.last_used) > IDLE_TIMEOUT {
                tracing::debug!(session = %pooled.session.id(), class = %pooled.class.name, "closing idle share session");
                pooled.session.close();
                return false;
            }
            true
        });
        drop(sessions);

        let below_target = self.classes.values().find(|class| {
            idle_budget
                .get(&class_key(class))
                .map_or(false, |budget| *budget > 0)
        });
        if let Some(class) = below_target {
            let _ = self.check_sender.try_send(Some(class.clone()));
        }
    }

    #[cfg(test)]
    pub(crate) async fn session_loads(&self) -> Vec<usize> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .filter(|pooled| !pooled.session.is_closed())
            .map(|pooled| pooled.session.load())
            .collect()
    }
}

/// Background task of the pool. Ends when the client closes or is dropped.
pub(crate) async fn reap(client: WeakClient, cancel: Cancel) {
    let receivers = client.upgrade().and_then(|client| {
        let pool = client.share_pool().ok()?;
        Some((pool.refill.clone(), pool.check.clone()))
    });
    let (refill, check) = match receivers {
        Some(receivers) => receivers,
        None => return,
    };
    let mut ticker = async_std::stream::interval(REAP_INTERVAL);
    loop {
        let dial_for = futures::select! {
            _ = ticker.next().fuse() => Some(None),
            _ = refill.recv().fuse() => None,
            class = check.recv().fuse() => Some(class.ok().flatten()),
            _ = cancel.cancelled().fuse() => return,
        };
        let client = match client.upgrade() {
            Some(client) => client,
            None => return,
        };
        let pool = match client.share_pool() {
            Ok(pool) => pool,
            Err(_) => return,
        };
        match dial_for {
            Some(class) => pool.check_streams(&client, class).await,
            None => pool.refill_rpc(&client).await,
        }
    }
}
