//! Cancellation token that carries the reason of the cancellation.
use futures::channel::oneshot;
use futures::future::{FutureExt as _, Shared};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::Error;

/// A cloneable cancellation token.
///
/// The first call to [Cancel::cancel] wins and stores its reason. All clones and all children
/// observe the cancellation. Children are cancelled with the reason of their parent.
#[derive(Clone)]
pub struct Cancel {
    inner: Arc<Inner>,
}

struct Inner {
    reason: Mutex<Option<Error>>,
    trigger: Mutex<Option<oneshot::Sender<()>>>,
    done: Shared<oneshot::Receiver<()>>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancel {
    pub fn new() -> Self {
        let (trigger, done) = oneshot::channel();
        Self {
            inner: Arc::new(Inner {
                reason: Mutex::new(None),
                trigger: Mutex::new(Some(trigger)),
                done: done.shared(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a token that is cancelled when `self` is cancelled.
    pub fn child(&self) -> Self {
        Self::child_of(&[self])
    }

    /// Create a token that is cancelled when any of `parents` is cancelled.
    pub fn child_of(parents: &[&Cancel]) -> Self {
        let child = Self::new();
        for parent in parents {
            parent.adopt(&child);
        }
        child
    }

    fn adopt(&self, child: &Cancel) {
        {
            let mut children = self.inner.children.lock();
            if self.inner.reason.lock().is_none() {
                children.retain(|child| child.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
                return;
            }
        }
        if let Some(reason) = self.reason() {
            child.cancel(reason);
        }
    }

    /// Cancel the token. Returns `false` if the token was already cancelled.
    pub fn cancel(&self, reason: Error) -> bool {
        {
            let mut current = self.inner.reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
        }
        if let Some(trigger) = self.inner.trigger.lock().take() {
            let _ = trigger.send(());
        }
        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            Cancel { inner: child }.cancel(reason.clone());
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<Error> {
        self.inner.reason.lock().clone()
    }

    /// Wait until the token is cancelled and return the reason.
    pub async fn cancelled(&self) -> Error {
        let _ = self.inner.done.clone().await;
        self.reason().unwrap_or(Error::StreamClosed)
    }
}

impl std::fmt::Debug for Cancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancel")
            .field("reason", &self.reason())
            .finish()
    }
}
