use std::sync::atomic::{AtomicBool, Ordering};

/// Single-fire guard for teardown code.
#[derive(Debug, Default)]
pub struct CloseGate {
    closed: AtomicBool,
}

impl CloseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once, for the first caller.
    pub fn close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
