//! Serialisable snapshots of sessions and their streams
use serde::Serialize;

use crate::auth::ConnInfo;
use crate::session::{Role, Session};
use crate::stream::{Origin, Stream, StreamState};
use crate::utils::MonitorInfo;

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub role: Role,
    pub conn_info: ConnInfo,
    pub monitor: MonitorInfo,
    /// Active streams and closed streams that are still cached, ordered by creation.
    pub streams: Vec<StreamView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamView {
    pub id: String,
    pub header: String,
    pub kind: &'static str,
    pub origin: Origin,
    pub state: StreamState,
    pub monitor: MonitorInfo,
}

impl StreamView {
    pub(crate) fn new(stream: &Stream) -> Self {
        Self {
            id: stream.id(),
            header: stream.header().to_string(),
            kind: stream.kind().name(),
            origin: stream.origin(),
            state: stream.state(),
            monitor: stream.monitor_info(),
        }
    }
}

/// Views of `sessions` ordered by creation time.
pub(crate) fn session_views(sessions: &[Session]) -> Vec<SessionView> {
    let mut views = sessions.iter().map(Session::view).collect::<Vec<_>>();
    views.sort_by(|a, b| {
        a.monitor
            .created
            .cmp(&b.monitor.created)
            .then_with(|| a.id.cmp(&b.id))
    });
    views
}
