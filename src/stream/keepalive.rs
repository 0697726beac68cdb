use futures::prelude::*;
use std::time::{Duration, Instant};

use super::{Closer, Stream};
use crate::message::Opcode;
use crate::Error;

/// Number of ping periods without a ping from the peer after which the stream is closed.
const TIMEOUT_PERIODS: u32 = 4;

/// Ping the peer every `period` and close the stream when the peer has not pinged for four
/// periods or when the stream is cancelled.
pub(crate) async fn keepalive(stream: Stream, period: Duration) {
    let pings = stream.pings();
    let mut ticker = async_std::stream::interval(period);
    let mut deadline = Instant::now() + period * TIMEOUT_PERIODS;
    loop {
        let timeout = async_std::task::sleep(deadline.saturating_duration_since(Instant::now()));
        futures::select! {
            _ = ticker.next().fuse() => {
                if let Err(error) = stream.send_message(Opcode::StreamPing, None) {
                    tracing::debug!(?error, "failed to send stream ping");
                    let reason = stream.cancel().reason().unwrap_or(error);
                    stream.close_with(reason, Closer::Session);
                    return;
                }
                stream.record_keepalive(session_delay(&stream));
            }
            ping = pings.recv().fuse() => {
                if ping.is_ok() {
                    deadline = Instant::now() + period * TIMEOUT_PERIODS;
                }
            }
            _ = timeout.fuse() => {
                tracing::debug!(stream = %stream.id(), "stream ping timeout");
                stream.close_with(Error::PingTimeout, Closer::Local);
                return;
            }
            reason = stream.cancel().cancelled().fuse() => {
                stream.close_with(reason, Closer::Local);
                return;
            }
        }
    }
}

fn session_delay(stream: &Stream) -> Duration {
    stream
        .inner
        .session
        .upgrade()
        .map_or(Duration::from_secs(0), |session| session.monitor.delay())
}
