//! Session oriented RPC and stream multiplexing over a single connection.
//!
//! After a handshake that negotiates encryption and exchanges [AuthInfo], two peers run a
//! [Session] over the connection. Either peer may call RPCs, open [streams][Stream] of four
//! kinds and serve [reverse RPC][ReverseRpc] calls nested in a stream. A [Client] can share a
//! small number of sessions between many calls.

pub mod auth;
pub mod cli;
mod client;
pub mod config;
pub mod crypto;
mod error;
mod frame;
mod handshake;
pub mod message;
mod payload;
mod reverse;
mod server;
mod service;
mod session;
mod share;
mod stream;
pub mod transport;
mod utils;
mod view;

#[cfg(test)]
mod test_utils;

pub use auth::{AuthInfo, ConnInfo};
pub use client::Client;
pub use config::{ClientConfig, ServerConfig, ShareDialer};
pub use crypto::CryptoOption;
pub use error::Error;
pub use payload::Payload;
pub use reverse::{ReverseRoutes, ReverseRpc};
pub use server::Server;
pub use service::{Request, Service};
pub use session::{Role, Session};
pub use share::ShareStreamClass;
pub use stream::{OpenOptions, Origin, Stream, StreamKind, StreamState};
pub use transport::{Connection, Dialer, Listener, TcpDialer};
pub use utils::{Cancel, MonitorInfo};
pub use view::{SessionView, StreamView};
