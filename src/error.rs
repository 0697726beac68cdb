use std::sync::Arc;

/// Errors returned by sessions, streams and the share pool.
///
/// The error is cheap to clone so that a single terminal reason can be handed to every task
/// waiting on a closed session or stream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A wire message header exceeds 255 bytes
    #[error("header must be less than or equal to 255 bytes, got {0}")]
    HeaderTooLong(usize),

    /// Received bytes are not a valid wire message
    #[error("failed to decode wire message")]
    Decode(#[from] crate::message::DecodeError),

    #[error("I/O error")]
    Io(#[source] Arc<std::io::Error>),

    #[error("failed to read or write frame")]
    Frame(#[source] Arc<crate::frame::FrameError>),

    #[error("cipher failure")]
    Cipher(#[from] crate::crypto::CipherError),

    #[error("failed to encode or decode JSON")]
    Json(#[source] Arc<serde_json::Error>),

    /// Client and server have no crypto option in common
    #[error("there is no supported crypto")]
    NoSupportedCrypto,

    /// The peer's auth info was rejected
    #[error("auth verification failed")]
    AuthVerificationFailed,

    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer violated the handshake protocol
    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    /// The operation is not permitted by the kind of stream
    #[error("stream invalid action")]
    StreamInvalidAction,

    #[error("stream closed")]
    StreamClosed,

    /// No handler is registered for the header
    #[error("invalid call: {0}")]
    InvalidCall(String),

    /// Failure reported by the peer
    #[error("{0}")]
    Remote(String),

    /// The peer did not answer stream pings in time
    #[error("stream ping timeout")]
    PingTimeout,

    /// Bind was called but the peer did not send a payload
    #[error("no data")]
    NoData,

    #[error("session closed")]
    SessionClosed,

    #[error("client closed")]
    ClientClosed,

    #[error("server closed")]
    ServerClosed,

    #[error("server is already running")]
    ServerRunning,

    #[error("reverse rpc closed")]
    ReverseRpcClosed,

    /// A share pool operation was used without a configured dialer
    #[error("share pool requires a dialer")]
    NoShareDialer,

    #[error("invalid share stream class {0:?}")]
    InvalidShareClass(String),

    #[error("duplicate share stream class {0:?}")]
    DuplicateShareClass(String),

    #[error("share pool failed to dial a session")]
    ShareDialFailed(#[source] Box<Error>),
}

impl Error {
    /// Error reported to the peer when a handler fails.
    pub(crate) fn from_handler(error: anyhow::Error) -> Self {
        Self::Remote(format!("{:#}", error))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl From<crate::frame::FrameError> for Error {
    fn from(error: crate::frame::FrameError) -> Self {
        Self::Frame(Arc::new(error))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(Arc::new(error))
    }
}
