//! Client and server configuration
//!
//! Durations below their minimum are replaced by the defaults when a [crate::Client] or
//! [crate::Server] is created.
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthInfo;
use crate::crypto::CryptoOption;
use crate::share::ShareStreamClass;
use crate::transport::Dialer;
use crate::Error;

pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MIN_STREAM_PING_INTERVAL: Duration = Duration::from_secs(5);
/// `cache_time` values up to this duration disable the cache of closed streams.
pub const MIN_CACHE_TIME: Duration = Duration::from_secs(1);

/// Validates the auth info a client sends during the handshake. The returned info is sent back
/// to the client.
pub type SessionAuthCallback = Arc<dyn Fn(&AuthInfo) -> Result<AuthInfo, Error> + Send + Sync>;

/// Validates the auth info sent with a stream open. Receives the stream header. The returned
/// info is sent back to the opener.
pub type StreamAuthCallback =
    Arc<dyn Fn(&str, &AuthInfo) -> Result<AuthInfo, Error> + Send + Sync>;

#[derive(Clone)]
pub struct ClientConfig {
    /// Period of session pings that measure the round trip delay.
    pub keep_alive_interval: Duration,
    pub handshake_timeout: Duration,
    pub stream_ping_interval: Duration,
    /// How long closed streams and sessions are remembered to absorb late messages.
    pub cache_time: Duration,
    pub crypto_options: Vec<CryptoOption>,
    /// Sent to the server during the handshake.
    pub auth_info: AuthInfo,
    /// Used by the share pool to open new sessions.
    pub share_dialer: Option<ShareDialer>,
    pub share_stream_classes: Vec<ShareStreamClass>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stream_ping_interval: MIN_STREAM_PING_INTERVAL,
            cache_time: Duration::from_secs(0),
            crypto_options: Vec::new(),
            auth_info: AuthInfo::new(),
            share_dialer: None,
            share_stream_classes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("stream_ping_interval", &self.stream_ping_interval)
            .field("cache_time", &self.cache_time)
            .field("crypto_options", &self.crypto_options)
            .field("auth_info", &self.auth_info)
            .field("share_dialer", &self.share_dialer)
            .field("share_stream_classes", &self.share_stream_classes)
            .finish()
    }
}

impl ClientConfig {
    pub(crate) fn normalize(mut self) -> Self {
        self.keep_alive_interval = normalize_keep_alive(self.keep_alive_interval);
        self.handshake_timeout = normalize_handshake_timeout(self.handshake_timeout);
        self.stream_ping_interval = normalize_stream_ping(self.stream_ping_interval);
        self.crypto_options = crate::crypto::normalize_options(self.crypto_options);
        self
    }

    pub(crate) fn settings(&self) -> SessionSettings {
        SessionSettings {
            keep_alive_interval: self.keep_alive_interval,
            stream_ping_interval: self.stream_ping_interval,
            cache_time: normalize_cache_time(self.cache_time),
            stream_auth: None,
        }
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    pub keep_alive_interval: Duration,
    pub handshake_timeout: Duration,
    pub stream_ping_interval: Duration,
    pub cache_time: Duration,
    pub crypto_options: Vec<CryptoOption>,
    /// Sent to clients if there is no `session_auth` callback.
    pub auth_info: AuthInfo,
    pub session_auth: Option<SessionAuthCallback>,
    pub stream_auth: Option<StreamAuthCallback>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stream_ping_interval: MIN_STREAM_PING_INTERVAL,
            cache_time: Duration::from_secs(0),
            crypto_options: Vec::new(),
            auth_info: AuthInfo::new(),
            session_auth: None,
            stream_auth: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("stream_ping_interval", &self.stream_ping_interval)
            .field("cache_time", &self.cache_time)
            .field("crypto_options", &self.crypto_options)
            .field("auth_info", &self.auth_info)
            .field("session_auth", &self.session_auth.is_some())
            .field("stream_auth", &self.stream_auth.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub(crate) fn normalize(mut self) -> Self {
        self.keep_alive_interval = normalize_keep_alive(self.keep_alive_interval);
        self.handshake_timeout = normalize_handshake_timeout(self.handshake_timeout);
        self.stream_ping_interval = normalize_stream_ping(self.stream_ping_interval);
        self.crypto_options = crate::crypto::normalize_options(self.crypto_options);
        self
    }

    pub(crate) fn settings(&self) -> SessionSettings {
        SessionSettings {
            keep_alive_interval: self.keep_alive_interval,
            stream_ping_interval: self.stream_ping_interval,
            cache_time: normalize_cache_time(self.cache_time),
            stream_auth: self.stream_auth.clone(),
        }
    }
}

/// Where the share pool dials new sessions.
#[derive(Clone)]
pub struct ShareDialer {
    pub dialer: Arc<dyn Dialer>,
    pub network: String,
    pub address: String,
}

impl ShareDialer {
    pub fn new(dialer: impl Dialer + 'static, network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            dialer: Arc::new(dialer),
            network: network.into(),
            address: address.into(),
        }
    }
}

impl std::fmt::Debug for ShareDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareDialer")
            .field("network", &self.network)
            .field("address", &self.address)
            .finish()
    }
}

/// Settings a running session needs.
#[derive(Clone)]
pub(crate) struct SessionSettings {
    pub keep_alive_interval: Duration,
    pub stream_ping_interval: Duration,
    pub cache_time: Option<Duration>,
    pub stream_auth: Option<StreamAuthCallback>,
}

fn normalize_keep_alive(interval: Duration) -> Duration {
    if interval < Duration::from_secs(1) {
        DEFAULT_KEEP_ALIVE_INTERVAL
    } else {
        interval
    }
}

fn normalize_handshake_timeout(timeout: Duration) -> Duration {
    if timeout < Duration::from_secs(1) {
        DEFAULT_HANDSHAKE_TIMEOUT
    } else {
        timeout
    }
}

fn normalize_stream_ping(interval: Duration) -> Duration {
    std::cmp::max(interval, MIN_STREAM_PING_INTERVAL)
}

fn normalize_cache_time(cache_time: Duration) -> Option<Duration> {
    if cache_time > MIN_CACHE_TIME {
        Some(cache_time)
    } else {
        None
    }
}
