//! Key-value information exchanged when a session or a stream is opened
use std::collections::BTreeMap;

use crate::transport::Connection;
use crate::Error;

/// Key under which a session stores its id.
pub const SESSION_ID: &str = "session_id";

const CLIENT_NETWORK: &str = "conn.client.network";
const CLIENT_LOCAL_ADDRESS: &str = "conn.client.local_address";
const CLIENT_REMOTE_ADDRESS: &str = "conn.client.remote_address";
const SERVER_NETWORK: &str = "conn.server.network";
const SERVER_LOCAL_ADDRESS: &str = "conn.server.local_address";
const SERVER_REMOTE_ADDRESS: &str = "conn.server.remote_address";

/// String map of credentials and connection metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct AuthInfo(BTreeMap<String, String>);

impl AuthInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Deserialize the JSON value stored under `key`.
    pub fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        self.0
            .get(key)
            .map(|value| serde_json::from_str(value))
            .transpose()
            .map_err(Error::from)
    }

    /// Store `value` as JSON under `key`.
    pub fn set_json(&mut self, key: impl Into<String>, value: &impl serde::Serialize) -> Result<&mut Self, Error> {
        let value = serde_json::to_string(value)?;
        Ok(self.set(key, value))
    }

    /// Copy all entries of `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: &AuthInfo) -> &mut Self {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.get(SESSION_ID)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Record the addresses of `conn` as observed by the client or the server.
    pub(crate) fn set_connection(&mut self, observer: Observer, conn: &dyn Connection) -> &mut Self {
        let (network, local, remote) = match observer {
            Observer::Client => (CLIENT_NETWORK, CLIENT_LOCAL_ADDRESS, CLIENT_REMOTE_ADDRESS),
            Observer::Server => (SERVER_NETWORK, SERVER_LOCAL_ADDRESS, SERVER_REMOTE_ADDRESS),
        };
        self.set(network, conn.network());
        if let Some(address) = conn.local_address() {
            self.set(local, address);
        }
        if let Some(address) = conn.peer_address() {
            self.set(remote, address);
        }
        self
    }

    pub fn conn_info(&self) -> ConnInfo {
        let get = |key: &str| self.get(key).map(ToOwned::to_owned);
        ConnInfo {
            client_network: get(CLIENT_NETWORK),
            client_local_address: get(CLIENT_LOCAL_ADDRESS),
            client_remote_address: get(CLIENT_REMOTE_ADDRESS),
            server_network: get(SERVER_NETWORK),
            server_local_address: get(SERVER_LOCAL_ADDRESS),
            server_remote_address: get(SERVER_REMOTE_ADDRESS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Observer {
    Client,
    Server,
}

/// Addresses of a connection as seen from both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConnInfo {
    pub client_network: Option<String>,
    pub client_local_address: Option<String>,
    pub client_remote_address: Option<String>,
    pub server_network: Option<String>,
    pub server_local_address: Option<String>,
    pub server_remote_address: Option<String>,
}
