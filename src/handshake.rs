//! Connection handshake
//!
//! 1. The client sends the names of its crypto options in plaintext. The server replies with the
//!    first of its own options that the client offered.
//! 2. If the selected cipher is symmetric both peers send a random nonce encrypted with it and
//!    switch to [crate::crypto::Aes256GcmCipher] keyed with the hash of both nonces.
//! 3. The client sends its [AuthInfo]. The server may reject it and replies with its own.
use futures::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthInfo, Observer};
use crate::config::SessionAuthCallback;
use crate::crypto::{self, Cipher, CryptoOption, Plaintext};
use crate::frame::{FrameReader, FrameWriter};
use crate::transport::Connection;
use crate::Error;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Hello {
    crypto: Vec<String>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Selected {
    crypto: Option<String>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
enum AuthReply {
    Accepted(AuthInfo),
    Rejected(String),
}

/// A connection that completed the handshake.
pub(crate) struct Established<Conn> {
    pub writer: FrameWriter<futures::io::WriteHalf<Conn>>,
    pub reader: FrameReader<futures::io::ReadHalf<Conn>>,
    /// Auth info of the session, including the connection addresses seen from both ends.
    pub auth_info: AuthInfo,
    /// Name of the negotiated crypto option.
    pub crypto: String,
}

/// Parameters to run the handshake as a client
pub(crate) struct Client<'a> {
    pub crypto_options: &'a [CryptoOption],
    pub auth_info: AuthInfo,
    pub timeout: Duration,
}

impl Client<'_> {
    #[tracing::instrument(level = "debug", skip(self, conn), fields(peer = ?conn.peer_address()))]
    pub async fn connect<Conn: Connection>(self, conn: Conn) -> Result<Established<Conn>, Error> {
        let timeout = self.timeout;
        async_std::future::timeout(timeout, self.handshake(conn))
            .await
            .map_err(|_| Error::HandshakeTimeout)?
    }

    async fn handshake<Conn: Connection>(self, conn: Conn) -> Result<Established<Conn>, Error> {
        let _ = sodiumoxide::init();
        let crypto_options = self.crypto_options;
        let mut auth_info = self.auth_info;
        auth_info.set_connection(Observer::Client, &conn);
        let (mut writer, mut reader) = crate::frame::framed(conn, Arc::new(Plaintext));

        let hello = Hello {
            crypto: crypto_options
                .iter()
                .map(CryptoOption::wire_name)
                .collect(),
        };
        send_json(&mut writer, &hello).await?;
        let Selected { crypto } = recv_json(&mut reader).await?;
        let option = crypto
            .and_then(|name| {
                crypto_options
                    .iter()
                    .find(|option| option.wire_name() == name)
            })
            .ok_or(Error::NoSupportedCrypto)?;
        tracing::debug!(crypto = %option.wire_name(), "crypto selected");

        let cipher = option.cipher.clone();
        writer.set_cipher(cipher.clone());
        reader.set_cipher(cipher.clone());
        if cipher.is_symmetric() {
            let client_nonce = crypto::random_nonce();
            writer.send(client_nonce.clone()).await?;
            let server_nonce = recv_nonce(&mut reader).await?;
            let session_cipher: Arc<dyn Cipher> = Arc::new(crypto::session_cipher(
                &*cipher,
                &client_nonce,
                &server_nonce,
            ));
            writer.set_cipher(session_cipher.clone());
            reader.set_cipher(session_cipher);
            tracing::debug!("switched to session cipher");
        }

        send_json(&mut writer, &auth_info).await?;
        match recv_json(&mut reader).await? {
            AuthReply::Accepted(server_info) => {
                auth_info.merge(&server_info);
            }
            AuthReply::Rejected(reason) => {
                tracing::debug!(%reason, "server rejected auth info");
                return Err(Error::AuthVerificationFailed);
            }
        }

        Ok(Established {
            writer,
            reader,
            auth_info,
            crypto: option.wire_name(),
        })
    }
}

/// Parameters to run the handshake as a server
pub(crate) struct Server<'a> {
    pub crypto_options: &'a [CryptoOption],
    /// Sent to the client if there is no `session_auth` callback.
    pub auth_info: &'a AuthInfo,
    pub session_auth: Option<&'a SessionAuthCallback>,
    pub timeout: Duration,
}

impl Server<'_> {
    #[tracing::instrument(level = "debug", skip(self, conn), fields(peer = ?conn.peer_address()))]
    pub async fn accept<Conn: Connection>(self, conn: Conn) -> Result<Established<Conn>, Error> {
        let timeout = self.timeout;
        async_std::future::timeout(timeout, self.handshake(conn))
            .await
            .map_err(|_| Error::HandshakeTimeout)?
    }

    async fn handshake<Conn: Connection>(self, conn: Conn) -> Result<Established<Conn>, Error> {
        let _ = sodiumoxide::init();
        let mut conn_info = AuthInfo::new();
        conn_info.set_connection(Observer::Server, &conn);
        let (mut writer, mut reader) = crate::frame::framed(conn, Arc::new(Plaintext));

        let Hello { crypto } = recv_json(&mut reader).await?;
        let option = crypto::select(self.crypto_options, &crypto);
        send_json(
            &mut writer,
            &Selected {
                crypto: option.map(CryptoOption::wire_name),
            },
        )
        .await?;
        let option = option.ok_or(Error::NoSupportedCrypto)?;
        tracing::debug!(crypto = %option.wire_name(), "crypto selected");

        let cipher = option.cipher.clone();
        writer.set_cipher(cipher.clone());
        reader.set_cipher(cipher.clone());
        if cipher.is_symmetric() {
            let client_nonce = recv_nonce(&mut reader).await?;
            let server_nonce = crypto::random_nonce();
            writer.send(server_nonce.clone()).await?;
            let session_cipher: Arc<dyn Cipher> = Arc::new(crypto::session_cipher(
                &*cipher,
                &client_nonce,
                &server_nonce,
            ));
            writer.set_cipher(session_cipher.clone());
            reader.set_cipher(session_cipher);
            tracing::debug!("switched to session cipher");
        }

        let mut client_info: AuthInfo = recv_json(&mut reader).await?;
        client_info.merge(&conn_info);
        let reply = match self.session_auth {
            Some(session_auth) => match session_auth(&client_info) {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::debug!(?error, "rejected client auth info");
                    send_json(&mut writer, &AuthReply::Rejected(error.to_string())).await?;
                    let _ = writer.close().await;
                    return Err(Error::AuthVerificationFailed);
                }
            },
            None => self.auth_info.clone(),
        };
        let mut reply = reply;
        reply.merge(&conn_info);
        send_json(&mut writer, &AuthReply::Accepted(reply)).await?;

        Ok(Established {
            writer,
            reader,
            auth_info: client_info,
            crypto: option.wire_name(),
        })
    }
}

async fn send_json<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    value: &impl serde::Serialize,
) -> Result<(), Error> {
    writer.send(serde_json::to_vec(value)?).await?;
    Ok(())
}

async fn recv_json<R: AsyncRead + Unpin, T: serde::de::DeserializeOwned>(
    reader: &mut FrameReader<R>,
) -> Result<T, Error> {
    let frame = reader
        .try_next()
        .await?
        .ok_or(Error::Handshake("connection closed by peer"))?;
    Ok(serde_json::from_slice(&frame)?)
}

async fn recv_nonce<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Vec<u8>, Error> {
    let nonce = reader
        .try_next()
        .await?
        .ok_or(Error::Handshake("connection closed by peer"))?;
    if nonce.len() != crypto::KEY_NONCE_SIZE {
        return Err(Error::Handshake("invalid key nonce"));
    }
    Ok(nonce)
}
