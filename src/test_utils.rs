use async_std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthInfo;
use crate::config::SessionSettings;
use crate::crypto::CryptoOption;
use crate::handshake;
use crate::service::Service;
use crate::session::{Role, Session};
use crate::utils::Cancel;

pub fn settings() -> SessionSettings {
    SessionSettings {
        keep_alive_interval: Duration::from_secs(5),
        stream_ping_interval: Duration::from_secs(5),
        cache_time: None,
        stream_auth: None,
    }
}

/// Connected client and server sessions over a Unix socket pair. The server serves `service`.
pub async fn session_pair(service: Service, settings: SessionSettings) -> (Session, Session) {
    session_pair_with(Service::new(), service, settings.clone(), settings).await
}

pub async fn session_pair_with(
    client_service: Service,
    server_service: Service,
    client_settings: SessionSettings,
    server_settings: SessionSettings,
) -> (Session, Session) {
    let _ = tracing_subscriber::fmt::try_init();
    let (client_conn, server_conn) = UnixStream::pair().unwrap();
    let options = vec![CryptoOption::plaintext()];
    let server_options = options.clone();
    let server = async_std::task::spawn(async move {
        let auth_info = AuthInfo::new();
        handshake::Server {
            crypto_options: &server_options,
            auth_info: &auth_info,
            session_auth: None,
            timeout: Duration::from_secs(5),
        }
        .accept(server_conn)
        .await
        .unwrap()
    });
    let client = handshake::Client {
        crypto_options: &options,
        auth_info: AuthInfo::new(),
        timeout: Duration::from_secs(5),
    }
    .connect(client_conn)
    .await
    .unwrap();
    let server = server.await;

    let cancel = Cancel::new();
    let client = Session::start(
        client,
        Role::Client,
        Arc::new(client_service),
        client_settings,
        &cancel,
    );
    let server = Session::start(
        server,
        Role::Server,
        Arc::new(server_service),
        server_settings,
        &cancel,
    );
    (client, server)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        async_std::task::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
