use async_std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use streamrpc::crypto::SecretBox;
use streamrpc::{
    AuthInfo, Client, ClientConfig, CryptoOption, Error, OpenOptions, Payload, ReverseRoutes,
    Server, ServerConfig, Service, StreamState, TcpDialer,
};

fn service() -> Service {
    let mut service = Service::new();
    service
        .add_rpc("echo", |request| async move { Ok(request.payload) })
        .add_rpc("whoami", |request| async move {
            Ok(Payload::from(request.auth_info.get("user").unwrap_or("nobody")))
        })
        .add_stream("echo", |stream| async move {
            loop {
                match stream.recv().await {
                    Ok(payload) => stream.send(payload)?,
                    Err(Error::StreamClosed) => return Ok(()),
                    Err(error) => return Err(error.into()),
                }
            }
        })
        .add_send_stream("count", |stream| async move {
            let count = stream.bind().await?.decode_json::<u32>()?;
            for i in 0..count {
                stream.send(Payload::json(&i)?)?;
            }
            Ok(())
        })
        .add_recv_stream("concat", |stream| async move {
            let mut text = String::new();
            loop {
                match stream.recv().await?.decode_json::<Option<String>>()? {
                    Some(part) => text.push_str(&part),
                    None => return Ok(Payload::from(text)),
                }
            }
        })
        .add_reverse_rpc("calc", |ctx| async move {
            let sum = ctx.rpc::<_, i64>("add", &(20, 22)).await?;
            let doubled = ctx.rpc::<_, i64>("double", &sum).await?;
            ctx.rpc::<_, ()>("result", &doubled).await?;
            Ok(())
        });
    service
}

async fn start_server(config: ServerConfig) -> (Server, String) {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = Server::new(config, service());
    let serving = server.clone();
    async_std::task::spawn(async move { serving.serve(listener).await });
    (server, address)
}

fn psk_option() -> CryptoOption {
    CryptoOption::new("psk", SecretBox::from_passphrase("correct horse"), 1)
}

#[async_std::test]
async fn rpc_over_tcp() {
    let (server, address) = start_server(ServerConfig::default()).await;
    let client = Client::new(ClientConfig::default()).unwrap();
    let session = client.dial(&TcpDialer, "tcp", &address).await.unwrap();

    let response = session.rpc("echo", "hello").await.unwrap();
    assert_eq!(response, Payload::from("hello"));
    match session.rpc("missing", Payload::default()).await {
        Err(Error::Remote(text)) => assert_eq!(text, "invalid call: missing"),
        result => panic!("unexpected result {:?}", result),
    }
    let numbers: Vec<u32> = session.json_rpc("echo", &vec![1u32, 2, 3]).await.unwrap();
    assert_eq!(numbers, vec![1, 2, 3]);

    client.close();
    server.close();
}

#[async_std::test]
async fn encrypted_session() {
    let (server, address) = start_server(ServerConfig {
        crypto_options: vec![psk_option()],
        ..ServerConfig::default()
    })
    .await;
    let client = Client::new(ClientConfig {
        crypto_options: vec![psk_option()],
        ..ClientConfig::default()
    })
    .unwrap();
    let session = client.dial(&TcpDialer, "tcp", &address).await.unwrap();
    let stream = session.stream("echo", OpenOptions::new()).await.unwrap();
    for i in 0..100u32 {
        stream.send(Payload::json(&i).unwrap()).unwrap();
        assert_eq!(stream.recv().await.unwrap().decode_json::<u32>().unwrap(), i);
    }
    stream.close();
    assert!(matches!(stream.recv().await, Err(Error::StreamClosed)));
    assert!(matches!(stream.send("late"), Err(Error::StreamClosed)));
    server.close();
}

#[async_std::test]
async fn no_common_crypto_option() {
    let (server, address) = start_server(ServerConfig {
        crypto_options: vec![psk_option()],
        ..ServerConfig::default()
    })
    .await;
    let client = Client::new(ClientConfig::default()).unwrap();
    let result = client.dial(&TcpDialer, "tcp", &address).await;
    assert!(matches!(result, Err(Error::NoSupportedCrypto)));
    server.close();
}

#[async_std::test]
async fn session_auth() {
    let (server, address) = start_server(ServerConfig {
        session_auth: Some(Arc::new(|auth_info: &AuthInfo| {
            match auth_info.get("token") {
                Some("secret") => Ok(AuthInfo::new().with("greeting", "welcome")),
                _ => Err(Error::AuthVerificationFailed),
            }
        })),
        ..ServerConfig::default()
    })
    .await;

    let rejected = Client::new(ClientConfig::default()).unwrap();
    let result = rejected.dial(&TcpDialer, "tcp", &address).await;
    assert!(matches!(result, Err(Error::AuthVerificationFailed)));

    let accepted = Client::new(ClientConfig {
        auth_info: AuthInfo::new().with("token", "secret").with("user", "ada"),
        ..ClientConfig::default()
    })
    .unwrap();
    let session = accepted.dial(&TcpDialer, "tcp", &address).await.unwrap();
    assert_eq!(session.auth_info().get("greeting"), Some("welcome"));
    assert!(session.auth_info().session_id().is_some());
    let user = session.rpc("whoami", Payload::default()).await.unwrap();
    assert_eq!(user, Payload::from("ada"));
    server.close();
}

#[async_std::test]
async fn one_directional_streams() {
    let (server, address) = start_server(ServerConfig::default()).await;
    let client = Client::new(ClientConfig::default()).unwrap();
    let session = client.dial(&TcpDialer, "tcp", &address).await.unwrap();

    let counts = session
        .recv_stream("count", Payload::json(&3u32).unwrap(), OpenOptions::new())
        .await
        .unwrap();
    for i in 0..3u32 {
        assert_eq!(counts.recv().await.unwrap().decode_json::<u32>().unwrap(), i);
    }
    assert!(matches!(counts.recv().await, Err(Error::StreamClosed)));
    // The opener of a receive-only stream may not send.
    assert!(matches!(counts.send("nope"), Err(Error::StreamInvalidAction)));

    let concat = session.send_stream("concat", OpenOptions::new()).await.unwrap();
    for part in &["a", "b", "c"] {
        concat.send(Payload::json(&Some(*part)).unwrap()).unwrap();
    }
    concat.send(Payload::json(&None::<String>).unwrap()).unwrap();
    assert_eq!(concat.bind().await.unwrap(), Payload::from("abc"));
    assert!(matches!(concat.recv().await, Err(Error::StreamInvalidAction)));
    server.close();
}

#[async_std::test]
async fn reverse_rpc() {
    let (server, address) = start_server(ServerConfig::default()).await;
    let client = Client::new(ClientConfig::default()).unwrap();
    let session = client.dial(&TcpDialer, "tcp", &address).await.unwrap();

    let (result_sender, result_receiver) = async_std::channel::bounded(1);
    let mut routes = ReverseRoutes::new();
    routes
        .add("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
        .add("double", |value: i64| async move { Ok(value * 2) })
        .add("result", move |value: i64| {
            let result_sender = result_sender.clone();
            async move {
                result_sender.send(value).await?;
                Ok(())
            }
        });
    session
        .reverse_rpc("calc", None, routes, OpenOptions::new())
        .await
        .unwrap();
    assert_eq!(result_receiver.recv().await.unwrap(), 84);
    server.close();
}

#[async_std::test]
async fn round_trip_delay() {
    let (server, address) = start_server(ServerConfig::default()).await;
    let client = Client::new(ClientConfig::default()).unwrap();
    let session = client.dial(&TcpDialer, "tcp", &address).await.unwrap();
    let delay = session.round_trip_delay().await.unwrap();
    assert!(delay < Duration::from_secs(5));
    server.close();
}

#[async_std::test]
async fn server_close() {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = Server::new(ServerConfig::default(), service());
    let serving = {
        let server = server.clone();
        async_std::task::spawn(async move { server.serve(listener).await })
    };

    let client = Client::new(ClientConfig::default()).unwrap();
    let session = client.dial(&TcpDialer, "tcp", &address).await.unwrap();
    let stream = session.stream("echo", OpenOptions::new()).await.unwrap();

    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    assert!(matches!(server.serve(second).await, Err(Error::ServerRunning)));

    server.close();
    assert!(matches!(serving.await, Err(Error::ServerClosed)));
    async_std::future::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();
    assert!(matches!(stream.recv().await, Err(Error::SessionClosed)));
    assert!(session.rpc("echo", "late").await.is_err());

    let again = TcpListener::bind("127.0.0.1:0").await.unwrap();
    assert!(matches!(server.serve(again).await, Err(Error::ServerClosed)));
}

#[async_std::test]
async fn client_close() {
    let (server, address) = start_server(ServerConfig::default()).await;
    let client = Client::new(ClientConfig::default()).unwrap();
    let session = client.dial(&TcpDialer, "tcp", &address).await.unwrap();
    client.close();
    assert!(client.is_closed());
    assert!(session.is_closed());
    assert!(matches!(
        client.dial(&TcpDialer, "tcp", &address).await,
        Err(Error::ClientClosed)
    ));
    server.close();
}

#[async_std::test]
async fn session_views() {
    let (server, address) = start_server(ServerConfig::default()).await;
    let client = Client::new(ClientConfig::default()).unwrap();
    let session = client.dial(&TcpDialer, "tcp", &address).await.unwrap();
    let stream = session.stream("echo", OpenOptions::new()).await.unwrap();
    stream.send("ping").unwrap();
    stream.recv().await.unwrap();

    let views = client.session_views();
    assert_eq!(views.len(), 1);
    let view = &views[0];
    assert_eq!(view.id, session.id());
    assert_eq!(view.conn_info.client_network.as_deref(), Some("tcp"));
    assert_eq!(view.streams.len(), 1);
    assert_eq!(view.streams[0].header, "echo");
    assert_eq!(view.streams[0].kind, "full_duplex");
    assert_eq!(view.streams[0].state, StreamState::Active);
    assert!(view.streams[0].monitor.written_bytes > 0);

    let json = serde_json::to_value(&views).unwrap();
    assert_eq!(json[0]["role"], "client");
    assert_eq!(json[0]["streams"][0]["origin"], "local");

    let server_views = server.session_views();
    assert_eq!(server_views.len(), 1);
    assert_eq!(server_views[0].streams.len(), 1);
    assert_eq!(
        serde_json::to_value(&server_views[0].streams[0].origin).unwrap(),
        "remote"
    );
    server.close();
}
