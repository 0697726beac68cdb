use std::time::Duration;

use super::*;
use crate::test_utils::{eventually, session_pair, session_pair_with, settings};

fn echo_service() -> Service {
    let mut service = Service::new();
    service.add_rpc("echo", |request| async move { Ok(request.payload) });
    service.add_rpc("fail", |_| async { Err(anyhow::anyhow!("boom")) });
    service.add_rpc("sleep", |_| async {
        async_std::task::sleep(Duration::from_secs(60)).await;
        Ok(Payload::default())
    });
    service.add_stream("echo", |stream| async move {
        loop {
            match stream.recv().await {
                Ok(payload) => stream.send(payload)?,
                Err(Error::StreamClosed) => return Ok(()),
                Err(error) => return Err(error.into()),
            }
        }
    });
    service.add_send_stream("count", |stream| async move {
        let count = stream.bind().await?.decode_json::<u32>()?;
        for i in 0..count {
            stream.send(Payload::json(&i)?)?;
        }
        Ok(())
    });
    service.add_recv_stream("sum", |stream| async move {
        let mut sum = 0u64;
        loop {
            let value = stream.recv().await?.decode_json::<Option<u64>>()?;
            match value {
                Some(value) => sum += value,
                None => return Ok(Payload::json(&sum)?),
            }
        }
    });
    service
}

#[async_std::test]
async fn rpc_echo() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    let reply = client.rpc("echo", "hello").await.unwrap();
    assert_eq!(reply.as_text(), Some("hello"));
    let value: Vec<u8> = client.json_rpc("echo", &vec![1u8, 2]).await.unwrap();
    assert_eq!(value, vec![1, 2]);
}

#[async_std::test]
async fn rpc_failures() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    match client.rpc("fail", Payload::default()).await {
        Err(Error::Remote(text)) => assert_eq!(text, "boom"),
        result => panic!("unexpected result {:?}", result),
    }
    match client.rpc("missing", Payload::default()).await {
        Err(Error::Remote(text)) => assert_eq!(text, "invalid call: missing"),
        result => panic!("unexpected result {:?}", result),
    }
    // The session survives failed calls.
    assert!(client.rpc("echo", "still").await.is_ok());
}

#[async_std::test]
async fn rpc_cancelled_by_caller() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    let cancel = Cancel::new();
    let call = {
        let client = client.clone();
        let cancel = cancel.clone();
        async_std::task::spawn(async move {
            client
                .rpc_with_cancel("sleep", Payload::default(), &cancel)
                .await
        })
    };
    async_std::task::sleep(Duration::from_millis(20)).await;
    cancel.cancel(Error::ClientClosed);
    assert!(matches!(call.await, Err(Error::ClientClosed)));
    assert_eq!(client.inner.pending.len(), 0);
}

#[async_std::test]
async fn rpc_fails_when_session_closes() {
    let (client, server) = session_pair(echo_service(), settings()).await;
    let call = {
        let client = client.clone();
        async_std::task::spawn(async move { client.rpc("sleep", Payload::default()).await })
    };
    async_std::task::sleep(Duration::from_millis(20)).await;
    server.close();
    assert!(matches!(call.await, Err(Error::SessionClosed)));
    client.closed().await;
    assert!(matches!(
        client.rpc("echo", "late").await,
        Err(Error::SessionClosed)
    ));
}

#[async_std::test]
async fn round_trip_delay() {
    let (client, server) = session_pair(echo_service(), settings()).await;
    let delay = client.round_trip_delay().await.unwrap();
    assert!(delay < Duration::from_secs(1));
    assert!(server.round_trip_delay().await.is_ok());
}

#[async_std::test]
async fn keep_alive_records_delay() {
    let mut settings = settings();
    settings.keep_alive_interval = Duration::from_millis(20);
    let (client, _server) = session_pair(echo_service(), settings).await;
    async_std::task::sleep(Duration::from_millis(100)).await;
    assert!(client.delay() > Duration::from_secs(0));
}

#[async_std::test]
async fn unknown_opcode_is_ignored() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    client
        .inner
        .send(&WireMessage::new("x", 1, Owner::Sender, Opcode::Unknown(99)))
        .unwrap();
    assert!(client.rpc("echo", "after").await.is_ok());
}

#[async_std::test]
async fn duplex_round_trips() {
    use proptest::strategy::{Strategy as _, ValueTree as _};

    // At most 1024 characters, so at most 4 KiB of UTF-8.
    let mut runner = proptest::test_runner::TestRunner::default();
    let messages = proptest::collection::vec("\\PC{0,1024}", 1000)
        .new_tree(&mut runner)
        .unwrap()
        .current();

    let (client, _server) = session_pair(echo_service(), settings()).await;
    let stream = client.stream("echo", OpenOptions::new()).await.unwrap();
    assert_eq!(stream.state(), crate::StreamState::Active);
    for message in messages {
        assert!(message.len() <= 4096);
        stream.send(message.as_str()).unwrap();
        let reply = stream.recv().await.unwrap();
        assert_eq!(reply.as_text(), Some(message.as_str()));
    }
    stream.close();
    assert!(matches!(stream.recv().await, Err(Error::StreamClosed)));
    assert!(matches!(stream.send("late"), Err(Error::StreamClosed)));
}

#[async_std::test]
async fn send_stream_drains_before_close() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    let stream = client
        .recv_stream("count", Payload::json(&3u32).unwrap(), OpenOptions::new())
        .await
        .unwrap();
    assert!(matches!(
        stream.send("nope"),
        Err(Error::StreamInvalidAction)
    ));
    let mut received = Vec::new();
    loop {
        match stream.recv().await {
            Ok(payload) => received.push(payload.decode_json::<u32>().unwrap()),
            Err(Error::StreamClosed) => break,
            Err(error) => panic!("unexpected error {:?}", error),
        }
    }
    assert_eq!(received, vec![0, 1, 2]);
}

#[async_std::test]
async fn recv_stream_reply() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    let stream = client.send_stream("sum", OpenOptions::new()).await.unwrap();
    assert!(matches!(stream.recv().await, Err(Error::StreamInvalidAction)));
    for value in 1..=4u64 {
        stream.send(Payload::json(&Some(value)).unwrap()).unwrap();
    }
    stream.send(Payload::json(&None::<u64>).unwrap()).unwrap();
    let sum = stream.bind().await.unwrap().decode_json::<u64>().unwrap();
    assert_eq!(sum, 10);
    assert!(stream.is_closed());
}

#[async_std::test]
async fn open_unknown_stream() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    match client.stream("missing", OpenOptions::new()).await {
        Err(Error::Remote(text)) => assert_eq!(text, "invalid call: missing"),
        result => panic!("unexpected result {:?}", result),
    }
    // Wrong kind for a registered header
    assert!(client.stream("count", OpenOptions::new()).await.is_err());
    assert_eq!(client.load(), 0);
}

#[async_std::test]
async fn rejected_open_is_retired() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    for _ in 0..20 {
        assert!(client.stream("missing", OpenOptions::new()).await.is_err());
        assert_eq!(client.load(), 0);
        assert!(client.view().streams.is_empty());
    }
}

#[async_std::test]
async fn oversized_message_leaves_session_intact() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    let large = Payload::Raw(vec![0u8; crate::frame::MAX_FRAME_SIZE + 1024 * 1024]);
    match client.rpc("echo", large.clone()).await {
        Err(Error::Frame(error)) => {
            assert!(matches!(*error, crate::frame::FrameError::TooLarge(_)))
        }
        result => panic!("unexpected result {:?}", result),
    }
    assert_eq!(client.inner.pending.len(), 0);

    let stream = client.stream("echo", OpenOptions::new()).await.unwrap();
    assert!(matches!(stream.send(large), Err(Error::Frame(_))));
    assert!(!stream.is_closed());
    stream.send("small").unwrap();
    assert_eq!(stream.recv().await.unwrap().as_text(), Some("small"));

    assert!(!client.is_closed());
    assert_eq!(client.rpc("echo", "x").await.unwrap().as_text(), Some("x"));
}

#[async_std::test]
async fn oversized_reply_fails_the_call() {
    let mut service = Service::new();
    service.add_rpc("inflate", |_| async {
        Ok(Payload::Raw(vec![0u8; crate::frame::MAX_FRAME_SIZE + 1]))
    });
    let (client, server) = session_pair(service, settings()).await;
    assert!(matches!(
        client.rpc("inflate", Payload::default()).await,
        Err(Error::Remote(_))
    ));
    assert!(!client.is_closed());
    assert!(!server.is_closed());
}

#[async_std::test]
async fn stream_auth() {
    let mut server_settings = settings();
    server_settings.stream_auth = Some(Arc::new(|header: &str, auth_info: &AuthInfo| {
        match auth_info.get("token") {
            Some("secret") => Ok(AuthInfo::new().with("stream", header)),
            _ => Err(Error::AuthVerificationFailed),
        }
    }));
    let (client, _server) =
        session_pair_with(Service::new(), echo_service(), settings(), server_settings).await;

    let options = OpenOptions::new().auth_info(AuthInfo::new().with("token", "secret"));
    let stream = client.stream("echo", options).await.unwrap();
    assert_eq!(stream.peer_auth_info().get("stream"), Some("echo"));

    match client.stream("echo", OpenOptions::new()).await {
        Err(Error::Remote(text)) => assert_eq!(text, "auth verification failed"),
        result => panic!("unexpected result {:?}", result),
    }
}

#[async_std::test]
async fn handler_sees_peer_close() {
    let (seen_sender, seen) = async_std::channel::bounded(1);
    let mut service = Service::new();
    service.add_stream("watch", move |stream| {
        let seen_sender = seen_sender.clone();
        async move {
            let result = stream.recv().await;
            let _ = seen_sender.send(result.map(|_| ())).await;
            Ok(())
        }
    });
    let (client, _server) = session_pair(service, settings()).await;
    let stream = client.stream("watch", OpenOptions::new()).await.unwrap();
    stream.close();
    assert!(matches!(seen.recv().await.unwrap(), Err(Error::StreamClosed)));
}

#[async_std::test]
async fn handler_failure_reaches_opener() {
    let mut service = Service::new();
    service.add_stream("broken", |_| async { Err(anyhow::anyhow!("handler broke")) });
    let (client, _server) = session_pair(service, settings()).await;
    let stream = client.stream("broken", OpenOptions::new()).await.unwrap();
    match stream.recv().await {
        Err(Error::Remote(text)) => assert_eq!(text, "handler broke"),
        result => panic!("unexpected result {:?}", result),
    }
}

#[async_std::test]
async fn session_close_cascades_to_streams() {
    let (client, server) = session_pair(echo_service(), settings()).await;
    let stream = client.stream("echo", OpenOptions::new()).await.unwrap();
    server.close();
    assert!(matches!(stream.recv().await, Err(Error::SessionClosed)));
    assert!(matches!(
        stream.cancel().reason(),
        Some(Error::SessionClosed)
    ));
    assert!(client.is_closed());
    assert!(matches!(
        client.stream("echo", OpenOptions::new()).await,
        Err(Error::SessionClosed)
    ));
}

#[async_std::test]
async fn caller_cancel_closes_stream() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    let cancel = Cancel::new();
    let stream = client
        .stream("echo", OpenOptions::new().cancel(cancel.clone()))
        .await
        .unwrap();
    cancel.cancel(Error::ClientClosed);
    assert!(stream.send("late").is_err());
    assert!(matches!(stream.recv().await, Err(Error::ClientClosed)));
    assert!(eventually(Duration::from_secs(1), || stream.is_closed()).await);
}

#[async_std::test]
async fn ping_timeout() {
    let mut client_settings = settings();
    client_settings.stream_ping_interval = Duration::from_millis(20);
    let mut server_settings = settings();
    server_settings.stream_ping_interval = Duration::from_secs(60);
    client_settings.cache_time = Some(Duration::from_millis(200));
    let (client, _server) =
        session_pair_with(Service::new(), echo_service(), client_settings, server_settings).await;
    let stream = client.stream("echo", OpenOptions::new()).await.unwrap();
    let id = stream.id();
    assert!(matches!(stream.recv().await, Err(Error::PingTimeout)));
    assert_eq!(client.stream_state(&id), (false, true));
    assert_eq!(client.load(), 0);
    assert!(eventually(Duration::from_secs(2), || client.stream_state(&id) == (false, false)).await);
    // The session itself stays usable.
    assert!(client.rpc("echo", "alive").await.is_ok());
}

#[async_std::test]
async fn pings_keep_stream_alive() {
    let mut settings = settings();
    settings.stream_ping_interval = Duration::from_millis(20);
    let (client, _server) = session_pair(echo_service(), settings).await;
    let stream = client.stream("echo", OpenOptions::new()).await.unwrap();
    async_std::task::sleep(Duration::from_millis(200)).await;
    assert!(!stream.is_closed());
    stream.send("ok").unwrap();
    assert_eq!(stream.recv().await.unwrap().as_text(), Some("ok"));
}

#[async_std::test]
async fn closed_streams_are_cached() {
    let mut settings = settings();
    settings.cache_time = Some(Duration::from_millis(100));
    let (client, _server) = session_pair(echo_service(), settings).await;
    let stream = client.stream("echo", OpenOptions::new()).await.unwrap();
    let id = stream.id();
    assert_eq!(client.stream_state(&id), (true, false));
    assert_eq!(client.view().streams.len(), 1);

    stream.close();
    assert_eq!(client.stream_state(&id), (false, true));
    // A straggler for the closed stream is swallowed.
    client.inner.route_to_stream(
        WireMessage::new("echo", stream.key().id, Owner::Receiver, Opcode::StreamSendFromResponder),
        0,
    );
    assert!(eventually(Duration::from_secs(1), || client.stream_state(&id) == (false, false)).await);
}

#[async_std::test]
async fn streams_not_cached_by_default() {
    let (client, _server) = session_pair(echo_service(), settings()).await;
    let stream = client.stream("echo", OpenOptions::new()).await.unwrap();
    let id = stream.id();
    stream.close();
    assert_eq!(client.stream_state(&id), (false, false));
}

#[async_std::test]
async fn load_counts_local_streams() {
    let (client, server) = session_pair(echo_service(), settings()).await;
    let a = client.stream("echo", OpenOptions::new()).await.unwrap();
    let b = client.stream("echo", OpenOptions::new()).await.unwrap();
    assert_eq!(client.load(), 2);
    assert_eq!(server.load(), 0);
    a.close();
    assert_eq!(client.load(), 1);
    b.close();
    assert_eq!(client.load(), 0);
}

#[async_std::test]
async fn session_ids_differ() {
    let (client, server) = session_pair(echo_service(), settings()).await;
    assert_ne!(client.id(), server.id());
    assert_eq!(client.auth_info().session_id(), Some(client.id()));
    assert_eq!(client.role(), Role::Client);
    assert_eq!(server.conn_info().server_network.as_deref(), Some("unix"));
}
