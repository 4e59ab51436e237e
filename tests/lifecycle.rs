//! Connection lifecycle: reconnection bounds, heartbeats and the
//! credential handshake.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{fast_settings, next_request, respond, MockNode, PATIENCE};
use everlog::proto::{command, Package};
use everlog::{ClientEvent, Connection, Credentials, Error, EventData, ExpectedVersion, StreamExt};
use futures_util::SinkExt;
use tokio::time::timeout;

async fn collect_until_disconnected(
    events: &mut (impl futures_util::Stream<Item = ClientEvent> + Unpin),
) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(PATIENCE, events.next())
            .await
            .expect("timed out waiting for events")
            .expect("event channel closed early");
        let done = matches!(event, ClientEvent::Disconnected { .. });
        seen.push(event);
        if done {
            return seen
        }
    }
}

#[tokio::test]
async fn reconnection_limit_zero_gives_exactly_one_attempt() {
    // bind then drop, so the port refuses connections
    let node = MockNode::bind().await;
    let addr = node.addr;
    drop(node);

    let settings = fast_settings(addr).max_reconnections(0).build().unwrap();
    let conn = Connection::create(settings);
    let mut events = conn.events();

    let err = timeout(PATIENCE, conn.connect()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed(_)), "got {err}");

    let seen = collect_until_disconnected(&mut events).await;
    let reconnecting =
        seen.iter().filter(|e| matches!(e, ClientEvent::Reconnecting)).count();
    assert_eq!(reconnecting, 1, "events: {seen:?}");
}

#[tokio::test]
async fn reconnection_limit_two_gives_three_attempts_then_disconnects() {
    let node = MockNode::bind().await;
    let addr = node.addr;
    drop(node);

    let settings = fast_settings(addr).max_reconnections(2).build().unwrap();
    let conn = Connection::create(settings);
    let mut events = conn.events();

    let _ = timeout(PATIENCE, conn.connect()).await.unwrap();

    let seen = collect_until_disconnected(&mut events).await;
    let reconnecting =
        seen.iter().filter(|e| matches!(e, ClientEvent::Reconnecting)).count();
    assert_eq!(reconnecting, 3, "events: {seen:?}");

    // the client is gone for good now
    let err = conn
        .append_to_stream("s", ExpectedVersion::Any, vec![EventData::binary("t", vec![1])])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed(_)), "got {err}");
}

#[tokio::test]
async fn operations_before_connect_fail_with_no_connection() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());

    let err = conn
        .append_to_stream("s", ExpectedVersion::Any, vec![EventData::binary("t", vec![1])])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoConnection), "got {err}");
}

#[tokio::test]
async fn connecting_twice_is_rejected() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());

    let client = conn.clone();
    let connecting = tokio::spawn(async move { client.connect().await });
    let _server = node.accept().await;

    timeout(PATIENCE, connecting).await.unwrap().unwrap().unwrap();

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "got {err}");
}

#[tokio::test]
async fn client_probes_an_idle_connection() {
    let node = MockNode::bind().await;
    let settings = fast_settings(node.addr)
        .heartbeat_interval(Duration::from_millis(100))
        .heartbeat_timeout(Duration::from_millis(1_000))
        .build()
        .unwrap();
    let conn = Connection::create(settings);

    let client = conn.clone();
    let connecting = tokio::spawn(async move { client.connect().await });
    let mut server = node.accept().await;
    timeout(PATIENCE, connecting).await.unwrap().unwrap().unwrap();

    // idle for longer than the heartbeat interval: a probe must arrive
    let probe = timeout(PATIENCE, server.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(probe.command, command::HEARTBEAT_REQUEST);
    let pong = Package::new(command::HEARTBEAT_RESPONSE, probe.correlation, Bytes::new());
    server.send(pong).await.unwrap();
}

#[tokio::test]
async fn client_answers_server_heartbeats() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());

    let client = conn.clone();
    let connecting = tokio::spawn(async move { client.connect().await });
    let mut server = node.accept().await;
    timeout(PATIENCE, connecting).await.unwrap().unwrap().unwrap();

    let ping = Package::new(command::HEARTBEAT_REQUEST, uuid::Uuid::new_v4(), Bytes::new());
    server.send(ping.clone()).await.unwrap();

    let pong = timeout(PATIENCE, server.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(pong.command, command::HEARTBEAT_RESPONSE);
    assert_eq!(pong.correlation, ping.correlation);
}

#[tokio::test]
async fn unanswered_heartbeats_trigger_a_reconnect() {
    let node = MockNode::bind().await;
    let settings = fast_settings(node.addr)
        .heartbeat_interval(Duration::from_millis(50))
        .heartbeat_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let conn = Connection::create(settings);

    let client = conn.clone();
    let connecting = tokio::spawn(async move { client.connect().await });
    let silent_server = node.accept().await;
    timeout(PATIENCE, connecting).await.unwrap().unwrap().unwrap();

    // never answer the probe; the client must drop us and come back
    let replacement = timeout(PATIENCE, node.accept()).await.expect("client did not reconnect");
    drop(silent_server);
    drop(replacement);
}

#[tokio::test]
async fn authentication_success_precedes_connected() {
    let node = MockNode::bind().await;
    let settings = fast_settings(node.addr)
        .with_credentials(Credentials::new("admin", "changeit"))
        .build()
        .unwrap();
    let conn = Connection::create(settings);

    let client = conn.clone();
    let connecting = tokio::spawn(async move { client.connect().await });

    let mut server = node.accept().await;
    let auth = next_request(&mut server).await;
    assert_eq!(auth.command, command::AUTHENTICATE);
    let credentials = auth.credentials.expect("credentials must ride the auth package");
    assert_eq!(credentials.login(), "admin");
    respond(&mut server, command::AUTHENTICATED, auth.correlation, Bytes::new()).await;

    timeout(PATIENCE, connecting).await.unwrap().unwrap().unwrap();

    // data packages carry the default credentials too
    let client = conn.clone();
    let appending = tokio::spawn(async move {
        client.append_to_stream("s", ExpectedVersion::Any, vec![EventData::binary("t", vec![1])])
            .await
    });
    let write = next_request(&mut server).await;
    assert_eq!(write.command, command::WRITE_EVENTS);
    assert!(write.credentials.is_some());
    respond(
        &mut server,
        command::WRITE_EVENTS_COMPLETED,
        write.correlation,
        everlog::proto::messages::WriteEventsCompleted::success(0).encode(),
    )
    .await;
    timeout(PATIENCE, appending).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn rejected_credentials_emit_and_eventually_close() {
    let node = MockNode::bind().await;
    let settings = fast_settings(node.addr)
        .with_credentials(Credentials::new("admin", "wrong"))
        .max_reconnections(0)
        .build()
        .unwrap();
    let conn = Connection::create(settings);
    let mut events = conn.events();

    let client = conn.clone();
    let connecting = tokio::spawn(async move { client.connect().await });

    let mut server = node.accept().await;
    let auth = next_request(&mut server).await;
    assert_eq!(auth.command, command::AUTHENTICATE);
    respond(
        &mut server,
        command::NOT_AUTHENTICATED,
        auth.correlation,
        Bytes::from_static(b"bad credentials"),
    )
    .await;

    let err = timeout(PATIENCE, connecting).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::NotAuthenticated(_)), "got {err}");

    let seen = collect_until_disconnected(&mut events).await;
    assert!(
        seen.iter().any(|e| matches!(e, ClientEvent::AuthenticationFailed(_))),
        "events: {seen:?}"
    );
}
