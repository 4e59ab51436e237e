//! Volatile and persistent subscriptions against a scripted node.

mod common;

use std::time::Duration;

use common::{fast_settings, next_request, respond, MockNode, ServerConn, PATIENCE};
use everlog::proto::{command, messages};
use everlog::{
    Connection, Position, RecordedEvent, ResolvedEvent, StreamExt, SubDropReason,
    SubscriptionEvent,
};
use tokio::time::timeout;
use uuid::Uuid;

async fn connected(node: &MockNode, conn: &Connection) -> ServerConn {
    let client = conn.clone();
    let connecting = tokio::spawn(async move { client.connect().await });
    let server = node.accept().await;
    timeout(PATIENCE, connecting).await.unwrap().unwrap().unwrap();
    server
}

fn pushed_event(number: i64) -> ResolvedEvent {
    ResolvedEvent {
        event: Some(RecordedEvent {
            stream: "cart-7".into(),
            id: Uuid::new_v4(),
            number,
            event_type: "item-added".into(),
            is_json: false,
            data: vec![number as u8],
            metadata: vec![],
            created_millis: 0,
        }),
        link: None,
        position: Some(Position { commit: number * 10, prepare: number * 10 }),
    }
}

#[tokio::test]
async fn confirm_deliver_then_drop_on_connection_loss() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let subscribing =
        tokio::spawn(async move { client.subscribe_to_stream("cart-7", true, None).await });

    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::SUBSCRIBE_TO_STREAM);
    let subscribe = messages::SubscribeToStream::decode(&request.payload).unwrap();
    assert_eq!(subscribe.stream, "cart-7");
    assert!(subscribe.resolve_link_tos);

    let confirmation =
        messages::SubscriptionConfirmation { last_commit_position: 40, last_event_number: 4 };
    respond(
        &mut server,
        command::SUBSCRIPTION_CONFIRMATION,
        request.correlation,
        confirmation.encode(),
    )
    .await;

    let mut subscription = timeout(PATIENCE, subscribing).await.unwrap().unwrap().unwrap();
    assert_eq!(subscription.last_commit_position, 40);
    assert_eq!(subscription.last_event_number, Some(4));

    // two pushes arrive in order
    for number in 5..7 {
        let push = messages::StreamEventAppeared { event: pushed_event(number) };
        respond(&mut server, command::STREAM_EVENT_APPEARED, request.correlation, push.encode())
            .await;
    }
    for number in 5..7 {
        match timeout(PATIENCE, subscription.next()).await.unwrap().unwrap() {
            SubscriptionEvent::EventAppeared(event) => {
                assert_eq!(event.original_event().unwrap().number, number)
            }
            other => panic!("expected an event, got {other:?}"),
        }
    }

    // the channel dies: exactly one terminal drop, no auto-resubscribe
    drop(server);
    match timeout(PATIENCE, subscription.next()).await.unwrap().unwrap() {
        SubscriptionEvent::Dropped(reason) => {
            assert_eq!(reason, SubDropReason::ConnectionClosed)
        }
        other => panic!("expected the drop, got {other:?}"),
    }
    assert!(timeout(PATIENCE, subscription.next()).await.unwrap().is_none());

    let mut replacement = timeout(PATIENCE, node.accept()).await.expect("client reconnects");
    let quiet =
        timeout(Duration::from_millis(500), next_request(&mut replacement)).await;
    assert!(quiet.is_err(), "the core must not resubscribe on its own");
}

#[tokio::test]
async fn unsubscribe_round_trips_through_the_server() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let subscribing =
        tokio::spawn(async move { client.subscribe_to_stream("cart-7", false, None).await });

    let request = next_request(&mut server).await;
    let confirmation =
        messages::SubscriptionConfirmation { last_commit_position: 0, last_event_number: -1 };
    respond(
        &mut server,
        command::SUBSCRIPTION_CONFIRMATION,
        request.correlation,
        confirmation.encode(),
    )
    .await;
    let mut subscription = timeout(PATIENCE, subscribing).await.unwrap().unwrap().unwrap();

    subscription.unsubscribe();
    let unsubscribe = next_request(&mut server).await;
    assert_eq!(unsubscribe.command, command::UNSUBSCRIBE_FROM_STREAM);
    assert_eq!(unsubscribe.correlation, request.correlation);

    let dropped = messages::SubscriptionDropped { reason: SubDropReason::Unsubscribed };
    respond(&mut server, command::SUBSCRIPTION_DROPPED, request.correlation, dropped.encode())
        .await;

    assert_eq!(
        timeout(PATIENCE, subscription.next()).await.unwrap().unwrap(),
        SubscriptionEvent::Dropped(SubDropReason::Unsubscribed)
    );
}

#[tokio::test]
async fn subscribe_to_all_uses_the_empty_stream_id() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let subscribing = tokio::spawn(async move { client.subscribe_to_all(false, None).await });

    let request = next_request(&mut server).await;
    let subscribe = messages::SubscribeToStream::decode(&request.payload).unwrap();
    assert!(subscribe.stream.is_empty());

    let confirmation =
        messages::SubscriptionConfirmation { last_commit_position: 1234, last_event_number: -1 };
    respond(
        &mut server,
        command::SUBSCRIPTION_CONFIRMATION,
        request.correlation,
        confirmation.encode(),
    )
    .await;

    let subscription = timeout(PATIENCE, subscribing).await.unwrap().unwrap().unwrap();
    assert_eq!(subscription.last_commit_position, 1234);
    assert_eq!(subscription.last_event_number, None);
}

#[tokio::test]
async fn persistent_consumer_receives_and_acks() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let connecting = tokio::spawn(async move {
        client.connect_to_persistent_subscription("orders", "billing", 10, None).await
    });

    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::CONNECT_TO_PERSISTENT_SUBSCRIPTION);
    let connect = messages::ConnectToPersistentSubscription::decode(&request.payload).unwrap();
    assert_eq!(connect.stream, "orders");
    assert_eq!(connect.group, "billing");
    assert_eq!(connect.allowed_in_flight_messages, 10);

    let confirmation = messages::PersistentSubscriptionConfirmation {
        last_commit_position: 0,
        subscription_id: "billing::orders".into(),
        last_event_number: 3,
    };
    respond(
        &mut server,
        command::PERSISTENT_SUBSCRIPTION_CONFIRMATION,
        request.correlation,
        confirmation.encode(),
    )
    .await;

    let mut subscription = timeout(PATIENCE, connecting).await.unwrap().unwrap().unwrap();
    assert_eq!(subscription.subscription_id(), "billing::orders");

    let event = pushed_event(4);
    let event_id = event.event.as_ref().unwrap().id;
    let push =
        messages::PersistentSubscriptionStreamEventAppeared { event, retry_count: 0 };
    respond(
        &mut server,
        command::PERSISTENT_SUBSCRIPTION_EVENT_APPEARED,
        request.correlation,
        push.encode(),
    )
    .await;

    match timeout(PATIENCE, subscription.next()).await.unwrap().unwrap() {
        SubscriptionEvent::EventAppeared(event) => {
            assert_eq!(event.original_event().unwrap().number, 4)
        }
        other => panic!("expected an event, got {other:?}"),
    }

    subscription.ack(vec![event_id]);
    let ack = next_request(&mut server).await;
    assert_eq!(ack.command, command::PERSISTENT_SUBSCRIPTION_ACK_EVENTS);
    assert_eq!(ack.correlation, request.correlation);
    let ack = messages::PersistentSubscriptionAckEvents::decode(&ack.payload).unwrap();
    assert_eq!(ack.subscription_id, "billing::orders");
    assert_eq!(ack.event_ids, vec![event_id]);
}
