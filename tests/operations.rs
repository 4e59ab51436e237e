//! Data-plane operations against a scripted node: appends, reads,
//! metadata, transactions, replays and redirects.

mod common;

use common::{fast_settings, next_request, respond, MockNode, ServerConn, PATIENCE};
use everlog::proto::{command, messages};
use everlog::{
    Connection, Error, EventData, EventReadStatus, ExpectedVersion, Position, RecordedEvent,
    ResolvedEvent, StreamMetadata,
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

fn recorded(stream: &str, number: i64, event: &messages::WriteEvents) -> ResolvedEvent {
    let data = &event.events[0];
    ResolvedEvent {
        event: Some(RecordedEvent {
            stream: stream.into(),
            id: data.id,
            number,
            event_type: data.event_type.clone(),
            is_json: data.is_json,
            data: data.data.clone(),
            metadata: data.metadata.clone(),
            created_millis: 1_700_000_000_000,
        }),
        link: None,
        position: None,
    }
}

#[tokio::test]
async fn happy_append_then_read_back() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let appending = tokio::spawn(async move {
        client
            .append_to_stream(
                "s",
                ExpectedVersion::Any,
                vec![EventData::binary("t", vec![0x01])],
            )
            .await
    });

    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::WRITE_EVENTS);
    let write = messages::WriteEvents::decode(&request.payload).unwrap();
    assert_eq!(write.stream, "s");
    assert_eq!(write.expected_version, -2);
    assert_eq!(write.events.len(), 1);

    respond(
        &mut server,
        command::WRITE_EVENTS_COMPLETED,
        request.correlation,
        messages::WriteEventsCompleted::success(0).encode(),
    )
    .await;

    let result = timeout(PATIENCE, appending).await.unwrap().unwrap().unwrap();
    assert_eq!(result.next_expected_version, 0);

    // now read event 0 back
    let client = conn.clone();
    let reading = tokio::spawn(async move { client.read_event("s", 0, false).await });

    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::READ_EVENT);
    let read = messages::ReadEvent::decode(&request.payload).unwrap();
    assert_eq!(read.stream, "s");
    assert_eq!(read.event_number, 0);

    let completed = messages::ReadEventCompleted {
        result: messages::ReadEventResult::Success,
        event: Some(recorded("s", 0, &write)),
        error: String::new(),
    };
    respond(&mut server, command::READ_EVENT_COMPLETED, request.correlation, completed.encode())
        .await;

    let result = timeout(PATIENCE, reading).await.unwrap().unwrap().unwrap();
    assert_eq!(result.status, EventReadStatus::Success);
    let event = result.event.unwrap();
    assert_eq!(event.original_event().unwrap().data, vec![0x01]);
}

#[tokio::test]
async fn wrong_expected_version_is_typed() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let appending = tokio::spawn(async move {
        client
            .append_to_stream(
                "s",
                ExpectedVersion::Exact(4),
                vec![EventData::binary("t", vec![1])],
            )
            .await
    });

    let request = next_request(&mut server).await;
    let completed = messages::WriteEventsCompleted {
        result: messages::OperationResult::WrongExpectedVersion,
        message: "current version is 9".into(),
        first_event_number: -1,
        last_event_number: -1,
        prepare_position: -1,
        commit_position: -1,
    };
    respond(
        &mut server,
        command::WRITE_EVENTS_COMPLETED,
        request.correlation,
        completed.encode(),
    )
    .await;

    let err = timeout(PATIENCE, appending).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::WrongExpectedVersion(_)), "got {err}");
}

#[tokio::test]
async fn an_operation_survives_a_mid_flight_disconnect() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let appending = tokio::spawn(async move {
        client
            .append_to_stream("s", ExpectedVersion::Any, vec![EventData::binary("t", vec![7])])
            .await
    });

    // take the request down with the connection
    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::WRITE_EVENTS);
    drop(server);

    // the client reconnects and replays the same write
    let mut server = timeout(PATIENCE, node.accept()).await.expect("no reconnect");
    let replay = timeout(PATIENCE, next_request(&mut server)).await.expect("no replay");
    assert_eq!(replay.command, command::WRITE_EVENTS);
    assert_ne!(replay.correlation, request.correlation, "replays use a fresh correlation id");

    respond(
        &mut server,
        command::WRITE_EVENTS_COMPLETED,
        replay.correlation,
        messages::WriteEventsCompleted::success(0).encode(),
    )
    .await;

    let result = timeout(PATIENCE, appending).await.unwrap().unwrap().unwrap();
    assert_eq!(result.next_expected_version, 0);
}

#[tokio::test]
async fn a_not_master_redirect_moves_the_operation() {
    let master = MockNode::bind().await;
    let follower = MockNode::bind().await;
    let conn = Connection::create(fast_settings(follower.addr).build().unwrap());
    let mut follower_conn = connected(&follower, &conn).await;

    let client = conn.clone();
    let appending = tokio::spawn(async move {
        client
            .append_to_stream("s", ExpectedVersion::Any, vec![EventData::binary("t", vec![1])])
            .await
    });

    let request = next_request(&mut follower_conn).await;
    let redirect = messages::NotHandled::not_master("127.0.0.1", master.addr.port());
    respond(&mut follower_conn, command::NOT_HANDLED, request.correlation, redirect.encode())
        .await;

    // the client walks over to the master and re-issues the write
    let mut master_conn = timeout(PATIENCE, master.accept()).await.expect("no redirect connect");
    let moved = timeout(PATIENCE, next_request(&mut master_conn)).await.expect("no re-issue");
    assert_eq!(moved.command, command::WRITE_EVENTS);

    respond(
        &mut master_conn,
        command::WRITE_EVENTS_COMPLETED,
        moved.correlation,
        messages::WriteEventsCompleted::success(0).encode(),
    )
    .await;

    let result = timeout(PATIENCE, appending).await.unwrap().unwrap().unwrap();
    assert_eq!(result.next_expected_version, 0);
}

#[tokio::test]
async fn metadata_round_trips_through_the_metastream() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let metadata = StreamMetadata {
        max_count: Some(50),
        max_age_seconds: Some(86_400),
        ..Default::default()
    };

    let client = conn.clone();
    let md = metadata.clone();
    let setting = tokio::spawn(async move {
        client.set_stream_metadata("orders", ExpectedVersion::Any, &md).await
    });

    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::WRITE_EVENTS);
    let write = messages::WriteEvents::decode(&request.payload).unwrap();
    assert_eq!(write.stream, "$$orders");
    assert_eq!(write.events[0].event_type, "$metadata");
    let stored = write.clone();
    respond(
        &mut server,
        command::WRITE_EVENTS_COMPLETED,
        request.correlation,
        messages::WriteEventsCompleted::success(0).encode(),
    )
    .await;
    timeout(PATIENCE, setting).await.unwrap().unwrap().unwrap();

    let client = conn.clone();
    let getting = tokio::spawn(async move { client.get_stream_metadata("orders").await });

    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::READ_EVENT);
    let read = messages::ReadEvent::decode(&request.payload).unwrap();
    assert_eq!(read.stream, "$$orders");
    assert_eq!(read.event_number, -1);

    let completed = messages::ReadEventCompleted {
        result: messages::ReadEventResult::Success,
        event: Some(recorded("$$orders", 0, &stored)),
        error: String::new(),
    };
    respond(&mut server, command::READ_EVENT_COMPLETED, request.correlation, completed.encode())
        .await;

    let result = timeout(PATIENCE, getting).await.unwrap().unwrap().unwrap();
    assert!(!result.deleted);
    assert_eq!(result.version, 0);
    assert_eq!(result.metadata, metadata);
}

#[tokio::test]
async fn metadata_of_a_deleted_stream_is_flagged() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let getting = tokio::spawn(async move { client.get_stream_metadata("gone").await });

    let request = next_request(&mut server).await;
    let completed = messages::ReadEventCompleted {
        result: messages::ReadEventResult::StreamDeleted,
        event: None,
        error: String::new(),
    };
    respond(&mut server, command::READ_EVENT_COMPLETED, request.correlation, completed.encode())
        .await;

    let result = timeout(PATIENCE, getting).await.unwrap().unwrap().unwrap();
    assert!(result.deleted);
    assert_eq!(result.version, i64::MAX);
}

#[tokio::test]
async fn a_transaction_runs_start_write_commit() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let starting = tokio::spawn(async move {
        client.start_transaction("ledger", ExpectedVersion::NoStream).await
    });

    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::TRANSACTION_START);
    let completed = messages::TransactionStartCompleted {
        transaction_id: 42,
        result: messages::OperationResult::Success,
        message: String::new(),
    };
    respond(
        &mut server,
        command::TRANSACTION_START_COMPLETED,
        request.correlation,
        completed.encode(),
    )
    .await;
    let transaction = timeout(PATIENCE, starting).await.unwrap().unwrap().unwrap();
    assert_eq!(transaction.id(), 42);

    let writing = tokio::spawn(async move {
        let result = transaction.write(vec![EventData::binary("entry", vec![1, 2])]).await;
        (transaction, result)
    });
    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::TRANSACTION_WRITE);
    let write = messages::TransactionWrite::decode(&request.payload).unwrap();
    assert_eq!(write.transaction_id, 42);
    let completed = messages::TransactionWriteCompleted {
        transaction_id: 42,
        result: messages::OperationResult::Success,
        message: String::new(),
    };
    respond(
        &mut server,
        command::TRANSACTION_WRITE_COMPLETED,
        request.correlation,
        completed.encode(),
    )
    .await;
    let (transaction, written) = timeout(PATIENCE, writing).await.unwrap().unwrap();
    written.unwrap();

    let committing = tokio::spawn(async move { transaction.commit().await });
    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::TRANSACTION_COMMIT);
    let completed = messages::TransactionCommitCompleted {
        transaction_id: 42,
        result: messages::OperationResult::Success,
        message: String::new(),
        first_event_number: 0,
        last_event_number: 1,
        prepare_position: 100,
        commit_position: 100,
    };
    respond(
        &mut server,
        command::TRANSACTION_COMMIT_COMPLETED,
        request.correlation,
        completed.encode(),
    )
    .await;
    let result = timeout(PATIENCE, committing).await.unwrap().unwrap().unwrap();
    assert_eq!(result.next_expected_version, 1);
    assert_eq!(result.position, Position { commit: 100, prepare: 100 });
}

#[tokio::test]
async fn persistent_subscription_crud_round_trips() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let creating = tokio::spawn(async move {
        client
            .create_persistent_subscription("orders", "billing", Default::default())
            .await
    });

    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::CREATE_PERSISTENT_SUBSCRIPTION);
    let upsert = messages::PersistentSubscriptionUpsert::decode(&request.payload).unwrap();
    assert_eq!(upsert.stream, "orders");
    assert_eq!(upsert.group, "billing");

    respond(
        &mut server,
        command::CREATE_PERSISTENT_SUBSCRIPTION_COMPLETED,
        request.correlation,
        messages::PersistentSubscriptionCompleted::success().encode(),
    )
    .await;
    timeout(PATIENCE, creating).await.unwrap().unwrap().unwrap();

    let client = conn.clone();
    let deleting = tokio::spawn(async move {
        client.delete_persistent_subscription("orders", "billing").await
    });
    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::DELETE_PERSISTENT_SUBSCRIPTION);
    respond(
        &mut server,
        command::DELETE_PERSISTENT_SUBSCRIPTION_COMPLETED,
        request.correlation,
        messages::PersistentSubscriptionCompleted::success().encode(),
    )
    .await;
    timeout(PATIENCE, deleting).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn validation_happens_before_anything_is_sent() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());

    let err = conn.read_stream_events_forward("s", 0, 0, false).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = conn.read_stream_events_forward("s", 0, 4096, false).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = conn.read_event("s", -2, false).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = conn.get_stream_metadata("$$s").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = conn
        .append_to_stream("", ExpectedVersion::Any, vec![EventData::binary("t", vec![1])])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn late_responses_after_a_timeout_are_dropped() {
    let node = MockNode::bind().await;
    let settings = fast_settings(node.addr)
        .operation_timeout(std::time::Duration::from_millis(200))
        .max_operation_retries(0)
        .build()
        .unwrap();
    let conn = Connection::create(settings);
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let appending = tokio::spawn(async move {
        client
            .append_to_stream("s", ExpectedVersion::Any, vec![EventData::binary("t", vec![1])])
            .await
    });

    let request = next_request(&mut server).await;
    // sit on the request until the client gives up
    let err = timeout(PATIENCE, appending).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::OperationTimeout(_)), "got {err}");

    // answering now must not break anything; the next operation still works
    respond(
        &mut server,
        command::WRITE_EVENTS_COMPLETED,
        request.correlation,
        messages::WriteEventsCompleted::success(0).encode(),
    )
    .await;

    let client = conn.clone();
    let reading = tokio::spawn(async move { client.read_event("s", -1, false).await });
    let request = next_request(&mut server).await;
    assert_eq!(request.command, command::READ_EVENT);
    let completed = messages::ReadEventCompleted {
        result: messages::ReadEventResult::NotFound,
        event: None,
        error: String::new(),
    };
    respond(&mut server, command::READ_EVENT_COMPLETED, request.correlation, completed.encode())
        .await;
    let result = timeout(PATIENCE, reading).await.unwrap().unwrap().unwrap();
    assert_eq!(result.status, EventReadStatus::NotFound);
}

#[tokio::test]
async fn uuid_is_used_for_correlation_ids() {
    let node = MockNode::bind().await;
    let conn = Connection::create(fast_settings(node.addr).build().unwrap());
    let mut server = connected(&node, &conn).await;

    let client = conn.clone();
    let _appending = tokio::spawn(async move {
        client
            .append_to_stream("s", ExpectedVersion::Any, vec![EventData::binary("t", vec![1])])
            .await
    });

    let request = next_request(&mut server).await;
    assert_ne!(request.correlation, Uuid::nil());
    assert_eq!(request.correlation.get_version_num(), 4);
}
