//! The user-facing connection object.
//!
//! `Connection` is a cheap cloneable handle over an instruction channel;
//! the engine behind it runs on its own task (see [`driver`]). Verbs here
//! only validate arguments, apply the admission bound and enqueue.

mod backend;
pub(crate) mod driver;
mod operations;
mod subscriptions;
#[cfg(feature = "tls")]
mod tls;

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures_channel::{mpsc, oneshot};
use futures_util::Stream;
use uuid::Uuid;

use crate::{
    discovery::{ClusterDiscoverer, Discover, StaticDiscoverer},
    errors::Error,
    metadata::{is_metastream, metastream_of, StreamMetadata, StreamMetadataResult,
               METADATA_EVENT_TYPE},
    operations::{
        persistent, read,
        subscribe::{PersistentConnect, VolatileSubscription},
        write, Operation,
    },
    settings::{Credentials, Settings, Target},
    types::{
        AllEventsSlice, DeleteResult, EventData, EventReadResult, EventReadStatus,
        ExpectedVersion, NakAction, PersistentSubscriptionSettings, Position, ReadDirection,
        StreamEventsSlice, SubscriptionEvent, WriteResult,
    },
};
use driver::{ConnectionDriver, Task};

/// Largest slice a single read may request, exclusive.
pub const MAX_READ_SIZE: usize = 4096;

/// Lifecycle notifications delivered to every registered listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A channel reached the connected state
    Connected(SocketAddr),
    /// The client shut down for good
    Disconnected { reason: String },
    /// A connection attempt is being scheduled
    Reconnecting,
    /// The active channel went away; reconnection follows
    ConnectionClosed { reason: String },
    /// A connection-level error, usually right before a close
    ErrorOccurred(String),
    /// The server rejected our credentials
    AuthenticationFailed(String),
}

/// Registered event listeners. Emission walks a snapshot so listeners can
/// be added or dropped mid-iteration.
#[derive(Clone, Default)]
pub(crate) struct Listeners(Arc<RwLock<Vec<mpsc::UnboundedSender<ClientEvent>>>>);

impl Listeners {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.0.write().expect("listener lock poisoned").push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let snapshot = self.0.read().expect("listener lock poisoned").clone();
        let mut prune = false;
        for listener in &snapshot {
            if listener.unbounded_send(event.clone()).is_err() {
                prune = true;
            }
        }
        if prune {
            self.0
                .write()
                .expect("listener lock poisoned")
                .retain(|listener| !listener.is_closed());
        }
    }
}

struct Inner {
    tasks: mpsc::UnboundedSender<Task>,
    settings: Arc<Settings>,
    totals: Arc<AtomicUsize>,
    listeners: Listeners,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.tasks.unbounded_send(Task::CloseConnection {
            reason: "connection handle dropped".into(),
            error: None,
        });
    }
}

/// Handle to an Everlog client. Cloning is cheap; the engine shuts down
/// when [`Connection::close`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates the client and spawns its engine; call
    /// [`Connection::connect`] to actually reach out. Must be called from
    /// within a tokio runtime.
    pub fn create(settings: Settings) -> Self {
        let discoverer: Arc<dyn Discover> = match &settings.target {
            Target::Static(node) => Arc::new(StaticDiscoverer::new(node.clone())),
            Target::Cluster(cluster) => Arc::new(ClusterDiscoverer::new(cluster.clone())),
        };
        Self::with_discoverer(settings, discoverer)
    }

    /// Same as [`Connection::create`] with a custom discoverer.
    pub fn with_discoverer(settings: Settings, discoverer: Arc<dyn Discover>) -> Self {
        let settings = Arc::new(settings);
        let listeners = Listeners::default();
        let totals = Arc::new(AtomicUsize::new(0));
        let tasks = ConnectionDriver::spawn(
            settings.clone(),
            discoverer,
            listeners.clone(),
            totals.clone(),
        );
        Self { inner: Arc::new(Inner { tasks, settings, totals, listeners }) }
    }

    /// Starts the connection lifecycle; resolves once the first channel is
    /// fully up.
    pub async fn connect(&self) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.send_task(Task::StartConnection { done })?;
        rx.await.map_err(|_| closed_error())?
    }

    /// Shuts the client down; all in-flight work fails over to errors.
    pub fn close(&self) {
        let _ = self.inner.tasks.unbounded_send(Task::CloseConnection {
            reason: "close requested by the user".into(),
            error: None,
        });
    }

    /// A stream of lifecycle events. Every call registers an independent
    /// listener.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.inner.listeners.subscribe()
    }

    /// Appends `events` at the end of `stream`.
    pub async fn append_to_stream(
        &self,
        stream: impl Into<String>,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, Error> {
        let stream = stream.into();
        validate_stream_name(&stream)?;
        let (tx, rx) = oneshot::channel();
        let op = write::append_to_stream(
            stream,
            expected_version,
            events,
            self.inner.settings.require_master,
            self.credentials(),
            tx,
        );
        self.submit(op, rx).await
    }

    /// Deletes `stream`; a hard delete makes the name unusable forever.
    pub async fn delete_stream(
        &self,
        stream: impl Into<String>,
        expected_version: ExpectedVersion,
        hard_delete: bool,
    ) -> Result<DeleteResult, Error> {
        let stream = stream.into();
        validate_stream_name(&stream)?;
        let (tx, rx) = oneshot::channel();
        let op = write::delete_stream(
            stream,
            expected_version,
            hard_delete,
            self.inner.settings.require_master,
            self.credentials(),
            tx,
        );
        self.submit(op, rx).await
    }

    /// Reads one event; `-1` reads the latest.
    pub async fn read_event(
        &self,
        stream: impl Into<String>,
        event_number: i64,
        resolve_link_tos: bool,
    ) -> Result<EventReadResult, Error> {
        let stream = stream.into();
        validate_stream_name(&stream)?;
        validate_event_number(event_number)?;
        let (tx, rx) = oneshot::channel();
        let op = read::read_event(
            stream,
            event_number,
            resolve_link_tos,
            self.inner.settings.require_master,
            self.credentials(),
            tx,
        );
        self.submit(op, rx).await
    }

    pub async fn read_stream_events_forward(
        &self,
        stream: impl Into<String>,
        start: i64,
        count: usize,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice, Error> {
        self.read_stream(stream.into(), start, count, ReadDirection::Forward, resolve_link_tos)
            .await
    }

    pub async fn read_stream_events_backward(
        &self,
        stream: impl Into<String>,
        start: i64,
        count: usize,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice, Error> {
        self.read_stream(stream.into(), start, count, ReadDirection::Backward, resolve_link_tos)
            .await
    }

    async fn read_stream(
        &self,
        stream: String,
        start: i64,
        count: usize,
        direction: ReadDirection,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice, Error> {
        validate_stream_name(&stream)?;
        validate_read_count(count)?;
        if direction == ReadDirection::Forward {
            if start < 0 {
                return Err(Error::InvalidArgument(format!(
                    "start must not be negative, got {start}"
                )))
            }
        } else {
            validate_event_number(start)?;
        }
        let (tx, rx) = oneshot::channel();
        let op = read::read_stream_events(
            stream,
            start,
            count as i32,
            direction,
            resolve_link_tos,
            self.inner.settings.require_master,
            self.credentials(),
            tx,
        );
        self.submit(op, rx).await
    }

    pub async fn read_all_events_forward(
        &self,
        position: Position,
        count: usize,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice, Error> {
        self.read_all(position, count, ReadDirection::Forward, resolve_link_tos).await
    }

    pub async fn read_all_events_backward(
        &self,
        position: Position,
        count: usize,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice, Error> {
        self.read_all(position, count, ReadDirection::Backward, resolve_link_tos).await
    }

    async fn read_all(
        &self,
        position: Position,
        count: usize,
        direction: ReadDirection,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice, Error> {
        validate_read_count(count)?;
        let (tx, rx) = oneshot::channel();
        let op = read::read_all_events(
            position,
            count as i32,
            direction,
            resolve_link_tos,
            self.inner.settings.require_master,
            self.credentials(),
            tx,
        );
        self.submit(op, rx).await
    }

    /// Opens a server-side transaction on `stream`.
    pub async fn start_transaction(
        &self,
        stream: impl Into<String>,
        expected_version: ExpectedVersion,
    ) -> Result<Transaction, Error> {
        let stream = stream.into();
        validate_stream_name(&stream)?;
        let (tx, rx) = oneshot::channel();
        let op = write::transaction_start(
            stream,
            expected_version,
            self.inner.settings.require_master,
            self.credentials(),
            tx,
        );
        let id = self.submit(op, rx).await?;
        Ok(Transaction { id, connection: self.clone() })
    }

    /// Writes the metadata document of `stream` into its metastream.
    pub async fn set_stream_metadata(
        &self,
        stream: impl Into<String>,
        expected_metastream_version: ExpectedVersion,
        metadata: &StreamMetadata,
    ) -> Result<WriteResult, Error> {
        let stream = stream.into();
        validate_metadata_target(&stream)?;
        let event = EventData {
            id: Uuid::new_v4(),
            event_type: METADATA_EVENT_TYPE.into(),
            is_json: true,
            data: serde_json::to_vec(metadata)?,
            metadata: Vec::new(),
        };
        self.append_to_stream(metastream_of(&stream), expected_metastream_version, vec![event])
            .await
    }

    /// Reads the latest metadata document of `stream`.
    pub async fn get_stream_metadata(
        &self,
        stream: impl Into<String>,
    ) -> Result<StreamMetadataResult, Error> {
        let stream = stream.into();
        validate_metadata_target(&stream)?;
        let read = self.read_event(metastream_of(&stream), -1, false).await?;
        match read.status {
            EventReadStatus::Success => {
                let event = read
                    .event
                    .as_ref()
                    .and_then(|resolved| resolved.original_event())
                    .ok_or_else(|| {
                        Error::ServerError("metadata read returned no event".into())
                    })?;
                let metadata = serde_json::from_slice(&event.data)?;
                Ok(StreamMetadataResult {
                    stream,
                    deleted: false,
                    version: event.number,
                    metadata,
                })
            }
            EventReadStatus::NotFound | EventReadStatus::NoStream => Ok(StreamMetadataResult {
                stream,
                deleted: false,
                version: -1,
                metadata: StreamMetadata::default(),
            }),
            EventReadStatus::StreamDeleted => Ok(StreamMetadataResult {
                stream,
                deleted: true,
                version: i64::MAX,
                metadata: StreamMetadata::default(),
            }),
        }
    }

    pub async fn create_persistent_subscription(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
        settings: PersistentSubscriptionSettings,
    ) -> Result<(), Error> {
        let (stream, group) = (stream.into(), group.into());
        validate_stream_name(&stream)?;
        validate_group_name(&group)?;
        let (tx, rx) = oneshot::channel();
        let op = persistent::create_persistent_subscription(
            stream,
            group,
            settings,
            self.credentials(),
            tx,
        );
        self.submit(op, rx).await
    }

    pub async fn update_persistent_subscription(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
        settings: PersistentSubscriptionSettings,
    ) -> Result<(), Error> {
        let (stream, group) = (stream.into(), group.into());
        validate_stream_name(&stream)?;
        validate_group_name(&group)?;
        let (tx, rx) = oneshot::channel();
        let op = persistent::update_persistent_subscription(
            stream,
            group,
            settings,
            self.credentials(),
            tx,
        );
        self.submit(op, rx).await
    }

    pub async fn delete_persistent_subscription(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<(), Error> {
        let (stream, group) = (stream.into(), group.into());
        validate_stream_name(&stream)?;
        validate_group_name(&group)?;
        let (tx, rx) = oneshot::channel();
        let op =
            persistent::delete_persistent_subscription(stream, group, self.credentials(), tx);
        self.submit(op, rx).await
    }

    /// Volatile subscription to `stream`; resolves once the server
    /// confirms it.
    pub async fn subscribe_to_stream(
        &self,
        stream: impl Into<String>,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
    ) -> Result<Subscription, Error> {
        let stream = stream.into();
        validate_stream_name(&stream)?;
        self.subscribe(stream, resolve_link_tos, credentials).await
    }

    /// Volatile subscription to everything written to the store.
    pub async fn subscribe_to_all(
        &self,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
    ) -> Result<Subscription, Error> {
        self.subscribe(String::new(), resolve_link_tos, credentials).await
    }

    async fn subscribe(
        &self,
        stream: String,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
    ) -> Result<Subscription, Error> {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded();
        let key = Uuid::new_v4();
        let credentials = credentials.or_else(|| self.credentials());
        let op =
            VolatileSubscription::new(stream, resolve_link_tos, credentials, confirm_tx, event_tx);
        self.send_task(Task::StartSubscription { op: Box::new(op), key })?;

        let confirmed = confirm_rx.await.map_err(|_| closed_error())??;
        Ok(Subscription {
            key,
            last_commit_position: confirmed.last_commit_position,
            last_event_number: confirmed.last_event_number,
            events: event_rx,
            tasks: self.inner.tasks.clone(),
        })
    }

    /// Joins a persistent subscription group as a consumer.
    pub async fn connect_to_persistent_subscription(
        &self,
        stream: impl Into<String>,
        group: impl Into<String>,
        buffer_size: i32,
        credentials: Option<Credentials>,
    ) -> Result<PersistentSubscription, Error> {
        let (stream, group) = (stream.into(), group.into());
        validate_stream_name(&stream)?;
        validate_group_name(&group)?;

        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded();
        let key = Uuid::new_v4();
        let credentials = credentials.or_else(|| self.credentials());
        let op = PersistentConnect::new(
            stream,
            group,
            buffer_size,
            credentials,
            confirm_tx,
            event_tx,
        );
        self.send_task(Task::StartPersistentSubscription { op: Box::new(op), key })?;

        let confirmed = confirm_rx.await.map_err(|_| closed_error())??;
        Ok(PersistentSubscription {
            key,
            subscription_id: confirmed.subscription_id.unwrap_or_default(),
            last_commit_position: confirmed.last_commit_position,
            last_event_number: confirmed.last_event_number,
            events: event_rx,
            tasks: self.inner.tasks.clone(),
        })
    }

    fn credentials(&self) -> Option<Credentials> {
        self.inner.settings.default_credentials.clone()
    }

    fn send_task(&self, task: Task) -> Result<(), Error> {
        self.inner.tasks.unbounded_send(task).map_err(|_| closed_error())
    }

    async fn submit<T>(
        &self,
        op: impl Operation + 'static,
        rx: oneshot::Receiver<Result<T, Error>>,
    ) -> Result<T, Error> {
        self.admit().await;
        self.inner.totals.fetch_add(1, Ordering::Relaxed);
        if self.inner.tasks.unbounded_send(Task::StartOperation { op: Box::new(op) }).is_err() {
            self.inner.totals.fetch_sub(1, Ordering::Relaxed);
            return Err(closed_error())
        }
        rx.await.map_err(|_| closed_error())?
    }

    /// Coarse admission bound on queued plus active operations.
    async fn admit(&self) {
        let max = self.inner.settings.max_operation_queue_size;
        while self.inner.totals.load(Ordering::Relaxed) >= max {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

fn closed_error() -> Error {
    Error::ConnectionClosed("the client is closed".into())
}

/// A live volatile subscription. Yields [`SubscriptionEvent`]s; the stream
/// ends after the terminal `Dropped` event.
pub struct Subscription {
    key: Uuid,
    pub last_commit_position: i64,
    /// `None` on `$all` subscriptions.
    pub last_event_number: Option<i64>,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    tasks: mpsc::UnboundedSender<Task>,
}

impl Subscription {
    /// Asks the server to stop this subscription; the terminal `Dropped`
    /// event arrives through the stream.
    pub fn unsubscribe(&self) {
        let _ = self.tasks.unbounded_send(Task::Unsubscribe { key: self.key });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.tasks.unbounded_send(Task::Unsubscribe { key: self.key });
    }
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// A live persistent subscription consumer.
pub struct PersistentSubscription {
    key: Uuid,
    subscription_id: String,
    pub last_commit_position: i64,
    pub last_event_number: Option<i64>,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    tasks: mpsc::UnboundedSender<Task>,
}

impl PersistentSubscription {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Acknowledges processed events.
    pub fn ack(&self, event_ids: Vec<Uuid>) {
        let _ = self.tasks.unbounded_send(Task::PersistentAck { key: self.key, ids: event_ids });
    }

    /// Negatively acknowledges events with the given disposition.
    pub fn nack(&self, event_ids: Vec<Uuid>, action: NakAction, message: impl Into<String>) {
        let _ = self.tasks.unbounded_send(Task::PersistentNak {
            key: self.key,
            ids: event_ids,
            action,
            message: message.into(),
        });
    }

    pub fn unsubscribe(&self) {
        let _ = self.tasks.unbounded_send(Task::Unsubscribe { key: self.key });
    }
}

impl Drop for PersistentSubscription {
    fn drop(&mut self) {
        let _ = self.tasks.unbounded_send(Task::Unsubscribe { key: self.key });
    }
}

impl Stream for PersistentSubscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// A server-side transaction. Write in batches, then commit.
pub struct Transaction {
    id: i64,
    connection: Connection,
}

impl Transaction {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub async fn write(&self, events: Vec<EventData>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        let op = write::transaction_write(
            self.id,
            events,
            self.connection.inner.settings.require_master,
            self.connection.credentials(),
            tx,
        );
        self.connection.submit(op, rx).await
    }

    pub async fn commit(&self) -> Result<WriteResult, Error> {
        let (tx, rx) = oneshot::channel();
        let op = write::transaction_commit(
            self.id,
            self.connection.inner.settings.require_master,
            self.connection.credentials(),
            tx,
        );
        self.connection.submit(op, rx).await
    }
}

fn validate_stream_name(stream: &str) -> Result<(), Error> {
    if stream.is_empty() {
        return Err(Error::InvalidArgument("stream name must not be empty".into()))
    }
    Ok(())
}

fn validate_group_name(group: &str) -> Result<(), Error> {
    if group.is_empty() {
        return Err(Error::InvalidArgument("group name must not be empty".into()))
    }
    Ok(())
}

fn validate_read_count(count: usize) -> Result<(), Error> {
    if count == 0 || count >= MAX_READ_SIZE {
        return Err(Error::InvalidArgument(format!(
            "count must be between 1 and {}, got {count}",
            MAX_READ_SIZE - 1
        )))
    }
    Ok(())
}

fn validate_event_number(event_number: i64) -> Result<(), Error> {
    if event_number < -1 {
        return Err(Error::InvalidArgument(format!(
            "event number must be -1 or above, got {event_number}"
        )))
    }
    Ok(())
}

fn validate_metadata_target(stream: &str) -> Result<(), Error> {
    validate_stream_name(stream)?;
    if is_metastream(stream) {
        return Err(Error::InvalidArgument(format!(
            "'{stream}' is a metastream and has no metadata of its own"
        )))
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_count_bounds() {
        assert!(validate_read_count(0).is_err());
        assert!(validate_read_count(1).is_ok());
        assert!(validate_read_count(MAX_READ_SIZE - 1).is_ok());
        assert!(validate_read_count(MAX_READ_SIZE).is_err());
    }

    #[test]
    fn event_number_bounds() {
        assert!(validate_event_number(-2).is_err());
        assert!(validate_event_number(-1).is_ok());
        assert!(validate_event_number(0).is_ok());
    }

    #[test]
    fn metadata_must_not_target_a_metastream() {
        assert!(validate_metadata_target("orders").is_ok());
        assert!(validate_metadata_target("$$orders").is_err());
        assert!(validate_metadata_target("").is_err());
    }

    #[test]
    fn stream_names_must_not_be_empty() {
        assert!(validate_stream_name("").is_err());
        assert!(validate_stream_name("s").is_ok());
    }
}
