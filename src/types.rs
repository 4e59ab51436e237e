//! Data types exchanged with Everlog nodes.

use std::net::SocketAddr;

use serde::Serialize;
use uuid::Uuid;

/// Concurrency guard for writes and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Disables the optimistic concurrency check
    Any,
    /// The stream must not exist yet
    NoStream,
    /// The last event in the stream must have exactly this number
    Exact(u64),
}

impl ExpectedVersion {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            ExpectedVersion::Any => -2,
            ExpectedVersion::NoStream => -1,
            ExpectedVersion::Exact(n) => n as i64,
        }
    }
}

/// A transaction-log position: commit and prepare offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub commit: i64,
    pub prepare: i64,
}

impl Position {
    /// The beginning of the transaction log.
    pub const START: Position = Position { commit: 0, prepare: 0 };
    /// The current end of the transaction log.
    pub const END: Position = Position { commit: -1, prepare: -1 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// An event to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl EventData {
    /// A JSON event, serialized through serde.
    pub fn json<T: Serialize + ?Sized>(
        event_type: impl Into<String>,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: true,
            data: serde_json::to_vec(data)?,
            metadata: Vec::new(),
        })
    }

    /// An opaque binary event.
    pub fn binary(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: false,
            data,
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An event as stored by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub stream: String,
    pub id: Uuid,
    pub number: i64,
    pub event_type: String,
    pub is_json: bool,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
    /// Milliseconds since the Unix epoch; 0 when the server did not say.
    pub created_millis: i64,
}

/// An event plus, when link resolution is on, the link event that pointed
/// at it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub event: Option<RecordedEvent>,
    pub link: Option<RecordedEvent>,
    /// Log position, present on reads from `$all` and subscription pushes.
    pub position: Option<Position>,
}

impl ResolvedEvent {
    /// The event as it was read: the link itself when one exists.
    pub fn original_event(&self) -> Option<&RecordedEvent> {
        self.link.as_ref().or(self.event.as_ref())
    }
}

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub next_expected_version: i64,
    pub position: Position,
}

/// Outcome of a successful stream deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReadStatus {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
}

/// Outcome of reading a single event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventReadResult {
    pub status: EventReadStatus,
    pub stream: String,
    pub event_number: i64,
    pub event: Option<ResolvedEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

/// A slice of a single stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEventsSlice {
    pub status: SliceReadStatus,
    pub stream: String,
    pub from_event_number: i64,
    pub direction: ReadDirection,
    pub events: Vec<ResolvedEvent>,
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
}

/// A slice of the `$all` stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AllEventsSlice {
    pub direction: ReadDirection,
    pub from_position: Position,
    pub next_position: Position,
    pub events: Vec<ResolvedEvent>,
}

impl AllEventsSlice {
    pub fn is_end_of_stream(&self) -> bool {
        self.events.is_empty()
    }
}

/// TCP endpoints of a resolved node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoints {
    /// Name to dial and to present for TLS verification; may be an IP.
    pub hostname: String,
    pub tcp: Option<SocketAddr>,
    pub secure_tcp: Option<SocketAddr>,
}

/// Something the server pushed down a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    EventAppeared(ResolvedEvent),
    /// Terminal; nothing follows it.
    Dropped(SubDropReason),
}

/// Why a subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDropReason {
    Unsubscribed,
    AccessDenied,
    NotFound,
    PersistentSubscriptionDeleted,
    MaxSubscribersReached,
    /// Client side only: the carrying connection went away.
    ConnectionClosed,
}

impl SubDropReason {
    pub(crate) fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => SubDropReason::Unsubscribed,
            1 => SubDropReason::AccessDenied,
            2 => SubDropReason::NotFound,
            3 => SubDropReason::PersistentSubscriptionDeleted,
            4 => SubDropReason::MaxSubscribersReached,
            _ => return None,
        })
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            SubDropReason::Unsubscribed => 0,
            SubDropReason::AccessDenied => 1,
            SubDropReason::NotFound => 2,
            SubDropReason::PersistentSubscriptionDeleted => 3,
            SubDropReason::MaxSubscribersReached => 4,
            SubDropReason::ConnectionClosed => 0,
        }
    }
}

/// What to do with events negatively acknowledged on a persistent
/// subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakAction {
    Unknown,
    Park,
    Retry,
    Skip,
    Stop,
}

impl NakAction {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            NakAction::Unknown => 0,
            NakAction::Park => 1,
            NakAction::Retry => 2,
            NakAction::Skip => 3,
            NakAction::Stop => 4,
        }
    }
}

/// How a persistent subscription distributes events among its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemConsumerStrategy {
    DispatchToSingle,
    RoundRobin,
    Pinned,
}

impl SystemConsumerStrategy {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            SystemConsumerStrategy::DispatchToSingle => "DispatchToSingle",
            SystemConsumerStrategy::RoundRobin => "RoundRobin",
            SystemConsumerStrategy::Pinned => "Pinned",
        }
    }
}

/// Server-side behavior of a persistent subscription group.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentSubscriptionSettings {
    pub resolve_link_tos: bool,
    /// Event number to start from; -1 means the end of the stream.
    pub start_from: i64,
    pub message_timeout_millis: i32,
    pub max_retry_count: i32,
    pub live_buffer_size: i32,
    pub read_batch_size: i32,
    pub history_buffer_size: i32,
    pub checkpoint_after_millis: i32,
    pub min_checkpoint_count: i32,
    pub max_checkpoint_count: i32,
    /// 0 means unlimited.
    pub max_subscriber_count: i32,
    pub consumer_strategy: SystemConsumerStrategy,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: -1,
            message_timeout_millis: 30_000,
            max_retry_count: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            checkpoint_after_millis: 2_000,
            min_checkpoint_count: 10,
            max_checkpoint_count: 1_000,
            max_subscriber_count: 0,
            consumer_strategy: SystemConsumerStrategy::RoundRobin,
        }
    }
}
