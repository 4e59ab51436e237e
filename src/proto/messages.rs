//! Payload schemas, one per command pair.
//!
//! Every message encodes to and decodes from the little-endian layout in
//! the wire primitives; responses are encodable too so test servers can be
//! built from the same definitions.

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use super::{
    wire::{Reader, Writer},
    CodecError,
};
use crate::types::{
    EventData, PersistentSubscriptionSettings, Position, RecordedEvent, ResolvedEvent,
    SubDropReason, SystemConsumerStrategy,
};

/// Result code shared by writes, deletes and transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Success,
    PrepareTimeout,
    CommitTimeout,
    ForwardTimeout,
    WrongExpectedVersion,
    StreamDeleted,
    InvalidTransaction,
    AccessDenied,
}

impl OperationResult {
    fn from_wire(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0 => OperationResult::Success,
            1 => OperationResult::PrepareTimeout,
            2 => OperationResult::CommitTimeout,
            3 => OperationResult::ForwardTimeout,
            4 => OperationResult::WrongExpectedVersion,
            5 => OperationResult::StreamDeleted,
            6 => OperationResult::InvalidTransaction,
            7 => OperationResult::AccessDenied,
            other => return Err(CodecError::UnknownValue("operation result", other)),
        })
    }

    fn to_wire(self) -> u8 {
        match self {
            OperationResult::Success => 0,
            OperationResult::PrepareTimeout => 1,
            OperationResult::CommitTimeout => 2,
            OperationResult::ForwardTimeout => 3,
            OperationResult::WrongExpectedVersion => 4,
            OperationResult::StreamDeleted => 5,
            OperationResult::InvalidTransaction => 6,
            OperationResult::AccessDenied => 7,
        }
    }

    /// Transient server-side conditions the client retries in-band.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            OperationResult::PrepareTimeout |
                OperationResult::CommitTimeout |
                OperationResult::ForwardTimeout
        )
    }
}

fn put_new_event(w: &mut Writer<'_>, event: &EventData) {
    w.uuid(event.id);
    w.string(&event.event_type);
    w.boolean(event.is_json);
    w.bytes(&event.data);
    w.bytes(&event.metadata);
}

fn read_new_event(r: &mut Reader<'_>) -> Result<EventData, CodecError> {
    Ok(EventData {
        id: r.uuid("event id")?,
        event_type: r.string("event type")?,
        is_json: r.boolean("event content flag")?,
        data: r.bytes("event data")?,
        metadata: r.bytes("event metadata")?,
    })
}

fn put_recorded_event(w: &mut Writer<'_>, event: &RecordedEvent) {
    w.string(&event.stream);
    w.uuid(event.id);
    w.i64(event.number);
    w.string(&event.event_type);
    w.boolean(event.is_json);
    w.bytes(&event.data);
    w.bytes(&event.metadata);
    w.i64(event.created_millis);
}

fn read_recorded_event(r: &mut Reader<'_>) -> Result<RecordedEvent, CodecError> {
    Ok(RecordedEvent {
        stream: r.string("recorded stream")?,
        id: r.uuid("recorded event id")?,
        number: r.i64("recorded event number")?,
        event_type: r.string("recorded event type")?,
        is_json: r.boolean("recorded content flag")?,
        data: r.bytes("recorded data")?,
        metadata: r.bytes("recorded metadata")?,
        created_millis: r.i64("recorded created")?,
    })
}

pub(crate) fn put_resolved_event(w: &mut Writer<'_>, event: &ResolvedEvent) {
    let mut tags = 0u8;
    if event.event.is_some() {
        tags |= 0x01;
    }
    if event.link.is_some() {
        tags |= 0x02;
    }
    w.u8(tags);
    if let Some(e) = &event.event {
        put_recorded_event(w, e);
    }
    if let Some(l) = &event.link {
        put_recorded_event(w, l);
    }
    let position = event.position.unwrap_or(Position::END);
    w.i64(position.commit);
    w.i64(position.prepare);
}

pub(crate) fn read_resolved_event(r: &mut Reader<'_>) -> Result<ResolvedEvent, CodecError> {
    let tags = r.u8("resolved event tags")?;
    let event = if tags & 0x01 != 0 { Some(read_recorded_event(r)?) } else { None };
    let link = if tags & 0x02 != 0 { Some(read_recorded_event(r)?) } else { None };
    let commit = r.i64("resolved commit position")?;
    let prepare = r.i64("resolved prepare position")?;
    let position =
        if commit < 0 { None } else { Some(Position { commit, prepare }) };
    Ok(ResolvedEvent { event, link, position })
}

fn put_resolved_events(w: &mut Writer<'_>, events: &[ResolvedEvent]) {
    w.u32(events.len() as u32);
    for event in events {
        put_resolved_event(w, event);
    }
}

fn read_resolved_events(r: &mut Reader<'_>) -> Result<Vec<ResolvedEvent>, CodecError> {
    let count = r.u32("event count")? as usize;
    let mut events = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        events.push(read_resolved_event(r)?);
    }
    Ok(events)
}

fn encode_with(f: impl FnOnce(&mut Writer<'_>)) -> Bytes {
    let mut buf = BytesMut::new();
    let mut w = Writer::new(&mut buf);
    f(&mut w);
    buf.freeze()
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteEvents {
    pub stream: String,
    pub expected_version: i64,
    pub require_master: bool,
    pub events: Vec<EventData>,
}

impl WriteEvents {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.stream);
            w.i64(self.expected_version);
            w.boolean(self.require_master);
            w.u32(self.events.len() as u32);
            for event in &self.events {
                put_new_event(w, event);
            }
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        let stream = r.string("stream")?;
        let expected_version = r.i64("expected version")?;
        let require_master = r.boolean("require master")?;
        let count = r.u32("event count")? as usize;
        let mut events = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            events.push(read_new_event(&mut r)?);
        }
        Ok(Self { stream, expected_version, require_master, events })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteEventsCompleted {
    pub result: OperationResult,
    pub message: String,
    pub first_event_number: i64,
    pub last_event_number: i64,
    pub prepare_position: i64,
    pub commit_position: i64,
}

impl WriteEventsCompleted {
    pub fn success(last_event_number: i64) -> Self {
        Self {
            result: OperationResult::Success,
            message: String::new(),
            first_event_number: 0,
            last_event_number,
            prepare_position: last_event_number,
            commit_position: last_event_number,
        }
    }

    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.u8(self.result.to_wire());
            w.string(&self.message);
            w.i64(self.first_event_number);
            w.i64(self.last_event_number);
            w.i64(self.prepare_position);
            w.i64(self.commit_position);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            result: OperationResult::from_wire(r.u8("result")?)?,
            message: r.string("message")?,
            first_event_number: r.i64("first event number")?,
            last_event_number: r.i64("last event number")?,
            prepare_position: r.i64("prepare position")?,
            commit_position: r.i64("commit position")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStream {
    pub stream: String,
    pub expected_version: i64,
    pub require_master: bool,
    pub hard_delete: bool,
}

impl DeleteStream {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.stream);
            w.i64(self.expected_version);
            w.boolean(self.require_master);
            w.boolean(self.hard_delete);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            stream: r.string("stream")?,
            expected_version: r.i64("expected version")?,
            require_master: r.boolean("require master")?,
            hard_delete: r.boolean("hard delete")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStreamCompleted {
    pub result: OperationResult,
    pub message: String,
    pub prepare_position: i64,
    pub commit_position: i64,
}

impl DeleteStreamCompleted {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.u8(self.result.to_wire());
            w.string(&self.message);
            w.i64(self.prepare_position);
            w.i64(self.commit_position);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            result: OperationResult::from_wire(r.u8("result")?)?,
            message: r.string("message")?,
            prepare_position: r.i64("prepare position")?,
            commit_position: r.i64("commit position")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionStart {
    pub stream: String,
    pub expected_version: i64,
    pub require_master: bool,
}

impl TransactionStart {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.stream);
            w.i64(self.expected_version);
            w.boolean(self.require_master);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            stream: r.string("stream")?,
            expected_version: r.i64("expected version")?,
            require_master: r.boolean("require master")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionStartCompleted {
    pub transaction_id: i64,
    pub result: OperationResult,
    pub message: String,
}

impl TransactionStartCompleted {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.i64(self.transaction_id);
            w.u8(self.result.to_wire());
            w.string(&self.message);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            transaction_id: r.i64("transaction id")?,
            result: OperationResult::from_wire(r.u8("result")?)?,
            message: r.string("message")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionWrite {
    pub transaction_id: i64,
    pub require_master: bool,
    pub events: Vec<EventData>,
}

impl TransactionWrite {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.i64(self.transaction_id);
            w.boolean(self.require_master);
            w.u32(self.events.len() as u32);
            for event in &self.events {
                put_new_event(w, event);
            }
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        let transaction_id = r.i64("transaction id")?;
        let require_master = r.boolean("require master")?;
        let count = r.u32("event count")? as usize;
        let mut events = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            events.push(read_new_event(&mut r)?);
        }
        Ok(Self { transaction_id, require_master, events })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionWriteCompleted {
    pub transaction_id: i64,
    pub result: OperationResult,
    pub message: String,
}

impl TransactionWriteCompleted {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.i64(self.transaction_id);
            w.u8(self.result.to_wire());
            w.string(&self.message);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            transaction_id: r.i64("transaction id")?,
            result: OperationResult::from_wire(r.u8("result")?)?,
            message: r.string("message")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionCommit {
    pub transaction_id: i64,
    pub require_master: bool,
}

impl TransactionCommit {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.i64(self.transaction_id);
            w.boolean(self.require_master);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            transaction_id: r.i64("transaction id")?,
            require_master: r.boolean("require master")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionCommitCompleted {
    pub transaction_id: i64,
    pub result: OperationResult,
    pub message: String,
    pub first_event_number: i64,
    pub last_event_number: i64,
    pub prepare_position: i64,
    pub commit_position: i64,
}

impl TransactionCommitCompleted {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.i64(self.transaction_id);
            w.u8(self.result.to_wire());
            w.string(&self.message);
            w.i64(self.first_event_number);
            w.i64(self.last_event_number);
            w.i64(self.prepare_position);
            w.i64(self.commit_position);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            transaction_id: r.i64("transaction id")?,
            result: OperationResult::from_wire(r.u8("result")?)?,
            message: r.string("message")?,
            first_event_number: r.i64("first event number")?,
            last_event_number: r.i64("last event number")?,
            prepare_position: r.i64("prepare position")?,
            commit_position: r.i64("commit position")?,
        })
    }
}

/// Result code of single-event reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEventResult {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
    Error,
    AccessDenied,
}

impl ReadEventResult {
    fn from_wire(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0 => ReadEventResult::Success,
            1 => ReadEventResult::NotFound,
            2 => ReadEventResult::NoStream,
            3 => ReadEventResult::StreamDeleted,
            4 => ReadEventResult::Error,
            5 => ReadEventResult::AccessDenied,
            other => return Err(CodecError::UnknownValue("read event result", other)),
        })
    }

    fn to_wire(self) -> u8 {
        match self {
            ReadEventResult::Success => 0,
            ReadEventResult::NotFound => 1,
            ReadEventResult::NoStream => 2,
            ReadEventResult::StreamDeleted => 3,
            ReadEventResult::Error => 4,
            ReadEventResult::AccessDenied => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadEvent {
    pub stream: String,
    pub event_number: i64,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

impl ReadEvent {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.stream);
            w.i64(self.event_number);
            w.boolean(self.resolve_link_tos);
            w.boolean(self.require_master);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            stream: r.string("stream")?,
            event_number: r.i64("event number")?,
            resolve_link_tos: r.boolean("resolve links")?,
            require_master: r.boolean("require master")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadEventCompleted {
    pub result: ReadEventResult,
    pub event: Option<ResolvedEvent>,
    pub error: String,
}

impl ReadEventCompleted {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.u8(self.result.to_wire());
            match &self.event {
                Some(event) => {
                    w.boolean(true);
                    put_resolved_event(w, event);
                }
                None => w.boolean(false),
            }
            w.string(&self.error);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        let result = ReadEventResult::from_wire(r.u8("result")?)?;
        let event =
            if r.boolean("event present")? { Some(read_resolved_event(&mut r)?) } else { None };
        let error = r.string("error")?;
        Ok(Self { result, event, error })
    }
}

/// Result code of slice reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceResult {
    Success,
    NoStream,
    StreamDeleted,
    NotModified,
    Error,
    AccessDenied,
}

impl SliceResult {
    fn from_wire(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0 => SliceResult::Success,
            1 => SliceResult::NoStream,
            2 => SliceResult::StreamDeleted,
            3 => SliceResult::NotModified,
            4 => SliceResult::Error,
            5 => SliceResult::AccessDenied,
            other => return Err(CodecError::UnknownValue("slice result", other)),
        })
    }

    fn to_wire(self) -> u8 {
        match self {
            SliceResult::Success => 0,
            SliceResult::NoStream => 1,
            SliceResult::StreamDeleted => 2,
            SliceResult::NotModified => 3,
            SliceResult::Error => 4,
            SliceResult::AccessDenied => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadStreamEvents {
    pub stream: String,
    pub from_event_number: i64,
    pub max_count: i32,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

impl ReadStreamEvents {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.stream);
            w.i64(self.from_event_number);
            w.i32(self.max_count);
            w.boolean(self.resolve_link_tos);
            w.boolean(self.require_master);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            stream: r.string("stream")?,
            from_event_number: r.i64("from event number")?,
            max_count: r.i32("max count")?,
            resolve_link_tos: r.boolean("resolve links")?,
            require_master: r.boolean("require master")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadStreamEventsCompleted {
    pub result: SliceResult,
    pub events: Vec<ResolvedEvent>,
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
    pub last_commit_position: i64,
    pub error: String,
}

impl ReadStreamEventsCompleted {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.u8(self.result.to_wire());
            put_resolved_events(w, &self.events);
            w.i64(self.next_event_number);
            w.i64(self.last_event_number);
            w.boolean(self.is_end_of_stream);
            w.i64(self.last_commit_position);
            w.string(&self.error);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            result: SliceResult::from_wire(r.u8("result")?)?,
            events: read_resolved_events(&mut r)?,
            next_event_number: r.i64("next event number")?,
            last_event_number: r.i64("last event number")?,
            is_end_of_stream: r.boolean("end of stream")?,
            last_commit_position: r.i64("last commit position")?,
            error: r.string("error")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadAllEvents {
    pub commit_position: i64,
    pub prepare_position: i64,
    pub max_count: i32,
    pub resolve_link_tos: bool,
    pub require_master: bool,
}

impl ReadAllEvents {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.i64(self.commit_position);
            w.i64(self.prepare_position);
            w.i32(self.max_count);
            w.boolean(self.resolve_link_tos);
            w.boolean(self.require_master);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            commit_position: r.i64("commit position")?,
            prepare_position: r.i64("prepare position")?,
            max_count: r.i32("max count")?,
            resolve_link_tos: r.boolean("resolve links")?,
            require_master: r.boolean("require master")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadAllEventsCompleted {
    pub result: SliceResult,
    pub commit_position: i64,
    pub prepare_position: i64,
    pub events: Vec<ResolvedEvent>,
    pub next_commit_position: i64,
    pub next_prepare_position: i64,
    pub error: String,
}

impl ReadAllEventsCompleted {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.u8(self.result.to_wire());
            w.i64(self.commit_position);
            w.i64(self.prepare_position);
            put_resolved_events(w, &self.events);
            w.i64(self.next_commit_position);
            w.i64(self.next_prepare_position);
            w.string(&self.error);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            result: SliceResult::from_wire(r.u8("result")?)?,
            commit_position: r.i64("commit position")?,
            prepare_position: r.i64("prepare position")?,
            events: read_resolved_events(&mut r)?,
            next_commit_position: r.i64("next commit position")?,
            next_prepare_position: r.i64("next prepare position")?,
            error: r.string("error")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeToStream {
    /// Empty subscribes to `$all`.
    pub stream: String,
    pub resolve_link_tos: bool,
}

impl SubscribeToStream {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.stream);
            w.boolean(self.resolve_link_tos);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            stream: r.string("stream")?,
            resolve_link_tos: r.boolean("resolve links")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfirmation {
    pub last_commit_position: i64,
    /// -1 for `$all` subscriptions.
    pub last_event_number: i64,
}

impl SubscriptionConfirmation {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.i64(self.last_commit_position);
            w.i64(self.last_event_number);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            last_commit_position: r.i64("last commit position")?,
            last_event_number: r.i64("last event number")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEventAppeared {
    pub event: ResolvedEvent,
}

impl StreamEventAppeared {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| put_resolved_event(w, &self.event))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self { event: read_resolved_event(&mut r)? })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDropped {
    pub reason: SubDropReason,
}

impl SubscriptionDropped {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| w.u8(self.reason.to_wire()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        let raw = r.u8("drop reason")?;
        let reason = SubDropReason::from_wire(raw)
            .ok_or(CodecError::UnknownValue("drop reason", raw))?;
        Ok(Self { reason })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectToPersistentSubscription {
    pub group: String,
    pub stream: String,
    pub allowed_in_flight_messages: i32,
}

impl ConnectToPersistentSubscription {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.group);
            w.string(&self.stream);
            w.i32(self.allowed_in_flight_messages);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            group: r.string("group")?,
            stream: r.string("stream")?,
            allowed_in_flight_messages: r.i32("allowed in flight")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentSubscriptionConfirmation {
    pub last_commit_position: i64,
    pub subscription_id: String,
    pub last_event_number: i64,
}

impl PersistentSubscriptionConfirmation {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.i64(self.last_commit_position);
            w.string(&self.subscription_id);
            w.i64(self.last_event_number);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            last_commit_position: r.i64("last commit position")?,
            subscription_id: r.string("subscription id")?,
            last_event_number: r.i64("last event number")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentSubscriptionStreamEventAppeared {
    pub event: ResolvedEvent,
    pub retry_count: i32,
}

impl PersistentSubscriptionStreamEventAppeared {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            put_resolved_event(w, &self.event);
            w.i32(self.retry_count);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            event: read_resolved_event(&mut r)?,
            retry_count: r.i32("retry count")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentSubscriptionAckEvents {
    pub subscription_id: String,
    pub event_ids: Vec<Uuid>,
}

impl PersistentSubscriptionAckEvents {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.subscription_id);
            w.u32(self.event_ids.len() as u32);
            for id in &self.event_ids {
                w.uuid(*id);
            }
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        let subscription_id = r.string("subscription id")?;
        let count = r.u32("event id count")? as usize;
        let mut event_ids = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            event_ids.push(r.uuid("event id")?);
        }
        Ok(Self { subscription_id, event_ids })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentSubscriptionNakEvents {
    pub subscription_id: String,
    pub event_ids: Vec<Uuid>,
    pub action: u8,
    pub message: String,
}

impl PersistentSubscriptionNakEvents {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.subscription_id);
            w.u32(self.event_ids.len() as u32);
            for id in &self.event_ids {
                w.uuid(*id);
            }
            w.u8(self.action);
            w.string(&self.message);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        let subscription_id = r.string("subscription id")?;
        let count = r.u32("event id count")? as usize;
        let mut event_ids = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            event_ids.push(r.uuid("event id")?);
        }
        Ok(Self {
            subscription_id,
            event_ids,
            action: r.u8("nak action")?,
            message: r.string("message")?,
        })
    }
}

fn put_persistent_settings(w: &mut Writer<'_>, s: &PersistentSubscriptionSettings) {
    w.boolean(s.resolve_link_tos);
    w.i64(s.start_from);
    w.i32(s.message_timeout_millis);
    w.i32(s.max_retry_count);
    w.i32(s.live_buffer_size);
    w.i32(s.read_batch_size);
    w.i32(s.history_buffer_size);
    w.i32(s.checkpoint_after_millis);
    w.i32(s.min_checkpoint_count);
    w.i32(s.max_checkpoint_count);
    w.i32(s.max_subscriber_count);
    w.string(s.consumer_strategy.as_str());
}

fn read_persistent_settings(
    r: &mut Reader<'_>,
) -> Result<PersistentSubscriptionSettings, CodecError> {
    let resolve_link_tos = r.boolean("resolve links")?;
    let start_from = r.i64("start from")?;
    let message_timeout_millis = r.i32("message timeout")?;
    let max_retry_count = r.i32("max retry count")?;
    let live_buffer_size = r.i32("live buffer size")?;
    let read_batch_size = r.i32("read batch size")?;
    let history_buffer_size = r.i32("history buffer size")?;
    let checkpoint_after_millis = r.i32("checkpoint after")?;
    let min_checkpoint_count = r.i32("min checkpoint count")?;
    let max_checkpoint_count = r.i32("max checkpoint count")?;
    let max_subscriber_count = r.i32("max subscriber count")?;
    let consumer_strategy = match r.string("consumer strategy")?.as_str() {
        "DispatchToSingle" => SystemConsumerStrategy::DispatchToSingle,
        "Pinned" => SystemConsumerStrategy::Pinned,
        _ => SystemConsumerStrategy::RoundRobin,
    };
    Ok(PersistentSubscriptionSettings {
        resolve_link_tos,
        start_from,
        message_timeout_millis,
        max_retry_count,
        live_buffer_size,
        read_batch_size,
        history_buffer_size,
        checkpoint_after_millis,
        min_checkpoint_count,
        max_checkpoint_count,
        max_subscriber_count,
        consumer_strategy,
    })
}

/// Create and update requests share this shape.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentSubscriptionUpsert {
    pub group: String,
    pub stream: String,
    pub settings: PersistentSubscriptionSettings,
}

impl PersistentSubscriptionUpsert {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.group);
            w.string(&self.stream);
            put_persistent_settings(w, &self.settings);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            group: r.string("group")?,
            stream: r.string("stream")?,
            settings: read_persistent_settings(&mut r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletePersistentSubscription {
    pub group: String,
    pub stream: String,
}

impl DeletePersistentSubscription {
    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.string(&self.group);
            w.string(&self.stream);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self { group: r.string("group")?, stream: r.string("stream")? })
    }
}

/// Completion of persistent-subscription CRUD. Result values are
/// per-command: 0 is always success, 1 is already-exists (create) or
/// does-not-exist (update/delete), 2 is a generic failure, 3 is access
/// denied.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentSubscriptionCompleted {
    pub result: u8,
    pub reason: String,
}

impl PersistentSubscriptionCompleted {
    pub fn success() -> Self {
        Self { result: 0, reason: String::new() }
    }

    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.u8(self.result);
            w.string(&self.reason);
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        Ok(Self { result: r.u8("result")?, reason: r.string("reason")? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotHandledReason {
    NotReady,
    TooBusy,
    NotMaster,
}

impl NotHandledReason {
    fn from_wire(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0 => NotHandledReason::NotReady,
            1 => NotHandledReason::TooBusy,
            2 => NotHandledReason::NotMaster,
            other => return Err(CodecError::UnknownValue("not handled reason", other)),
        })
    }

    fn to_wire(self) -> u8 {
        match self {
            NotHandledReason::NotReady => 0,
            NotHandledReason::TooBusy => 1,
            NotHandledReason::NotMaster => 2,
        }
    }
}

/// Where the current master listens, attached to not-master responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInfo {
    pub tcp_address: String,
    pub tcp_port: u16,
    pub secure_tcp_address: Option<String>,
    pub secure_tcp_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotHandled {
    pub reason: NotHandledReason,
    pub master: Option<MasterInfo>,
}

impl NotHandled {
    pub fn too_busy() -> Self {
        Self { reason: NotHandledReason::TooBusy, master: None }
    }

    pub fn not_master(address: impl Into<String>, port: u16) -> Self {
        Self {
            reason: NotHandledReason::NotMaster,
            master: Some(MasterInfo {
                tcp_address: address.into(),
                tcp_port: port,
                secure_tcp_address: None,
                secure_tcp_port: None,
            }),
        }
    }

    pub fn encode(&self) -> Bytes {
        encode_with(|w| {
            w.u8(self.reason.to_wire());
            match &self.master {
                Some(info) => {
                    w.boolean(true);
                    w.string(&info.tcp_address);
                    w.u16(info.tcp_port);
                    w.opt_string(info.secure_tcp_address.as_deref());
                    match info.secure_tcp_port {
                        Some(port) => {
                            w.boolean(true);
                            w.u16(port);
                        }
                        None => w.boolean(false),
                    }
                }
                None => w.boolean(false),
            }
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(payload);
        let reason = NotHandledReason::from_wire(r.u8("reason")?)?;
        let master = if r.boolean("master info present")? {
            let tcp_address = r.string("master tcp address")?;
            let tcp_port = r.u16("master tcp port")?;
            let secure_tcp_address = r.opt_string("master secure tcp address")?;
            let secure_tcp_port =
                if r.boolean("master secure tcp port present")? {
                    Some(r.u16("master secure tcp port")?)
                } else {
                    None
                };
            Some(MasterInfo { tcp_address, tcp_port, secure_tcp_address, secure_tcp_port })
        } else {
            None
        };
        Ok(Self { reason, master })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_recorded(stream: &str, number: i64) -> RecordedEvent {
        RecordedEvent {
            stream: stream.into(),
            id: Uuid::new_v4(),
            number,
            event_type: "t".into(),
            is_json: false,
            data: vec![0x01],
            metadata: vec![],
            created_millis: 1_700_000_000_000,
        }
    }

    #[test]
    fn write_events_round_trips() {
        let msg = WriteEvents {
            stream: "orders".into(),
            expected_version: -2,
            require_master: true,
            events: vec![EventData::binary("order-placed", vec![1, 2, 3])],
        };
        assert_eq!(WriteEvents::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn resolved_event_round_trips_with_link_and_position() {
        let event = ResolvedEvent {
            event: Some(sample_recorded("orders", 3)),
            link: Some(sample_recorded("$ce-orders", 17)),
            position: Some(Position { commit: 1024, prepare: 1024 }),
        };
        let msg = StreamEventAppeared { event };
        assert_eq!(StreamEventAppeared::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn read_stream_completed_round_trips() {
        let msg = ReadStreamEventsCompleted {
            result: SliceResult::Success,
            events: vec![ResolvedEvent {
                event: Some(sample_recorded("orders", 0)),
                link: None,
                position: None,
            }],
            next_event_number: 1,
            last_event_number: 0,
            is_end_of_stream: true,
            last_commit_position: 77,
            error: String::new(),
        };
        assert_eq!(ReadStreamEventsCompleted::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn not_handled_round_trips_master_info() {
        let msg = NotHandled::not_master("10.0.0.7", 1113);
        assert_eq!(NotHandled::decode(&msg.encode()).unwrap(), msg);

        let busy = NotHandled::too_busy();
        assert_eq!(NotHandled::decode(&busy.encode()).unwrap(), busy);
    }

    #[test]
    fn persistent_upsert_round_trips() {
        let msg = PersistentSubscriptionUpsert {
            group: "billing".into(),
            stream: "orders".into(),
            settings: PersistentSubscriptionSettings::default(),
        };
        assert_eq!(PersistentSubscriptionUpsert::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let msg = WriteEventsCompleted::success(4).encode();
        let err = WriteEventsCompleted::decode(&msg[..msg.len() - 2]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated(_)));
    }
}
