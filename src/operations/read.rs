//! Read-side operations.

use futures_channel::oneshot;

use super::{Outcome, RequestResponse};
use crate::{
    errors::Error,
    proto::{command, messages},
    settings::Credentials,
    types::{
        AllEventsSlice, EventReadResult, EventReadStatus, Position, ReadDirection,
        SliceReadStatus, StreamEventsSlice,
    },
};

fn malformed(name: &str, e: impl std::fmt::Display) -> Error {
    Error::ServerError(format!("malformed {name} response: {e}"))
}

pub(crate) fn read_event(
    stream: String,
    event_number: i64,
    resolve_link_tos: bool,
    require_master: bool,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<EventReadResult, Error>>,
) -> RequestResponse<EventReadResult> {
    let payload = messages::ReadEvent {
        stream: stream.clone(),
        event_number,
        resolve_link_tos,
        require_master,
    }
    .encode();

    RequestResponse::new(
        "read-event",
        command::READ_EVENT,
        command::READ_EVENT_COMPLETED,
        payload,
        credentials,
        completion,
        move |body| {
            let msg = match messages::ReadEventCompleted::decode(body) {
                Ok(msg) => msg,
                Err(e) => return Outcome::Fail(malformed("read-event", e)),
            };
            let status = match msg.result {
                messages::ReadEventResult::Success => EventReadStatus::Success,
                messages::ReadEventResult::NotFound => EventReadStatus::NotFound,
                messages::ReadEventResult::NoStream => EventReadStatus::NoStream,
                messages::ReadEventResult::StreamDeleted => EventReadStatus::StreamDeleted,
                messages::ReadEventResult::Error => {
                    return Outcome::Fail(Error::ServerError(format!(
                        "read of '{stream}' failed: {}",
                        msg.error
                    )))
                }
                messages::ReadEventResult::AccessDenied => {
                    return Outcome::Fail(Error::AccessDenied(format!("read of '{stream}'")))
                }
            };
            Outcome::Done(EventReadResult {
                status,
                stream: stream.clone(),
                event_number,
                event: msg.event,
            })
        },
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn read_stream_events(
    stream: String,
    from_event_number: i64,
    max_count: i32,
    direction: ReadDirection,
    resolve_link_tos: bool,
    require_master: bool,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<StreamEventsSlice, Error>>,
) -> RequestResponse<StreamEventsSlice> {
    let (request_command, response_command) = match direction {
        ReadDirection::Forward => (
            command::READ_STREAM_EVENTS_FORWARD,
            command::READ_STREAM_EVENTS_FORWARD_COMPLETED,
        ),
        ReadDirection::Backward => (
            command::READ_STREAM_EVENTS_BACKWARD,
            command::READ_STREAM_EVENTS_BACKWARD_COMPLETED,
        ),
    };
    let payload = messages::ReadStreamEvents {
        stream: stream.clone(),
        from_event_number,
        max_count,
        resolve_link_tos,
        require_master,
    }
    .encode();

    RequestResponse::new(
        "read-stream-events",
        request_command,
        response_command,
        payload,
        credentials,
        completion,
        move |body| {
            let msg = match messages::ReadStreamEventsCompleted::decode(body) {
                Ok(msg) => msg,
                Err(e) => return Outcome::Fail(malformed("read-stream-events", e)),
            };
            let status = match msg.result {
                messages::SliceResult::Success => SliceReadStatus::Success,
                messages::SliceResult::NoStream => SliceReadStatus::StreamNotFound,
                messages::SliceResult::StreamDeleted => SliceReadStatus::StreamDeleted,
                messages::SliceResult::NotModified | messages::SliceResult::Error => {
                    return Outcome::Fail(Error::ServerError(format!(
                        "slice read of '{stream}' failed: {}",
                        msg.error
                    )))
                }
                messages::SliceResult::AccessDenied => {
                    return Outcome::Fail(Error::AccessDenied(format!(
                        "slice read of '{stream}'"
                    )))
                }
            };
            Outcome::Done(StreamEventsSlice {
                status,
                stream: stream.clone(),
                from_event_number,
                direction,
                events: msg.events,
                next_event_number: msg.next_event_number,
                last_event_number: msg.last_event_number,
                is_end_of_stream: msg.is_end_of_stream,
            })
        },
    )
}

pub(crate) fn read_all_events(
    position: Position,
    max_count: i32,
    direction: ReadDirection,
    resolve_link_tos: bool,
    require_master: bool,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<AllEventsSlice, Error>>,
) -> RequestResponse<AllEventsSlice> {
    let (request_command, response_command) = match direction {
        ReadDirection::Forward => {
            (command::READ_ALL_EVENTS_FORWARD, command::READ_ALL_EVENTS_FORWARD_COMPLETED)
        }
        ReadDirection::Backward => {
            (command::READ_ALL_EVENTS_BACKWARD, command::READ_ALL_EVENTS_BACKWARD_COMPLETED)
        }
    };
    let payload = messages::ReadAllEvents {
        commit_position: position.commit,
        prepare_position: position.prepare,
        max_count,
        resolve_link_tos,
        require_master,
    }
    .encode();

    RequestResponse::new(
        "read-all-events",
        request_command,
        response_command,
        payload,
        credentials,
        completion,
        move |body| {
            let msg = match messages::ReadAllEventsCompleted::decode(body) {
                Ok(msg) => msg,
                Err(e) => return Outcome::Fail(malformed("read-all-events", e)),
            };
            match msg.result {
                messages::SliceResult::Success => Outcome::Done(AllEventsSlice {
                    direction,
                    from_position: Position {
                        commit: msg.commit_position,
                        prepare: msg.prepare_position,
                    },
                    next_position: Position {
                        commit: msg.next_commit_position,
                        prepare: msg.next_prepare_position,
                    },
                    events: msg.events,
                }),
                messages::SliceResult::AccessDenied => {
                    Outcome::Fail(Error::AccessDenied("read of $all".into()))
                }
                _ => Outcome::Fail(Error::ServerError(format!(
                    "read of $all failed: {:?} {}",
                    msg.result, msg.error
                ))),
            }
        },
    )
}
