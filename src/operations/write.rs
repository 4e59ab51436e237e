//! Write-side operations: appends, deletes and transactions.

use futures_channel::oneshot;

use super::{Outcome, RequestResponse};
use crate::{
    errors::Error,
    proto::{command, messages},
    settings::Credentials,
    types::{DeleteResult, EventData, ExpectedVersion, Position, WriteResult},
};

fn malformed(name: &str, e: impl std::fmt::Display) -> Error {
    Error::ServerError(format!("malformed {name} response: {e}"))
}

pub(crate) fn append_to_stream(
    stream: String,
    expected_version: ExpectedVersion,
    events: Vec<EventData>,
    require_master: bool,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<WriteResult, Error>>,
) -> RequestResponse<WriteResult> {
    let payload = messages::WriteEvents {
        stream: stream.clone(),
        expected_version: expected_version.as_i64(),
        require_master,
        events,
    }
    .encode();

    RequestResponse::new(
        "write-events",
        command::WRITE_EVENTS,
        command::WRITE_EVENTS_COMPLETED,
        payload,
        credentials,
        completion,
        move |body| {
            let msg = match messages::WriteEventsCompleted::decode(body) {
                Ok(msg) => msg,
                Err(e) => return Outcome::Fail(malformed("write-events", e)),
            };
            if msg.result.is_retryable() {
                return Outcome::Retry
            }
            match msg.result {
                messages::OperationResult::Success => Outcome::Done(WriteResult {
                    next_expected_version: msg.last_event_number,
                    position: Position {
                        commit: msg.commit_position,
                        prepare: msg.prepare_position,
                    },
                }),
                messages::OperationResult::WrongExpectedVersion => Outcome::Fail(
                    Error::WrongExpectedVersion(format!("append to '{stream}': {}", msg.message)),
                ),
                messages::OperationResult::StreamDeleted => {
                    Outcome::Fail(Error::StreamDeleted(stream.clone()))
                }
                messages::OperationResult::AccessDenied => {
                    Outcome::Fail(Error::AccessDenied(format!("append to '{stream}'")))
                }
                _ => Outcome::Fail(Error::ServerError(format!(
                    "append to '{stream}' failed: {:?} {}",
                    msg.result, msg.message
                ))),
            }
        },
    )
}

pub(crate) fn delete_stream(
    stream: String,
    expected_version: ExpectedVersion,
    hard_delete: bool,
    require_master: bool,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<DeleteResult, Error>>,
) -> RequestResponse<DeleteResult> {
    let payload = messages::DeleteStream {
        stream: stream.clone(),
        expected_version: expected_version.as_i64(),
        require_master,
        hard_delete,
    }
    .encode();

    RequestResponse::new(
        "delete-stream",
        command::DELETE_STREAM,
        command::DELETE_STREAM_COMPLETED,
        payload,
        credentials,
        completion,
        move |body| {
            let msg = match messages::DeleteStreamCompleted::decode(body) {
                Ok(msg) => msg,
                Err(e) => return Outcome::Fail(malformed("delete-stream", e)),
            };
            if msg.result.is_retryable() {
                return Outcome::Retry
            }
            match msg.result {
                messages::OperationResult::Success => Outcome::Done(DeleteResult {
                    position: Position {
                        commit: msg.commit_position,
                        prepare: msg.prepare_position,
                    },
                }),
                messages::OperationResult::WrongExpectedVersion => Outcome::Fail(
                    Error::WrongExpectedVersion(format!("delete of '{stream}': {}", msg.message)),
                ),
                messages::OperationResult::StreamDeleted => {
                    Outcome::Fail(Error::StreamDeleted(stream.clone()))
                }
                messages::OperationResult::AccessDenied => {
                    Outcome::Fail(Error::AccessDenied(format!("delete of '{stream}'")))
                }
                _ => Outcome::Fail(Error::ServerError(format!(
                    "delete of '{stream}' failed: {:?} {}",
                    msg.result, msg.message
                ))),
            }
        },
    )
}

pub(crate) fn transaction_start(
    stream: String,
    expected_version: ExpectedVersion,
    require_master: bool,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<i64, Error>>,
) -> RequestResponse<i64> {
    let payload = messages::TransactionStart {
        stream: stream.clone(),
        expected_version: expected_version.as_i64(),
        require_master,
    }
    .encode();

    RequestResponse::new(
        "transaction-start",
        command::TRANSACTION_START,
        command::TRANSACTION_START_COMPLETED,
        payload,
        credentials,
        completion,
        move |body| {
            let msg = match messages::TransactionStartCompleted::decode(body) {
                Ok(msg) => msg,
                Err(e) => return Outcome::Fail(malformed("transaction-start", e)),
            };
            if msg.result.is_retryable() {
                return Outcome::Retry
            }
            match msg.result {
                messages::OperationResult::Success => Outcome::Done(msg.transaction_id),
                messages::OperationResult::WrongExpectedVersion => {
                    Outcome::Fail(Error::WrongExpectedVersion(format!(
                        "transaction on '{stream}': {}",
                        msg.message
                    )))
                }
                messages::OperationResult::StreamDeleted => {
                    Outcome::Fail(Error::StreamDeleted(stream.clone()))
                }
                messages::OperationResult::AccessDenied => {
                    Outcome::Fail(Error::AccessDenied(format!("transaction on '{stream}'")))
                }
                _ => Outcome::Fail(Error::ServerError(format!(
                    "transaction start on '{stream}' failed: {:?} {}",
                    msg.result, msg.message
                ))),
            }
        },
    )
}

pub(crate) fn transaction_write(
    transaction_id: i64,
    events: Vec<EventData>,
    require_master: bool,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<(), Error>>,
) -> RequestResponse<()> {
    let payload =
        messages::TransactionWrite { transaction_id, require_master, events }.encode();

    RequestResponse::new(
        "transaction-write",
        command::TRANSACTION_WRITE,
        command::TRANSACTION_WRITE_COMPLETED,
        payload,
        credentials,
        completion,
        move |body| {
            let msg = match messages::TransactionWriteCompleted::decode(body) {
                Ok(msg) => msg,
                Err(e) => return Outcome::Fail(malformed("transaction-write", e)),
            };
            if msg.result.is_retryable() {
                return Outcome::Retry
            }
            match msg.result {
                messages::OperationResult::Success => Outcome::Done(()),
                messages::OperationResult::AccessDenied => Outcome::Fail(Error::AccessDenied(
                    format!("write in transaction {transaction_id}"),
                )),
                _ => Outcome::Fail(Error::ServerError(format!(
                    "transaction write {transaction_id} failed: {:?} {}",
                    msg.result, msg.message
                ))),
            }
        },
    )
}

pub(crate) fn transaction_commit(
    transaction_id: i64,
    require_master: bool,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<WriteResult, Error>>,
) -> RequestResponse<WriteResult> {
    let payload = messages::TransactionCommit { transaction_id, require_master }.encode();

    RequestResponse::new(
        "transaction-commit",
        command::TRANSACTION_COMMIT,
        command::TRANSACTION_COMMIT_COMPLETED,
        payload,
        credentials,
        completion,
        move |body| {
            let msg = match messages::TransactionCommitCompleted::decode(body) {
                Ok(msg) => msg,
                Err(e) => return Outcome::Fail(malformed("transaction-commit", e)),
            };
            match msg.result {
                messages::OperationResult::Success => Outcome::Done(WriteResult {
                    next_expected_version: msg.last_event_number,
                    position: Position {
                        commit: msg.commit_position,
                        prepare: msg.prepare_position,
                    },
                }),
                // a commit may have landed server-side; retrying is not safe
                messages::OperationResult::CommitTimeout => Outcome::Fail(Error::CommitTimeout(
                    format!("transaction {transaction_id}: {}", msg.message),
                )),
                messages::OperationResult::PrepareTimeout |
                messages::OperationResult::ForwardTimeout => Outcome::Retry,
                messages::OperationResult::WrongExpectedVersion => {
                    Outcome::Fail(Error::WrongExpectedVersion(format!(
                        "transaction {transaction_id}: {}",
                        msg.message
                    )))
                }
                messages::OperationResult::AccessDenied => Outcome::Fail(Error::AccessDenied(
                    format!("commit of transaction {transaction_id}"),
                )),
                _ => Outcome::Fail(Error::ServerError(format!(
                    "transaction commit {transaction_id} failed: {:?} {}",
                    msg.result, msg.message
                ))),
            }
        },
    )
}
