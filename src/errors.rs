use thiserror::Error;

/// An error thrown by a connection verb or lifecycle future.
///
/// Per-operation failures complete the caller's future with one of these;
/// connection-fatal conditions additionally surface as
/// [`crate::ClientEvent::ErrorOccurred`] before the client reconnects or
/// shuts down.
#[derive(Debug, Error)]
pub enum Error {
    /// A precondition failed at the facade, before anything was enqueued
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was submitted before `connect` was ever called
    #[error("no connection available")]
    NoConnection,

    /// The client is closed, or closed while the operation was in flight
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Endpoint discovery failed terminally
    #[error("cannot establish connection: {0}")]
    CannotEstablishConnection(String),

    /// The credential handshake was rejected by the server
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// The per-attempt deadline elapsed with no retry budget left
    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// The server kept asking for a retry until the budget ran out
    #[error("retry limit reached after {0} retries")]
    RetryLimitReached(i32),

    /// The server rejected the operation with a typed failure
    #[error("server error: {0}")]
    ServerError(String),

    /// The server flagged the request as a protocol violation. Fatal for
    /// the connection that carried it
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The stream was not at the expected version
    #[error("wrong expected version: {0}")]
    WrongExpectedVersion(String),

    /// The target stream has been deleted
    #[error("stream deleted: {0}")]
    StreamDeleted(String),

    /// The credentials in use are not allowed to perform the operation
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The server could not commit the write in time
    #[error("commit timed out: {0}")]
    CommitTimeout(String),

    /// Error in underlying lib `serde_json`
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// std IO error forwarding
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
