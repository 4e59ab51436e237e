//! Operation objects: each pending exchange knows how to build its request
//! package, inspect whatever comes back under its correlation id, and
//! complete or fail the caller's future exactly once.

pub(crate) mod persistent;
pub(crate) mod read;
pub(crate) mod subscribe;
pub(crate) mod write;

use bytes::Bytes;
use futures_channel::oneshot;
use uuid::Uuid;

use crate::{
    errors::Error,
    proto::{command, messages, Package},
    settings::Credentials,
    types::NodeEndpoints,
};

/// What the engine should do after an operation inspected a response.
#[derive(Debug)]
pub(crate) enum Decision {
    /// Response consumed, exchange still in flight
    DoNothing,
    /// The operation is finished, successfully or not
    EndOperation,
    /// Re-issue the request with a fresh correlation id
    Retry,
    /// Re-issue after reconnecting to the given node
    Reconnect(NodeEndpoints),
    /// The connection that carried this response must be torn down
    Fatal(String),
}

/// Same shape for subscriptions, plus the confirmed transition.
#[derive(Debug)]
pub(crate) enum SubDecision {
    DoNothing,
    /// The server confirmed the subscription; it is live now
    Confirmed,
    /// The subscription ended; the item can be discarded
    Dropped,
    Retry,
    Reconnect(NodeEndpoints),
    Fatal(String),
}

/// A one-shot request/response exchange.
pub(crate) trait Operation: Send {
    fn name(&self) -> &'static str;

    /// Builds the request package for one attempt.
    fn request(&self, correlation: Uuid) -> Package;

    /// Inspects a package received under this operation's correlation id.
    fn inspect(&mut self, package: Package) -> Decision;

    /// Completes the caller's future exceptionally.
    fn fail(&mut self, error: Error);
}

/// A long-lived server-push exchange.
pub(crate) trait SubscriptionOperation: Send {
    fn name(&self) -> &'static str;

    fn request(&self, correlation: Uuid) -> Package;

    fn inspect(&mut self, package: Package) -> SubDecision;

    /// Ends the subscription from the client side: fails the pending
    /// confirmation or delivers the terminal drop event, exactly once.
    fn drop_terminally(&mut self, reason: crate::types::SubDropReason, error: Option<Error>);

    /// Acknowledgement package for persistent subscriptions.
    fn ack_package(&self, _correlation: Uuid, _ids: &[Uuid]) -> Option<Package> {
        None
    }

    /// Negative acknowledgement package for persistent subscriptions.
    fn nak_package(
        &self,
        _correlation: Uuid,
        _ids: &[Uuid],
        _action: crate::types::NakAction,
        _message: &str,
    ) -> Option<Package> {
        None
    }
}

/// Outcome of decoding an expected response payload.
pub(crate) enum Outcome<T> {
    Done(T),
    Fail(Error),
    Retry,
}

/// The common one-shot operation: a pre-encoded request, the command byte
/// of the expected response, and a mapper from its payload to the result.
pub(crate) struct RequestResponse<T> {
    name: &'static str,
    command: u8,
    expects: u8,
    payload: Bytes,
    credentials: Option<Credentials>,
    map: Box<dyn Fn(&[u8]) -> Outcome<T> + Send>,
    completion: Option<oneshot::Sender<Result<T, Error>>>,
}

impl<T: Send> RequestResponse<T> {
    pub(crate) fn new(
        name: &'static str,
        command: u8,
        expects: u8,
        payload: Bytes,
        credentials: Option<Credentials>,
        completion: oneshot::Sender<Result<T, Error>>,
        map: impl Fn(&[u8]) -> Outcome<T> + Send + 'static,
    ) -> Self {
        Self {
            name,
            command,
            expects,
            payload,
            credentials,
            map: Box::new(map),
            completion: Some(completion),
        }
    }

    fn complete(&mut self, result: Result<T, Error>) {
        // caller may have dropped the receiving end, which is fine
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

impl<T: Send> Operation for RequestResponse<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn request(&self, correlation: Uuid) -> Package {
        Package {
            command: self.command,
            correlation,
            credentials: self.credentials.clone(),
            payload: self.payload.clone(),
        }
    }

    fn inspect(&mut self, package: Package) -> Decision {
        match package.command {
            c if c == self.expects => match (self.map)(&package.payload) {
                Outcome::Done(value) => {
                    self.complete(Ok(value));
                    Decision::EndOperation
                }
                Outcome::Fail(error) => {
                    self.complete(Err(error));
                    Decision::EndOperation
                }
                Outcome::Retry => Decision::Retry,
            },
            command::NOT_AUTHENTICATED => {
                self.complete(Err(Error::NotAuthenticated(payload_text(&package.payload))));
                Decision::EndOperation
            }
            command::BAD_REQUEST => {
                let message = payload_text(&package.payload);
                self.complete(Err(Error::BadRequest(message.clone())));
                Decision::Fatal(format!("server rejected {} as a bad request: {message}", self.name))
            }
            command::NOT_HANDLED => inspect_not_handled(&package.payload, self.name)
                .unwrap_or_else(|error| {
                    self.complete(Err(error));
                    Decision::EndOperation
                }),
            other => {
                // not ours to act on; the deadline sweep covers us if the
                // real response never comes
                tracing::warn!(
                    command = other,
                    op = self.name,
                    "unexpected command under an operation correlation id"
                );
                Decision::DoNothing
            }
        }
    }

    fn fail(&mut self, error: Error) {
        self.complete(Err(error));
    }
}

/// Maps a not-handled payload to retry or a reconnect hint.
pub(crate) fn inspect_not_handled(payload: &[u8], name: &str) -> Result<Decision, Error> {
    let not_handled = messages::NotHandled::decode(payload)
        .map_err(|e| Error::ServerError(format!("malformed not-handled response to {name}: {e}")))?;
    Ok(match not_handled.reason {
        messages::NotHandledReason::NotReady | messages::NotHandledReason::TooBusy => {
            Decision::Retry
        }
        messages::NotHandledReason::NotMaster => match master_endpoints(&not_handled) {
            Some(endpoints) => Decision::Reconnect(endpoints),
            // no usable address in the hint; retrying will hit the redirect again
            None => Decision::Retry,
        },
    })
}

fn master_endpoints(not_handled: &messages::NotHandled) -> Option<NodeEndpoints> {
    let info = not_handled.master.as_ref()?;
    let ip: std::net::IpAddr = info.tcp_address.parse().ok()?;
    let secure_tcp = match (&info.secure_tcp_address, info.secure_tcp_port) {
        (Some(addr), Some(port)) => {
            addr.parse().ok().map(|ip| std::net::SocketAddr::new(ip, port))
        }
        (None, Some(port)) => Some(std::net::SocketAddr::new(ip, port)),
        _ => None,
    };
    Some(NodeEndpoints {
        hostname: info.tcp_address.clone(),
        tcp: Some(std::net::SocketAddr::new(ip, info.tcp_port)),
        secure_tcp,
    })
}

pub(crate) fn payload_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
