//! Subscription operations: volatile (stream or `$all`) and persistent
//! consumers.

use bytes::Bytes;
use futures_channel::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;

use super::{inspect_not_handled, payload_text, Decision, SubDecision, SubscriptionOperation};
use crate::{
    errors::Error,
    proto::{command, messages, Package},
    settings::Credentials,
    types::{NakAction, SubDropReason, SubscriptionEvent},
};

/// What a confirmed subscription reports back to the subscriber.
#[derive(Debug, Clone)]
pub(crate) struct Confirmed {
    pub last_commit_position: i64,
    /// `None` on `$all` subscriptions.
    pub last_event_number: Option<i64>,
    /// Server-side id, persistent subscriptions only.
    pub subscription_id: Option<String>,
}

fn drop_error(reason: SubDropReason) -> Error {
    match reason {
        SubDropReason::AccessDenied => Error::AccessDenied("subscription".into()),
        SubDropReason::NotFound => Error::ServerError("subscription target not found".into()),
        SubDropReason::ConnectionClosed => {
            Error::ConnectionClosed("subscription channel lost".into())
        }
        other => Error::ServerError(format!("subscription dropped: {other:?}")),
    }
}

/// State shared by both subscription kinds: a pending confirmation and a
/// live event channel, each used at most once / until dropped.
struct SubscriberSide {
    confirm: Option<oneshot::Sender<Result<Confirmed, Error>>>,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl SubscriberSide {
    fn confirm(&mut self, confirmed: Confirmed) {
        if let Some(tx) = self.confirm.take() {
            let _ = tx.send(Ok(confirmed));
        }
    }

    /// Returns `false` when the subscriber has gone away.
    fn deliver(&mut self, event: SubscriptionEvent) -> bool {
        self.events.unbounded_send(event).is_ok()
    }

    fn drop_terminally(&mut self, reason: SubDropReason, error: Option<Error>) {
        match self.confirm.take() {
            Some(tx) => {
                let _ = tx.send(Err(error.unwrap_or_else(|| drop_error(reason))));
            }
            None => {
                let _ = self.events.unbounded_send(SubscriptionEvent::Dropped(reason));
            }
        }
    }
}

/// Converts a one-shot [`Decision`] from the shared not-handled logic.
fn sub_decision(decision: Decision) -> SubDecision {
    match decision {
        Decision::Retry => SubDecision::Retry,
        Decision::Reconnect(endpoints) => SubDecision::Reconnect(endpoints),
        Decision::DoNothing => SubDecision::DoNothing,
        Decision::EndOperation => SubDecision::Dropped,
        Decision::Fatal(reason) => SubDecision::Fatal(reason),
    }
}

/// A volatile subscription to one stream or, with an empty stream id, to
/// `$all`.
pub(crate) struct VolatileSubscription {
    stream: String,
    resolve_link_tos: bool,
    credentials: Option<Credentials>,
    side: SubscriberSide,
}

impl VolatileSubscription {
    pub(crate) fn new(
        stream: String,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
        confirm: oneshot::Sender<Result<Confirmed, Error>>,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> Self {
        Self {
            stream,
            resolve_link_tos,
            credentials,
            side: SubscriberSide { confirm: Some(confirm), events },
        }
    }

    fn is_all(&self) -> bool {
        self.stream.is_empty()
    }
}

impl SubscriptionOperation for VolatileSubscription {
    fn name(&self) -> &'static str {
        "subscribe-to-stream"
    }

    fn request(&self, correlation: Uuid) -> Package {
        let payload = messages::SubscribeToStream {
            stream: self.stream.clone(),
            resolve_link_tos: self.resolve_link_tos,
        }
        .encode();
        Package {
            command: command::SUBSCRIBE_TO_STREAM,
            correlation,
            credentials: self.credentials.clone(),
            payload,
        }
    }

    fn inspect(&mut self, package: Package) -> SubDecision {
        match package.command {
            command::SUBSCRIPTION_CONFIRMATION => {
                match messages::SubscriptionConfirmation::decode(&package.payload) {
                    Ok(msg) => {
                        let last_event_number =
                            if self.is_all() { None } else { Some(msg.last_event_number) };
                        self.side.confirm(Confirmed {
                            last_commit_position: msg.last_commit_position,
                            last_event_number,
                            subscription_id: None,
                        });
                        SubDecision::Confirmed
                    }
                    Err(e) => SubDecision::Fatal(format!("malformed subscription confirmation: {e}")),
                }
            }
            command::STREAM_EVENT_APPEARED => {
                match messages::StreamEventAppeared::decode(&package.payload) {
                    Ok(msg) => {
                        if self.side.deliver(SubscriptionEvent::EventAppeared(msg.event)) {
                            SubDecision::DoNothing
                        } else {
                            // subscriber hung up; let the server know
                            trace!(stream = self.stream, "subscriber gone, dropping subscription");
                            SubDecision::Dropped
                        }
                    }
                    Err(e) => SubDecision::Fatal(format!("malformed subscription event: {e}")),
                }
            }
            command::SUBSCRIPTION_DROPPED => {
                let reason = messages::SubscriptionDropped::decode(&package.payload)
                    .map(|msg| msg.reason)
                    .unwrap_or(SubDropReason::Unsubscribed);
                self.side.drop_terminally(reason, None);
                SubDecision::Dropped
            }
            command::NOT_AUTHENTICATED => {
                self.side.drop_terminally(
                    SubDropReason::AccessDenied,
                    Some(Error::NotAuthenticated(payload_text(&package.payload))),
                );
                SubDecision::Dropped
            }
            command::BAD_REQUEST => {
                let message = payload_text(&package.payload);
                self.side.drop_terminally(
                    SubDropReason::ConnectionClosed,
                    Some(Error::BadRequest(message.clone())),
                );
                SubDecision::Fatal(format!("server rejected a subscription request: {message}"))
            }
            command::NOT_HANDLED => match inspect_not_handled(&package.payload, self.name()) {
                Ok(decision) => sub_decision(decision),
                Err(error) => {
                    self.side.drop_terminally(SubDropReason::ConnectionClosed, Some(error));
                    SubDecision::Dropped
                }
            },
            other => {
                trace!(command = other, "ignoring unexpected package on a subscription");
                SubDecision::DoNothing
            }
        }
    }

    fn drop_terminally(&mut self, reason: SubDropReason, error: Option<Error>) {
        self.side.drop_terminally(reason, error);
    }
}

/// A consumer of a persistent subscription group.
pub(crate) struct PersistentConnect {
    stream: String,
    group: String,
    buffer_size: i32,
    credentials: Option<Credentials>,
    side: SubscriberSide,
    subscription_id: Option<String>,
}

impl PersistentConnect {
    pub(crate) fn new(
        stream: String,
        group: String,
        buffer_size: i32,
        credentials: Option<Credentials>,
        confirm: oneshot::Sender<Result<Confirmed, Error>>,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> Self {
        Self {
            stream,
            group,
            buffer_size,
            credentials,
            side: SubscriberSide { confirm: Some(confirm), events },
            subscription_id: None,
        }
    }
}

impl SubscriptionOperation for PersistentConnect {
    fn name(&self) -> &'static str {
        "connect-to-persistent-subscription"
    }

    fn request(&self, correlation: Uuid) -> Package {
        let payload = messages::ConnectToPersistentSubscription {
            group: self.group.clone(),
            stream: self.stream.clone(),
            allowed_in_flight_messages: self.buffer_size,
        }
        .encode();
        Package {
            command: command::CONNECT_TO_PERSISTENT_SUBSCRIPTION,
            correlation,
            credentials: self.credentials.clone(),
            payload,
        }
    }

    fn inspect(&mut self, package: Package) -> SubDecision {
        match package.command {
            command::PERSISTENT_SUBSCRIPTION_CONFIRMATION => {
                match messages::PersistentSubscriptionConfirmation::decode(&package.payload) {
                    Ok(msg) => {
                        self.subscription_id = Some(msg.subscription_id.clone());
                        self.side.confirm(Confirmed {
                            last_commit_position: msg.last_commit_position,
                            last_event_number: Some(msg.last_event_number),
                            subscription_id: Some(msg.subscription_id),
                        });
                        SubDecision::Confirmed
                    }
                    Err(e) => SubDecision::Fatal(format!(
                        "malformed persistent subscription confirmation: {e}"
                    )),
                }
            }
            command::PERSISTENT_SUBSCRIPTION_EVENT_APPEARED => {
                match messages::PersistentSubscriptionStreamEventAppeared::decode(&package.payload)
                {
                    Ok(msg) => {
                        if self.side.deliver(SubscriptionEvent::EventAppeared(msg.event)) {
                            SubDecision::DoNothing
                        } else {
                            trace!(
                                group = self.group,
                                "consumer gone, dropping persistent subscription"
                            );
                            SubDecision::Dropped
                        }
                    }
                    Err(e) => {
                        SubDecision::Fatal(format!("malformed persistent subscription event: {e}"))
                    }
                }
            }
            command::SUBSCRIPTION_DROPPED => {
                let reason = messages::SubscriptionDropped::decode(&package.payload)
                    .map(|msg| msg.reason)
                    .unwrap_or(SubDropReason::Unsubscribed);
                self.side.drop_terminally(reason, None);
                SubDecision::Dropped
            }
            command::NOT_AUTHENTICATED => {
                self.side.drop_terminally(
                    SubDropReason::AccessDenied,
                    Some(Error::NotAuthenticated(payload_text(&package.payload))),
                );
                SubDecision::Dropped
            }
            command::BAD_REQUEST => {
                let message = payload_text(&package.payload);
                self.side.drop_terminally(
                    SubDropReason::ConnectionClosed,
                    Some(Error::BadRequest(message.clone())),
                );
                SubDecision::Fatal(format!(
                    "server rejected a persistent subscription request: {message}"
                ))
            }
            command::NOT_HANDLED => match inspect_not_handled(&package.payload, self.name()) {
                Ok(decision) => sub_decision(decision),
                Err(error) => {
                    self.side.drop_terminally(SubDropReason::ConnectionClosed, Some(error));
                    SubDecision::Dropped
                }
            },
            other => {
                trace!(command = other, "ignoring unexpected package on a subscription");
                SubDecision::DoNothing
            }
        }
    }

    fn drop_terminally(&mut self, reason: SubDropReason, error: Option<Error>) {
        self.side.drop_terminally(reason, error);
    }

    fn ack_package(&self, correlation: Uuid, ids: &[Uuid]) -> Option<Package> {
        let subscription_id = self.subscription_id.clone()?;
        let payload = messages::PersistentSubscriptionAckEvents {
            subscription_id,
            event_ids: ids.to_vec(),
        }
        .encode();
        Some(Package {
            command: command::PERSISTENT_SUBSCRIPTION_ACK_EVENTS,
            correlation,
            credentials: self.credentials.clone(),
            payload,
        })
    }

    fn nak_package(
        &self,
        correlation: Uuid,
        ids: &[Uuid],
        action: NakAction,
        message: &str,
    ) -> Option<Package> {
        let subscription_id = self.subscription_id.clone()?;
        let payload = messages::PersistentSubscriptionNakEvents {
            subscription_id,
            event_ids: ids.to_vec(),
            action: action.to_wire(),
            message: message.to_owned(),
        }
        .encode();
        Some(Package {
            command: command::PERSISTENT_SUBSCRIPTION_NAK_EVENTS,
            correlation,
            credentials: self.credentials.clone(),
            payload,
        })
    }
}

/// Bare unsubscribe request written on a live channel.
pub(crate) fn unsubscribe_package(correlation: Uuid) -> Package {
    Package::new(command::UNSUBSCRIBE_FROM_STREAM, correlation, Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, RecordedEvent, ResolvedEvent};
    use futures_util::StreamExt;

    fn subscription() -> (
        VolatileSubscription,
        oneshot::Receiver<Result<Confirmed, Error>>,
        mpsc::UnboundedReceiver<SubscriptionEvent>,
    ) {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::unbounded();
        let op = VolatileSubscription::new("cart-7".into(), true, None, confirm_tx, event_tx);
        (op, confirm_rx, event_rx)
    }

    fn push(command: u8, payload: Bytes) -> Package {
        Package::new(command, Uuid::new_v4(), payload)
    }

    fn sample_event() -> ResolvedEvent {
        ResolvedEvent {
            event: Some(RecordedEvent {
                stream: "cart-7".into(),
                id: Uuid::new_v4(),
                number: 0,
                event_type: "item-added".into(),
                is_json: false,
                data: vec![9],
                metadata: vec![],
                created_millis: 0,
            }),
            link: None,
            position: Some(Position { commit: 10, prepare: 10 }),
        }
    }

    #[test]
    fn confirmation_completes_the_subscribe_future() {
        let (mut op, mut confirm, _events) = subscription();
        let msg = messages::SubscriptionConfirmation {
            last_commit_position: 99,
            last_event_number: 4,
        };
        let decision = op.inspect(push(command::SUBSCRIPTION_CONFIRMATION, msg.encode()));
        assert!(matches!(decision, SubDecision::Confirmed));

        let confirmed = confirm.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(confirmed.last_commit_position, 99);
        assert_eq!(confirmed.last_event_number, Some(4));
    }

    #[tokio::test]
    async fn events_flow_to_the_subscriber() {
        let (mut op, _confirm, mut events) = subscription();
        let msg = messages::StreamEventAppeared { event: sample_event() };
        let decision = op.inspect(push(command::STREAM_EVENT_APPEARED, msg.encode()));
        assert!(matches!(decision, SubDecision::DoNothing));

        match events.next().await.unwrap() {
            SubscriptionEvent::EventAppeared(event) => {
                assert_eq!(event.original_event().unwrap().event_type, "item-added")
            }
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_drop_after_confirmation_reaches_the_event_channel_once() {
        let (mut op, _confirm, mut events) = subscription();
        let confirmation = messages::SubscriptionConfirmation {
            last_commit_position: 0,
            last_event_number: -1,
        };
        op.inspect(push(command::SUBSCRIPTION_CONFIRMATION, confirmation.encode()));

        let dropped = messages::SubscriptionDropped { reason: SubDropReason::Unsubscribed };
        let decision = op.inspect(push(command::SUBSCRIPTION_DROPPED, dropped.encode()));
        assert!(matches!(decision, SubDecision::Dropped));

        assert_eq!(
            events.next().await.unwrap(),
            SubscriptionEvent::Dropped(SubDropReason::Unsubscribed)
        );
    }

    #[test]
    fn access_denied_before_confirmation_fails_the_subscribe_future() {
        let (mut op, mut confirm, _events) = subscription();
        let dropped = messages::SubscriptionDropped { reason: SubDropReason::AccessDenied };
        op.inspect(push(command::SUBSCRIPTION_DROPPED, dropped.encode()));

        assert!(matches!(confirm.try_recv().unwrap().unwrap(), Err(Error::AccessDenied(_))));
    }
}
