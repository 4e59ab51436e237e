//! Persistent subscription group CRUD.

use bytes::Bytes;
use futures_channel::oneshot;

use super::{Outcome, RequestResponse};
use crate::{
    errors::Error,
    proto::{command, messages},
    settings::Credentials,
    types::PersistentSubscriptionSettings,
};

fn crud_map(
    name: &'static str,
    group: String,
    stream: String,
    missing_means: &'static str,
) -> impl Fn(&[u8]) -> Outcome<()> + Send {
    move |body| {
        let msg = match messages::PersistentSubscriptionCompleted::decode(body) {
            Ok(msg) => msg,
            Err(e) => {
                return Outcome::Fail(Error::ServerError(format!(
                    "malformed {name} response: {e}"
                )))
            }
        };
        match msg.result {
            0 => Outcome::Done(()),
            1 => Outcome::Fail(Error::ServerError(format!(
                "{name} of '{group}' on '{stream}': group {missing_means}"
            ))),
            3 => Outcome::Fail(Error::AccessDenied(format!(
                "{name} of '{group}' on '{stream}'"
            ))),
            _ => Outcome::Fail(Error::ServerError(format!(
                "{name} of '{group}' on '{stream}' failed: {}",
                msg.reason
            ))),
        }
    }
}

pub(crate) fn create_persistent_subscription(
    stream: String,
    group: String,
    settings: PersistentSubscriptionSettings,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<(), Error>>,
) -> RequestResponse<()> {
    let payload = messages::PersistentSubscriptionUpsert {
        group: group.clone(),
        stream: stream.clone(),
        settings,
    }
    .encode();
    RequestResponse::new(
        "create-persistent-subscription",
        command::CREATE_PERSISTENT_SUBSCRIPTION,
        command::CREATE_PERSISTENT_SUBSCRIPTION_COMPLETED,
        payload,
        credentials,
        completion,
        crud_map("create-persistent-subscription", group, stream, "already exists"),
    )
}

pub(crate) fn update_persistent_subscription(
    stream: String,
    group: String,
    settings: PersistentSubscriptionSettings,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<(), Error>>,
) -> RequestResponse<()> {
    let payload = messages::PersistentSubscriptionUpsert {
        group: group.clone(),
        stream: stream.clone(),
        settings,
    }
    .encode();
    RequestResponse::new(
        "update-persistent-subscription",
        command::UPDATE_PERSISTENT_SUBSCRIPTION,
        command::UPDATE_PERSISTENT_SUBSCRIPTION_COMPLETED,
        payload,
        credentials,
        completion,
        crud_map("update-persistent-subscription", group, stream, "does not exist"),
    )
}

pub(crate) fn delete_persistent_subscription(
    stream: String,
    group: String,
    credentials: Option<Credentials>,
    completion: oneshot::Sender<Result<(), Error>>,
) -> RequestResponse<()> {
    let payload: Bytes = messages::DeletePersistentSubscription {
        group: group.clone(),
        stream: stream.clone(),
    }
    .encode();
    RequestResponse::new(
        "delete-persistent-subscription",
        command::DELETE_PERSISTENT_SUBSCRIPTION,
        command::DELETE_PERSISTENT_SUBSCRIPTION_COMPLETED,
        payload,
        credentials,
        completion,
        crud_map("delete-persistent-subscription", group, stream, "does not exist"),
    )
}
