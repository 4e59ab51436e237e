//! Tracking of pending and live subscriptions.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{driver::Channel, operations::Directive};
use crate::{
    errors::Error,
    operations::{subscribe::unsubscribe_package, SubDecision, SubscriptionOperation},
    proto::Package,
    settings::Settings,
    types::{NakAction, SubDropReason},
};

pub(crate) struct SubscriptionItem {
    pub(crate) op: Box<dyn SubscriptionOperation>,
    /// Stable handle id; survives correlation changes across retries.
    pub(crate) key: Uuid,
    pub(crate) correlation: Uuid,
    pub(crate) max_retries: i32,
    pub(crate) timeout: Duration,
    pub(crate) retry_count: i32,
    pub(crate) connection_id: Option<Uuid>,
    pub(crate) is_subscribed: bool,
    pub(crate) last_updated: Instant,
}

impl SubscriptionItem {
    pub(crate) fn new(op: Box<dyn SubscriptionOperation>, key: Uuid, settings: &Settings) -> Self {
        Self {
            op,
            key,
            correlation: Uuid::nil(),
            max_retries: settings.max_operation_retries,
            timeout: settings.operation_timeout,
            retry_count: 0,
            connection_id: None,
            is_subscribed: false,
            last_updated: Instant::now(),
        }
    }
}

pub(crate) struct SubscriptionManager {
    active: HashMap<Uuid, SubscriptionItem>,
    waiting: VecDeque<SubscriptionItem>,
}

impl SubscriptionManager {
    pub(crate) fn new(_settings: &Settings) -> Self {
        Self { active: HashMap::new(), waiting: VecDeque::new() }
    }

    pub(crate) fn owns(&self, correlation: Uuid) -> bool {
        self.active.contains_key(&correlation)
    }

    pub(crate) fn enqueue(&mut self, item: SubscriptionItem) {
        trace!(sub = item.op.name(), "subscription deferred");
        self.waiting.push_back(item);
    }

    /// Writes the subscribe request on `channel`.
    pub(crate) fn start(&mut self, mut item: SubscriptionItem, channel: &Channel) {
        let correlation = Uuid::new_v4();
        let package = item.op.request(correlation);
        item.correlation = correlation;
        item.connection_id = Some(channel.id);
        item.is_subscribed = false;
        item.last_updated = Instant::now();

        trace!(sub = item.op.name(), %correlation, "subscription starting");
        if !channel.send(package) {
            debug!(sub = item.op.name(), "subscription started on a dying channel");
        }
        self.active.insert(correlation, item);
    }

    pub(crate) fn start_waiting(&mut self, channel: &Channel) {
        while let Some(item) = self.waiting.pop_front() {
            self.start(item, channel);
        }
    }

    /// Routes a server push to its subscription and applies the decision.
    pub(crate) fn handle_package(
        &mut self,
        package: Package,
        channel: &Channel,
    ) -> Option<Directive> {
        let correlation = package.correlation;
        let item = match self.active.get_mut(&correlation) {
            Some(item) => item,
            None => {
                trace!(%correlation, "push without a live subscription, dropped");
                return None
            }
        };

        match item.op.inspect(package) {
            SubDecision::DoNothing => {
                item.last_updated = Instant::now();
                None
            }
            SubDecision::Confirmed => {
                item.is_subscribed = true;
                item.last_updated = Instant::now();
                None
            }
            SubDecision::Dropped => {
                self.active.remove(&correlation);
                None
            }
            SubDecision::Retry => {
                let item = self.active.remove(&correlation).expect("checked above");
                self.retry(item, Some(channel));
                None
            }
            SubDecision::Reconnect(endpoints) => {
                let mut item = self.active.remove(&correlation).expect("checked above");
                item.connection_id = None;
                self.waiting.push_back(item);
                Some(Directive::Reconnect(endpoints))
            }
            SubDecision::Fatal(reason) => {
                self.active.remove(&correlation);
                Some(Directive::CloseConnection(reason))
            }
        }
    }

    /// Re-enqueues within the retry budget, else drops terminally. Starts
    /// immediately when a live channel is at hand.
    fn retry(&mut self, mut item: SubscriptionItem, channel: Option<&Channel>) {
        if item.max_retries >= 0 && item.retry_count >= item.max_retries {
            warn!(sub = item.op.name(), retries = item.retry_count, "subscription retries exhausted");
            let retries = item.retry_count;
            item.op.drop_terminally(
                SubDropReason::ConnectionClosed,
                Some(Error::RetryLimitReached(retries)),
            );
            return
        }
        item.retry_count += 1;
        item.connection_id = None;
        item.is_subscribed = false;
        match channel {
            Some(channel) => self.start(item, channel),
            None => self.waiting.push_back(item),
        }
    }

    /// Sweeps pending (unconfirmed) items past their deadline; live
    /// subscriptions have no deadline.
    pub(crate) fn check_timeouts(&mut self, channel: &Channel) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, item)| {
                !item.is_subscribed && now.duration_since(item.last_updated) >= item.timeout
            })
            .map(|(correlation, _)| *correlation)
            .collect();

        for correlation in expired {
            let mut item = match self.active.remove(&correlation) {
                Some(item) => item,
                None => continue,
            };
            if item.connection_id != Some(channel.id) {
                debug!(sub = item.op.name(), "replaying subscription from a lost channel");
                item.connection_id = None;
                self.start(item, channel);
            } else if item.max_retries >= 0 && item.retry_count >= item.max_retries {
                let name = item.op.name();
                item.op.drop_terminally(
                    SubDropReason::ConnectionClosed,
                    Some(Error::OperationTimeout(format!(
                        "{name} was not confirmed in {:?} after {} attempts",
                        item.timeout,
                        item.retry_count + 1
                    ))),
                );
            } else {
                item.retry_count += 1;
                item.connection_id = None;
                self.start(item, channel);
            }
        }
        self.start_waiting(channel);
    }

    /// The channel is gone: confirmed subscriptions drop terminally, the
    /// rest go back to the queue within their retry budget.
    pub(crate) fn purge(&mut self, channel_id: Uuid) {
        let bound: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, item)| item.connection_id == Some(channel_id))
            .map(|(correlation, _)| *correlation)
            .collect();

        for correlation in bound {
            let mut item = match self.active.remove(&correlation) {
                Some(item) => item,
                None => continue,
            };
            if item.is_subscribed {
                debug!(sub = item.op.name(), "live subscription lost its channel");
                item.op.drop_terminally(SubDropReason::ConnectionClosed, None);
            } else {
                self.retry(item, None);
            }
        }
    }

    /// User-requested unsubscribe by handle key.
    pub(crate) fn unsubscribe(&mut self, key: Uuid, channel: Option<&Channel>) {
        if let Some(correlation) = self.find_active(key) {
            let subscribed =
                self.active.get(&correlation).map(|item| item.is_subscribed).unwrap_or(false);
            if subscribed {
                // server answers with a subscription-dropped package
                if let Some(channel) = channel {
                    channel.send(unsubscribe_package(correlation));
                    return
                }
            }
            if let Some(mut item) = self.active.remove(&correlation) {
                item.op.drop_terminally(SubDropReason::Unsubscribed, None);
            }
            return
        }

        if let Some(index) = self.waiting.iter().position(|item| item.key == key) {
            if let Some(mut item) = self.waiting.remove(index) {
                item.op.drop_terminally(SubDropReason::Unsubscribed, None);
            }
        }
    }

    pub(crate) fn ack(&mut self, key: Uuid, ids: &[Uuid], channel: &Channel) {
        if let Some(correlation) = self.find_active(key) {
            if let Some(item) = self.active.get(&correlation) {
                if let Some(package) = item.op.ack_package(correlation, ids) {
                    channel.send(package);
                }
            }
        }
    }

    pub(crate) fn nak(
        &mut self,
        key: Uuid,
        ids: &[Uuid],
        action: NakAction,
        message: &str,
        channel: &Channel,
    ) {
        if let Some(correlation) = self.find_active(key) {
            if let Some(item) = self.active.get(&correlation) {
                if let Some(package) = item.op.nak_package(correlation, ids, action, message) {
                    channel.send(package);
                }
            }
        }
    }

    fn find_active(&self, key: Uuid) -> Option<Uuid> {
        self.active
            .iter()
            .find(|(_, item)| item.key == key)
            .map(|(correlation, _)| *correlation)
    }

    /// Drops everything; used on the final disconnect.
    pub(crate) fn cleanup(&mut self, make_error: impl Fn() -> Error) {
        let total = self.active.len() + self.waiting.len();
        if total > 0 {
            debug!(total, "dropping all subscriptions");
        }
        for (_, mut item) in self.active.drain() {
            item.op.drop_terminally(SubDropReason::ConnectionClosed, Some(make_error()));
        }
        for mut item in self.waiting.drain(..) {
            item.op.drop_terminally(SubDropReason::ConnectionClosed, Some(make_error()));
        }
    }
}
