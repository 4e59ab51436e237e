//! Tracking of pending one-shot operations.
//!
//! Items wait in a FIFO until capacity and a live channel allow them to be
//! scheduled; scheduled items sit in the active map keyed by correlation
//! id until a response, a retry or a timeout sweep moves them on.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::driver::Channel;
use crate::{
    errors::Error,
    operations::{Decision, Operation},
    proto::Package,
    settings::Settings,
    types::NodeEndpoints,
};

/// Side effect a manager asks the engine to perform.
#[derive(Debug)]
pub(crate) enum Directive {
    Reconnect(NodeEndpoints),
    CloseConnection(String),
}

pub(crate) struct OperationItem {
    pub(crate) op: Box<dyn Operation>,
    pub(crate) correlation: Uuid,
    pub(crate) max_retries: i32,
    pub(crate) timeout: Duration,
    pub(crate) retry_count: i32,
    pub(crate) connection_id: Option<Uuid>,
    pub(crate) last_updated: Instant,
    totals: Arc<AtomicUsize>,
}

impl OperationItem {
    pub(crate) fn new(
        op: Box<dyn Operation>,
        settings: &Settings,
        totals: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            op,
            correlation: Uuid::nil(),
            max_retries: settings.max_operation_retries,
            timeout: settings.operation_timeout,
            retry_count: 0,
            connection_id: None,
            last_updated: Instant::now(),
            totals,
        }
    }
}

impl Drop for OperationItem {
    fn drop(&mut self) {
        // the admission gate in the facade counts this item until it
        // reaches a terminal state
        self.totals.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) struct OperationManager {
    active: HashMap<Uuid, OperationItem>,
    waiting: VecDeque<OperationItem>,
    max_concurrent: usize,
}

impl OperationManager {
    pub(crate) fn new(settings: &Settings) -> Self {
        Self {
            active: HashMap::new(),
            waiting: VecDeque::new(),
            max_concurrent: settings.max_concurrent_operations,
        }
    }

    pub(crate) fn owns(&self, correlation: Uuid) -> bool {
        self.active.contains_key(&correlation)
    }

    /// Defers an item until a channel is available.
    pub(crate) fn enqueue(&mut self, item: OperationItem) {
        trace!(op = item.op.name(), waiting = self.waiting.len(), "operation deferred");
        self.waiting.push_back(item);
    }

    /// Writes the request on `channel`, or defers when at capacity.
    pub(crate) fn schedule(&mut self, mut item: OperationItem, channel: &Channel) {
        if self.active.len() >= self.max_concurrent {
            self.waiting.push_back(item);
            return
        }

        let correlation = Uuid::new_v4();
        let package = item.op.request(correlation);
        item.correlation = correlation;
        item.connection_id = Some(channel.id);
        item.last_updated = Instant::now();

        trace!(op = item.op.name(), %correlation, attempt = item.retry_count, "operation scheduled");
        if !channel.send(package) {
            // channel is on its way down; the item stays bound to it and
            // the next timeout sweep replays it on the replacement
            debug!(op = item.op.name(), "scheduled on a dying channel");
        }
        self.active.insert(correlation, item);
    }

    /// Pulls deferred items onto `channel` while capacity remains.
    pub(crate) fn schedule_waiting(&mut self, channel: &Channel) {
        while self.active.len() < self.max_concurrent {
            match self.waiting.pop_front() {
                Some(item) => self.schedule(item, channel),
                None => break,
            }
        }
    }

    /// Routes a response to its operation and applies the decision.
    pub(crate) fn handle_response(
        &mut self,
        package: Package,
        channel: &Channel,
    ) -> Option<Directive> {
        let correlation = package.correlation;
        let mut item = match self.active.remove(&correlation) {
            Some(item) => item,
            None => {
                // late responses to operations that already timed out land here
                trace!(%correlation, "response without a pending operation, dropped");
                return None
            }
        };

        match item.op.inspect(package) {
            Decision::DoNothing => {
                item.last_updated = Instant::now();
                self.active.insert(correlation, item);
                None
            }
            Decision::EndOperation => {
                // capacity freed up
                self.schedule_waiting(channel);
                None
            }
            Decision::Retry => {
                self.retry(item);
                self.schedule_waiting(channel);
                None
            }
            Decision::Reconnect(endpoints) => {
                // re-issued once the replacement channel is up
                item.connection_id = None;
                self.waiting.push_back(item);
                Some(Directive::Reconnect(endpoints))
            }
            Decision::Fatal(reason) => Some(Directive::CloseConnection(reason)),
        }
    }

    fn retry(&mut self, mut item: OperationItem) {
        if item.max_retries >= 0 && item.retry_count >= item.max_retries {
            warn!(op = item.op.name(), retries = item.retry_count, "retry budget exhausted");
            let retries = item.retry_count;
            item.op.fail(Error::RetryLimitReached(retries));
            return
        }
        item.retry_count += 1;
        item.connection_id = None;
        self.waiting.push_back(item);
    }

    /// Sweeps active items past their deadline: items bound to an older
    /// channel replay for free, the rest consume retry budget or fail.
    pub(crate) fn check_timeouts(&mut self, channel: &Channel) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, item)| now.duration_since(item.last_updated) >= item.timeout)
            .map(|(correlation, _)| *correlation)
            .collect();

        for correlation in expired {
            let mut item = match self.active.remove(&correlation) {
                Some(item) => item,
                None => continue,
            };
            if item.connection_id != Some(channel.id) {
                debug!(op = item.op.name(), "replaying operation from a lost channel");
                item.connection_id = None;
                self.waiting.push_back(item);
            } else if item.max_retries >= 0 && item.retry_count >= item.max_retries {
                let name = item.op.name();
                item.op.fail(Error::OperationTimeout(format!(
                    "{name} gave no response in {:?} after {} attempts",
                    item.timeout,
                    item.retry_count + 1
                )));
            } else {
                item.retry_count += 1;
                item.connection_id = None;
                self.waiting.push_back(item);
            }
        }
        self.schedule_waiting(channel);
    }

    /// Fails everything; used on the final disconnect.
    pub(crate) fn cleanup(&mut self, make_error: impl Fn() -> Error) {
        let active = self.active.len();
        let waiting = self.waiting.len();
        if active + waiting > 0 {
            debug!(active, waiting, "failing all in-flight operations");
        }
        for (_, mut item) in self.active.drain() {
            item.op.fail(make_error());
        }
        for mut item in self.waiting.drain(..) {
            item.op.fail(make_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::write::append_to_stream;
    use crate::proto::{command, messages, Package};
    use crate::types::{EventData, ExpectedVersion, WriteResult};
    use futures_channel::oneshot;
    use futures_util::StreamExt;

    fn settings() -> Settings {
        Settings::builder()
            .single_node("localhost", 1113)
            .operation_timeout(Duration::from_millis(10))
            .max_operation_retries(1)
            .build()
            .unwrap()
    }

    fn item(
        settings: &Settings,
        totals: &Arc<AtomicUsize>,
    ) -> (OperationItem, oneshot::Receiver<Result<WriteResult, Error>>) {
        let (tx, rx) = oneshot::channel();
        let op = append_to_stream(
            "unit".into(),
            ExpectedVersion::Any,
            vec![EventData::binary("t", vec![1])],
            true,
            None,
            tx,
        );
        totals.fetch_add(1, Ordering::Relaxed);
        (OperationItem::new(Box::new(op), settings, totals.clone()), rx)
    }

    #[tokio::test]
    async fn schedule_writes_the_request_and_a_response_completes_it() {
        let settings = settings();
        let totals = Arc::new(AtomicUsize::new(0));
        let (channel, mut outbound) = Channel::test();
        let mut manager = OperationManager::new(&settings);

        let (op_item, mut rx) = item(&settings, &totals);
        manager.schedule(op_item, &channel);

        let request = outbound.next().await.unwrap();
        assert_eq!(request.command, command::WRITE_EVENTS);

        let response = Package::new(
            command::WRITE_EVENTS_COMPLETED,
            request.correlation,
            messages::WriteEventsCompleted::success(3).encode(),
        );
        assert!(manager.handle_response(response, &channel).is_none());
        assert_eq!(rx.try_recv().unwrap().unwrap().unwrap().next_expected_version, 3);
        assert_eq!(totals.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn capacity_overflow_defers_to_waiting() {
        let settings = Settings::builder()
            .single_node("localhost", 1113)
            .max_concurrent_operations(1)
            .build()
            .unwrap();
        let totals = Arc::new(AtomicUsize::new(0));
        let (channel, mut outbound) = Channel::test();
        let mut manager = OperationManager::new(&settings);

        let (first, _rx1) = item(&settings, &totals);
        let (second, _rx2) = item(&settings, &totals);
        manager.schedule(first, &channel);
        manager.schedule(second, &channel);

        let scheduled = outbound.next().await.unwrap();
        assert!(outbound.try_next().is_err(), "second operation must wait");

        // completing the first drains the waiting queue
        let response = Package::new(
            command::WRITE_EVENTS_COMPLETED,
            scheduled.correlation,
            messages::WriteEventsCompleted::success(0).encode(),
        );
        manager.handle_response(response, &channel);
        assert_eq!(outbound.next().await.unwrap().command, command::WRITE_EVENTS);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let settings = settings();
        let totals = Arc::new(AtomicUsize::new(0));
        let (channel, mut outbound) = Channel::test();
        let mut manager = OperationManager::new(&settings);

        let (op_item, mut rx) = item(&settings, &totals);
        manager.schedule(op_item, &channel);

        // max_operation_retries is 1: one retry passes, the next fails
        for _ in 0..2 {
            let request = outbound.next().await.unwrap();
            let busy = Package::new(
                command::NOT_HANDLED,
                request.correlation,
                messages::NotHandled::too_busy().encode(),
            );
            manager.handle_response(busy, &channel);
        }

        assert!(matches!(rx.try_recv().unwrap().unwrap(), Err(Error::RetryLimitReached(1))));
        assert_eq!(totals.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn timeout_on_a_lost_channel_replays_without_spending_budget() {
        let settings = settings();
        let totals = Arc::new(AtomicUsize::new(0));
        let (old_channel, mut old_outbound) = Channel::test();
        let (new_channel, mut new_outbound) = Channel::test();
        let mut manager = OperationManager::new(&settings);

        let (op_item, _rx) = item(&settings, &totals);
        manager.schedule(op_item, &old_channel);
        let first = old_outbound.next().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.check_timeouts(&new_channel);

        let replayed = new_outbound.next().await.unwrap();
        assert_eq!(replayed.command, command::WRITE_EVENTS);
        assert_ne!(replayed.correlation, first.correlation, "replay gets a fresh correlation id");
    }

    #[tokio::test]
    async fn timeout_on_the_same_channel_exhausts_into_a_timeout_error() {
        let settings = Settings::builder()
            .single_node("localhost", 1113)
            .operation_timeout(Duration::from_millis(5))
            .max_operation_retries(0)
            .build()
            .unwrap();
        let totals = Arc::new(AtomicUsize::new(0));
        let (channel, _outbound) = Channel::test();
        let mut manager = OperationManager::new(&settings);

        let (op_item, mut rx) = item(&settings, &totals);
        manager.schedule(op_item, &channel);

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.check_timeouts(&channel);

        assert!(matches!(rx.try_recv().unwrap().unwrap(), Err(Error::OperationTimeout(_))));
    }

    #[tokio::test]
    async fn cleanup_fails_active_and_waiting_alike() {
        let settings = settings();
        let totals = Arc::new(AtomicUsize::new(0));
        let (channel, _outbound) = Channel::test();
        let mut manager = OperationManager::new(&settings);

        let (active, mut active_rx) = item(&settings, &totals);
        let (waiting, mut waiting_rx) = item(&settings, &totals);
        manager.schedule(active, &channel);
        manager.enqueue(waiting);

        manager.cleanup(|| Error::ConnectionClosed("test teardown".into()));

        assert!(matches!(active_rx.try_recv().unwrap().unwrap(), Err(Error::ConnectionClosed(_))));
        assert!(matches!(waiting_rx.try_recv().unwrap().unwrap(), Err(Error::ConnectionClosed(_))));
        assert_eq!(totals.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn late_responses_are_dropped_silently() {
        let settings = settings();
        let (channel, _outbound) = Channel::test();
        let mut manager = OperationManager::new(&settings);

        let stray = Package::new(
            command::WRITE_EVENTS_COMPLETED,
            Uuid::new_v4(),
            messages::WriteEventsCompleted::success(0).encode(),
        );
        assert!(manager.handle_response(stray, &channel).is_none());
    }
}
