//! The connection engine.
//!
//! One spawned task owns every piece of mutable client state: the current
//! channel, the connecting phase, reconnection bookkeeping and both
//! managers. Everything reaches it through the task queue, including
//! inbound packages posted by the transport task, so handlers run strictly
//! one at a time and never block.

use std::{
    net::SocketAddr,
    sync::{atomic::AtomicUsize, Arc},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_channel::{mpsc, oneshot};
use futures_util::StreamExt;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    backend::{BackendDriver, TcpBackend},
    operations::{Directive, OperationItem, OperationManager},
    subscriptions::{SubscriptionItem, SubscriptionManager},
    ClientEvent, Listeners,
};
use crate::{
    discovery::Discover,
    errors::Error,
    operations::{payload_text, Operation, SubscriptionOperation},
    proto::{command, Package},
    settings::Settings,
    types::{NakAction, NodeEndpoints},
};

/// Period of the maintenance ticker.
const TICK_PERIOD: Duration = Duration::from_millis(200);

/// Fine-grained progress of the current connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectingPhase {
    Invalid,
    Reconnecting,
    EndpointDiscovery,
    ConnectionEstablishing,
    Authentication,
    Connected,
}

/// Coarse state, derived from the phase and channel presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Closed,
}

/// The engine's view of a live channel.
pub(crate) struct Channel {
    pub(crate) id: Uuid,
    pub(crate) remote: SocketAddr,
    driver: BackendDriver,
}

impl Channel {
    pub(crate) fn send(&self, package: Package) -> bool {
        self.driver.send(package)
    }

    #[cfg(test)]
    pub(crate) fn test() -> (Self, mpsc::UnboundedReceiver<Package>) {
        let (driver, outbound) = BackendDriver::test();
        (
            Self {
                id: Uuid::new_v4(),
                remote: "127.0.0.1:1113".parse().expect("literal address"),
                driver,
            },
            outbound,
        )
    }
}

/// A freshly connected, not yet spawned backend.
pub(crate) struct EstablishedChannel {
    pub(crate) id: Uuid,
    pub(crate) remote: SocketAddr,
    pub(crate) backend: TcpBackend,
    pub(crate) driver: BackendDriver,
}

impl std::fmt::Debug for EstablishedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Everything that can reach the control loop.
pub(crate) enum Task {
    StartConnection {
        done: oneshot::Sender<Result<(), Error>>,
    },
    CloseConnection {
        reason: String,
        error: Option<Error>,
    },
    EstablishTcpConnection {
        epoch: u64,
        endpoints: NodeEndpoints,
    },
    StartOperation {
        op: Box<dyn Operation>,
    },
    StartSubscription {
        op: Box<dyn SubscriptionOperation>,
        key: Uuid,
    },
    StartPersistentSubscription {
        op: Box<dyn SubscriptionOperation>,
        key: Uuid,
    },
    Unsubscribe {
        key: Uuid,
    },
    PersistentAck {
        key: Uuid,
        ids: Vec<Uuid>,
    },
    PersistentNak {
        key: Uuid,
        ids: Vec<Uuid>,
        action: NakAction,
        message: String,
    },
    // internal: completions and transport notifications
    EndpointDiscovered {
        epoch: u64,
        result: Result<NodeEndpoints, Error>,
    },
    TcpConnectionEstablished {
        epoch: u64,
        result: Result<EstablishedChannel, Error>,
    },
    PackageArrived {
        channel_id: Uuid,
        package: Package,
    },
    ChannelClosed {
        channel_id: Uuid,
        cause: Option<String>,
    },
}

struct AuthAttempt {
    correlation: Uuid,
    deadline: Instant,
}

pub(crate) struct ConnectionDriver {
    settings: Arc<Settings>,
    discoverer: Arc<dyn Discover>,
    tasks_tx: mpsc::UnboundedSender<Task>,
    tasks_rx: mpsc::UnboundedReceiver<Task>,
    listeners: Listeners,
    totals: Arc<AtomicUsize>,

    channel: Option<Channel>,
    phase: ConnectingPhase,
    closed: bool,
    /// Attempt token; completions carrying an older one are stale.
    epoch: u64,
    reconn_attempt: i32,
    reconn_since: Instant,
    last_timeout_check: Instant,
    pending_connect: Option<oneshot::Sender<Result<(), Error>>>,
    auth: Option<AuthAttempt>,
    /// The current failure cycle began with a rejected handshake.
    auth_failed_cycle: bool,
    last_failed_endpoint: Option<SocketAddr>,

    operations: OperationManager,
    subscriptions: SubscriptionManager,
}

impl ConnectionDriver {
    pub(crate) fn spawn(
        settings: Arc<Settings>,
        discoverer: Arc<dyn Discover>,
        listeners: Listeners,
        totals: Arc<AtomicUsize>,
    ) -> mpsc::UnboundedSender<Task> {
        let (tasks_tx, tasks_rx) = mpsc::unbounded();
        let driver = ConnectionDriver {
            operations: OperationManager::new(&settings),
            subscriptions: SubscriptionManager::new(&settings),
            settings,
            discoverer,
            tasks_tx: tasks_tx.clone(),
            tasks_rx,
            listeners,
            totals,
            channel: None,
            phase: ConnectingPhase::Invalid,
            closed: false,
            epoch: 0,
            reconn_attempt: 0,
            reconn_since: Instant::now(),
            last_timeout_check: Instant::now(),
            pending_connect: None,
            auth: None,
            auth_failed_cycle: false,
            last_failed_endpoint: None,
        };
        tokio::spawn(driver.run());
        tasks_tx
    }

    async fn run(mut self) {
        let mut ticker = interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                task = self.tasks_rx.next() => match task {
                    Some(task) => self.handle_task(task),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
            if self.closed {
                break
            }
        }
        debug!("control loop stopped");
    }

    fn state(&self) -> ConnectionState {
        if self.closed {
            ConnectionState::Closed
        } else if self.channel.is_some() {
            if self.phase == ConnectingPhase::Connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Connecting
            }
        } else {
            ConnectionState::Init
        }
    }

    fn emit(&self, event: ClientEvent) {
        self.listeners.emit(event);
    }

    fn enqueue(&self, task: Task) {
        // only fails while shutting down, when nobody cares anymore
        let _ = self.tasks_tx.unbounded_send(task);
    }

    fn enqueue_close(&self, reason: String, error: Option<Error>) {
        self.enqueue(Task::CloseConnection { reason, error });
    }

    fn handle_task(&mut self, task: Task) {
        match task {
            Task::StartConnection { done } => self.start_connection(done),
            Task::CloseConnection { reason, error } => self.close_connection(reason, error),
            Task::EstablishTcpConnection { epoch, endpoints } => {
                self.establish_tcp_connection(epoch, endpoints)
            }
            Task::StartOperation { op } => self.start_operation(op),
            Task::StartSubscription { op, key } | Task::StartPersistentSubscription { op, key } => {
                self.start_subscription(op, key)
            }
            Task::Unsubscribe { key } => {
                self.subscriptions.unsubscribe(key, self.channel.as_ref())
            }
            Task::PersistentAck { key, ids } => {
                if let Some(channel) = self.channel.as_ref() {
                    self.subscriptions.ack(key, &ids, channel);
                }
            }
            Task::PersistentNak { key, ids, action, message } => {
                if let Some(channel) = self.channel.as_ref() {
                    self.subscriptions.nak(key, &ids, action, &message, channel);
                }
            }
            Task::EndpointDiscovered { epoch, result } => {
                self.on_endpoint_discovered(epoch, result)
            }
            Task::TcpConnectionEstablished { epoch, result } => {
                self.on_tcp_connection_established(epoch, result)
            }
            Task::PackageArrived { channel_id, package } => self.on_package(channel_id, package),
            Task::ChannelClosed { channel_id, cause } => self.on_channel_closed(channel_id, cause),
        }
    }

    fn on_tick(&mut self) {
        if let Some(auth) = &self.auth {
            if Instant::now() >= auth.deadline {
                warn!("credential handshake timed out");
                self.auth = None;
                self.auth_failed_cycle = true;
                self.emit(ClientEvent::AuthenticationFailed("authentication timed out".into()));
                self.close_tcp_connection("authentication timed out");
                return
            }
        }

        match (self.state(), self.phase) {
            (ConnectionState::Init, ConnectingPhase::Reconnecting) => {
                if self.reconn_since.elapsed() >= self.settings.reconnection_delay {
                    self.reconn_attempt += 1;
                    self.reconn_since = Instant::now();
                    if self.settings.max_reconnections >= 0 &&
                        self.reconn_attempt > self.settings.max_reconnections
                    {
                        self.enqueue_close("reconnection limit reached".into(), None);
                    } else {
                        debug!(attempt = self.reconn_attempt, "scheduling a reconnection");
                        self.discover_endpoint();
                    }
                }
            }
            (ConnectionState::Connected, _) => {
                if self.last_timeout_check.elapsed() >=
                    self.settings.operation_timeout_check_interval
                {
                    self.last_timeout_check = Instant::now();
                    let channel = self.channel.as_ref().expect("connected implies a channel");
                    self.operations.check_timeouts(channel);
                    self.subscriptions.check_timeouts(channel);
                }
            }
            _ => {}
        }
    }

    fn start_connection(&mut self, done: oneshot::Sender<Result<(), Error>>) {
        match (self.state(), self.phase) {
            (ConnectionState::Closed, _) => {
                let _ = done.send(Err(Error::ConnectionClosed("the client is closed".into())));
            }
            (ConnectionState::Init, ConnectingPhase::Invalid) => {
                self.pending_connect = Some(done);
                self.phase = ConnectingPhase::Reconnecting;
                self.reconn_attempt = 0;
                self.reconn_since = Instant::now();
                self.discover_endpoint();
            }
            _ => {
                let _ =
                    done.send(Err(Error::InvalidArgument("connection is already active".into())));
            }
        }
    }

    fn discover_endpoint(&mut self) {
        if !(self.state() == ConnectionState::Init && self.phase == ConnectingPhase::Reconnecting)
        {
            debug!(phase = ?self.phase, "discovery requested in the wrong phase, ignored");
            return
        }
        self.phase = ConnectingPhase::EndpointDiscovery;
        self.epoch += 1;
        let epoch = self.epoch;
        self.emit(ClientEvent::Reconnecting);

        let discoverer = self.discoverer.clone();
        let failed = self.last_failed_endpoint;
        let tasks = self.tasks_tx.clone();
        debug!(epoch, "discovering a node endpoint");
        tokio::spawn(async move {
            let result = discoverer.discover(failed).await;
            let _ = tasks.unbounded_send(Task::EndpointDiscovered { epoch, result });
        });
    }

    fn on_endpoint_discovered(&mut self, epoch: u64, result: Result<NodeEndpoints, Error>) {
        if epoch != self.epoch || self.phase != ConnectingPhase::EndpointDiscovery {
            debug!(epoch, current = self.epoch, "stale discovery result dropped");
            return
        }
        match result {
            Ok(endpoints) => {
                self.enqueue(Task::EstablishTcpConnection { epoch, endpoints });
            }
            Err(e) => {
                let message = match e {
                    Error::CannotEstablishConnection(m) => m,
                    other => other.to_string(),
                };
                if let Some(done) = self.pending_connect.take() {
                    let _ =
                        done.send(Err(Error::CannotEstablishConnection(message.clone())));
                }
                self.enqueue_close(
                    format!("endpoint discovery failed: {message}"),
                    Some(Error::CannotEstablishConnection(message)),
                );
            }
        }
    }

    fn pick_endpoint(&self, endpoints: &NodeEndpoints) -> Option<(SocketAddr, bool)> {
        if self.settings.ssl.enabled {
            if let Some(addr) = endpoints.secure_tcp {
                return Some((addr, true))
            }
        }
        endpoints.tcp.map(|addr| (addr, false))
    }

    fn establish_tcp_connection(&mut self, epoch: u64, endpoints: NodeEndpoints) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "stale establish request dropped");
            return
        }
        if !(self.state() == ConnectionState::Init &&
            self.phase == ConnectingPhase::EndpointDiscovery)
        {
            debug!(phase = ?self.phase, "establish requested in the wrong phase, ignored");
            return
        }
        let Some((addr, secure)) = self.pick_endpoint(&endpoints) else {
            self.enqueue_close("no candidate endpoint to connect to".into(), None);
            return
        };

        self.phase = ConnectingPhase::ConnectionEstablishing;
        debug!(%addr, secure, "establishing TCP connection");

        let channel_id = Uuid::new_v4();
        let tasks = self.tasks_tx.clone();
        let settings = self.settings.clone();
        let tls_host = secure.then(|| endpoints.hostname.clone());
        tokio::spawn(async move {
            let result = TcpBackend::connect(channel_id, addr, tls_host, &settings, tasks.clone())
                .await
                .map(|(backend, driver)| EstablishedChannel {
                    id: channel_id,
                    remote: addr,
                    backend,
                    driver,
                });
            let _ = tasks.unbounded_send(Task::TcpConnectionEstablished { epoch, result });
        });
    }

    fn on_tcp_connection_established(
        &mut self,
        epoch: u64,
        result: Result<EstablishedChannel, Error>,
    ) {
        if epoch != self.epoch || self.phase != ConnectingPhase::ConnectionEstablishing {
            // dropping a successful result closes its socket
            debug!(epoch, current = self.epoch, "stale connect result dropped");
            return
        }
        match result {
            Ok(established) => {
                debug!(remote = %established.remote, channel = %established.id, "channel up");
                self.phase = ConnectingPhase::Authentication;
                established.backend.spawn();
                self.channel = Some(Channel {
                    id: established.id,
                    remote: established.remote,
                    driver: established.driver,
                });

                match self.settings.default_credentials.clone() {
                    Some(credentials) => {
                        let correlation = Uuid::new_v4();
                        let package = Package::authenticated(
                            command::AUTHENTICATE,
                            correlation,
                            credentials,
                            Bytes::new(),
                        );
                        let sent = self
                            .channel
                            .as_ref()
                            .map(|channel| channel.send(package))
                            .unwrap_or(false);
                        if sent {
                            let deadline = Instant::now() + self.settings.operation_timeout;
                            self.auth = Some(AuthAttempt { correlation, deadline });
                        } else {
                            self.close_tcp_connection("channel died before authentication");
                        }
                    }
                    // nothing to prove without credentials
                    None => self.goto_connected(),
                }
            }
            Err(e) => {
                self.close_tcp_connection(&format!("unable to connect: {e}"));
            }
        }
    }

    fn goto_connected(&mut self) {
        self.phase = ConnectingPhase::Connected;
        self.reconn_attempt = 0;
        self.reconn_since = Instant::now();
        self.auth = None;
        self.auth_failed_cycle = false;
        self.last_timeout_check = Instant::now();

        let remote = match self.channel.as_ref() {
            Some(channel) => channel.remote,
            None => return,
        };
        if let Some(done) = self.pending_connect.take() {
            let _ = done.send(Ok(()));
        }
        info!(%remote, "connected");
        self.emit(ClientEvent::Connected(remote));

        let channel = self.channel.as_ref().expect("connected implies a channel");
        self.operations.check_timeouts(channel);
        self.operations.schedule_waiting(channel);
        self.subscriptions.check_timeouts(channel);
        self.subscriptions.start_waiting(channel);
    }

    fn on_package(&mut self, channel_id: Uuid, package: Package) {
        match &self.channel {
            Some(channel) if channel.id == channel_id => {}
            _ => {
                trace!(%channel_id, "package from a stale channel dropped");
                return
            }
        }

        if let Some(auth) = &self.auth {
            if package.correlation == auth.correlation &&
                matches!(package.command, command::AUTHENTICATED | command::NOT_AUTHENTICATED)
            {
                self.auth = None;
                if package.command == command::AUTHENTICATED {
                    debug!("credential handshake accepted");
                    self.goto_connected();
                } else {
                    let reason = payload_text(&package.payload);
                    warn!(reason, "credential handshake rejected");
                    self.auth_failed_cycle = true;
                    self.emit(ClientEvent::AuthenticationFailed(reason));
                    self.close_tcp_connection("authentication failed");
                }
                return
            }
        }

        if package.command == command::BAD_REQUEST && package.correlation.is_nil() {
            let message = payload_text(&package.payload);
            self.enqueue_close(
                format!("connection-wide bad request: {message}"),
                Some(Error::BadRequest(message)),
            );
            return
        }

        let directive = {
            let channel = self.channel.as_ref().expect("checked above");
            if self.operations.owns(package.correlation) {
                self.operations.handle_response(package, channel)
            } else if self.subscriptions.owns(package.correlation) {
                self.subscriptions.handle_package(package, channel)
            } else {
                trace!(correlation = %package.correlation, command = package.command,
                       "package with no owner dropped");
                None
            }
        };

        match directive {
            Some(Directive::Reconnect(endpoints)) => self.reconnect_to(endpoints),
            Some(Directive::CloseConnection(reason)) => {
                self.enqueue_close(reason, None);
            }
            None => {}
        }
    }

    /// Not-master redirect: swap channels without going through discovery.
    fn reconnect_to(&mut self, endpoints: NodeEndpoints) {
        if self.state() != ConnectionState::Connected {
            return
        }
        let Some((addr, _)) = self.pick_endpoint(&endpoints) else {
            self.enqueue_close("reconnect hint carried no usable endpoint".into(), None);
            return
        };
        if self.channel.as_ref().map(|channel| channel.remote) == Some(addr) {
            return
        }

        info!(%addr, "server redirected us to another node");
        self.close_tcp_connection("reconnect requested by the server");
        self.phase = ConnectingPhase::EndpointDiscovery;
        self.epoch += 1;
        self.enqueue(Task::EstablishTcpConnection { epoch: self.epoch, endpoints });
    }

    fn start_operation(&mut self, op: Box<dyn Operation>) {
        let mut item = OperationItem::new(op, &self.settings, self.totals.clone());
        match (self.state(), self.phase) {
            (ConnectionState::Closed, _) => {
                item.op.fail(Error::ConnectionClosed("the client is closed".into()))
            }
            (ConnectionState::Init, ConnectingPhase::Invalid) => item.op.fail(Error::NoConnection),
            (ConnectionState::Connected, _) => {
                let channel = self.channel.as_ref().expect("connected implies a channel");
                self.operations.schedule(item, channel);
            }
            _ => self.operations.enqueue(item),
        }
    }

    fn start_subscription(&mut self, op: Box<dyn SubscriptionOperation>, key: Uuid) {
        let mut item = SubscriptionItem::new(op, key, &self.settings);
        match (self.state(), self.phase) {
            (ConnectionState::Closed, _) => item.op.drop_terminally(
                crate::types::SubDropReason::ConnectionClosed,
                Some(Error::ConnectionClosed("the client is closed".into())),
            ),
            (ConnectionState::Init, ConnectingPhase::Invalid) => item.op.drop_terminally(
                crate::types::SubDropReason::ConnectionClosed,
                Some(Error::NoConnection),
            ),
            (ConnectionState::Connected, _) => {
                let channel = self.channel.as_ref().expect("connected implies a channel");
                self.subscriptions.start(item, channel);
            }
            _ => self.subscriptions.enqueue(item),
        }
    }

    /// Tears the channel down from our side and enters the reconnect path.
    fn close_tcp_connection(&mut self, reason: &str) {
        match self.channel.take() {
            Some(channel) => {
                debug!(reason, remote = %channel.remote, "closing TCP connection");
                self.last_failed_endpoint = Some(channel.remote);
                let id = channel.id;
                channel.driver.shutdown();
                self.after_channel_loss(id, reason);
            }
            None => {
                debug!(reason, "connect attempt abandoned");
                self.phase = ConnectingPhase::Reconnecting;
                self.reconn_since = Instant::now();
            }
        }
    }

    /// The transport task noticed the channel die.
    fn on_channel_closed(&mut self, channel_id: Uuid, cause: Option<String>) {
        match &self.channel {
            Some(channel) if channel.id == channel_id => {}
            _ => {
                trace!(%channel_id, "close notice from a stale channel dropped");
                return
            }
        }
        let channel = self.channel.take().expect("checked above");
        self.last_failed_endpoint = Some(channel.remote);
        if let Some(cause) = &cause {
            warn!(cause, remote = %channel.remote, "channel lost");
            self.emit(ClientEvent::ErrorOccurred(cause.clone()));
        }
        self.after_channel_loss(channel_id, cause.as_deref().unwrap_or("connection closed"));
    }

    fn after_channel_loss(&mut self, channel_id: Uuid, reason: &str) {
        self.auth = None;
        self.subscriptions.purge(channel_id);
        self.emit(ClientEvent::ConnectionClosed { reason: reason.to_string() });
        self.phase = ConnectingPhase::Reconnecting;
        self.reconn_since = Instant::now();
    }

    fn close_connection(&mut self, reason: String, error: Option<Error>) {
        if self.state() == ConnectionState::Closed {
            debug!(reason, "close requested but already closed");
            return
        }
        if let Some(error) = &error {
            self.emit(ClientEvent::ErrorOccurred(error.to_string()));
        }
        self.disconnect(&reason);
    }

    fn disconnect(&mut self, reason: &str) {
        info!(reason, "disconnecting");
        self.closed = true;

        let auth_failure = self.auth_failed_cycle;
        let reason_text = reason.to_string();
        let make_error = move || {
            if auth_failure {
                Error::NotAuthenticated("the credential handshake was rejected".into())
            } else {
                Error::ConnectionClosed(reason_text.clone())
            }
        };
        self.operations.cleanup(&make_error);
        self.subscriptions.cleanup(&make_error);

        if let Some(channel) = self.channel.take() {
            channel.driver.shutdown();
        }
        self.phase = ConnectingPhase::Invalid;

        if let Some(done) = self.pending_connect.take() {
            let _ = done.send(Err(make_error()));
        }
        self.emit(ClientEvent::Disconnected { reason: reason.to_string() });
    }
}
