use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::cache::MessageCache;
use crate::config::{SessionProperties, Settings, TimeoutSettings};
use crate::events::{ConnectionEvent, ConnectionState, EventBus};
use crate::message::{Message, MessageConverter, converter_for};
use crate::subscription::{RequestOutcome, SubscriptionIssuer, SubscriptionRegistry};
use crate::transport::{
    BrokerSession, BrokerTransport, CorrelationToken, DispatchHandle, RawMessage, SessionEvent,
    SessionHandler, SessionInfo,
};
use crate::utils::{BridgeError, Result, TransportError};

/// Drives one broker session through its lifecycle and wires the
/// subscription registry, the message cache and the event bus to it.
///
/// The manager owns the session exclusively and disposes it exactly once.
/// Transport callbacks are serialized against the lifecycle state; every
/// transition is broadcast on the `EventBus` while the state is still
/// locked, so observers see transitions in the order they happened.
pub struct ConnectionManager<T: BrokerTransport> {
    transport: T,
    properties: SessionProperties,
    timeouts: TimeoutSettings,
    shared: Arc<Shared>,
}

impl<T: BrokerTransport> ConnectionManager<T> {
    /// Creates a manager around an initialized transport.
    pub fn new(transport: T, settings: &Settings, converter: Arc<dyn MessageConverter>) -> Self {
        Self {
            transport,
            properties: settings.session.clone(),
            timeouts: settings.timeouts.clone(),
            shared: Arc::new(Shared::new(converter)),
        }
    }

    /// Creates a manager using the converter named by `settings.message`.
    pub fn from_settings(transport: T, settings: &Settings) -> Self {
        Self::new(transport, settings, converter_for(settings.message.format))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Opened
    }

    pub fn cache(&self) -> &MessageCache {
        &self.shared.cache
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.shared.registry
    }

    /// Adds an independent observer of connection events.
    ///
    /// Events produced before registration are not replayed.
    pub fn register_connection_event_observer(&self) -> UnboundedReceiver<ConnectionEvent> {
        self.shared.bus.register_observer()
    }

    /// Latest message received for `destination`.
    ///
    /// Absence only means nothing has arrived yet; check `state()` to tell
    /// it apart from a missing connection.
    pub fn lookup(&self, destination: &str) -> Option<Arc<Message>> {
        self.shared.cache.lookup(destination)
    }

    /// Opens a session and waits for the broker's answer.
    ///
    /// Returns the event that settled the attempt. Every transition on the
    /// way is also broadcast to the registered observers.
    pub async fn connect(&self) -> Result<ConnectionEvent> {
        let shared = &self.shared;
        let (waiter, generation) = {
            let mut lifecycle = shared.lifecycle.lock();
            let state = lifecycle.state;
            match state {
                ConnectionState::Created | ConnectionState::Closed => {}
                ConnectionState::Closing | ConnectionState::Faulted => {
                    return Err(BridgeError::InvalidState(state));
                }
                state => {
                    warn!(%state, "connect rejected, session already opened or opening");
                    return Err(BridgeError::AlreadyInProgress);
                }
            }
            let (tx, rx) = oneshot::channel();
            lifecycle.generation += 1;
            lifecycle.connect_waiter = Some(tx);
            shared.transition(&mut lifecycle, ConnectionState::Opening, &SessionInfo::default());
            (rx, lifecycle.generation)
        };

        // a session left behind by a dropped connection is retired first
        shared.dispose_session_if(|installed| installed < generation);

        if let Err(e) = self.properties.validate() {
            let reason = match e {
                BridgeError::Configuration(reason) => reason,
                other => other.to_string(),
            };
            return Err(self.fault(generation, 0, reason));
        }

        let handler = Arc::new(SessionCallbacks {
            shared: Arc::downgrade(shared),
            generation,
        });
        let session = match self.transport.create_session(&self.properties, handler) {
            Ok(session) => session,
            Err(e) => return Err(self.fault(generation, 0, e.to_string())),
        };
        shared.session.install(generation, session);
        if !shared.is_current_attempt(generation) {
            // a disconnect ran while the session was being created
            shared.dispose_session_if(|installed| installed == generation);
            return Err(superseded());
        }

        info!(host = %self.properties.host, vpn = %self.properties.vpn, "connecting to broker");
        if let Err(e) = shared.session.with(|s| s.connect()) {
            let (code, reason) = match e {
                TransportError::Rejected { return_code, info } => (return_code, info),
                other => (0, other.to_string()),
            };
            return Err(self.fault(generation, code, reason));
        }

        let limit = self.timeouts.connect();
        match tokio::time::timeout(limit, waiter).await {
            Ok(Ok(event)) if event.state == ConnectionState::Opened => Ok(event),
            Ok(Ok(event)) => Err(BridgeError::TransportConnect {
                state: event.state,
                response_code: event.response_code,
                info: event.info,
            }),
            Ok(Err(_)) => Err(BridgeError::TransportConnect {
                state: self.state(),
                response_code: 0,
                info: Some("connect attempt abandoned".to_string()),
            }),
            Err(_) => {
                error!(?limit, "broker did not answer the connect attempt");
                self.abandon_connect(generation);
                Err(BridgeError::Timeout {
                    operation: "connect",
                    after: limit,
                })
            }
        }
    }

    /// Tears the session down: Closing, transport disconnect, subscriptions
    /// dropped, session disposed, cache emptied, Closed.
    ///
    /// A no-op when there is nothing to close.
    pub async fn disconnect(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut lifecycle = shared.lifecycle.lock();
            let state = lifecycle.state;
            match state {
                ConnectionState::Created | ConnectionState::Closed => return Ok(()),
                ConnectionState::Closing => {
                    debug!("disconnect already in progress");
                    return Ok(());
                }
                ConnectionState::Faulted => {
                    drop(lifecycle);
                    shared.dispose_session();
                    return Ok(());
                }
                _ => {
                    shared.transition(&mut lifecycle, ConnectionState::Closing, &SessionInfo::default());
                }
            }
        }

        if let Err(e) = shared.session.with(|s| s.disconnect()) {
            warn!(error = %e, "transport disconnect failed, disposing anyway");
        }
        shared.registry.clear();
        shared.dispose_session();
        shared.cache.clear();

        shared.apply(ConnectionState::Closed, &SessionInfo::default());
        info!("disconnected from broker");
        Ok(())
    }

    /// Subscribes to `topic`; see `SubscriptionRegistry::subscribe`.
    ///
    /// Already-subscribed topics succeed without a connection. Anything
    /// else needs an Opened session.
    pub async fn subscribe(&self, topic: &str) -> Result<bool> {
        if topic.is_empty() {
            return Err(BridgeError::InvalidTopic);
        }
        if self.shared.registry.contains(topic) {
            return Ok(true);
        }
        self.ensure_opened()?;
        self.shared
            .registry
            .subscribe(topic, &self.shared.session, self.timeouts.request())
            .await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<bool> {
        self.shared
            .registry
            .unsubscribe(topic, &self.shared.session, self.timeouts.request())
            .await
    }

    /// Adds one unit of demand for `topic` and subscribes on the first one.
    ///
    /// Without an Opened session the demand is still recorded and
    /// `NotConnected` is returned.
    pub async fn retain(&self, topic: &str) -> Result<bool> {
        if topic.is_empty() {
            return Err(BridgeError::InvalidTopic);
        }
        if !self.is_connected() && !self.shared.registry.contains(topic) {
            self.shared.registry.add_demand(topic);
            return Err(BridgeError::NotConnected);
        }
        self.shared
            .registry
            .retain(topic, &self.shared.session, self.timeouts.request())
            .await
    }

    /// Drops one unit of demand; the last release unsubscribes.
    pub async fn release(&self, topic: &str) -> Result<bool> {
        self.shared
            .registry
            .release(topic, &self.shared.session, self.timeouts.request())
            .await
    }

    fn ensure_opened(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Opened => Ok(()),
            state => {
                debug!(%state, "request refused, session not opened");
                Err(BridgeError::NotConnected)
            }
        }
    }

    /// Faults the attempt `generation` unless a disconnect already
    /// settled it.
    fn fault(&self, generation: u64, response_code: i32, reason: String) -> BridgeError {
        let faulted = {
            let mut lifecycle = self.shared.lifecycle.lock();
            let current = lifecycle.generation == generation
                && lifecycle.state == ConnectionState::Opening;
            if current {
                error!(response_code, %reason, "connect rejected before reaching the broker");
                self.shared.transition(
                    &mut lifecycle,
                    ConnectionState::Faulted,
                    &SessionInfo {
                        response_code,
                        info: Some(reason.clone()),
                    },
                );
            }
            current
        };
        self.shared.dispose_session_if(|installed| installed == generation);
        if faulted {
            BridgeError::Configuration(reason)
        } else {
            debug!(%reason, "connect failure after the attempt was superseded");
            superseded()
        }
    }

    fn abandon_connect(&self, generation: u64) {
        let abandoned = {
            let mut lifecycle = self.shared.lifecycle.lock();
            let current = lifecycle.generation == generation
                && lifecycle.state == ConnectionState::Opening;
            if current {
                lifecycle.connect_waiter = None;
                self.shared.transition(
                    &mut lifecycle,
                    ConnectionState::Closed,
                    &SessionInfo::new(0, "connect timed out"),
                );
            }
            current
        };
        if abandoned {
            self.shared.dispose_session_if(|installed| installed == generation);
        }
    }
}

fn superseded() -> BridgeError {
    BridgeError::TransportConnect {
        state: ConnectionState::Closed,
        response_code: 0,
        info: Some("connect attempt superseded by disconnect".to_string()),
    }
}

impl<T: BrokerTransport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        if self.shared.dispose_session() {
            debug!("session disposed with its connection manager");
        }
    }
}

struct Lifecycle {
    state: ConnectionState,
    /// Bumped for every session; callbacks from older sessions are ignored.
    generation: u64,
    connect_waiter: Option<oneshot::Sender<ConnectionEvent>>,
}

/// State shared between the manager and the session callbacks.
struct Shared {
    lifecycle: Mutex<Lifecycle>,
    session: SessionSlot,
    registry: SubscriptionRegistry,
    cache: MessageCache,
    bus: EventBus,
    converter: Arc<dyn MessageConverter>,
}

impl Shared {
    fn new(converter: Arc<dyn MessageConverter>) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Created,
                generation: 0,
                connect_waiter: None,
            }),
            session: SessionSlot::default(),
            registry: SubscriptionRegistry::new(),
            cache: MessageCache::new(),
            bus: EventBus::new(),
            converter,
        }
    }

    /// Moves to `next` if the lifecycle graph allows it and broadcasts the
    /// resulting event. Must be called with the lifecycle locked.
    fn transition(
        &self,
        lifecycle: &mut Lifecycle,
        next: ConnectionState,
        info: &SessionInfo,
    ) -> Option<ConnectionEvent> {
        let from = lifecycle.state;
        if !from.can_transition_to(next) {
            warn!(%from, to = %next, "ignoring transition outside the connection lifecycle");
            return None;
        }
        lifecycle.state = next;

        let event = ConnectionEvent::new(next, info.info.clone(), info.response_code);
        info!(%from, to = %next, response_code = info.response_code, "connection state changed");
        let observers = self.bus.broadcast(&event);
        trace!(observers, "connection event broadcast");

        if next.resolves_connect() {
            if let Some(waiter) = lifecycle.connect_waiter.take() {
                let _ = waiter.send(event.clone());
            }
        }
        Some(event)
    }

    fn apply(&self, next: ConnectionState, info: &SessionInfo) -> Option<ConnectionEvent> {
        let mut lifecycle = self.lifecycle.lock();
        self.transition(&mut lifecycle, next, info)
    }

    fn dispose_session(&self) -> bool {
        self.dispose_session_if(|_| true)
    }

    /// Disposes the installed session if its generation matches `retire`.
    fn dispose_session_if(&self, retire: impl FnOnce(u64) -> bool) -> bool {
        match self.session.take_if(retire) {
            Some(session) => {
                session.dispose();
                true
            }
            None => false,
        }
    }

    fn is_current_attempt(&self, generation: u64) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.generation == generation && lifecycle.state == ConnectionState::Opening
    }

    fn on_session_event(&self, generation: u64, event: SessionEvent) {
        match event {
            SessionEvent::SubscriptionOk { token, info } => {
                self.registry.resolve(token, RequestOutcome::Confirmed(info));
            }
            SessionEvent::SubscriptionError { token, info } => {
                self.registry.resolve(token, RequestOutcome::Rejected(info));
            }
            event => self.on_state_event(generation, event),
        }
    }

    fn on_state_event(&self, generation: u64, event: SessionEvent) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.generation != generation {
            debug!(?event, "ignoring event from a retired session");
            return;
        }
        if lifecycle.state == ConnectionState::Closing {
            debug!(?event, "ignoring session event during teardown");
            return;
        }

        let session_lost = match event {
            SessionEvent::UpNotice(info) => {
                if lifecycle.state == ConnectionState::Opening {
                    self.transition(&mut lifecycle, ConnectionState::Opened, &info);
                } else {
                    debug!(state = %lifecycle.state, "ignoring up notice");
                }
                false
            }
            SessionEvent::ConnectFailed(info) | SessionEvent::Down(info) => self
                .transition(&mut lifecycle, ConnectionState::Closed, &info)
                .is_some(),
            SessionEvent::Reconnecting(info) => {
                self.transition(&mut lifecycle, ConnectionState::Reconnecting, &info);
                false
            }
            SessionEvent::Reconnected(info) => {
                if self
                    .transition(&mut lifecycle, ConnectionState::Reconnected, &info)
                    .is_some()
                {
                    self.transition(&mut lifecycle, ConnectionState::Opened, &info);
                }
                false
            }
            SessionEvent::Fatal(info) => {
                error!(
                    response_code = info.response_code,
                    info = info.info.as_deref().unwrap_or(""),
                    "broker session failed"
                );
                self.transition(&mut lifecycle, ConnectionState::Faulted, &info)
                    .is_some()
            }
            SessionEvent::SubscriptionOk { .. } | SessionEvent::SubscriptionError { .. } => false,
        };
        drop(lifecycle);

        if session_lost {
            // the broker forgot our subscriptions along with the session
            self.registry.clear();
        }
    }

    fn on_message(&self, generation: u64, raw: RawMessage) {
        let message = self.converter.convert(raw);
        let lifecycle = self.lifecycle.lock();
        if lifecycle.generation != generation || !lifecycle.state.is_connect_in_progress() {
            trace!(destination = message.destination(), "dropping message outside a live session");
            return;
        }
        trace!(destination = message.destination(), size = message.len(), "message cached");
        self.cache.store_message(message);
    }
}

/// The `SessionHandler` handed to the transport. Holds the shared state
/// weakly so a session never keeps its manager alive.
struct SessionCallbacks {
    shared: Weak<Shared>,
    generation: u64,
}

impl SessionHandler for SessionCallbacks {
    fn on_session_event(&self, event: SessionEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_session_event(self.generation, event);
        }
    }

    fn on_message(&self, message: RawMessage) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_message(self.generation, message);
        }
    }
}

/// Exclusive owner of the live session, tagged with the connect attempt
/// that created it.
#[derive(Default)]
struct SessionSlot {
    session: Mutex<Option<(u64, Box<dyn BrokerSession>)>>,
}

impl SessionSlot {
    fn install(&self, generation: u64, session: Box<dyn BrokerSession>) {
        *self.session.lock() = Some((generation, session));
    }

    fn take_if(&self, retire: impl FnOnce(u64) -> bool) -> Option<Box<dyn BrokerSession>> {
        let mut slot = self.session.lock();
        match slot.as_ref() {
            Some((generation, _)) if retire(*generation) => slot.take().map(|(_, s)| s),
            _ => None,
        }
    }

    fn with<R>(
        &self,
        f: impl FnOnce(&dyn BrokerSession) -> std::result::Result<R, TransportError>,
    ) -> std::result::Result<R, TransportError> {
        match self.session.lock().as_ref() {
            Some((_, session)) => f(session.as_ref()),
            None => Err(TransportError::SessionClosed),
        }
    }
}

impl SubscriptionIssuer for SessionSlot {
    fn create_dispatch_target(
        &self,
        topic: &str,
    ) -> std::result::Result<DispatchHandle, TransportError> {
        self.with(|s| s.create_dispatch_target(topic))
    }

    fn subscribe(
        &self,
        target: &DispatchHandle,
        token: CorrelationToken,
    ) -> std::result::Result<(), TransportError> {
        self.with(|s| s.subscribe(target, token))
    }

    fn unsubscribe(
        &self,
        target: &DispatchHandle,
        token: CorrelationToken,
    ) -> std::result::Result<(), TransportError> {
        self.with(|s| s.unsubscribe(target, token))
    }
}
