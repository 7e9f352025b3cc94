//! In-process loopback broker
//!
//! A small broker that implements the transport boundary without a network.
//! It keeps a topic table of subscribed sessions, routes `publish` calls to
//! every matching session, and delivers all callbacks on a per-session
//! context thread, the way a client SDK would.
//!
//! Topic patterns use `/`-separated levels; `*` matches exactly one level
//! and a trailing `>` matches one or more remaining levels.
//!
//! Behaviour is scriptable (`set_connect_behavior`, `set_subscribe_behavior`,
//! ...) and every transport call is counted, which makes the broker the
//! test double for the connection core as well as the backend of the
//! binary's demo mode.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, trace};

use super::sdk_log::{SdkLogLevel, forward_sdk_log};
use super::session::{
    BrokerSession, BrokerTransport, CorrelationToken, DispatchHandle, RawMessage, SessionEvent,
    SessionHandler, SessionInfo,
};
use crate::config::{ApiSettings, SessionProperties};
use crate::utils::TransportError;

pub type SessionId = u64;

/// Response code used for successful session events.
pub const RESPONSE_OK: i32 = 200;

/// How the broker answers `connect`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Up notice right away.
    #[default]
    Accept,
    /// Asynchronous connect failure.
    Refuse { response_code: i32, info: String },
    /// Synchronous rejection, before any attempt is made.
    Reject { return_code: i32, info: String },
    /// Never answer.
    Silent,
}

/// How the broker answers subscribe and unsubscribe requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubscribeBehavior {
    #[default]
    Confirm,
    Reject { response_code: i32, info: String },
    /// Accept the request but never confirm it.
    Silent,
}

/// Counters of transport calls made against the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub sessions_created: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub subscribes: usize,
    pub unsubscribes: usize,
    pub disposed: usize,
    pub published: usize,
}

/// Subscribers of one topic pattern.
#[derive(Debug, Default)]
struct Topic {
    pattern: String,
    subscribers: HashSet<SessionId>,
}

impl Topic {
    fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            subscribers: HashSet::new(),
        }
    }
}

enum Delivery {
    Event(SessionEvent),
    Message(RawMessage),
}

struct SessionEntry {
    client_name: String,
    outbox: UnboundedSender<Delivery>,
    connected: bool,
}

#[derive(Default)]
struct BrokerState {
    next_session: SessionId,
    sessions: HashMap<SessionId, SessionEntry>,
    topics: HashMap<String, Topic>,
    connect_behavior: ConnectBehavior,
    subscribe_behavior: SubscribeBehavior,
    unsubscribe_behavior: SubscribeBehavior,
    stats: LoopbackStats,
}

impl BrokerState {
    fn send(&self, session: SessionId, delivery: Delivery) {
        if let Some(entry) = self.sessions.get(&session) {
            // a closed outbox means the session is being disposed
            let _ = entry.outbox.send(delivery);
        }
    }

    fn drop_subscriptions_of(&mut self, session: SessionId) {
        for topic in self.topics.values_mut() {
            topic.subscribers.remove(&session);
        }
        self.topics.retain(|_, t| !t.subscribers.is_empty());
    }
}

/// Shared handle to the broker; clones refer to the same broker.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackBroker")
            .field("sessions", &state.sessions.len())
            .field("topics", &state.topics.len())
            .finish()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().connect_behavior = behavior;
    }

    pub fn set_subscribe_behavior(&self, behavior: SubscribeBehavior) {
        self.state.lock().subscribe_behavior = behavior;
    }

    pub fn set_unsubscribe_behavior(&self, behavior: SubscribeBehavior) {
        self.state.lock().unsubscribe_behavior = behavior;
    }

    pub fn stats(&self) -> LoopbackStats {
        self.state.lock().stats.clone()
    }

    /// Number of sessions holding a subscription that matches `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let state = self.state.lock();
        matching_sessions(&state, topic).len()
    }

    pub fn connected_sessions(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.connected)
            .count()
    }

    /// Route `payload` to every connected session subscribed to a pattern
    /// matching `topic`. Returns the number of sessions reached.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let mut state = self.state.lock();
        state.stats.published += 1;

        let targets = matching_sessions(&state, topic);
        for session in &targets {
            state.send(
                *session,
                Delivery::Message(RawMessage::new(topic, payload.clone())),
            );
        }
        trace!(%topic, sessions = targets.len(), "loopback publish");
        targets.len()
    }

    /// Deliver `event` to every connected session.
    pub fn emit(&self, event: SessionEvent) {
        let state = self.state.lock();
        for (id, entry) in &state.sessions {
            if entry.connected {
                debug!(session = id, client = %entry.client_name, ?event, "injecting session event");
                let _ = entry.outbox.send(Delivery::Event(event.clone()));
            }
        }
    }

    /// Drop every connection, as if the broker went away.
    pub fn drop_connections(&self, response_code: i32, info: &str) {
        self.emit(SessionEvent::Down(SessionInfo::new(response_code, info)));
        let mut state = self.state.lock();
        let ids: Vec<SessionId> = state.sessions.keys().copied().collect();
        for id in ids {
            state.drop_subscriptions_of(id);
            if let Some(entry) = state.sessions.get_mut(&id) {
                entry.connected = false;
            }
        }
    }

    fn register_session(
        &self,
        client_name: &str,
        outbox: UnboundedSender<Delivery>,
    ) -> SessionId {
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            SessionEntry {
                client_name: client_name.to_string(),
                outbox,
                connected: false,
            },
        );
        state.stats.sessions_created += 1;
        id
    }
}

fn matching_sessions(state: &BrokerState, topic: &str) -> Vec<SessionId> {
    let mut seen = HashSet::new();
    for t in state.topics.values() {
        if topic_matches(&t.pattern, topic) {
            for id in &t.subscribers {
                let connected = state.sessions.get(id).is_some_and(|s| s.connected);
                if connected {
                    seen.insert(*id);
                }
            }
        }
    }
    let mut ids: Vec<SessionId> = seen.into_iter().collect();
    ids.sort_unstable();
    ids
}

/// Whether subscription `pattern` matches published `topic`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some(">"), Some(_)) => return pattern_levels.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// `BrokerTransport` backed by a `LoopbackBroker`.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    broker: LoopbackBroker,
    log_level: SdkLogLevel,
}

impl LoopbackTransport {
    pub fn with_broker(broker: LoopbackBroker) -> Self {
        Self {
            broker,
            log_level: SdkLogLevel::Notice,
        }
    }

    pub fn broker(&self) -> &LoopbackBroker {
        &self.broker
    }
}

impl BrokerTransport for LoopbackTransport {
    fn initialize(api: &ApiSettings) -> Result<Self, TransportError> {
        let log_level = SdkLogLevel::parse_or_default(&api.log_level);
        let transport = Self {
            broker: LoopbackBroker::new(),
            log_level,
        };
        if log_level >= SdkLogLevel::Notice {
            forward_sdk_log(
                SdkLogLevel::Notice,
                &format!("loopback transport initialized, log level {log_level}"),
            );
        }
        Ok(transport)
    }

    fn create_session(
        &self,
        properties: &SessionProperties,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Box<dyn BrokerSession>, TransportError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let id = self.broker.register_session(&properties.client_name, tx);

        thread::Builder::new()
            .name(format!("loopback-context-{id}"))
            .spawn(move || {
                while let Some(delivery) = rx.blocking_recv() {
                    match delivery {
                        Delivery::Event(event) => handler.on_session_event(event),
                        Delivery::Message(message) => handler.on_message(message),
                    }
                }
            })
            .map_err(|e| TransportError::Initialization(e.to_string()))?;

        if self.log_level >= SdkLogLevel::Debug {
            forward_sdk_log(
                SdkLogLevel::Debug,
                &format!("session {id} created for {}", properties.host),
            );
        }

        Ok(Box::new(LoopbackSession {
            id,
            broker: self.broker.clone(),
            targets: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct LoopbackSession {
    id: SessionId,
    broker: LoopbackBroker,
    /// dispatch handle id -> subscribed pattern
    targets: Mutex<HashMap<String, String>>,
}

impl LoopbackSession {
    fn answer(
        &self,
        state: &BrokerState,
        behavior: &SubscribeBehavior,
        token: CorrelationToken,
    ) -> bool {
        match behavior {
            SubscribeBehavior::Confirm => {
                state.send(
                    self.id,
                    Delivery::Event(SessionEvent::SubscriptionOk {
                        token,
                        info: SessionInfo::new(RESPONSE_OK, "OK"),
                    }),
                );
                true
            }
            SubscribeBehavior::Reject {
                response_code,
                info,
            } => {
                state.send(
                    self.id,
                    Delivery::Event(SessionEvent::SubscriptionError {
                        token,
                        info: SessionInfo::new(*response_code, info.clone()),
                    }),
                );
                false
            }
            SubscribeBehavior::Silent => false,
        }
    }

    fn ensure_connected(&self, state: &BrokerState) -> Result<(), TransportError> {
        match state.sessions.get(&self.id) {
            Some(entry) if entry.connected => Ok(()),
            _ => Err(TransportError::SessionClosed),
        }
    }
}

impl BrokerSession for LoopbackSession {
    fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.stats.connects += 1;

        match state.connect_behavior.clone() {
            ConnectBehavior::Accept => {
                if let Some(entry) = state.sessions.get_mut(&self.id) {
                    entry.connected = true;
                }
                state.send(
                    self.id,
                    Delivery::Event(SessionEvent::UpNotice(SessionInfo::new(
                        RESPONSE_OK,
                        "OK",
                    ))),
                );
            }
            ConnectBehavior::Refuse {
                response_code,
                info,
            } => {
                state.send(
                    self.id,
                    Delivery::Event(SessionEvent::ConnectFailed(SessionInfo::new(
                        response_code,
                        info,
                    ))),
                );
            }
            ConnectBehavior::Reject { return_code, info } => {
                return Err(TransportError::Rejected { return_code, info });
            }
            ConnectBehavior::Silent => {}
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.stats.disconnects += 1;
        state.drop_subscriptions_of(self.id);
        if let Some(entry) = state.sessions.get_mut(&self.id) {
            entry.connected = false;
        }
        self.targets.lock().clear();
        Ok(())
    }

    fn create_dispatch_target(&self, topic: &str) -> Result<DispatchHandle, TransportError> {
        Ok(DispatchHandle::new(topic))
    }

    fn subscribe(
        &self,
        target: &DispatchHandle,
        token: CorrelationToken,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        self.ensure_connected(&state)?;
        state.stats.subscribes += 1;

        let behavior = state.subscribe_behavior.clone();
        if self.answer(&state, &behavior, token) {
            state
                .topics
                .entry(target.topic.clone())
                .or_insert_with(|| Topic::new(&target.topic))
                .subscribers
                .insert(self.id);
            self.targets
                .lock()
                .insert(target.id.clone(), target.topic.clone());
        }
        Ok(())
    }

    fn unsubscribe(
        &self,
        target: &DispatchHandle,
        token: CorrelationToken,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        self.ensure_connected(&state)?;
        state.stats.unsubscribes += 1;

        let behavior = state.unsubscribe_behavior.clone();
        if self.answer(&state, &behavior, token) {
            let mut targets = self.targets.lock();
            targets.remove(&target.id);
            // another handle of this session may still hold the pattern
            let still_used = targets.values().any(|p| p == &target.topic);
            if !still_used {
                if let Some(topic) = state.topics.get_mut(&target.topic) {
                    topic.subscribers.remove(&self.id);
                }
                state.topics.retain(|_, t| !t.subscribers.is_empty());
            }
        }
        Ok(())
    }

    fn dispose(self: Box<Self>) {
        let mut state = self.broker.state.lock();
        state.drop_subscriptions_of(self.id);
        // dropping the entry closes the outbox and ends the context thread
        state.sessions.remove(&self.id);
        state.stats.disposed += 1;
        debug!(session = self.id, "loopback session disposed");
    }
}
