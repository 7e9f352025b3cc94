//! Subscription registry
//!
//! A topic is present here only while the broker has confirmed its
//! subscription and no confirmed unsubscribe has followed. Requests are
//! issued through a `SubscriptionIssuer` (the live session) and suspend on
//! the pending-request table until the matching confirmation arrives.
//!
//! Concurrent subscribes to the same topic share a single transport
//! request: the first caller owns it, later callers wait for its result.
//! Requests for different topics never wait on each other; the registry
//! lock is only held for bookkeeping, never across an await.
//!
//! The registry also keeps the per-topic demand count used by hosts that
//! map many consumers onto one topic (`retain` / `release`). While the last
//! release is unsubscribing, the topic is draining: further releases leave
//! the request alone, and a `retain` arriving meanwhile gets the topic
//! subscribed again once the unsubscribe settles.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::pending::{PendingRequests, RequestOutcome, WaitError};
use crate::transport::{CorrelationToken, DispatchHandle, SessionInfo};
use crate::utils::{BridgeError, Result, TransportError};

/// The subscribe/unsubscribe half of a live session.
pub trait SubscriptionIssuer: Send + Sync {
    fn create_dispatch_target(
        &self,
        topic: &str,
    ) -> std::result::Result<DispatchHandle, TransportError>;

    fn subscribe(
        &self,
        target: &DispatchHandle,
        token: CorrelationToken,
    ) -> std::result::Result<(), TransportError>;

    fn unsubscribe(
        &self,
        target: &DispatchHandle,
        token: CorrelationToken,
    ) -> std::result::Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub handle: DispatchHandle,
}

#[derive(Debug)]
struct InFlight {
    id: u64,
    joiners: Vec<oneshot::Sender<bool>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: HashMap<String, Subscription>,
    in_flight: HashMap<String, InFlight>,
    demand: HashMap<String, usize>,
    /// Topics whose last release is waiting on its unsubscribe.
    draining: HashSet<String>,
    next_request: u64,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    pending: PendingRequests,
}

enum Entry {
    Active,
    Join(oneshot::Receiver<bool>),
    Owner(u64),
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.state.lock().active.contains_key(topic)
    }

    pub fn handle(&self, topic: &str) -> Option<DispatchHandle> {
        self.state
            .lock()
            .active
            .get(topic)
            .map(|s| s.handle.clone())
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().active.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().active.is_empty()
    }

    /// Current demand count for `topic`.
    pub fn demand(&self, topic: &str) -> usize {
        self.state.lock().demand.get(topic).copied().unwrap_or(0)
    }

    /// Number of requests waiting for a confirmation.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Route a subscribe/unsubscribe confirmation to its waiting request.
    pub fn resolve(&self, token: CorrelationToken, outcome: RequestOutcome) -> bool {
        let delivered = self.pending.resolve(token, outcome);
        if !delivered {
            debug!(%token, "confirmation for a request nobody is waiting on");
        }
        delivered
    }

    /// Subscribe to `topic` unless already subscribed.
    ///
    /// `Ok(false)` means the broker rejected the request; nothing is
    /// recorded in that case.
    pub async fn subscribe(
        &self,
        topic: &str,
        issuer: &dyn SubscriptionIssuer,
        limit: Duration,
    ) -> Result<bool> {
        if topic.is_empty() {
            return Err(BridgeError::InvalidTopic);
        }

        let entry = {
            let mut state = self.state.lock();
            if state.active.contains_key(topic) {
                Entry::Active
            } else if let Some(in_flight) = state.in_flight.get_mut(topic) {
                let (tx, rx) = oneshot::channel();
                in_flight.joiners.push(tx);
                Entry::Join(rx)
            } else {
                state.next_request += 1;
                let id = state.next_request;
                state.in_flight.insert(
                    topic.to_string(),
                    InFlight {
                        id,
                        joiners: Vec::new(),
                    },
                );
                Entry::Owner(id)
            }
        };

        let id = match entry {
            Entry::Active => return Ok(true),
            Entry::Join(rx) => {
                debug!(%topic, "joining in-flight subscribe");
                return Ok(rx.await.unwrap_or(false));
            }
            Entry::Owner(id) => id,
        };

        let mut guard = InFlightGuard {
            registry: self,
            topic,
            id,
            finished: false,
        };
        let result = self.request_subscribe(topic, issuer, limit).await;
        let handle = match &result {
            Ok(Some(handle)) => Some(handle.clone()),
            _ => None,
        };
        let recorded = guard.finish(handle);

        match result {
            Ok(Some(_)) if recorded => {
                info!(%topic, "subscription added");
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn request_subscribe(
        &self,
        topic: &str,
        issuer: &dyn SubscriptionIssuer,
        limit: Duration,
    ) -> Result<Option<DispatchHandle>> {
        let handle = issuer.create_dispatch_target(topic)?;
        let request = self.pending.register();
        let token = request.token();
        debug!(%topic, %token, "issuing subscribe");
        issuer.subscribe(&handle, token)?;

        match request.wait(limit).await {
            Ok(RequestOutcome::Confirmed(_)) => Ok(Some(handle)),
            Ok(RequestOutcome::Rejected(info)) => {
                log_rejection("Subscription", topic, &info);
                Ok(None)
            }
            Err(WaitError::Cancelled) => {
                warn!(%topic, "subscribe cancelled by teardown");
                Ok(None)
            }
            Err(WaitError::TimedOut) => {
                error!(%topic, ?limit, "subscribe confirmation timed out");
                Err(BridgeError::Timeout {
                    operation: "subscribe",
                    after: limit,
                })
            }
        }
    }

    /// Unsubscribe from `topic` and forget its demand. Unknown topics
    /// succeed immediately.
    ///
    /// `Ok(false)` means the broker rejected the request and the
    /// subscription is still recorded.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        issuer: &dyn SubscriptionIssuer,
        limit: Duration,
    ) -> Result<bool> {
        let removed = self.request_unsubscribe(topic, issuer, limit).await?;
        if removed {
            self.state.lock().demand.remove(topic);
        }
        Ok(removed)
    }

    async fn request_unsubscribe(
        &self,
        topic: &str,
        issuer: &dyn SubscriptionIssuer,
        limit: Duration,
    ) -> Result<bool> {
        let Some(handle) = self.handle(topic) else {
            return Ok(true);
        };

        let request = self.pending.register();
        let token = request.token();
        debug!(%topic, %token, "issuing unsubscribe");
        issuer.unsubscribe(&handle, token)?;

        match request.wait(limit).await {
            Ok(RequestOutcome::Confirmed(_)) => {
                let mut state = self.state.lock();
                if state.active.get(topic).is_some_and(|s| s.handle == handle) {
                    state.active.remove(topic);
                }
                info!(%topic, "subscription removed");
                Ok(true)
            }
            Ok(RequestOutcome::Rejected(info)) => {
                log_rejection("Unsubscribe", topic, &info);
                Ok(false)
            }
            Err(WaitError::Cancelled) => {
                // teardown already dropped the mapping
                Ok(true)
            }
            Err(WaitError::TimedOut) => {
                error!(%topic, ?limit, "unsubscribe confirmation timed out");
                Err(BridgeError::Timeout {
                    operation: "unsubscribe",
                    after: limit,
                })
            }
        }
    }

    /// Add one unit of demand for `topic` and make sure it is subscribed.
    pub async fn retain(
        &self,
        topic: &str,
        issuer: &dyn SubscriptionIssuer,
        limit: Duration,
    ) -> Result<bool> {
        if topic.is_empty() {
            return Err(BridgeError::InvalidTopic);
        }
        self.add_demand(topic);
        self.subscribe(topic, issuer, limit).await
    }

    /// Record one unit of demand without touching the transport.
    pub fn add_demand(&self, topic: &str) -> usize {
        let count = {
            let mut state = self.state.lock();
            let count = state.demand.entry(topic.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        debug!(%topic, demand = count, "topic retained");
        count
    }

    /// Drop one unit of demand; the last release unsubscribes.
    ///
    /// When the unsubscribe does not go through (rejected, timed out or
    /// not sent) the released unit is given back, so the count keeps
    /// matching the recorded subscription and the release can be retried.
    pub async fn release(
        &self,
        topic: &str,
        issuer: &dyn SubscriptionIssuer,
        limit: Duration,
    ) -> Result<bool> {
        let remaining = {
            let mut state = self.state.lock();
            let Some(count) = state.demand.get_mut(topic) else {
                return Ok(true);
            };
            if *count == 0 {
                // draining; the outstanding release settles the entry
                return Ok(true);
            }
            *count -= 1;
            let remaining = *count;
            if remaining == 0 && !state.draining.insert(topic.to_string()) {
                return Ok(true);
            }
            remaining
        };
        debug!(%topic, demand = remaining, "topic released");
        if remaining > 0 {
            return Ok(true);
        }

        let mut guard = DrainGuard {
            registry: self,
            topic,
            finished: false,
        };
        let result = self.request_unsubscribe(topic, issuer, limit).await;
        let retained = guard.finish(matches!(result, Ok(true)));

        match result {
            Ok(true) if retained => {
                debug!(%topic, "topic retained while releasing, subscribing again");
                if let Err(e) = self.subscribe(topic, issuer, limit).await {
                    warn!(%topic, error = %e, "resubscribe after release failed");
                }
                Ok(true)
            }
            other => other,
        }
    }

    /// Settles a draining topic. Returns whether demand came back while
    /// the unsubscribe was outstanding.
    fn finish_drain(&self, topic: &str, unsubscribed: bool) -> bool {
        let mut state = self.state.lock();
        state.draining.remove(topic);
        if !unsubscribed {
            *state.demand.entry(topic.to_string()).or_insert(0) += 1;
            return false;
        }
        let demand = state.demand.get(topic).copied().unwrap_or(0);
        if demand == 0 {
            state.demand.remove(topic);
        }
        demand > 0
    }

    /// Forget every subscription without talking to the transport.
    ///
    /// Requests still waiting for a confirmation are woken as cancelled.
    /// Demand counts survive: they describe what the host still wants once
    /// a new session is up.
    pub fn clear(&self) {
        let (dropped, joiners) = {
            let mut state = self.state.lock();
            let dropped = state.active.len();
            state.active.clear();
            let joiners: Vec<_> = state.in_flight.drain().collect();
            (dropped, joiners)
        };
        // dropping the joiner senders wakes them with "not subscribed"
        drop(joiners);
        let cancelled = self.pending.fail_all();
        debug!(dropped, cancelled, "subscription registry cleared");
    }

    fn finish_in_flight(&self, topic: &str, id: u64, handle: Option<DispatchHandle>) -> bool {
        let mut state = self.state.lock();
        let owned = state.in_flight.get(topic).is_some_and(|f| f.id == id);
        if !owned {
            // cleared while the request was outstanding
            return false;
        }
        let Some(in_flight) = state.in_flight.remove(topic) else {
            return false;
        };
        let subscribed = handle.is_some();
        if let Some(handle) = handle {
            state.active.insert(
                topic.to_string(),
                Subscription {
                    topic: topic.to_string(),
                    handle,
                },
            );
        }
        drop(state);

        for joiner in in_flight.joiners {
            let _ = joiner.send(subscribed);
        }
        subscribed
    }
}

/// Settles an in-flight subscribe even if its owner is dropped mid-await.
struct InFlightGuard<'a> {
    registry: &'a SubscriptionRegistry,
    topic: &'a str,
    id: u64,
    finished: bool,
}

impl InFlightGuard<'_> {
    fn finish(&mut self, handle: Option<DispatchHandle>) -> bool {
        self.finished = true;
        self.registry.finish_in_flight(self.topic, self.id, handle)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.finish_in_flight(self.topic, self.id, None);
        }
    }
}

/// Settles a draining topic even if the releasing caller is dropped
/// mid-await.
struct DrainGuard<'a> {
    registry: &'a SubscriptionRegistry,
    topic: &'a str,
    finished: bool,
}

impl DrainGuard<'_> {
    fn finish(&mut self, unsubscribed: bool) -> bool {
        self.finished = true;
        self.registry.finish_drain(self.topic, unsubscribed)
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.finish_drain(self.topic, false);
        }
    }
}

fn log_rejection(request: &str, topic: &str, info: &SessionInfo) {
    error!(
        "{request} error to topic: {topic} responseCode {} errorInfo: {}",
        info.response_code,
        info.info.as_deref().unwrap_or("")
    );
}
