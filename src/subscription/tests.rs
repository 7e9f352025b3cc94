use super::*;
use crate::transport::{CorrelationToken, DispatchHandle, SessionInfo};
use crate::utils::{BridgeError, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Subscribe(String, CorrelationToken),
    Unsubscribe(String, CorrelationToken),
}

/// Records requests; the test decides when and how they are confirmed.
#[derive(Default)]
struct ScriptedIssuer {
    calls: Mutex<Vec<Call>>,
    closed: bool,
}

impl ScriptedIssuer {
    fn closed() -> Self {
        Self {
            closed: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn subscribes(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Subscribe(..)))
            .count()
    }

    async fn next_token(&self, seen: usize) -> CorrelationToken {
        loop {
            if let Some(call) = self.calls.lock().get(seen) {
                return match call {
                    Call::Subscribe(_, token) | Call::Unsubscribe(_, token) => *token,
                };
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl SubscriptionIssuer for ScriptedIssuer {
    fn create_dispatch_target(&self, topic: &str) -> Result<DispatchHandle, TransportError> {
        if self.closed {
            return Err(TransportError::SessionClosed);
        }
        Ok(DispatchHandle::new(topic))
    }

    fn subscribe(&self, target: &DispatchHandle, token: CorrelationToken) -> Result<(), TransportError> {
        self.calls
            .lock()
            .push(Call::Subscribe(target.topic.clone(), token));
        Ok(())
    }

    fn unsubscribe(
        &self,
        target: &DispatchHandle,
        token: CorrelationToken,
    ) -> Result<(), TransportError> {
        self.calls
            .lock()
            .push(Call::Unsubscribe(target.topic.clone(), token));
        Ok(())
    }
}

fn ok() -> RequestOutcome {
    RequestOutcome::Confirmed(SessionInfo::new(200, "OK"))
}

fn rejected() -> RequestOutcome {
    RequestOutcome::Rejected(SessionInfo::new(403, "permission denied"))
}

fn setup() -> (Arc<SubscriptionRegistry>, Arc<ScriptedIssuer>) {
    (
        Arc::new(SubscriptionRegistry::new()),
        Arc::new(ScriptedIssuer::default()),
    )
}

fn spawn_subscribe(
    registry: &Arc<SubscriptionRegistry>,
    issuer: &Arc<ScriptedIssuer>,
    topic: &'static str,
) -> tokio::task::JoinHandle<crate::utils::Result<bool>> {
    let registry = registry.clone();
    let issuer = issuer.clone();
    tokio::spawn(async move { registry.subscribe(topic, issuer.as_ref(), LIMIT).await })
}

async fn subscribed(
    registry: &Arc<SubscriptionRegistry>,
    issuer: &Arc<ScriptedIssuer>,
    topic: &'static str,
) {
    let seen = issuer.calls().len();
    let task = spawn_subscribe(registry, issuer, topic);
    let token = issuer.next_token(seen).await;
    assert!(registry.resolve(token, ok()));
    assert!(task.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_pending_request_resolves() {
    let table = PendingRequests::new();
    let request = table.register();
    let token = request.token();
    assert_eq!(table.len(), 1);

    assert!(table.resolve(token, ok()));
    assert_eq!(request.wait(LIMIT).await, Ok(ok()));
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_pending_request_timeout_withdraws_token() {
    let table = PendingRequests::new();
    let request = table.register();
    let token = request.token();

    let outcome = request.wait(Duration::from_millis(20)).await;
    assert_eq!(outcome, Err(WaitError::TimedOut));
    assert!(table.is_empty());
    // a late confirmation finds nobody waiting
    assert!(!table.resolve(token, ok()));
}

#[tokio::test]
async fn test_fail_all_cancels_waiters() {
    let table = PendingRequests::new();
    let first = table.register();
    let second = table.register();

    assert_eq!(table.fail_all(), 2);
    assert_eq!(first.wait(LIMIT).await, Err(WaitError::Cancelled));
    assert_eq!(second.wait(LIMIT).await, Err(WaitError::Cancelled));
}

#[tokio::test]
async fn test_unknown_token_is_ignored() {
    let registry = SubscriptionRegistry::new();
    assert!(!registry.resolve(CorrelationToken::new(), ok()));
}

#[tokio::test]
async fn test_subscribe_then_unsubscribe_restores_state() {
    let (registry, issuer) = setup();

    subscribed(&registry, &issuer, "topic/A").await;
    assert!(registry.contains("topic/A"));
    assert_eq!(registry.topics(), vec!["topic/A".to_string()]);

    let task = {
        let registry = registry.clone();
        let issuer = issuer.clone();
        tokio::spawn(async move { registry.unsubscribe("topic/A", issuer.as_ref(), LIMIT).await })
    };
    let token = issuer.next_token(1).await;
    registry.resolve(token, ok());

    assert!(task.await.unwrap().unwrap());
    assert!(registry.is_empty());
    assert_eq!(registry.pending_requests(), 0);
}

#[tokio::test]
async fn test_repeat_subscribe_issues_one_request() {
    let (registry, issuer) = setup();
    subscribed(&registry, &issuer, "topic/A").await;

    let again = registry.subscribe("topic/A", issuer.as_ref(), LIMIT).await;
    assert!(again.unwrap());
    assert_eq!(issuer.subscribes(), 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_concurrent_subscribes_share_one_request() {
    let (registry, issuer) = setup();

    let first = spawn_subscribe(&registry, &issuer, "topic/A");
    let token = issuer.next_token(0).await;
    let second = spawn_subscribe(&registry, &issuer, "topic/A");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(issuer.subscribes(), 1);
    registry.resolve(token, ok());

    assert!(first.await.unwrap().unwrap());
    assert!(second.await.unwrap().unwrap());
    assert_eq!(issuer.subscribes(), 1);
}

#[tokio::test]
async fn test_different_topics_proceed_independently() {
    let (registry, issuer) = setup();

    let a = spawn_subscribe(&registry, &issuer, "topic/A");
    let token_a = issuer.next_token(0).await;
    let b = spawn_subscribe(&registry, &issuer, "topic/B");
    let token_b = issuer.next_token(1).await;

    // B completes while A is still outstanding
    registry.resolve(token_b, ok());
    assert!(b.await.unwrap().unwrap());
    assert!(registry.contains("topic/B"));
    assert!(!registry.contains("topic/A"));

    registry.resolve(token_a, ok());
    assert!(a.await.unwrap().unwrap());
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_rejected_subscribe_records_nothing() {
    let (registry, issuer) = setup();

    let task = spawn_subscribe(&registry, &issuer, "topic/A");
    let token = issuer.next_token(0).await;
    registry.resolve(token, rejected());

    assert!(!task.await.unwrap().unwrap());
    assert!(!registry.contains("topic/A"));

    // a later attempt issues a fresh request
    let task = spawn_subscribe(&registry, &issuer, "topic/A");
    let token = issuer.next_token(1).await;
    registry.resolve(token, ok());
    assert!(task.await.unwrap().unwrap());
    assert_eq!(issuer.subscribes(), 2);
}

#[tokio::test]
async fn test_rejected_unsubscribe_keeps_mapping() {
    let (registry, issuer) = setup();
    subscribed(&registry, &issuer, "topic/A").await;

    let task = {
        let registry = registry.clone();
        let issuer = issuer.clone();
        tokio::spawn(async move { registry.unsubscribe("topic/A", issuer.as_ref(), LIMIT).await })
    };
    let token = issuer.next_token(1).await;
    registry.resolve(token, rejected());

    assert!(!task.await.unwrap().unwrap());
    assert!(registry.contains("topic/A"));
}

#[tokio::test]
async fn test_unsubscribe_unknown_topic_is_noop() {
    let (registry, issuer) = setup();
    let result = registry.unsubscribe("nowhere", issuer.as_ref(), LIMIT).await;
    assert!(result.unwrap());
    assert!(issuer.calls().is_empty());
}

#[tokio::test]
async fn test_subscribe_timeout() {
    let (registry, issuer) = setup();

    let result = registry
        .subscribe("topic/A", issuer.as_ref(), Duration::from_millis(20))
        .await;

    assert!(matches!(
        result,
        Err(BridgeError::Timeout {
            operation: "subscribe",
            ..
        })
    ));
    assert!(!registry.contains("topic/A"));
    assert_eq!(registry.pending_requests(), 0);
}

#[tokio::test]
async fn test_empty_topic_is_rejected() {
    let (registry, issuer) = setup();
    let result = registry.subscribe("", issuer.as_ref(), LIMIT).await;
    assert!(matches!(result, Err(BridgeError::InvalidTopic)));
    assert!(issuer.calls().is_empty());
}

#[tokio::test]
async fn test_transport_failure_propagates() {
    let registry = SubscriptionRegistry::new();
    let issuer = ScriptedIssuer::closed();

    let result = registry.subscribe("topic/A", &issuer, LIMIT).await;
    assert!(matches!(
        result,
        Err(BridgeError::Transport(TransportError::SessionClosed))
    ));

    // the topic is free for the next attempt
    let issuer = ScriptedIssuer::default();
    let retry = registry.subscribe("topic/A", &issuer, Duration::from_millis(20)).await;
    assert!(matches!(retry, Err(BridgeError::Timeout { .. })));
    assert_eq!(issuer.subscribes(), 1);
}

#[tokio::test]
async fn test_clear_cancels_outstanding_requests() {
    let (registry, issuer) = setup();
    subscribed(&registry, &issuer, "topic/A").await;

    let owner = spawn_subscribe(&registry, &issuer, "topic/B");
    let token = issuer.next_token(1).await;
    let joiner = spawn_subscribe(&registry, &issuer, "topic/B");
    tokio::time::sleep(Duration::from_millis(20)).await;

    registry.clear();

    assert!(!owner.await.unwrap().unwrap());
    assert!(!joiner.await.unwrap().unwrap());
    assert!(registry.is_empty());
    assert!(!registry.resolve(token, ok()));
}

#[tokio::test]
async fn test_retain_and_release_count_demand() {
    let (registry, issuer) = setup();

    let first = {
        let registry = registry.clone();
        let issuer = issuer.clone();
        tokio::spawn(async move { registry.retain("topic/A", issuer.as_ref(), LIMIT).await })
    };
    let token = issuer.next_token(0).await;
    registry.resolve(token, ok());
    assert!(first.await.unwrap().unwrap());

    assert!(registry.retain("topic/A", issuer.as_ref(), LIMIT).await.unwrap());
    assert_eq!(registry.demand("topic/A"), 2);
    assert_eq!(issuer.subscribes(), 1);

    // first release only lowers the count
    assert!(registry.release("topic/A", issuer.as_ref(), LIMIT).await.unwrap());
    assert_eq!(registry.demand("topic/A"), 1);
    assert!(registry.contains("topic/A"));
    assert_eq!(issuer.calls().len(), 1);

    let last = {
        let registry = registry.clone();
        let issuer = issuer.clone();
        tokio::spawn(async move { registry.release("topic/A", issuer.as_ref(), LIMIT).await })
    };
    let token = issuer.next_token(1).await;
    assert!(matches!(&issuer.calls()[1], Call::Unsubscribe(topic, _) if topic == "topic/A"));
    registry.resolve(token, ok());

    assert!(last.await.unwrap().unwrap());
    assert_eq!(registry.demand("topic/A"), 0);
    assert!(!registry.contains("topic/A"));
}

#[tokio::test]
async fn test_release_without_demand_is_noop() {
    let (registry, issuer) = setup();
    assert!(registry.release("topic/A", issuer.as_ref(), LIMIT).await.unwrap());
    assert!(issuer.calls().is_empty());
}

fn spawn_release(
    registry: &Arc<SubscriptionRegistry>,
    issuer: &Arc<ScriptedIssuer>,
    topic: &'static str,
) -> tokio::task::JoinHandle<crate::utils::Result<bool>> {
    let registry = registry.clone();
    let issuer = issuer.clone();
    tokio::spawn(async move { registry.release(topic, issuer.as_ref(), LIMIT).await })
}

#[tokio::test]
async fn test_retain_during_last_release_resubscribes() {
    let (registry, issuer) = setup();
    registry.add_demand("topic/A");
    subscribed(&registry, &issuer, "topic/A").await;

    let release = spawn_release(&registry, &issuer, "topic/A");
    let unsubscribe = issuer.next_token(1).await;
    assert!(matches!(&issuer.calls()[1], Call::Unsubscribe(..)));

    // a consumer comes and goes while the unsubscribe is outstanding
    assert!(registry.retain("topic/A", issuer.as_ref(), LIMIT).await.unwrap());
    assert_eq!(registry.demand("topic/A"), 1);
    assert!(spawn_release(&registry, &issuer, "topic/A").await.unwrap().unwrap());
    assert_eq!(issuer.calls().len(), 2);

    // and another one stays
    assert!(registry.retain("topic/A", issuer.as_ref(), LIMIT).await.unwrap());
    assert_eq!(registry.demand("topic/A"), 1);

    registry.resolve(unsubscribe, ok());
    let resubscribe = issuer.next_token(2).await;
    assert!(matches!(&issuer.calls()[2], Call::Subscribe(topic, _) if topic == "topic/A"));
    registry.resolve(resubscribe, ok());

    assert!(release.await.unwrap().unwrap());
    assert!(registry.contains("topic/A"));
    assert_eq!(registry.demand("topic/A"), 1);
    assert_eq!(issuer.calls().len(), 3);
}

#[tokio::test]
async fn test_rejected_last_release_keeps_demand() {
    let (registry, issuer) = setup();
    registry.add_demand("topic/A");
    subscribed(&registry, &issuer, "topic/A").await;

    let release = spawn_release(&registry, &issuer, "topic/A");
    let token = issuer.next_token(1).await;
    registry.resolve(token, rejected());

    assert!(!release.await.unwrap().unwrap());
    assert!(registry.contains("topic/A"));
    assert_eq!(registry.demand("topic/A"), 1);

    // the release can be retried
    let retry = spawn_release(&registry, &issuer, "topic/A");
    let token = issuer.next_token(2).await;
    registry.resolve(token, ok());

    assert!(retry.await.unwrap().unwrap());
    assert!(!registry.contains("topic/A"));
    assert_eq!(registry.demand("topic/A"), 0);
}

#[tokio::test]
async fn test_timed_out_last_release_keeps_demand() {
    let (registry, issuer) = setup();
    registry.add_demand("topic/A");
    subscribed(&registry, &issuer, "topic/A").await;

    let result = registry
        .release("topic/A", issuer.as_ref(), Duration::from_millis(20))
        .await;

    assert!(matches!(
        result,
        Err(BridgeError::Timeout {
            operation: "unsubscribe",
            ..
        })
    ));
    assert!(registry.contains("topic/A"));
    assert_eq!(registry.demand("topic/A"), 1);
}
