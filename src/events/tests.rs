use super::{ConnectionEvent, ConnectionState, EventBus};
use std::sync::Arc;
use std::time::Duration;

use ConnectionState::*;

#[test]
fn test_default_state_is_created() {
    assert_eq!(ConnectionState::default(), Created);
}

#[test]
fn test_lifecycle_graph_allows_documented_paths() {
    assert!(Created.can_transition_to(Opening));
    assert!(Opening.can_transition_to(Opened));
    assert!(Opening.can_transition_to(Closed));
    assert!(Opening.can_transition_to(Faulted));
    assert!(Opened.can_transition_to(Closing));
    assert!(Closing.can_transition_to(Closed));
    assert!(Opened.can_transition_to(Reconnecting));
    assert!(Reconnecting.can_transition_to(Reconnected));
    assert!(Reconnected.can_transition_to(Opened));
    assert!(Reconnecting.can_transition_to(Closed));
    assert!(Closed.can_transition_to(Opening));
}

#[test]
fn test_lifecycle_graph_rejects_shortcuts() {
    assert!(!Created.can_transition_to(Opened));
    assert!(!Closed.can_transition_to(Opened));
    assert!(!Closing.can_transition_to(Opened));
    assert!(!Opened.can_transition_to(Opening));
    assert!(!Opened.can_transition_to(Reconnected));
}

#[test]
fn test_faulted_is_terminal() {
    for next in [Created, Opening, Opened, Reconnecting, Reconnected, Closing, Closed, Faulted] {
        assert!(!Faulted.can_transition_to(next), "Faulted -> {next}");
    }
}

#[test]
fn test_connect_in_progress_states() {
    assert!(Opening.is_connect_in_progress());
    assert!(Opened.is_connect_in_progress());
    assert!(!Closed.is_connect_in_progress());
    assert!(!Created.is_connect_in_progress());
}

#[test]
fn test_event_display() {
    let event = ConnectionEvent::new(Closed, Some("peer reset".to_string()), 400);
    assert_eq!(
        event.to_string(),
        "Connection Event: Closed ResponseCode: 400 Info: peer reset"
    );
}

#[tokio::test]
async fn test_broadcast_reaches_every_observer() {
    let bus = EventBus::new();
    let mut a = bus.register_observer();
    let mut b = bus.register_observer();

    let delivered = bus.broadcast(&ConnectionEvent::new(Opening, None, 0));
    assert_eq!(delivered, 2);

    assert_eq!(a.recv().await.unwrap().state, Opening);
    assert_eq!(b.recv().await.unwrap().state, Opening);
}

#[tokio::test]
async fn test_broadcast_without_observers_is_noop() {
    let bus = EventBus::new();
    assert_eq!(bus.broadcast(&ConnectionEvent::new(Opening, None, 0)), 0);
}

#[tokio::test]
async fn test_dropped_observer_is_pruned() {
    let bus = EventBus::new();
    let rx = bus.register_observer();
    let mut live = bus.register_observer();
    assert_eq!(bus.observer_count(), 2);

    drop(rx);
    let delivered = bus.broadcast(&ConnectionEvent::new(Closed, None, 0));

    assert_eq!(delivered, 1);
    assert_eq!(bus.observer_count(), 1);
    assert_eq!(live.recv().await.unwrap().state, Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_observer_does_not_hold_back_others() {
    let bus = Arc::new(EventBus::new());
    let mut fast = bus.register_observer();
    let mut slow = bus.register_observer();

    let states = [Opening, Opened, Reconnecting, Reconnected, Opened, Closing, Closed];
    let n = states.len();

    let slow_task = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < n {
            tokio::time::sleep(Duration::from_millis(20)).await;
            seen.push(slow.recv().await.unwrap().state);
        }
        seen
    });

    let producer = {
        let bus = bus.clone();
        tokio::spawn(async move {
            for state in states {
                bus.broadcast(&ConnectionEvent::new(state, None, 0));
            }
        })
    };

    let mut fast_seen = Vec::new();
    while fast_seen.len() < n {
        let event = tokio::time::timeout(Duration::from_millis(100), fast.recv())
            .await
            .expect("fast observer was held back")
            .unwrap();
        fast_seen.push(event.state);
    }
    producer.await.unwrap();

    assert_eq!(fast_seen, states.to_vec());
    assert_eq!(slow_task.await.unwrap(), states.to_vec());
}
