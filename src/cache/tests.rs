use super::MessageCache;
use crate::message::Message;
use crate::message::convert::decode_json;
use std::sync::Arc;

fn json_message(destination: &str, body: &str) -> Message {
    Message::with_decoder(destination, body.as_bytes().to_vec(), decode_json)
}

#[test]
fn test_lookup_missing_destination() {
    let cache = MessageCache::new();
    assert!(cache.lookup("topic/A").is_none());
    assert!(cache.is_empty());
}

#[test]
fn test_last_value_wins() {
    let cache = MessageCache::new();
    cache.upsert("topic/A", json_message("topic/A", r#"{"price":100}"#));
    cache.upsert("topic/A", json_message("topic/A", r#"{"price":101}"#));

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.field("topic/A", "price").as_deref(), Some("101"));
}

#[test]
fn test_store_message_uses_destination() {
    let cache = MessageCache::new();
    cache.store_message(json_message("topic/B", r#"{"qty":7}"#));
    assert_eq!(cache.lookup("topic/B").unwrap().field("qty").as_deref(), Some("7"));
}

#[test]
fn test_destinations_are_independent() {
    let cache = MessageCache::new();
    cache.store_message(json_message("a", r#"{"v":1}"#));
    cache.store_message(json_message("b", r#"{"v":2}"#));

    assert_eq!(cache.field("a", "v").as_deref(), Some("1"));
    assert_eq!(cache.field("b", "v").as_deref(), Some("2"));
}

#[test]
fn test_remove_and_clear() {
    let cache = MessageCache::new();
    cache.store_message(json_message("a", "{}"));
    cache.store_message(json_message("b", "{}"));

    assert!(cache.remove("a").is_some());
    assert!(cache.lookup("a").is_none());

    cache.clear();
    assert!(cache.is_empty());
    assert!(cache.lookup("b").is_none());
}

#[test]
fn test_reader_keeps_snapshot_after_overwrite() {
    let cache = MessageCache::new();
    cache.store_message(json_message("a", r#"{"v":"old"}"#));
    let held = cache.lookup("a").unwrap();

    cache.store_message(json_message("a", r#"{"v":"new"}"#));

    assert_eq!(held.field("v").as_deref(), Some("old"));
    assert_eq!(cache.field("a", "v").as_deref(), Some("new"));
}

#[test]
fn test_concurrent_writers_and_readers() {
    let cache = Arc::new(MessageCache::new());
    let writers: Vec<_> = (0..4)
        .map(|w| {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let body = format!(r#"{{"writer":{w},"seq":{i}}}"#);
                    cache.store_message(json_message("shared", &body));
                    cache.store_message(json_message(&format!("own/{w}"), &body));
                }
            })
        })
        .collect();

    let reader = {
        let cache = cache.clone();
        std::thread::spawn(move || {
            for _ in 0..2000 {
                if let Some(msg) = cache.lookup("shared") {
                    // an entry is always a complete message
                    assert!(msg.field("writer").is_some());
                    assert!(msg.field("seq").is_some());
                }
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    reader.join().unwrap();

    assert_eq!(cache.len(), 5);
    for w in 0..4 {
        assert_eq!(cache.field(&format!("own/{w}"), "seq").as_deref(), Some("499"));
    }
}
