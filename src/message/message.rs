//! Normalized message representation
//!
//! A `Message` is built once by a converter and never mutated afterwards.
//! It keeps the raw body bytes and, when the converter supplied a decoder,
//! a structured view that is decoded on first access and cached. A body
//! that fails to decode is still a valid message: only structured lookups
//! on it come back empty.

use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

/// Turns a body into its structured view.
pub type Decoder = fn(&[u8]) -> Result<Value, String>;

#[derive(Debug, Clone)]
pub struct Message {
    destination: String,
    body: Bytes,
    received_at: DateTime<Utc>,
    decoder: Option<Decoder>,
    view: OnceLock<Option<Value>>,
}

impl Message {
    /// A message with no structured view.
    pub fn raw(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::build(destination.into(), body.into(), None)
    }

    /// A message whose structured view is produced by `decoder` on demand.
    pub fn with_decoder(
        destination: impl Into<String>,
        body: impl Into<Bytes>,
        decoder: Decoder,
    ) -> Self {
        Self::build(destination.into(), body.into(), Some(decoder))
    }

    fn build(destination: String, body: Bytes, decoder: Option<Decoder>) -> Self {
        Self {
            destination,
            body,
            received_at: Utc::now(),
            decoder,
            view: OnceLock::new(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as UTF-8 text; `None` when empty or not valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        if self.body.is_empty() {
            return None;
        }
        std::str::from_utf8(&self.body).ok()
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// The decoded body, if this message has a decoder and the body decoded.
    pub fn structured(&self) -> Option<&Value> {
        self.view
            .get_or_init(|| {
                let decoder = self.decoder?;
                if self.body.is_empty() {
                    return None;
                }
                match decoder(&self.body) {
                    Ok(value) => Some(value),
                    Err(reason) => {
                        warn!(
                            destination = %self.destination,
                            %reason,
                            "unable to decode message body"
                        );
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Top-level member `key` of an object body.
    pub fn value(&self, key: &str) -> Option<&Value> {
        match self.structured()?.get(key)? {
            Value::Null => None,
            v => Some(v),
        }
    }

    /// Nested lookup using a JSON pointer such as `/quote/bid`.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        match self.structured()?.pointer(pointer)? {
            Value::Null => None,
            v => Some(v),
        }
    }

    /// Top-level member `key` rendered as cell text.
    ///
    /// Strings come back without quotes; numbers, booleans and nested
    /// values use their JSON text.
    pub fn field(&self, key: &str) -> Option<String> {
        self.value(key).map(render_value)
    }
}

pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message[Destination:{}, BodySize:{}]",
            self.destination,
            self.body.len()
        )
    }
}
