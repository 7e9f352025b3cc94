//! Message conversion strategies
//!
//! The connection core only knows the `MessageConverter` capability. Which
//! structured view (if any) a message gets is decided here.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::Message;
use crate::transport::RawMessage;

/// Turns a raw transport message into a `Message`.
///
/// The raw message is consumed so its resources are released as soon as
/// conversion returns.
pub trait MessageConverter: Send + Sync {
    fn convert(&self, raw: RawMessage) -> Message;
}

/// Produces converters; lets hosts swap decoding without touching the core.
pub trait ConverterFactory {
    type Converter: MessageConverter + 'static;

    fn create_converter(&self) -> Self::Converter;
}

/// Body encodings the bridge knows how to present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Json,
    Raw,
}

/// Decodes message bodies as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverter;

impl MessageConverter for JsonConverter {
    fn convert(&self, raw: RawMessage) -> Message {
        let RawMessage {
            destination,
            payload,
        } = raw;
        Message::with_decoder(destination, payload, decode_json)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverterFactory;

impl ConverterFactory for JsonConverterFactory {
    type Converter = JsonConverter;

    fn create_converter(&self) -> JsonConverter {
        JsonConverter
    }
}

/// Keeps bodies as opaque bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawConverter;

impl MessageConverter for RawConverter {
    fn convert(&self, raw: RawMessage) -> Message {
        Message::raw(raw.destination, raw.payload)
    }
}

pub fn decode_json(body: &[u8]) -> Result<Value, String> {
    serde_json::from_slice(body).map_err(|e| e.to_string())
}

pub fn converter_for(format: BodyFormat) -> Arc<dyn MessageConverter> {
    match format {
        BodyFormat::Json => Arc::new(JsonConverterFactory.create_converter()),
        BodyFormat::Raw => Arc::new(RawConverter),
    }
}
