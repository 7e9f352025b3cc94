//! The `message` module defines the normalized `Message` that lands in the
//! cache and the pluggable converters that build it from raw transport
//! messages.

pub mod convert;
#[allow(clippy::module_inception)]
pub mod message;

pub use convert::{
    BodyFormat, ConverterFactory, JsonConverter, JsonConverterFactory, MessageConverter,
    RawConverter, converter_for,
};
pub use message::{Decoder, Message};
