//! The `events` module defines the connection lifecycle vocabulary
//! (`ConnectionState`, `ConnectionEvent`) and the `EventBus` that fans each
//! transition out to any number of independent observers.

pub mod bus;
pub mod event;

pub use bus::EventBus;
pub use event::{ConnectionEvent, ConnectionState};

#[cfg(test)]
mod tests;
