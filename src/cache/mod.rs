//! The `cache` module keeps the most recent message per destination so the
//! polling host can read values without touching the transport.

pub mod store;

pub use store::MessageCache;

#[cfg(test)]
mod tests;
