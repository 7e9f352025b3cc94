//! The `connection` module holds the `ConnectionManager`, the orchestrator
//! that owns the broker session and its lifecycle state machine.

pub mod manager;

pub use manager::ConnectionManager;
