//! # RTD Bridge
//!
//! `rtd-bridge` connects a publish/subscribe message broker to a polling
//! live-data consumer, such as a spreadsheet cell refreshed on a timer.
//! Broker messages land in a last-value cache that the poller reads; the
//! connection lifecycle is published as a stream of events.
//!
//! ## Core Modules
//!
//! - `connection`: The `ConnectionManager`, owner of the broker session and its lifecycle state machine.
//! - `subscription`: Confirmed topic subscriptions, correlated request/confirmation handling and demand counts.
//! - `cache`: The concurrent last-value-wins message store.
//! - `events`: Connection states, connection events and the fan-out `EventBus`.
//! - `message`: The normalized `Message` and the pluggable `MessageConverter` strategies.
//! - `transport`: The broker SDK boundary and an in-process loopback broker.
//! - `rtd`: The polling host adapter binding cells to (topic, field) pairs.
//! - `config`: Loading settings from files and environment variables.
//! - `utils`: Shared error types and logging setup.

pub mod cache;
pub mod config;
pub mod connection;
pub mod events;
pub mod message;
pub mod rtd;
pub mod subscription;
pub mod transport;
pub mod utils;

pub use connection::ConnectionManager;
pub use utils::{BridgeError, Result};
