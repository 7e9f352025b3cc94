//! Confirmed topic subscriptions and the requests that establish them.

pub mod pending;
pub mod registry;

pub use pending::{PendingRequest, PendingRequests, RequestOutcome, WaitError};
pub use registry::{Subscription, SubscriptionIssuer, SubscriptionRegistry};

#[cfg(test)]
mod tests;
