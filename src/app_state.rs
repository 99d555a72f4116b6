//! Shared application state injected into all Axum handlers.

use crate::broker::Broker;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Broker every upgraded connection registers with.
    pub broker: Broker,
}

impl AppState {
    /// Wraps a running broker.
    #[must_use]
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }
}
