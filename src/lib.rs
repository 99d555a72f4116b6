//! # wsbroker
//!
//! In-memory WebSocket connection broker.
//!
//! Upgraded connections become [`broker::Session`]s registered with a
//! [`broker::Broker`] under a unique id. Application code reads from and
//! writes to a session through bounded queues, addresses other sessions by
//! id, and broadcasts to all of them. Slow readers are evicted rather than
//! allowed to block anyone else.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket)
//!     │
//!     ├── HTTP surface (api/, ws/)
//!     │
//!     ├── Broker control loop (broker::hub)
//!     │     └── registry: SessionId → session
//!     │
//!     ├── Session handles (broker::session)
//!     ├── Inbound / outbound pumps (broker::pump)
//!     │
//!     └── Transport adapter (transport/) ── axum WebSocket
//! ```

pub mod api;
pub mod app_state;
pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod transport;
pub mod ws;
