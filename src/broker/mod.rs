//! Connection broker.
//!
//! - [`hub`]: the [`Broker`] handle and its control loop, which owns the
//!   registry of live sessions.
//! - [`session`]: the [`Session`] handle applications use to talk to one
//!   client.
//! - `pump`: the per-session tasks that move messages between the queues
//!   and the transport.

pub mod hub;
mod pump;
pub mod session;

pub use hub::Broker;
pub use session::Session;
