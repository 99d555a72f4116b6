//! Domain layer: session identity, framed messages, and lifecycle states.
//!
//! These types are shared by the broker, the transport adapter, and the
//! WebSocket endpoint. None of them perform I/O.

pub mod frame;
pub mod session_id;
pub mod session_state;

pub use frame::{Frame, MessageKind};
pub use session_id::SessionId;
pub use session_state::SessionState;
