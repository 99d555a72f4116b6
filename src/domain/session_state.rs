//! Session lifecycle states.

use std::fmt;

/// Lifecycle of a session.
///
/// ```text
/// Upgrading ──► Active ──► Draining ──► Closed
///     │                        ▲
///     └────────────────────────┘  (registration failed)
/// ```
///
/// States only move forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Handshake done, not yet registered with the broker.
    Upgrading,
    /// Registered; both pumps are running.
    Active,
    /// Deregistered or closing; queues are shut and pumps are winding down.
    Draining,
    /// Pumps have exited and the transport has been released.
    Closed,
}

impl SessionState {
    /// Returns `true` once the session has left [`SessionState::Active`]
    /// on its way down.
    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(self, Self::Draining | Self::Closed)
    }

    /// Returns `true` if moving from `self` to `next` is a legal forward
    /// transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next > self
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Upgrading => "upgrading",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}
