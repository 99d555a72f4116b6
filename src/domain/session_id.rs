//! Routing identity of a connected session.
//!
//! [`SessionId`] is a non-empty string newtype. Connections get a default
//! identity derived from the peer address and the connect time
//! (`CID-<sanitized-address>-<unix-timestamp>`); callers may replace it once
//! through [`crate::broker::Session::change_id`].

use std::borrow::Borrow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Prefix of every broker-assigned identity.
pub const DEFAULT_ID_PREFIX: &str = "CID-";

/// Identity used as the routing key for point-to-point delivery.
///
/// Cheap to clone: the string is shared behind an [`Arc`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// Creates a `SessionId` from any string-like value.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::EmptyId`] if `id` is empty.
    pub fn new(id: impl AsRef<str>) -> Result<Self, BrokerError> {
        let id = id.as_ref();
        if id.is_empty() {
            return Err(BrokerError::EmptyId);
        }
        Ok(Self(Arc::from(id)))
    }

    /// Derives the default identity for a peer connecting at `at`.
    ///
    /// Every character of the peer address other than ASCII letters, digits,
    /// `-` and `_` is replaced by `0`, so `127.0.0.1:5000` becomes
    /// `12700000105000`.
    #[must_use]
    pub fn from_peer(peer: &SocketAddr, at: DateTime<Utc>) -> Self {
        let sanitized: String = peer
            .to_string()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '0'
                }
            })
            .collect();
        Self(Arc::from(format!(
            "{DEFAULT_ID_PREFIX}{sanitized}-{}",
            at.timestamp()
        )))
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for SessionId {
    type Error = BrokerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0.to_string()
    }
}
