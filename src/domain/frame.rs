//! Framed messages exchanged on session queues.
//!
//! A [`Frame`] is a typed payload: [`MessageKind::Text`] (always valid UTF-8)
//! or [`MessageKind::Binary`]. On the outbound queue frames travel in their
//! encoded form so one broadcast buffer can be shared by every recipient:
//!
//! ```text
//! +----------+----------+----------------------+
//! | kind (1) | 0xFF (1) | payload (0..n bytes) |
//! +----------+----------+----------------------+
//! ```
//!
//! Decoding is panic-free: no indexing, only [`bytes::Buf`] reads after
//! `remaining()` checks.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BrokerError;

/// Fixed second byte of every encoded frame header.
pub const FRAME_SENTINEL: u8 = 0xFF;

/// Length of the encoded frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 2;

/// Type tag of a framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// UTF-8 text message.
    Text = 1,
    /// Opaque binary message.
    Binary = 2,
}

impl MessageKind {
    /// Returns the wire tag for this kind.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = BrokerError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::Text),
            2 => Ok(Self::Binary),
            other => Err(BrokerError::UnsupportedMessageType(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Binary => f.write_str("binary"),
        }
    }
}

/// A typed message payload.
///
/// Text frames are validated on construction, so a `Frame` with
/// [`MessageKind::Text`] always carries valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: MessageKind,
    payload: Bytes,
}

impl Frame {
    /// Builds a frame of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidTextEncoding`] if `kind` is
    /// [`MessageKind::Text`] and `payload` is not valid UTF-8.
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Result<Self, BrokerError> {
        let payload = payload.into();
        if kind == MessageKind::Text && std::str::from_utf8(&payload).is_err() {
            return Err(BrokerError::InvalidTextEncoding);
        }
        Ok(Self { kind, payload })
    }

    /// Builds a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidTextEncoding`] if `payload` is not
    /// valid UTF-8.
    pub fn text(payload: impl Into<Bytes>) -> Result<Self, BrokerError> {
        Self::new(MessageKind::Text, payload)
    }

    /// Builds a binary frame. Any bytes are accepted.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: payload.into(),
        }
    }

    /// Returns the message kind.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Returns the payload without the header.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame and returns its payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Returns the payload as text, or `None` for binary frames.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.payload).ok(),
            MessageKind::Binary => None,
        }
    }

    /// Encodes the frame as `[kind, 0xFF, payload...]`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind.tag());
        buf.put_u8(FRAME_SENTINEL);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a frame produced by [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - [`BrokerError::MalformedFrame`] if the header is truncated or the
    ///   sentinel byte is wrong.
    /// - [`BrokerError::UnsupportedMessageType`] for an unknown kind tag.
    /// - [`BrokerError::InvalidTextEncoding`] for a text frame whose payload
    ///   is not valid UTF-8.
    pub fn decode(mut buf: Bytes) -> Result<Self, BrokerError> {
        if buf.remaining() < FRAME_HEADER_LEN {
            return Err(BrokerError::MalformedFrame(format!(
                "frame too short: {} bytes",
                buf.remaining()
            )));
        }
        let tag = buf.get_u8();
        let sentinel = buf.get_u8();
        if sentinel != FRAME_SENTINEL {
            return Err(BrokerError::MalformedFrame(format!(
                "bad sentinel byte {sentinel:#04x}"
            )));
        }
        let kind = MessageKind::try_from(tag)?;
        Self::new(kind, buf)
    }
}
