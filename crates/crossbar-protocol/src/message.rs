//! Decoded message and frame views.
//!
//! The wire codec itself lives outside this workspace; the proxy core only
//! sees messages that are already split into `(event_id, headers, payload)`
//! triples with the payload kept as opaque bytes.

use bytes::Bytes;

/// Reserved event id carried by channel revocation control frames.
pub const REVOKE_EVENT_ID: u64 = u64::MAX;

/// One header attached to a message. Both name and value are opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header name.
    pub name: Bytes,
    /// Header value.
    pub value: Bytes,
}

impl Header {
    /// Creates a header from anything convertible to bytes.
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Ordered header collection.
pub type Headers = Vec<Header>;

/// A decoded RPC message: slot id, headers and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Protocol slot id of this message.
    pub event_id: u64,
    /// Header metadata.
    pub headers: Headers,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Creates a message.
    pub fn new(event_id: u64, headers: Headers, payload: impl Into<Bytes>) -> Self {
        Self { event_id, headers, payload: payload.into() }
    }
}

/// A channel-multiplexed message as written to a raw connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical channel id within one connection.
    pub channel_id: u64,
    /// Protocol slot id.
    pub event_id: u64,
    /// Header metadata.
    pub headers: Headers,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Wraps a message into a frame for the given channel.
    pub fn new(channel_id: u64, message: Message) -> Self {
        Self {
            channel_id,
            event_id: message.event_id,
            headers: message.headers,
            payload: message.payload,
        }
    }

    /// Builds the control frame that revokes a channel with an error code.
    pub fn revoke(channel_id: u64, code: u32) -> Self {
        Self {
            channel_id,
            event_id: REVOKE_EVENT_ID,
            headers: Headers::new(),
            payload: Bytes::copy_from_slice(&code.to_be_bytes()),
        }
    }

    /// Whether this frame is a channel revocation.
    pub fn is_revoke(&self) -> bool {
        self.event_id == REVOKE_EVENT_ID
    }

    /// Extracts the error code from a revocation frame.
    pub fn revoke_code(&self) -> Option<u32> {
        if !self.is_revoke() {
            return None;
        }
        let raw: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    /// Strips the channel id, leaving the decoded message.
    pub fn into_message(self) -> Message {
        Message { event_id: self.event_id, headers: self.headers, payload: self.payload }
    }
}
