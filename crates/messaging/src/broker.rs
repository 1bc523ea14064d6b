//! Message broker abstraction (mechanics only).
//!
//! The executor needs very little from a broker:
//!
//! - **One transacted session**: everything received and sent since the last
//!   `commit`/`rollback` is one unit of work.
//! - **Blocking receive**: `receive` waits without a timeout until a message
//!   matching the session's media-type filter arrives, or the connection is
//!   closed from another thread.
//! - **Cross-thread close**: `BrokerConnection::close` may be called from a
//!   signal-handling thread and must wake a blocked `receive`.
//!
//! Delivery is at-least-once. A message that is rolled back is redelivered,
//! and after too many redeliveries it is moved to a dead-letter queue by the
//! broker implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use batchexec_core::MessageId;

use crate::selector::MediaTypeFilter;

/// Default JMS-style priority.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination(String);

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Destination {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Bytes(Bytes),
    Text(String),
}

/// Typed message property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    String(String),
}

impl PropertyValue {
    /// Render as a string, the way selectors compare properties.
    pub fn to_text(&self) -> String {
        match self {
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Long(l) => l.to_string(),
            PropertyValue::String(s) => s.clone(),
        }
    }

    /// Parse the encoded form written by [`PropertyValue::encode`].
    pub fn decode(encoded: &str) -> Option<Self> {
        let (kind, value) = encoded.split_once(':')?;
        Some(match kind {
            "b" => PropertyValue::Bool(value.parse().ok()?),
            "i" => PropertyValue::Int(value.parse().ok()?),
            "l" => PropertyValue::Long(value.parse().ok()?),
            "s" => PropertyValue::String(value.to_string()),
            _ => return None,
        })
    }

    /// Type-tagged string form for transports that only carry strings.
    pub fn encode(&self) -> String {
        match self {
            PropertyValue::Bool(b) => format!("b:{b}"),
            PropertyValue::Int(i) => format!("i:{i}"),
            PropertyValue::Long(l) => format!("l:{l}"),
            PropertyValue::String(s) => format!("s:{s}"),
        }
    }
}

/// A single broker message with its headers and properties.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub id: MessageId,
    pub body: MessageBody,
    pub properties: BTreeMap<String, PropertyValue>,
    pub reply_to: Option<Destination>,
    pub priority: u8,
    /// Zero on first delivery.
    pub redelivery_count: u32,
}

impl BrokerMessage {
    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self::with_body(MessageBody::Bytes(body.into()))
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::with_body(MessageBody::Text(body.into()))
    }

    fn with_body(body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            body,
            properties: BTreeMap::new(),
            reply_to: None,
            priority: DEFAULT_PRIORITY,
            redelivery_count: 0,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_string_property(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_property(name, PropertyValue::String(value.into()))
    }

    pub fn with_reply_to(mut self, destination: Destination) -> Self {
        self.reply_to = Some(destination);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn string_property(&self, name: &str) -> Option<String> {
        self.property(name).map(PropertyValue::to_text)
    }

    /// Long property, accepting int and numeric string encodings.
    pub fn long_property(&self, name: &str) -> Option<i64> {
        match self.property(name)? {
            PropertyValue::Long(l) => Some(*l),
            PropertyValue::Int(i) => Some(i64::from(*i)),
            PropertyValue::String(s) => s.trim().parse().ok(),
            PropertyValue::Bool(_) => None,
        }
    }

    pub fn int_property(&self, name: &str) -> Option<i32> {
        self.long_property(name).and_then(|l| i32::try_from(l).ok())
    }

    pub fn bool_property(&self, name: &str) -> Option<bool> {
        match self.property(name)? {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            MessageBody::Bytes(b) => Some(b),
            MessageBody::Text(_) => None,
        }
    }

    pub fn body_text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(t) => Some(t),
            MessageBody::Bytes(_) => None,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::Bytes(_) => "bytes",
            MessageBody::Text(_) => "text",
        }
    }
}

/// Broker failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker connection is closed")]
    Closed,

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("timed out waiting for a reply on {0}")]
    Timeout(Destination),
}

/// Factory for broker connections.
pub trait BrokerConnector {
    type Connection: BrokerConnection + 'static;

    fn connect(&self) -> Result<Self::Connection, BrokerError>;
}

/// An open broker connection.
///
/// `close` must be safe to call from any thread, any number of times.
pub trait BrokerConnection: Send + Sync {
    type Session: TransactedSession;

    /// Open a transacted session consuming `request_queue`, restricted by
    /// `filter`.
    fn open_session(
        &self,
        request_queue: &str,
        filter: &MediaTypeFilter,
    ) -> Result<Self::Session, BrokerError>;

    /// Send `message` outside any transaction and wait for one reply on a
    /// temporary queue. `None` waits until the connection closes.
    fn request_reply(
        &self,
        queue: &str,
        message: BrokerMessage,
        timeout: Option<Duration>,
    ) -> Result<BrokerMessage, BrokerError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Transacted consumer/producer pair.
pub trait TransactedSession: Send {
    /// Block until a message arrives. Returns `Ok(None)` when the connection
    /// was closed while waiting.
    fn receive(&mut self) -> Result<Option<BrokerMessage>, BrokerError>;

    /// Stage `message` for `destination`. Nothing is visible until `commit`.
    fn send(&mut self, destination: &Destination, message: BrokerMessage)
    -> Result<(), BrokerError>;

    fn commit(&mut self) -> Result<(), BrokerError>;

    /// Discard staged sends and return received messages for redelivery.
    fn rollback(&mut self) -> Result<(), BrokerError>;
}
