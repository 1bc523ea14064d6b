//! Broker plumbing & wire envelopes (mechanics only).
//!
//! Nothing in here knows about job semantics: it moves bytes between the
//! executor and a transacted message queue and defines the protobuf shape of
//! those bytes.

pub mod broker;
pub mod convert;
pub mod envelope;
pub mod in_memory;
pub mod selector;

pub use broker::{
    BrokerConnection, BrokerConnector, BrokerError, BrokerMessage, DEFAULT_PRIORITY, Destination,
    MessageBody, PropertyValue, TransactedSession,
};
pub use convert::{EnvelopeError, RequestPayload};
pub use in_memory::{DEAD_LETTER_QUEUE, InMemoryBroker, InMemoryConnection, InMemorySession};
pub use selector::{MEDIA_TYPE_PROPERTY, MediaTypeFilter, RESTRICT_MEDIA_TYPES_ENV, SelectorError};
