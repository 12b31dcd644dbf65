//! # Domain Types
//!
//! This module defines the value types that flow through the store: addresses,
//! events, and facts.
//!
//! - An [`Event`] is what the application gives us: an opaque
//!   `(type, content-type, body)` triple.
//! - An [`Address`] names a position: a stream and a zero-based offset within
//!   that stream.
//! - A [`Fact`] is what appending produces: an event placed at an address,
//!   stamped with the commit time.
//!
//! ## The ε-stream
//!
//! Each store has one special stream whose name is the empty string, called
//! the ε-stream (pronounced "epsilon"). It receives a fact for every event
//! appended anywhere in the store, plus meta-facts describing the store
//! itself (store creation, stream creation). It is read-only from the client
//! API - appending to it directly is a programmer error.

use std::fmt;

use chrono::{DateTime, Utc};

/// The lowercase epsilon character, conventionally used to denote the empty
/// string. It stands in for the empty stream name when an [`Address`] is
/// rendered for humans.
const EPSILON: &str = "ε";

// =============================================================================
// Address
// =============================================================================

/// Identifies a fact by its stream and position within that stream.
///
/// Each stream is an ordered set of facts with offsets forming the dense
/// sequence `0, 1, 2, ...`. An address can also refer to the *next unused*
/// slot of a stream, which is how [`EventStore::append`] addresses its
/// optimistic-concurrency check.
///
/// # Example
///
/// ```
/// use gospel::Address;
///
/// let addr = Address::new("orders", 0);
/// assert_eq!(addr.to_string(), "orders+0");
/// assert_eq!(addr.next().offset, 1);
/// ```
///
/// [`EventStore::append`]: crate::EventStore::append
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// The name of the stream that contains the fact.
    ///
    /// The empty string denotes the ε-stream.
    pub stream: String,

    /// The zero-based position of the fact within the stream.
    pub offset: u64,
}

impl Address {
    /// Creates an address from a stream name and offset.
    pub fn new(stream: impl Into<String>, offset: u64) -> Self {
        Self {
            stream: stream.into(),
            offset,
        }
    }

    /// Returns the address immediately following this one.
    pub fn next(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            offset: self.offset + 1,
        }
    }

    /// Returns true if this address refers to the ε-stream.
    pub fn is_epsilon(&self) -> bool {
        self.stream.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stream = if self.stream.is_empty() {
            EPSILON
        } else {
            &self.stream
        };

        write!(f, "{}+{}", stream, self.offset)
    }
}

// =============================================================================
// Event
// =============================================================================

/// An application-defined event.
///
/// Events are appended to a named stream to produce facts. The store treats
/// the body as opaque bytes; the content type exists so consumers can decode
/// it without out-of-band agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The kind of event that occurred.
    ///
    /// Typically a human-readable verb in the past tense, but may be any
    /// non-empty string. Readers can filter on it.
    pub event_type: String,

    /// The format of the data in the event body.
    ///
    /// Typically a standard MIME type such as `application/json`, or a
    /// "vendor" MIME type carrying schema/version information such as
    /// `application/vnd.mycompany.some-event.v1+json`.
    pub content_type: String,

    /// Application-defined binary data containing the specifics of the event.
    pub body: Vec<u8>,
}

impl Event {
    /// Creates an event.
    pub fn new(
        event_type: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!", self.event_type)
    }
}

// =============================================================================
// Fact
// =============================================================================

/// An event that has been appended to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    /// Identifies the fact by its stream and position within that stream.
    pub addr: Address,

    /// The time at which the fact was created.
    ///
    /// This does not necessarily correlate with the time at which the event
    /// occurred within the application. It is informational only: its exact
    /// value is implementation specific and is not guaranteed to increase
    /// monotonically, for example if the system time is changed.
    pub time: DateTime<Utc>,

    /// The application-defined event data.
    pub event: Event,
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.event, self.addr)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_uses_stream_name() {
        let addr = Address::new("orders", 42);
        assert_eq!(addr.to_string(), "orders+42");
    }

    #[test]
    fn address_display_renders_epsilon_stream() {
        let addr = Address::new("", 3);
        assert_eq!(addr.to_string(), "ε+3");
    }

    #[test]
    fn address_next_increments_offset() {
        let addr = Address::new("orders", 0);
        assert_eq!(addr.next(), Address::new("orders", 1));

        // next() composes: two steps forward is offset + 2.
        assert_eq!(addr.next().next(), Address::new("orders", 2));
    }

    #[test]
    fn address_is_epsilon() {
        assert!(Address::new("", 0).is_epsilon());
        assert!(!Address::new("orders", 0).is_epsilon());
    }

    #[test]
    fn event_display_is_type_with_bang() {
        let ev = Event::new("account.opened", "text/plain", b"hi".to_vec());
        assert_eq!(ev.to_string(), "account.opened!");
    }

    #[test]
    fn fact_display_combines_event_and_address() {
        let fact = Fact {
            addr: Address::new("accounts", 7),
            time: Utc::now(),
            event: Event::new("account.opened", "text/plain", b"".to_vec()),
        };
        assert_eq!(fact.to_string(), "account.opened!accounts+7");
    }
}
