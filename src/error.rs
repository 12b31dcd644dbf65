//! # Error Handling
//!
//! A single error enum represents every failure mode a caller can observe,
//! which keeps function signatures and caller-side matching simple.
//!
//! ## Error Categories
//!
//! | Category | Variant | Typical Response |
//! |----------|---------|------------------|
//! | Conflict | [`Error::Conflict`] | Re-read the stream head, retry with the fresh offset |
//! | Reader closed | [`Error::ReaderClosed`] | Open a new reader |
//! | Client closed | [`Error::ClientClosed`] | Open a new client |
//! | Database | [`Error::Sqlite`] | Log and investigate |
//! | Integrity | [`Error::Schema`] | Manual intervention, restore from backup |
//! | I/O | [`Error::Io`] | Log and investigate |
//!
//! Two failure classes deliberately do **not** appear here:
//!
//! - Transient lock contention (`SQLITE_BUSY`) is retried internally by the
//!   append path and never surfaces.
//! - Programmer errors (appending zero events, appending to the ε-stream,
//!   calling `get()` before `next()`) panic, so misuse is caught loudly
//!   during testing rather than handled at runtime.
//!
//! Caller-imposed deadlines are not an error of this crate either: wrap
//! `next()`/`try_next()` in [`tokio::time::timeout`] and handle the elapsed
//! error at the call site. Abandoning a call never terminates the reader.

use thiserror::Error;

use crate::types::{Address, Event};

/// All errors that can occur in store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An optimistic append failed because the given address was not the next
    /// unused offset of its stream.
    ///
    /// Conflicts are recoverable: another producer won the race for this
    /// offset. Re-read the head of the stream and retry the append with the
    /// current next-unused address. The variant carries the address and
    /// event that failed to append; see [`Error::conflict_details`].
    ///
    /// A conflict rolls back the entire append call, including any events
    /// that preceded the conflicting one in the same call.
    #[error("conflict appending {event} at {address}")]
    Conflict {
        /// The address the caller expected to be the next unused offset.
        address: Address,
        /// The event that failed to append.
        event: Event,
    },

    /// The reader has been closed.
    ///
    /// Returned by `next()`/`try_next()` once the reader's terminal error
    /// (if any) has already been delivered, and by any call after `close()`.
    #[error("reader is closed")]
    ReaderClosed,

    /// The client has been closed.
    ///
    /// Returned when a store opened through a client is used after the
    /// client's writer has shut down. Note that this is an I/O-class
    /// failure, never a conflict.
    #[error("client is closed")]
    ClientClosed,

    /// The database reported an error that is not transient.
    ///
    /// Lock-contention errors (`SQLITE_BUSY`, `SQLITE_LOCKED`) are retried
    /// internally and do not reach this variant.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database contents violate the store's expectations.
    ///
    /// For example a store whose ε-stream row is missing, or a stored
    /// timestamp outside the representable range. Usually indicates the
    /// database was modified outside this crate.
    #[error("schema error: {0}")]
    Schema(String),

    /// An operating-system level failure, such as being unable to spawn a
    /// worker thread.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error represents an append conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Returns the address and event of a failed append, if this error is a
    /// conflict.
    pub fn conflict_details(&self) -> Option<(&Address, &Event)> {
        match self {
            Error::Conflict { address, event } => Some((address, event)),
            _ => None,
        }
    }
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_display_names_event_and_address() {
        let err = Error::Conflict {
            address: Address::new("orders", 5),
            event: Event::new("order.placed", "text/plain", b"".to_vec()),
        };
        assert_eq!(err.to_string(), "conflict appending order.placed! at orders+5");
    }

    #[test]
    fn conflict_accessors() {
        let err = Error::Conflict {
            address: Address::new("orders", 5),
            event: Event::new("order.placed", "text/plain", b"x".to_vec()),
        };
        assert!(err.is_conflict());

        let (addr, ev) = err.conflict_details().unwrap();
        assert_eq!(addr.offset, 5);
        assert_eq!(ev.event_type, "order.placed");

        assert!(!Error::ReaderClosed.is_conflict());
        assert!(Error::ReaderClosed.conflict_details().is_none());
    }

    #[test]
    fn sqlite_errors_convert_via_from() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let err: Error = sqlite_err.into();
        assert!(matches!(err, Error::Sqlite(_)));
        assert!(err.to_string().contains("sqlite error"));
    }

    #[test]
    fn sentinel_display() {
        assert_eq!(Error::ReaderClosed.to_string(), "reader is closed");
        assert_eq!(Error::ClientClosed.to_string(), "client is closed");
    }
}
