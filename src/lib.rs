//! # gospel - Append-Only Event-Log Store
//!
//! An event-log service layered over SQLite. Producers append
//! application-defined events to named streams; consumers open long-lived
//! readers that deliver facts (events with stream addresses and timestamps)
//! in order, tailing the stream indefinitely.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Async API                               │
//! │        Client ──► EventStore ──► append / open(Reader)          │
//! └───────────────┬───────────────────────────────┬─────────────────┘
//!                 │                               │
//!                 ▼                               ▼
//! ┌───────────────────────────┐   ┌───────────────────────────────┐
//! │       Writer Thread       │   │    Poller Thread (per reader) │
//! │  (RW connection, append   │   │  (RO connection, adaptive     │
//! │   transactions, retries)  │   │   poll rate, bounded buffer)  │
//! └──────────────┬────────────┘   └───────────────┬───────────────┘
//!                │                                │
//!                └───────────► SQLite ◄───────────┘
//!                              (WAL)
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Dense offsets**: for every `(store, stream)`, fact offsets form the
//!    contiguous sequence `0, 1, ..., next - 1`.
//! 2. **Dual write**: every fact on a named stream has exactly one
//!    counterpart on the store's ε-stream, written in the same transaction.
//! 3. **Atomic appends**: an append of *n* events commits all *n* facts
//!    contiguously or none of them.
//! 4. **Read-only ε-stream**: direct appends to the ε-stream are rejected.
//! 5. **Immutability**: events and facts are never updated or deleted by
//!    the store.
//!
//! ## Example
//!
//! ```no_run
//! use gospel::{Address, Client, Event};
//!
//! #[tokio::main]
//! async fn main() -> gospel::Result<()> {
//!     let client = Client::open("gospel.db", []).await?;
//!     let store = client.open_store("example").await?;
//!
//!     // Optimistic append: offset 0 means "the stream must be empty".
//!     let next = store
//!         .append(
//!             Address::new("greetings", 0),
//!             vec![Event::new("greeting.offered", "text/plain", b"hello".to_vec())],
//!         )
//!         .await?;
//!     assert_eq!(next.offset, 1);
//!
//!     // Tail the stream from the start.
//!     let mut reader = store.open(Address::new("greetings", 0), []).await?;
//!     reader.next().await?;
//!     println!("{}", reader.get());
//!
//!     reader.close().await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

/// Error types for store operations.
pub mod error;

/// Domain value types: addresses, events and facts.
pub mod types;

/// Measurement primitives used by the reader's rate control and debug
/// logging.
pub mod metrics;

/// The async token-bucket rate limiter shared by the polling paths.
pub mod limit;

/// Functional options for clients and readers.
pub mod options;

/// DDL and idempotent schema bootstrap.
pub mod schema;

/// The transactional append engine: checked and unchecked strategies,
/// ε-stream dual writes, and lock-contention retry.
mod append;

/// The client: writer thread, store lifecycle, shared poll limiter.
mod client;

/// The per-store facade over appends and readers.
mod store;

/// The adaptive tailing reader.
mod reader;

pub use append::{
    STORE_CREATED_CONTENT_TYPE, STORE_CREATED_EVENT_TYPE, STREAM_CREATED_CONTENT_TYPE,
    STREAM_CREATED_EVENT_TYPE,
};
pub use client::Client;
pub use error::{Error, Result};
pub use options::{
    acceptable_latency, client_extension, filter_by_event_type, poll_rate_limit,
    read_buffer_size, reader_extension, starvation_latency, ClientOption, ClientOptions,
    ExtensionKey, ReaderOption, ReaderOptions, DEFAULT_ACCEPTABLE_LATENCY,
    DEFAULT_POLL_RATE_LIMIT, DEFAULT_READ_BUFFER_SIZE, MIN_READ_BUFFER_SIZE,
    STARVATION_LATENCY_FACTOR,
};
pub use reader::Reader;
pub use store::EventStore;
pub use types::{Address, Event, Fact};
