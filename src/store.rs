//! # Event Store Facade
//!
//! An [`EventStore`] is bound to one named store within the database and
//! fans out to the two subsystems: appends go to the client's writer thread,
//! and [`EventStore::open`] starts an independent tailing [`Reader`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::append::{self, Strategy};
use crate::client::WriteRequest;
use crate::error::{Error, Result};
use crate::limit::RateLimiter;
use crate::options::{ReaderOption, ReaderOptions};
use crate::reader::Reader;
use crate::types::{Address, Event};

/// A named event store: an isolated namespace of streams plus one ε-stream.
///
/// Obtained from [`Client::open_store`]. Cheap to clone and safe to share
/// across tasks.
///
/// [`Client::open_store`]: crate::Client::open_store
#[derive(Clone, Debug)]
pub struct EventStore {
    id: u64,
    name: String,
    path: PathBuf,
    write_tx: mpsc::Sender<WriteRequest>,
    poll_limit: Arc<RateLimiter>,
}

impl EventStore {
    pub(crate) fn new(
        id: u64,
        name: String,
        path: PathBuf,
        write_tx: mpsc::Sender<WriteRequest>,
        poll_limit: Arc<RateLimiter>,
    ) -> Self {
        Self {
            id,
            name,
            path,
            write_tx,
            poll_limit,
        }
    }

    /// The store's ID within the database.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The store's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically writes one or more events to the end of a stream,
    /// producing a contiguous block of facts.
    ///
    /// `addr.offset` must refer to the next unused offset within the stream,
    /// otherwise the append fails with a conflict; see
    /// [`Error::is_conflict`]. A conflict anywhere in the batch rolls back
    /// the entire call.
    ///
    /// Returns the address of the next unused offset after the appended
    /// facts.
    ///
    /// # Panics
    ///
    /// Panics if `events` is empty, or if `addr` refers to the ε-stream.
    pub async fn append(&self, addr: Address, events: Vec<Event>) -> Result<Address> {
        let first = events.first().cloned();
        let count = events.len();
        let result = self.submit(addr, events, append::append_checked).await;

        match &result {
            Ok(next) => self.log_append("checked", next, first, count),
            Err(err) => {
                if let Some((addr, event)) = err.conflict_details() {
                    info!(target: "gospel::store", "conflict appending {event} at {addr}");
                }
            }
        }

        result
    }

    /// Atomically writes one or more events to the end of a stream,
    /// producing a contiguous block of facts.
    ///
    /// Unlike [`EventStore::append`], the caller is not required to know the
    /// next unused offset of the stream, hence the offset is said to be
    /// "unchecked". Never conflicts.
    ///
    /// Returns the address of the next unused offset after the appended
    /// facts.
    ///
    /// # Panics
    ///
    /// Panics if `events` is empty, or if `stream` is empty (the ε-stream).
    pub async fn append_unchecked(
        &self,
        stream: impl Into<String>,
        events: Vec<Event>,
    ) -> Result<Address> {
        let addr = Address::new(stream, 0);
        let first = events.first().cloned();
        let count = events.len();
        let result = self.submit(addr, events, append::append_unchecked).await;

        if let Ok(next) = &result {
            self.log_append("unchecked", next, first, count);
        }

        result
    }

    /// Returns a reader that begins reading facts at `addr`.
    ///
    /// The opening call only prepares the reader; the reader itself runs
    /// under its own cancellation scope owned by [`Reader::close`], so it
    /// outlives whatever scope performed the open.
    pub async fn open(
        &self,
        addr: Address,
        opts: impl IntoIterator<Item = ReaderOption>,
    ) -> Result<Reader> {
        Reader::open(
            &self.path,
            self.id,
            addr,
            Arc::clone(&self.poll_limit),
            ReaderOptions::new(opts),
        )
        .await
    }

    /// Ships an append to the writer thread and waits for the outcome.
    async fn submit(
        &self,
        addr: Address,
        events: Vec<Event>,
        strategy: Strategy,
    ) -> Result<Address> {
        assert!(!addr.stream.is_empty(), "cannot append to the ε-stream");
        assert!(!events.is_empty(), "no events provided");

        let (response_tx, response_rx) = oneshot::channel();

        self.write_tx
            .send(WriteRequest::Append {
                store_id: self.id,
                addr,
                events,
                strategy,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::ClientClosed)?;

        response_rx.await.map_err(|_| Error::ClientClosed)?
    }

    /// Logs a successful append.
    ///
    /// `next` is the next unused offset, so the batch started `count` facts
    /// earlier. The stream in the logged address is qualified with the store
    /// name, which is not part of any real address.
    fn log_append(&self, kind: &str, next: &Address, first: Option<Event>, count: usize) {
        let Some(first) = first else { return };

        let addr = Address::new(
            format!("{}::{}", self.name, next.stream),
            next.offset - count as u64,
        );

        match count {
            1 => info!(target: "gospel::store", "appended {first} at {addr} ({kind})"),
            2 => info!(target: "gospel::store", "appended {first} and 1 more event at {addr} ({kind})"),
            n => info!(
                target: "gospel::store",
                "appended {first} and {} more events at {addr} ({kind})",
                n - 1,
            ),
        }
    }
}
