//! # Client
//!
//! The [`Client`] owns everything shared by the event stores opened through
//! it: the writer thread holding the read-write database connection, the
//! global polling-rate limiter, and the database path readers open their own
//! connections against.
//!
//! ## Why a dedicated writer thread?
//!
//! A SQLite `Connection` is not `Sync`, and the append path is serialized by
//! the database's write lock anyway, so the simplest sound arrangement is a
//! single OS thread that owns the read-write connection and services append
//! and store-open requests from async tasks over a channel:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Async Tasks                         │
//! │   store.append() ──┐                                     │
//! │   store.append() ──┼── tokio::sync::mpsc ──────────┐     │
//! │   client.open_store() ─┘                           │     │
//! └────────────────────────────────────────────────────┼─────┘
//!                                                      ▼
//!                                          ┌───────────────────┐
//!                                          │   Writer Thread   │
//!                                          │  (RW connection,  │
//!                                          │   WAL, retries)   │
//!                                          └─────────┬─────────┘
//!                                                    ▼
//!                                              database file
//! ```
//!
//! Readers never touch this thread: each reader's poller owns a read-only
//! connection to the same WAL-mode database (see [`Reader`]).
//!
//! [`Reader`]: crate::Reader

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use crate::append::{self, Strategy};
use crate::error::{Error, Result};
use crate::limit::RateLimiter;
use crate::options::{ClientOption, ClientOptions};
use crate::schema;
use crate::store::EventStore;
use crate::types::{Address, Event};

/// Size of the write-request channel.
const WRITE_CHANNEL_SIZE: usize = 1024;

/// A request serviced by the writer thread.
pub(crate) enum WriteRequest {
    /// Create-or-select a store by name.
    OpenStore {
        name: String,
        response: oneshot::Sender<Result<(u64, bool)>>,
    },

    /// Append events to a stream with the given strategy.
    Append {
        store_id: u64,
        addr: Address,
        events: Vec<Event>,
        strategy: Strategy,
        response: oneshot::Sender<Result<Address>>,
    },

    /// Stop the writer thread.
    Shutdown,
}

/// A connection to an event-log database.
///
/// Each database supports an arbitrary number of named event stores, opened
/// with [`Client::open_store`]. The client is cheap to clone and safe to
/// share across tasks; all clones use the same writer thread and the same
/// global polling-rate limiter.
#[derive(Clone)]
pub struct Client {
    /// Channel to the writer thread.
    write_tx: mpsc::Sender<WriteRequest>,

    /// Handle to the writer thread, taken by the first `close()`.
    writer_handle: Arc<Mutex<Option<JoinHandle<()>>>>,

    /// Path of the database file; readers open their own connections to it.
    path: PathBuf,

    /// Limits the number of polling queries per second across all readers
    /// opened through this client.
    poll_limit: Arc<RateLimiter>,
}

impl Client {
    /// Opens the event-log database at `path`, creating it and bootstrapping
    /// the schema if necessary.
    ///
    /// The bootstrap is idempotent, so concurrent clients may open the same
    /// database.
    ///
    /// # Errors
    ///
    /// - [`Error::Sqlite`] if the file cannot be opened or the schema cannot
    ///   be created
    /// - [`Error::Io`] if the writer thread cannot be spawned
    pub async fn open(
        path: impl AsRef<Path>,
        opts: impl IntoIterator<Item = ClientOption>,
    ) -> Result<Self> {
        let options = ClientOptions::new(opts);
        let path = path.as_ref().to_path_buf();

        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();

        let writer_path = path.clone();
        let handle = std::thread::Builder::new()
            .name("gospel-writer".to_string())
            .spawn(move || {
                let conn = match schema::open_writer(&writer_path) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if ready_tx.send(Ok(())).is_err() {
                    // The opening caller went away; nothing to serve.
                    return;
                }

                run_writer(conn, write_rx);
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Schema("writer thread exited before becoming ready".to_string()))??;

        info!(
            target: "gospel::client",
            "opened event-log database at {}",
            path.display(),
        );

        Ok(Self {
            write_tx,
            writer_handle: Arc::new(Mutex::new(Some(handle))),
            path,
            poll_limit: Arc::new(RateLimiter::new(options.poll_rate_limit(), 1)),
        })
    }

    /// Returns an event store by name, creating it if necessary.
    ///
    /// Creation atomically inserts the store row, seeds the store's ε-stream,
    /// and records a `$store.created` meta-fact on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has been closed; never a
    /// conflict.
    pub async fn open_store(&self, name: &str) -> Result<EventStore> {
        let (response_tx, response_rx) = oneshot::channel();

        self.write_tx
            .send(WriteRequest::OpenStore {
                name: name.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| Error::ClientClosed)?;

        let (id, created) = response_rx.await.map_err(|_| Error::ClientClosed)??;

        if created {
            debug!(target: "gospel::client", "created new event store '{name}'");
        } else {
            debug!(target: "gospel::client", "opened existing event store '{name}'");
        }

        Ok(EventStore::new(
            id,
            name.to_string(),
            self.path.clone(),
            self.write_tx.clone(),
            Arc::clone(&self.poll_limit),
        ))
    }

    /// Closes the client, stopping the writer thread.
    ///
    /// Idempotent. Stores and readers opened through the client keep working
    /// only for reads; appends and `open_store` calls fail with
    /// [`Error::ClientClosed`] afterwards.
    pub async fn close(&self) {
        let _ = self.write_tx.send(WriteRequest::Shutdown).await;

        if let Some(handle) = self.writer_handle.lock().await.take() {
            let _ = handle.join();
        }
    }
}

/// The writer loop: services requests until shutdown or until every client
/// clone has been dropped.
fn run_writer(conn: Connection, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            WriteRequest::OpenStore { name, response } => {
                // Lock contention is retried like the append path, bounded
                // by the caller still waiting for the answer.
                let result = loop {
                    match append::open_store(&conn, &name) {
                        Err(e) if append::is_busy(&e) && !response.is_closed() => continue,
                        result => break result,
                    }
                };

                let _ = response.send(result);
            }

            WriteRequest::Append {
                store_id,
                addr,
                events,
                strategy,
                response,
            } => {
                let result = append::append_with_retry(&conn, store_id, &addr, &events, strategy, || {
                    response.is_closed()
                });

                let _ = response.send(result);
            }

            WriteRequest::Shutdown => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
