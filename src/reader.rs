//! # Adaptive Tailing Reader
//!
//! A [`Reader`] is a long-lived cursor over one stream. A background poller
//! repeatedly queries the database for facts at and after the reader's
//! position, keeps a bounded lookahead buffer full, and tails the stream
//! indefinitely; consumers drain the buffer with [`Reader::next`] /
//! [`Reader::try_next`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Poller Thread                             │
//! │                                                                 │
//! │   global limiter ──► adaptive limiter ──► SELECT facts ──┐      │
//! │        ▲                    ▲                            │      │
//! │        │                    └── rate control ◄── latency │      │
//! │   shared by all                (EWMA, headroom)          │      │
//! │   readers of the                                         ▼      │
//! │   client                                     bounded fact chan  │
//! └──────────────────────────────────────────────────┬──────────────┘
//!                                                    │
//!                           next() / try_next() ◄────┘
//! ```
//!
//! ## Rate adaptation
//!
//! Polling too fast wastes database capacity on empty reads; polling too
//! slowly inflates delivery latency. The poller measures the latency of each
//! poll (the age of the oldest fact it returned) and smooths it with an
//! exponentially-weighted moving average. The difference between the
//! configured *acceptable latency* and that average is the **headroom**:
//! positive headroom means we are fresher than required and the poll
//! interval grows by the headroom; negative headroom shrinks it. The
//! resulting rate is clamped between `1 / starvation latency` (the floor
//! that bounds staleness at the stream tail) and the client-wide ceiling
//! enforced by the shared global limiter.
//!
//! ## Lifecycle
//!
//! The poller runs under a cancellation token owned by [`Reader::close`],
//! not under the scope that opened the reader, so a reader outlives its
//! opening call. A database failure stops the poller and is delivered
//! exactly once to the next `next()`/`try_next()`; every call after that
//! (and after `close()`) reports [`Error::ReaderClosed`]. Abandoning a
//! `next()` future - for example because a `tokio::time::timeout` around it
//! fired - never terminates the reader.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::limit::RateLimiter;
use crate::metrics::{
    format_duration, format_rate, interval_to_rate, rate_to_interval, Ewma, RateCounter,
};
use crate::options::ReaderOptions;
use crate::schema;
use crate::types::{Address, Event, Fact};

/// Average age of samples kept in the per-poll latency moving average. A
/// sample is taken after each poll.
const AVERAGE_LATENCY_AGE: f64 = 20.0;

// =============================================================================
// Reader
// =============================================================================

/// A cursor that delivers the facts of one stream in ascending offset
/// order, tailing the stream indefinitely.
///
/// Obtained from [`EventStore::open`].
///
/// # Example
///
/// ```no_run
/// # async fn example(store: gospel::EventStore) -> gospel::Result<()> {
/// use gospel::Address;
///
/// let mut reader = store.open(Address::new("orders", 0), []).await?;
///
/// loop {
///     let next = reader.next().await?;
///     println!("got {} (resume at {})", reader.get(), next);
/// }
/// # }
/// ```
///
/// [`EventStore::open`]: crate::EventStore::open
pub struct Reader {
    /// Facts delivered by the poller, in order, with backpressure.
    facts: mpsc::Receiver<Fact>,

    /// Signaled (capacity 1, non-blocking) on every empty poll. Only
    /// `try_next()` listens to it.
    end: mpsc::Receiver<()>,

    /// Carries the poller's terminal error, if any; closed when the poller
    /// exits. The error is delivered at most once.
    done: mpsc::Receiver<Error>,

    /// Cancels the poller. Owned by `close()` (and the destructor).
    cancel: CancellationToken,

    /// The fact returned by `get()` until the next `next()` call.
    current: Option<Fact>,

    /// A fact that was already buffered when `next()` returned; it becomes
    /// `current` on the following call without touching the channel.
    lookahead: Option<Fact>,

    /// Set once `close()` runs and the terminal error has been drained.
    closed: bool,
}

impl Reader {
    /// Opens a reader that begins reading facts at `addr`.
    ///
    /// Spawns the poller thread and waits for it to validate its query
    /// against the database; errors preparing the statement surface here.
    pub(crate) async fn open(
        path: &Path,
        store_id: u64,
        addr: Address,
        global_limit: Arc<RateLimiter>,
        opts: ReaderOptions,
    ) -> Result<Self> {
        let buffer = opts.read_buffer_size();

        let (facts_tx, facts_rx) = mpsc::channel(buffer);
        let (end_tx, end_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        if tracing::enabled!(target: "gospel::reader", tracing::Level::DEBUG) {
            let filter = match opts.event_type_filter() {
                Some(types) => types.join(", "),
                None => "*".to_string(),
            };

            debug!(
                target: "gospel::reader",
                "{} | global poll limit: {} | acceptable latency: {} | starvation latency: {} | read-buffer: {} | filter: {}",
                addr,
                format_rate(global_limit.rate()),
                format_duration(opts.acceptable_latency()),
                format_duration(opts.starvation_latency()),
                buffer,
                filter,
            );
        }

        let poller_path = path.to_path_buf();
        let poller_cancel = cancel.clone();

        std::thread::Builder::new()
            .name("gospel-reader".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };

                rt.block_on(async move {
                    let poller = match Poller::new(
                        &poller_path,
                        store_id,
                        addr,
                        global_limit,
                        &opts,
                        poller_cancel,
                        facts_tx,
                        end_tx,
                        done_tx,
                    ) {
                        Ok(poller) => poller,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    if ready_tx.send(Ok(())).is_err() {
                        // The opening caller went away before we started.
                        return;
                    }

                    poller.run().await;
                });
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Schema("reader thread exited before becoming ready".to_string()))??;

        Ok(Self {
            facts: facts_rx,
            end: end_rx,
            done: done_rx,
            cancel,
            current: None,
            lookahead: None,
            closed: false,
        })
    }

    /// Waits until a fact is available for reading.
    ///
    /// On success the "current" fact is ready to be returned by
    /// [`Reader::get`], and the returned address is the offset the reader
    /// has reached - suitable for resuming in a future
    /// [`EventStore::open`]. Note that it is not always the address
    /// immediately following the current fact: it may be further ahead in
    /// the stream, skipping facts the reader's filter excludes.
    ///
    /// Cancel-safe; impose a deadline with [`tokio::time::timeout`].
    /// Abandoning the future never terminates the reader.
    ///
    /// [`EventStore::open`]: crate::EventStore::open
    pub async fn next(&mut self) -> Result<Address> {
        match self.advance(false).await? {
            Some(next) => Ok(next),
            // The end-of-stream branch is disabled for next().
            None => unreachable!("end-of-stream is only observable via try_next"),
        }
    }

    /// Waits until a fact is available for reading or the poller observes
    /// the end of the stream.
    ///
    /// Returns `Some(next_address)` when a new fact is current, or `None`
    /// when the current fact is the last one known to exist in the stream.
    pub async fn try_next(&mut self) -> Result<Option<Address>> {
        self.advance(true).await
    }

    /// Returns the "current" fact.
    ///
    /// The same fact is returned until `next()`/`try_next()` succeeds again.
    ///
    /// # Panics
    ///
    /// Panics if called before a successful `next()`/`try_next()`, or after
    /// the reader has been closed.
    pub fn get(&self) -> &Fact {
        assert!(!self.closed, "the reader is closed");

        self.current
            .as_ref()
            .expect("next() must be called before get()")
    }

    /// Closes the reader and returns its terminal error, if any.
    ///
    /// Idempotent: the first call cancels the poller and drains its exit
    /// status; later calls return `Ok(())`. A clean close - including one
    /// racing a terminal error that `next()` already delivered - is `Ok`.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;
        self.cancel.cancel();

        match self.done.recv().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Produces the next current fact.
    ///
    /// With `until_end` set, an empty-poll signal is reported as `Ok(None)`
    /// instead of being ignored.
    async fn advance(&mut self, until_end: bool) -> Result<Option<Address>> {
        if self.closed {
            return Err(Error::ReaderClosed);
        }

        let current = match self.lookahead.take() {
            Some(fact) => fact,
            None => {
                tokio::select! {
                    // Prefer delivering buffered facts over reporting
                    // end-of-stream or termination.
                    biased;

                    fact = self.facts.recv() => match fact {
                        Some(fact) => fact,
                        // Poller gone and buffer drained: surface its
                        // terminal error once, then the closed sentinel.
                        None => return Err(self.terminal().await),
                    },

                    _ = self.end.recv(), if until_end => return Ok(None),

                    err = self.done.recv() => return Err(match err {
                        Some(err) => err,
                        None => Error::ReaderClosed,
                    }),
                }
            }
        };

        // Non-blocking peek at the following fact. When it is already
        // buffered, its address is a better "next" than current + 1 because
        // it skips over facts the filter excluded.
        let fallback = current.addr.next();
        self.current = Some(current);

        match self.facts.try_recv() {
            Ok(fact) => {
                let next = fact.addr.clone();
                self.lookahead = Some(fact);
                Ok(Some(next))
            }
            Err(_) => Ok(Some(fallback)),
        }
    }

    /// Drains the poller's exit status after the fact channel closed.
    async fn terminal(&mut self) -> Error {
        match self.done.recv().await {
            Some(err) => err,
            None => Error::ReaderClosed,
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        // Stop the poller even if the reader was never explicitly closed.
        self.cancel.cancel();
    }
}

// =============================================================================
// Poller
// =============================================================================

/// Why the poll loop stopped.
enum Exit {
    /// The reader was closed (or the opening caller vanished); not an error.
    Canceled,

    /// The database failed; reported through `done`.
    Failed(Error),
}

/// The background half of a reader: owns the read-only connection and the
/// self-tuned poll loop. Single-owner; no locks.
struct Poller {
    conn: Connection,
    query: String,

    store_id: u64,

    /// The starting address for the next database poll.
    addr: Address,

    /// Event types to poll for; empty means unfiltered.
    filter: Vec<String>,

    facts_tx: mpsc::Sender<Fact>,
    end_tx: mpsc::Sender<()>,
    done_tx: mpsc::Sender<Error>,
    cancel: CancellationToken,

    /// Shared ceiling on polls per second across the whole client.
    global_limit: Arc<RateLimiter>,

    /// Self-tuned poll pacing.
    rate: RateControl,

    /// Bookkeeping that only exists when debug logging is enabled.
    debug: Option<PollDebug>,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    fn new(
        path: &Path,
        store_id: u64,
        addr: Address,
        global_limit: Arc<RateLimiter>,
        opts: &ReaderOptions,
        cancel: CancellationToken,
        facts_tx: mpsc::Sender<Fact>,
        end_tx: mpsc::Sender<()>,
        done_tx: mpsc::Sender<Error>,
    ) -> Result<Self> {
        let conn = schema::open_reader(path)?;

        let filter: Vec<String> = opts
            .event_type_filter()
            .map(<[String]>::to_vec)
            .unwrap_or_default();

        let query = build_query(filter.len(), opts.read_buffer_size());

        // One prepared statement per reader: validate it now so open()
        // reports bad queries, and let the statement cache reuse it on
        // every poll.
        conn.prepare_cached(&query)?;

        let debug = tracing::enabled!(target: "gospel::reader", tracing::Level::DEBUG)
            .then(PollDebug::new);

        Ok(Self {
            conn,
            query,
            store_id,
            addr,
            filter,
            facts_tx,
            end_tx,
            done_tx,
            cancel,
            global_limit: Arc::clone(&global_limit),
            rate: RateControl::new(
                opts.acceptable_latency(),
                opts.starvation_latency(),
                global_limit,
            ),
            debug,
        })
    }

    /// Polls the database and delivers facts until canceled or failed.
    async fn run(mut self) {
        let exit = loop {
            if let Err(exit) = self.tick().await {
                break exit;
            }
        };

        if let Exit::Failed(err) = exit {
            let _ = self.done_tx.try_send(err);
        }

        // Dropping the poller closes the fact, end and done channels, which
        // wakes any pending next()/try_next().
    }

    /// One pass of the poll loop.
    async fn tick(&mut self) -> std::result::Result<(), Exit> {
        self.wait(WhichLimit::Global).await?;
        self.wait(WhichLimit::Adaptive).await?;

        let count = self.poll().await?;

        self.rate.adjust();
        self.log_poll(count);

        Ok(())
    }

    /// Waits for a poll token, aborting on cancellation.
    async fn wait(&self, which: WhichLimit) -> std::result::Result<(), Exit> {
        let limiter = match which {
            WhichLimit::Global => &*self.global_limit,
            WhichLimit::Adaptive => &self.rate.adaptive,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Exit::Canceled),
            _ = limiter.acquire() => Ok(()),
        }
    }

    /// Queries the database for facts beginning at `self.addr` and sends
    /// them into the buffer, blocking on backpressure.
    async fn poll(&mut self) -> std::result::Result<usize, Exit> {
        let facts = self.fetch().map_err(Exit::Failed)?;

        let now = Utc::now();
        let count = facts.len();
        let first_time = facts.first().map(|f| f.time);

        for fact in facts {
            let next = fact.addr.next();

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Exit::Canceled),
                sent = self.facts_tx.send(fact) => {
                    if sent.is_err() {
                        // The reader handle is gone; stop quietly.
                        return Err(Exit::Canceled);
                    }
                }
            }

            self.addr = next;

            if let Some(debug) = &mut self.debug {
                debug.fact_rate.tick();
            }
        }

        // The poll's latency is the age of the oldest fact it returned
        // (zero for an empty poll). Both timestamps come from this
        // process's clock: the database is embedded, so there is no
        // server/client drift to compensate for.
        let latency = first_time
            .map(|first| (now - first).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);
        self.rate.observe(latency);

        if count == 0 {
            // Non-blocking: one pending end signal is enough.
            let _ = self.end_tx.try_send(());
        }

        Ok(count)
    }

    /// Runs the prepared query and materializes the returned facts.
    fn fetch(&mut self) -> Result<Vec<Fact>> {
        let mut stmt = self.conn.prepare_cached(&self.query)?;

        let store_id = self.store_id as i64;
        let offset = self.addr.offset as i64;

        let mut params: Vec<&dyn ToSql> = vec![&store_id, &self.addr.stream, &offset];
        for event_type in &self.filter {
            params.push(event_type);
        }

        let stream = self.addr.stream.clone();
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut facts = Vec::new();
        for row in rows {
            let (offset, time, event_type, content_type, body) = row?;

            facts.push(Fact {
                addr: Address::new(stream.clone(), offset as u64),
                time: micros_to_datetime(time)?,
                event: Event::new(event_type, content_type, body),
            });
        }

        Ok(facts)
    }

    /// Logs metrics for the previous poll and any rate adjustment.
    ///
    /// Repeated empty polls at an unchanged rate carry no new information
    /// and are muted.
    fn log_poll(&mut self, count: usize) {
        let Some(poll_debug) = &mut self.debug else { return };

        poll_debug.poll_rate.tick();

        let rate = self.rate.adaptive.rate();
        if rate == poll_debug.previous_rate && count == 0 && poll_debug.mute_empty_polls {
            return;
        }
        poll_debug.mute_empty_polls = count == 0;
        poll_debug.previous_rate = rate;

        let capacity = self.facts_tx.max_capacity();
        let occupancy = capacity - self.facts_tx.capacity();

        debug!(
            target: "gospel::reader",
            "{} | fetch: {:3} {} | queue: {:3}/{:3} | adaptive poll: {} | avg poll: {} | latency: {}",
            self.addr,
            count,
            format_rate(poll_debug.fact_rate.rate()),
            occupancy,
            capacity,
            format_rate(rate),
            format_rate(poll_debug.poll_rate.rate()),
            format_duration(self.rate.effective_latency()),
        );
    }
}

/// Selects which of the two limiters [`Poller::wait`] blocks on.
enum WhichLimit {
    Global,
    Adaptive,
}

/// Debug-only bookkeeping; allocated only when a debug subscriber is
/// active when the reader is opened.
struct PollDebug {
    /// Actual polling rate, which can be well below the adaptive limit for
    /// slow consumers (backpressure stalls the loop).
    poll_rate: RateCounter,

    /// Rate of fact delivery into the buffer.
    fact_rate: RateCounter,

    previous_rate: f64,
    mute_empty_polls: bool,
}

impl PollDebug {
    fn new() -> Self {
        Self {
            poll_rate: RateCounter::new(),
            fact_rate: RateCounter::new(),
            previous_rate: 0.0,
            mute_empty_polls: false,
        }
    }
}

/// Builds the polling query.
///
/// `store_id`, `stream`, the resume offset and the filter list are bound as
/// parameters; only the row limit (already validated as a buffer size) is
/// interpolated.
fn build_query(filter_len: usize, limit: usize) -> String {
    let mut sql = String::from(
        r#"SELECT f."offset", f.time, e.event_type, e.content_type, e.body
FROM fact AS f
INNER JOIN event AS e ON e.id = f.event_id
WHERE f.store_id = ?1 AND f.stream = ?2 AND f."offset" >= ?3"#,
    );

    if filter_len > 0 {
        sql.push_str(" AND e.event_type IN (");
        for i in 0..filter_len {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("?{}", i + 4));
        }
        sql.push(')');
    }

    sql.push_str(&format!(" ORDER BY f.\"offset\" LIMIT {limit}"));

    sql
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Schema(format!("fact timestamp {micros} is out of range")))
}

// =============================================================================
// Rate Control
// =============================================================================

/// The reader's self-tuning poll pacing.
///
/// Kept separate from the poller so the adaptation math can be exercised
/// without a database.
struct RateControl {
    /// The limiter being tuned. Not shared with other readers.
    adaptive: RateLimiter,

    /// Supplies the ceiling: the adaptive rate never exceeds the global
    /// limiter's rate.
    global: Arc<RateLimiter>,

    /// The latency the reader aims to maintain.
    acceptable: Duration,

    /// The latency tolerated at the stream tail; sets the floor on the poll
    /// rate.
    starvation: Duration,

    /// Latency computed from the most recent poll; zero when it was empty.
    instantaneous: Duration,

    /// Smoothed latency over recent polls.
    average: Ewma,
}

impl RateControl {
    fn new(acceptable: Duration, starvation: Duration, global: Arc<RateLimiter>) -> Self {
        Self {
            // Start at one poll per acceptable-latency interval.
            adaptive: RateLimiter::new(interval_to_rate(acceptable.as_secs_f64()), 1),
            global,
            acceptable,
            starvation,
            instantaneous: Duration::ZERO,
            average: Ewma::new(AVERAGE_LATENCY_AGE),
        }
    }

    /// Records the latency observed by a poll.
    fn observe(&mut self, latency: Duration) {
        self.instantaneous = latency;
        self.average.add(latency.as_secs_f64());
    }

    /// The latency used to adjust the poll rate.
    ///
    /// The moving average needs several samples before it is primed; until
    /// then it reports zero and the instantaneous value is used instead.
    fn effective_latency(&self) -> Duration {
        let average = self.average.value();

        if average == 0.0 {
            self.instantaneous
        } else {
            Duration::from_secs_f64(average)
        }
    }

    /// Re-tunes the poll rate to balance poll frequency against latency.
    ///
    /// Positive headroom (fresher than required) stretches the poll
    /// interval by the headroom; negative headroom shrinks it. Returns true
    /// if the rate changed.
    fn adjust(&mut self) -> bool {
        let headroom = self.acceptable.as_secs_f64() - self.effective_latency().as_secs_f64();

        let interval = rate_to_interval(self.adaptive.rate()).as_secs_f64();

        self.set_rate(interval_to_rate(interval + headroom))
    }

    /// Applies a new adaptive rate, clamped between the starvation floor and
    /// the global ceiling. The limiter is only touched when the rate
    /// actually changes.
    fn set_rate(&mut self, rate: f64) -> bool {
        let min = interval_to_rate(self.starvation.as_secs_f64());
        let max = self.global.rate();

        let clamped = if rate < min {
            min
        } else if rate > max {
            max
        } else {
            rate
        };

        if clamped != self.adaptive.rate() {
            self.adaptive.set_rate(clamped);
            return true;
        }

        false
    }
}

// =============================================================================
// Tests
// =============================================================================
