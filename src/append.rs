//! # Append Engine
//!
//! Transactional, optimistic-concurrency-controlled allocation of stream
//! offsets, with a dual write to the store's ε-stream.
//!
//! Two strategies share a single transactional skeleton:
//!
//! ```text
//! BEGIN IMMEDIATE → strategy(store_id, addr, events) → COMMIT
//!                              │
//!                              └─ any error → ROLLBACK
//! ```
//!
//! - **Checked** ([`append_checked`]): the caller supplies the offset it
//!   believes is the next unused one. The stream row's `next` counter is the
//!   arbiter; a mismatch yields [`Error::Conflict`] and rolls the whole call
//!   back, so an append of *n* events is atomic.
//! - **Unchecked** ([`append_unchecked`]): the store assigns the offset by
//!   bumping the stream row unconditionally. Never conflicts.
//!
//! Every appended event also produces one fact on the ε-stream, written in
//! the same transaction. Creating a stream (or a store, see [`open_store`])
//! additionally records a meta-fact on the ε-stream describing the creation.
//!
//! The whole skeleton is retried when the database reports lock contention
//! (`SQLITE_BUSY`), the embedded analogue of a server deadlock: detection is
//! by driver error code, every other error class surfaces immediately, and
//! the only bound on retries is the caller abandoning the call. Each attempt
//! works on its own copy of the address, so a retry never observes a
//! partially advanced cursor.

use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::types::{Address, Event};

/// Event type of the ε-stream meta-fact recorded when a store is created.
pub const STORE_CREATED_EVENT_TYPE: &str = "$store.created";

/// Content type of the `$store.created` meta-fact. Its body is the store
/// name.
pub const STORE_CREATED_CONTENT_TYPE: &str = "application/vnd.gospel.store.created.v1";

/// Event type of the ε-stream meta-fact recorded when a stream is created.
pub const STREAM_CREATED_EVENT_TYPE: &str = "$stream.created";

/// Content type of the `$stream.created` meta-fact. Its body is the stream
/// name.
pub const STREAM_CREATED_CONTENT_TYPE: &str = "application/vnd.gospel.stream.created.v1";

/// A function that performs the database writes for one append call.
///
/// `addr.offset` is advanced to refer to the next unused offset as events
/// are written.
pub(crate) type Strategy = fn(&Connection, u64, &mut Address, &[Event]) -> Result<()>;

// =============================================================================
// Transactional Skeleton
// =============================================================================

/// Runs `f` inside an immediate transaction, committing on success and
/// rolling back on any error.
///
/// `BEGIN IMMEDIATE` takes the write lock up front, which is what stands in
/// for the per-row locks a server database would take on the stream rows.
/// Raw statements are used for transaction control so `f` can borrow the
/// connection freely.
fn in_transaction<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    match f(conn) {
        Ok(value) => match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(value),
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        },
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Writes events to a stream inside a transaction using the given append
/// strategy, retrying on lock contention.
///
/// `abandoned` is consulted between attempts; when it reports true (the
/// caller has stopped waiting for the result) the retry loop gives up and
/// returns the busy error instead.
///
/// On success, returns the address of the next unused offset after the
/// append.
pub(crate) fn append_with_retry(
    conn: &Connection,
    store_id: u64,
    addr: &Address,
    events: &[Event],
    strategy: Strategy,
    abandoned: impl Fn() -> bool,
) -> Result<Address> {
    loop {
        let mut attempt = addr.clone();

        match in_transaction(conn, |conn| strategy(conn, store_id, &mut attempt, events)) {
            Ok(()) => return Ok(attempt),
            Err(e) if is_busy(&e) && !abandoned() => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Returns true if `err` is transient lock contention, the only error class
/// the append path retries.
pub(crate) fn is_busy(err: &Error) -> bool {
    matches!(
        err,
        Error::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// =============================================================================
// Strategies
// =============================================================================

/// The checked append strategy: verifies that `addr` refers to the next
/// unused offset of its stream before writing each event.
pub(crate) fn append_checked(
    conn: &Connection,
    store_id: u64,
    addr: &mut Address,
    events: &[Event],
) -> Result<()> {
    for event in events {
        let now = now_micros();

        if addr.offset == 0 {
            // Offset 0 means "the stream should not exist yet": try to
            // create it outright. A duplicate key means it does exist, so
            // offset 0 is already taken.
            let inserted = conn.execute(
                "INSERT INTO stream (store_id, name, next) VALUES (?1, ?2, 1)",
                params![store_id as i64, addr.stream],
            );

            match inserted {
                Ok(_) => record_stream_created(conn, now, store_id, &addr.stream)?,
                Err(e) if is_constraint(&e) => return Err(conflict(addr, event)),
                Err(e) => return Err(e.into()),
            }
        } else {
            // The stream must already be at exactly this offset.
            let updated = conn.execute(
                "UPDATE stream SET next = ?1 + 1
                 WHERE store_id = ?2 AND name = ?3 AND next = ?1",
                params![addr.offset as i64, store_id as i64, addr.stream],
            )?;

            if updated == 0 {
                return Err(conflict(addr, event));
            }
        }

        // Once we know the write will not conflict, store the event and
        // record its facts.
        let event_id = store_event(conn, now, store_id, event)?;
        record_epsilon(conn, now, store_id, event_id)?;
        insert_fact(conn, now, store_id, &addr.stream, addr.offset, event_id)?;

        addr.offset += 1;
    }

    Ok(())
}

/// The unchecked append strategy: appends at whatever the next unused offset
/// happens to be, regardless of `addr.offset`.
pub(crate) fn append_unchecked(
    conn: &Connection,
    store_id: u64,
    addr: &mut Address,
    events: &[Event],
) -> Result<()> {
    for event in events {
        let now = now_micros();

        // Store the event first, deferring the stream-row lock as late as
        // possible.
        let event_id = store_event(conn, now, store_id, event)?;

        conn.execute(
            "INSERT INTO stream (store_id, name, next) VALUES (?1, ?2, 1)
             ON CONFLICT (store_id, name) DO UPDATE SET next = next + 1",
            params![store_id as i64, addr.stream],
        )?;

        // Our offset is whatever we just set the next offset to, minus 1.
        let offset: i64 = conn.query_row(
            "SELECT next - 1 FROM stream WHERE store_id = ?1 AND name = ?2",
            params![store_id as i64, addr.stream],
            |row| row.get(0),
        )?;

        if offset == 0 {
            record_stream_created(conn, now, store_id, &addr.stream)?;
        }

        record_epsilon(conn, now, store_id, event_id)?;
        insert_fact(conn, now, store_id, &addr.stream, offset as u64, event_id)?;

        addr.offset = offset as u64;
    }

    // The returned address is the next unused offset, one past the last
    // committed event.
    addr.offset += 1;

    Ok(())
}

fn conflict(addr: &Address, event: &Event) -> Error {
    Error::Conflict {
        address: addr.clone(),
        event: event.clone(),
    }
}

// =============================================================================
// Store Lifecycle
// =============================================================================

/// Creates-or-selects the store named `name`, returning its ID and whether
/// it was created by this call.
///
/// Creation inserts the store row, seeds its ε-stream at `next = 0`, and
/// records a `$store.created` meta-fact, all in one transaction.
pub(crate) fn open_store(conn: &Connection, name: &str) -> Result<(u64, bool)> {
    in_transaction(conn, |conn| {
        let created = match conn.execute("INSERT INTO store (name) VALUES (?1)", params![name]) {
            Ok(_) => true,
            Err(e) if is_constraint(&e) => false,
            Err(e) => return Err(e.into()),
        };

        let id: i64 = if created {
            conn.last_insert_rowid()
        } else {
            conn.query_row(
                "SELECT id FROM store WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?
        };

        if created {
            conn.execute(
                "INSERT INTO stream (store_id, name, next) VALUES (?1, '', 0)",
                params![id],
            )?;

            record_store_created(conn, now_micros(), id as u64, name)?;
        }

        Ok((id as u64, created))
    })
}

// =============================================================================
// Row Helpers
// =============================================================================

/// Inserts an event row and returns its auto-increment ID.
fn store_event(conn: &Connection, now: i64, store_id: u64, event: &Event) -> Result<i64> {
    conn.execute(
        "INSERT INTO event (time, store_id, event_type, content_type, body)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            now,
            store_id as i64,
            event.event_type,
            event.content_type,
            event.body,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Inserts a fact row at the given stream position.
fn insert_fact(
    conn: &Connection,
    now: i64,
    store_id: u64,
    stream: &str,
    offset: u64,
    event_id: i64,
) -> Result<()> {
    conn.execute(
        r#"INSERT INTO fact (store_id, stream, "offset", event_id, time)
           VALUES (?1, ?2, ?3, ?4, ?5)"#,
        params![store_id as i64, stream, offset as i64, event_id, now],
    )?;

    Ok(())
}

/// Records a fact on the ε-stream at its next unused offset.
///
/// The surrounding immediate transaction holds the database write lock, so
/// reading and bumping the ε-stream row here is race-free.
fn record_epsilon(conn: &Connection, now: i64, store_id: u64, event_id: i64) -> Result<()> {
    let offset: i64 = conn
        .query_row(
            "SELECT next FROM stream WHERE store_id = ?1 AND name = ''",
            params![store_id as i64],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                Error::Schema(format!("ε-stream does not exist for store {store_id}"))
            }
            e => e.into(),
        })?;

    conn.execute(
        r#"INSERT INTO fact (store_id, stream, "offset", event_id, time)
           VALUES (?1, '', ?2, ?3, ?4)"#,
        params![store_id as i64, offset, event_id, now],
    )?;

    conn.execute(
        "UPDATE stream SET next = ?1 + 1 WHERE store_id = ?2 AND name = ''",
        params![offset, store_id as i64],
    )?;

    Ok(())
}

/// Records a `$stream.created` meta-fact on the ε-stream.
fn record_stream_created(conn: &Connection, now: i64, store_id: u64, stream: &str) -> Result<()> {
    let event = Event::new(
        STREAM_CREATED_EVENT_TYPE,
        STREAM_CREATED_CONTENT_TYPE,
        stream.as_bytes().to_vec(),
    );

    let event_id = store_event(conn, now, store_id, &event)?;
    record_epsilon(conn, now, store_id, event_id)
}

/// Records a `$store.created` meta-fact on the ε-stream.
fn record_store_created(conn: &Connection, now: i64, store_id: u64, store: &str) -> Result<()> {
    let event = Event::new(
        STORE_CREATED_EVENT_TYPE,
        STORE_CREATED_CONTENT_TYPE,
        store.as_bytes().to_vec(),
    );

    let event_id = store_event(conn, now, store_id, &event)?;
    record_epsilon(conn, now, store_id, event_id)
}

/// Returns the current time in microseconds since the Unix epoch.
///
/// This is the clock that stamps facts; the database is embedded, so the
/// append timestamp and any reader's "now" come from the same clock.
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn setup() -> (Connection, u64) {
        let conn = Connection::open_in_memory().unwrap();
        schema::bootstrap(&conn).unwrap();
        let (store_id, created) = open_store(&conn, "test").unwrap();
        assert!(created);
        (conn, store_id)
    }

    fn epsilon_types(conn: &Connection, store_id: u64) -> Vec<String> {
        let mut stmt = conn
            .prepare(
                r#"SELECT e.event_type FROM fact AS f
                   INNER JOIN event AS e ON e.id = f.event_id
                   WHERE f.store_id = ?1 AND f.stream = ''
                   ORDER BY f."offset""#,
            )
            .unwrap();

        stmt.query_map(params![store_id as i64], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    fn stream_next(conn: &Connection, store_id: u64, stream: &str) -> Option<i64> {
        conn.query_row(
            "SELECT next FROM stream WHERE store_id = ?1 AND name = ?2",
            params![store_id as i64, stream],
            |row| row.get(0),
        )
        .ok()
    }

    fn some_event(body: &str) -> Event {
        Event::new("thing.happened", "text/plain", body.as_bytes().to_vec())
    }

    #[test]
    fn open_store_seeds_epsilon_stream_and_meta_fact() {
        let (conn, store_id) = setup();

        // The ε-stream exists and holds exactly the $store.created fact.
        assert_eq!(stream_next(&conn, store_id, ""), Some(1));
        assert_eq!(epsilon_types(&conn, store_id), vec![STORE_CREATED_EVENT_TYPE]);

        let body: Vec<u8> = conn
            .query_row(
                r#"SELECT e.body FROM fact AS f
                   INNER JOIN event AS e ON e.id = f.event_id
                   WHERE f.store_id = ?1 AND f.stream = '' AND f."offset" = 0"#,
                params![store_id as i64],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(body, b"test");
    }

    #[test]
    fn open_store_is_create_or_select() {
        let (conn, store_id) = setup();

        let (again, created) = open_store(&conn, "test").unwrap();
        assert_eq!(again, store_id);
        assert!(!created);

        // No second meta-fact was recorded.
        assert_eq!(epsilon_types(&conn, store_id).len(), 1);

        let (other, created) = open_store(&conn, "other").unwrap();
        assert_ne!(other, store_id);
        assert!(created);
    }

    #[test]
    fn checked_append_creates_stream_and_dual_writes() {
        let (conn, store_id) = setup();

        let next = append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 0),
            &[some_event("x")],
            append_checked,
            || false,
        )
        .unwrap();
        assert_eq!(next, Address::new("s", 1));
        assert_eq!(stream_next(&conn, store_id, "s"), Some(1));

        // ε-stream: store.created, then stream.created, then the event.
        assert_eq!(
            epsilon_types(&conn, store_id),
            vec![
                STORE_CREATED_EVENT_TYPE,
                STREAM_CREATED_EVENT_TYPE,
                "thing.happened",
            ]
        );

        // The named-stream fact is at s+0.
        let offset: i64 = conn
            .query_row(
                r#"SELECT f."offset" FROM fact AS f WHERE f.store_id = ?1 AND f.stream = 's'"#,
                params![store_id as i64],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(offset, 0);
    }

    #[test]
    fn checked_append_of_n_events_is_contiguous() {
        let (conn, store_id) = setup();

        let events = [some_event("a"), some_event("b"), some_event("c")];
        let next = append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 0),
            &events,
            append_checked,
            || false,
        )
        .unwrap();

        assert_eq!(next.offset, 3);
        assert_eq!(stream_next(&conn, store_id, "s"), Some(3));

        let offsets: Vec<i64> = {
            let mut stmt = conn
                .prepare(
                    r#"SELECT f."offset" FROM fact AS f
                       WHERE f.store_id = ?1 AND f.stream = 's' ORDER BY f."offset""#,
                )
                .unwrap();
            stmt.query_map(params![store_id as i64], |row| row.get(0))
                .unwrap()
                .collect::<std::result::Result<_, _>>()
                .unwrap()
        };
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[test]
    fn checked_append_past_the_end_of_an_empty_stream_conflicts() {
        let (conn, store_id) = setup();

        let err = append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 1),
            &[some_event("x")],
            append_checked,
            || false,
        )
        .unwrap_err();

        assert!(err.is_conflict());
        let (addr, _) = err.conflict_details().unwrap();
        assert_eq!(*addr, Address::new("s", 1));

        // Nothing was created.
        assert_eq!(stream_next(&conn, store_id, "s"), None);
    }

    #[test]
    fn checked_append_at_zero_on_an_existing_stream_conflicts() {
        let (conn, store_id) = setup();

        append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 0),
            &[some_event("first")],
            append_checked,
            || false,
        )
        .unwrap();

        let epsilon_before = epsilon_types(&conn, store_id).len();

        let err = append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 0),
            &[some_event("second")],
            append_checked,
            || false,
        )
        .unwrap_err();
        assert!(err.is_conflict());

        // The conflict left the stream counter and the ε-stream untouched.
        assert_eq!(stream_next(&conn, store_id, "s"), Some(1));
        assert_eq!(epsilon_types(&conn, store_id).len(), epsilon_before);
    }

    #[test]
    fn conflicting_append_rolls_back_every_event_in_the_call() {
        let (conn, store_id) = setup();

        // Stale expected offset with several events: the guard fails on the
        // first event and the transaction discards everything.
        append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 0),
            &[some_event("first")],
            append_checked,
            || false,
        )
        .unwrap();

        let err = append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 5),
            &[some_event("a"), some_event("b"), some_event("c")],
            append_checked,
            || false,
        )
        .unwrap_err();
        assert!(err.is_conflict());

        let facts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM fact WHERE store_id = ?1 AND stream = 's'",
                params![store_id as i64],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(facts, 1);
        assert_eq!(stream_next(&conn, store_id, "s"), Some(1));
    }

    #[test]
    fn transaction_skeleton_rolls_back_mid_call_failures() {
        let (conn, store_id) = setup();

        // A strategy failure after some writes must leave no trace.
        let result: Result<()> = in_transaction(&conn, |conn| {
            let now = now_micros();
            let event_id = store_event(conn, now, store_id, &some_event("orphan"))?;
            record_epsilon(conn, now, store_id, event_id)?;
            Err(Error::Schema("boom".to_string()))
        });
        assert!(result.is_err());

        let events: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event WHERE event_type = 'thing.happened'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(events, 0);
        assert_eq!(stream_next(&conn, store_id, ""), Some(1));
    }

    #[test]
    fn unchecked_append_assigns_sequential_offsets() {
        let (conn, store_id) = setup();

        // First use of an empty stream returns {s, 1} as the next address.
        let next = append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 0),
            &[some_event("a")],
            append_unchecked,
            || false,
        )
        .unwrap();
        assert_eq!(next, Address::new("s", 1));

        // Each subsequent append lands one past the previous one, no matter
        // what offset the caller passes in.
        let next = append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 999),
            &[some_event("b")],
            append_unchecked,
            || false,
        )
        .unwrap();
        assert_eq!(next, Address::new("s", 2));

        let next = append_with_retry(
            &conn,
            store_id,
            &Address::new("s", 0),
            &[some_event("c"), some_event("d")],
            append_unchecked,
            || false,
        )
        .unwrap();
        assert_eq!(next, Address::new("s", 4));

        assert_eq!(stream_next(&conn, store_id, "s"), Some(4));
    }

    #[test]
    fn unchecked_append_records_stream_creation_once() {
        let (conn, store_id) = setup();

        for _ in 0..3 {
            append_with_retry(
                &conn,
                store_id,
                &Address::new("s", 0),
                &[some_event("x")],
                append_unchecked,
                || false,
            )
            .unwrap();
        }

        let created: usize = epsilon_types(&conn, store_id)
            .iter()
            .filter(|t| *t == STREAM_CREATED_EVENT_TYPE)
            .count();
        assert_eq!(created, 1);
    }

    #[test]
    fn epsilon_offset_accounting() {
        let (conn, store_id) = setup();

        // m appended events + 1 store creation + one per created stream.
        append_with_retry(
            &conn,
            store_id,
            &Address::new("a", 0),
            &[some_event("1"), some_event("2")],
            append_checked,
            || false,
        )
        .unwrap();

        append_with_retry(
            &conn,
            store_id,
            &Address::new("b", 0),
            &[some_event("3")],
            append_unchecked,
            || false,
        )
        .unwrap();

        // m = 3, streams created = 2, plus the store itself.
        assert_eq!(stream_next(&conn, store_id, ""), Some(3 + 1 + 2));
    }
}
