//! # Schema Bootstrap
//!
//! DDL for the store's four tables and the logic to bring a database up to
//! that schema. The bootstrap runs on every [`Client`] open; every statement
//! is guarded with `IF NOT EXISTS`, so it is idempotent and safe when
//! several clients race to open the same database.
//!
//! ## Table Overview
//!
//! ```text
//! store                 stream                     event
//! ┌────────────┐        ┌──────────────────┐       ┌──────────────────┐
//! │ id (PK)    │◄───┐   │ store_id ────────┼──┐    │ id (PK)          │
//! │ name (UQ)  │    ├───│ name             │  │    │ time             │
//! └────────────┘    │   │ next             │  ├────│ store_id         │
//!                   │   └──────────────────┘  │    │ event_type       │
//!                   │                         │    │ content_type     │
//!                   │   fact                  │    │ body             │
//!                   │   ┌──────────────────┐  │    └──────────────────┘
//!                   └───│ store_id         │──┘              ▲
//!                       │ stream, offset   │                 │
//!                       │ event_id ────────┼─────────────────┘
//!                       │ time             │
//!                       └──────────────────┘
//! ```
//!
//! `stream` rows are the locking authority for append ordering: appends
//! update `stream.next` inside an immediate transaction, so two producers
//! can never commit the same offset. `fact` maps `(store, stream, offset)`
//! to events; each appended event produces one fact on its named stream and
//! one on the store's ε-stream, in the same transaction.
//!
//! ## Physical layout
//!
//! The table and column names are stable across implementations so external
//! tools can read the database directly. `event` and `fact` carry a
//! microsecond `time` column, indexed to support time-ranged archival;
//! retention itself is a deployment concern, not a store operation.
//!
//! [`Client`]: crate::Client

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::Result;

/// How long a connection waits on the database lock before reporting
/// `SQLITE_BUSY`. The append path additionally retries busy errors around
/// whole transactions.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL
// =============================================================================

/// `store` maps store names to their IDs.
///
/// A store is a named logical namespace owning a set of streams and one
/// ε-stream. Stores are created on first open and never destroyed by the
/// store itself.
const CREATE_STORE: &str = r#"
CREATE TABLE IF NOT EXISTS store
(
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
)
"#;

/// `stream` is the authoritative source for the next unused offset of each
/// stream.
///
/// Appends take the write lock and update `next`, which serializes
/// concurrent appends to the same stream and is what makes checked appends'
/// optimistic-concurrency test sound. The ε-stream appears here as the row
/// with the empty name.
///
/// Stream names and offsets are de-normalized into `fact` rather than
/// related to this table, so `fact` can be read (or archived) without it.
const CREATE_STREAM: &str = r#"
CREATE TABLE IF NOT EXISTS stream
(
    store_id INTEGER NOT NULL,
    name     TEXT NOT NULL,
    next     INTEGER NOT NULL,

    PRIMARY KEY (store_id, name)
)
"#;

/// `event` contains application-defined event data.
///
/// Events are immutable once committed; no update or delete path exists in
/// the store. `time` is the commit timestamp in microseconds since the Unix
/// epoch, assigned from the writer's clock.
const CREATE_EVENT: &str = r#"
CREATE TABLE IF NOT EXISTS event
(
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    time         INTEGER NOT NULL,
    store_id     INTEGER NOT NULL,
    event_type   TEXT NOT NULL,
    content_type TEXT NOT NULL,
    body         BLOB NOT NULL
)
"#;

/// Index supporting time-ranged archival of old events.
const CREATE_EVENT_TIME_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS event_time ON event (time)
"#;

/// `fact` maps `(store, stream, offset)` to events.
///
/// Every event appended by a client appears on both the named stream it was
/// appended to and on the store's ε-stream.
const CREATE_FACT: &str = r#"
CREATE TABLE IF NOT EXISTS fact
(
    store_id INTEGER NOT NULL,
    stream   TEXT NOT NULL,
    "offset" INTEGER NOT NULL,
    event_id INTEGER NOT NULL,
    time     INTEGER NOT NULL
)
"#;

/// The reader's polling query: `WHERE store_id = ? AND stream = ? AND
/// "offset" >= ? ORDER BY "offset"`.
const CREATE_FACT_STREAM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS fact_stream ON fact (store_id, stream, "offset")
"#;

/// Index supporting time-ranged archival of old facts.
const CREATE_FACT_TIME_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS fact_time ON fact (time)
"#;

/// `human_view` is a human-readable, chronological report of facts for
/// operators, excluding those on the ε-stream.
const CREATE_HUMAN_VIEW: &str = r#"
CREATE VIEW IF NOT EXISTS human_view AS
    SELECT
        o.name AS store,
        f.time,
        f.stream,
        f."offset",
        e.event_type,
        e.content_type,
        e.body
    FROM store AS o
    INNER JOIN fact AS f
        ON f.store_id = o.id
    INNER JOIN event AS e
        ON e.id = f.event_id
    WHERE f.stream != ''
    ORDER BY o.name, e.time, f.stream, f."offset"
"#;

// =============================================================================
// Bootstrap
// =============================================================================

/// Creates the store schema on the given connection.
///
/// Idempotent: every statement is guarded with `IF NOT EXISTS`, so racing
/// clients can bootstrap the same database concurrently.
pub fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_STORE)?;
    conn.execute_batch(CREATE_STREAM)?;
    conn.execute_batch(CREATE_EVENT)?;
    conn.execute_batch(CREATE_EVENT_TIME_INDEX)?;
    conn.execute_batch(CREATE_FACT)?;
    conn.execute_batch(CREATE_FACT_STREAM_INDEX)?;
    conn.execute_batch(CREATE_FACT_TIME_INDEX)?;
    conn.execute_batch(CREATE_HUMAN_VIEW)?;

    Ok(())
}

/// Opens the read-write connection used by a client's writer thread, applies
/// the connection configuration, and bootstraps the schema.
///
/// WAL mode lets readers see a consistent snapshot while the writer commits;
/// `synchronous = NORMAL` syncs the WAL on commit rather than on every
/// write, which is the usual WAL-mode pairing.
pub(crate) fn open_writer(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    bootstrap(&conn)?;

    Ok(conn)
}

/// Opens the read-only connection owned by a reader's polling thread.
///
/// Readers never use the writer's connection; each poller owns its own
/// read-only handle so polling cannot contend with appends for anything but
/// the WAL itself.
pub(crate) fn open_reader(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(conn)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(count, 4, "expected store, stream, event and fact tables");
    }

    #[test]
    fn bootstrap_creates_indexes_and_view() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();

        let indexes: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master
                     WHERE type = 'index' AND name NOT LIKE 'sqlite_%'",
                )
                .unwrap();

            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .collect::<std::result::Result<_, _>>()
                .unwrap()
        };

        assert!(indexes.contains(&"fact_stream".to_string()));
        assert!(indexes.contains(&"fact_time".to_string()));
        assert!(indexes.contains(&"event_time".to_string()));

        let views: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view' AND name = 'human_view'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(views, 1);
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();
        bootstrap(&conn).unwrap();

        // Still usable after the second pass.
        conn.execute("INSERT INTO store (name) VALUES ('test')", [])
            .unwrap();
    }

    #[test]
    fn fact_offset_column_is_usable() {
        // "offset" is an SQL keyword; make sure the quoting in the DDL and
        // the canonical queries agree.
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();

        conn.execute(
            r#"INSERT INTO fact (store_id, stream, "offset", event_id, time)
               VALUES (1, 's', 0, 1, 0)"#,
            [],
        )
        .unwrap();

        let offset: i64 = conn
            .query_row(
                r#"SELECT "offset" FROM fact WHERE store_id = 1 AND stream = 's'"#,
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(offset, 0);
    }
}
