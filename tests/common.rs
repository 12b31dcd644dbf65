#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use gospel::{Client, Event, EventStore, Reader};

/// Opens a client against a fresh temp-file database.
///
/// The temp dir must be kept alive for the duration of the test.
pub async fn open_client(name: &str) -> (tempfile::TempDir, Client) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path: PathBuf = dir.path().join(name);

    let client = Client::open(&path, []).await.expect("open client");
    (dir, client)
}

/// Opens a client and a store named "test" in one step.
pub async fn open_store(name: &str) -> (tempfile::TempDir, Client, EventStore) {
    let (dir, client) = open_client(name).await;
    let store = client.open_store("test").await.expect("open store");
    (dir, client, store)
}

/// A plain-text event.
pub fn event(event_type: &str, body: &str) -> Event {
    Event::new(event_type, "text/plain", body.as_bytes().to_vec())
}

/// Collects the next `n` facts from a reader, bounded by a timeout.
pub async fn collect(reader: &mut Reader, n: usize) -> Vec<gospel::Fact> {
    let mut facts = Vec::with_capacity(n);

    for i in 0..n {
        tokio::time::timeout(Duration::from_secs(10), reader.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for fact {i}"))
            .expect("reader failed");
        facts.push(reader.get().clone());
    }

    facts
}

/// Asserts that the reader reports end-of-stream (rather than another fact)
/// within a timeout.
pub async fn assert_at_end(reader: &mut Reader) {
    let outcome = tokio::time::timeout(Duration::from_secs(10), reader.try_next())
        .await
        .expect("timed out waiting for end of stream")
        .expect("reader failed");

    assert!(outcome.is_none(), "expected end of stream, got a fact");
}
