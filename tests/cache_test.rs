mod common;

use std::sync::Arc;
use std::time::Duration;

use riptide::{Event, EventsTable, StreamOptions};
use tokio::sync::Barrier;

fn cached_table(name: &str) -> EventsTable {
    EventsTable::builder(name)
        .with_cache_enabled()
        .with_backoff(Duration::from_millis(50))
        .build()
}

async fn recv_n(table: &EventsTable, path: &std::path::Path, count: usize) -> Vec<Event> {
    let mut stream = table.stream(common::open(path), "", StreamOptions::default());
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        events.push(stream.recv().await.unwrap());
    }
    events
}

#[tokio::test]
async fn concurrent_clients_share_one_database_read() {
    let table = Arc::new(cached_table("events_singleflight"));
    let (_dir, path) = common::create_temp_db(&table, "singleflight.db");

    common::insert_events(&table, &path, &["a", "b", "c", "d", "e"]);

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let table = Arc::clone(&table);
        let path = path.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            recv_n(&table, &path, 5).await
        }));
    }

    let first = handles.remove(0).await.unwrap();
    let second = handles.remove(0).await.unwrap();

    // Both clients see the same five events in the same order.
    assert_eq!(first, second);
    let ids: Vec<i64> = first.iter().map(|e| e.id.as_raw()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    // Exactly one read-through happened; the other client hit memory.
    let misses = common::counter_value("riptide_rcache_misses_total", "events_singleflight");
    let hits = common::counter_value("riptide_rcache_hits_total", "events_singleflight");
    assert_eq!(misses, 1, "single-flight: one database read");
    assert_eq!(hits, 1, "the other client observes a cache hit");
}

#[tokio::test]
async fn sequential_clients_hit_the_warm_cache() {
    let table = cached_table("events_warm");
    let (_dir, path) = common::create_temp_db(&table, "warm.db");

    common::insert_events(&table, &path, &["a", "b", "c"]);

    let warmup = recv_n(&table, &path, 3).await;
    let misses_after_warmup = common::counter_value("riptide_rcache_misses_total", "events_warm");

    for _ in 0..3 {
        let events = recv_n(&table, &path, 3).await;
        assert_eq!(events, warmup);
    }

    assert_eq!(
        common::counter_value("riptide_rcache_misses_total", "events_warm"),
        misses_after_warmup,
        "warm reads must not touch the database"
    );
    assert!(common::counter_value("riptide_rcache_hits_total", "events_warm") >= 3);
}

#[tokio::test]
async fn cache_appends_across_inserts() {
    let table = cached_table("events_append");
    let (_dir, path) = common::create_temp_db(&table, "append.db");

    common::insert_events(&table, &path, &["a", "b"]);
    let mut stream = table.stream(common::open(&path), "", StreamOptions::default());
    assert_eq!(stream.recv().await.unwrap().id.as_raw(), 1);
    assert_eq!(stream.recv().await.unwrap().id.as_raw(), 2);

    // New events extend the cached suffix; a fresh client replays the whole
    // run from memory plus one read-through for the tail.
    common::insert_events(&table, &path, &["c", "d"]);
    assert_eq!(stream.recv().await.unwrap().id.as_raw(), 3);
    assert_eq!(stream.recv().await.unwrap().id.as_raw(), 4);

    let replay = recv_n(&table, &path, 4).await;
    let ids: Vec<i64> = replay.iter().map(|e| e.id.as_raw()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn poll_counter_tracks_loader_calls() {
    let table = cached_table("events_poll");
    let (_dir, path) = common::create_temp_db(&table, "poll.db");

    common::insert_events(&table, &path, &["a"]);
    let before = common::counter_value("riptide_events_poll_total", "events_poll");

    recv_n(&table, &path, 1).await;
    let after = common::counter_value("riptide_events_poll_total", "events_poll");
    assert!(after > before);
}
