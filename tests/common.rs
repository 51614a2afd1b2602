#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use riptide::{Database, EventsTable, EventType};
use rusqlite::{params, Connection};

/// Creates a temp database file with the table's schema applied.
pub fn create_temp_db(table: &EventsTable, name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let db = Database::open(&path).expect("initialize database");
    db.create_events_table(table.schema())
        .expect("create events table");
    (dir, path)
}

pub fn open(path: &Path) -> Connection {
    Database::open(path)
        .expect("open connection")
        .into_connection()
}

/// Inserts one event per foreign id through the public insert path,
/// committing and notifying after each.
pub fn insert_events(table: &EventsTable, path: &Path, foreign_ids: &[&str]) {
    let mut conn = open(path);
    for fid in foreign_ids {
        let tx = conn.transaction().expect("begin transaction");
        let notify = table
            .insert(&tx, fid, EventType::from_raw(1))
            .expect("insert event");
        tx.commit().expect("commit transaction");
        notify.notify();
    }
}

/// Inserts a row with an explicit id, bypassing the public insert path.
/// Lets tests fabricate gaps (skipped ids) and sentinel rows.
pub fn insert_raw(path: &Path, table_name: &str, id: i64, foreign_id: &str, event_type: i64) {
    let conn = open(path);
    conn.execute(
        &format!("INSERT INTO {table_name} (id, foreign_id, type) VALUES (?1, ?2, ?3)"),
        params![id, foreign_id, event_type],
    )
    .expect("raw insert");
}

/// Polls `f` until it returns `Some`, or panics after `timeout`.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Reads a counter from the default prometheus registry for one table label.
pub fn counter_value(name: &str, table: &str) -> u64 {
    for family in prometheus::gather() {
        if family.get_name() != name {
            continue;
        }
        for metric in family.get_metric() {
            let matches = metric
                .get_label()
                .iter()
                .any(|l| l.get_name() == "table_name" && l.get_value() == table);
            if matches {
                return metric.get_counter().get_value() as u64;
            }
        }
    }
    0
}
