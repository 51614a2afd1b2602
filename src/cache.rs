//! # Read-Through Cache
//!
//! Serves the hot head of the log to many concurrent stream clients without
//! hammering the database.
//!
//! ## Shape
//!
//! The cache is an in-memory run of events whose ids are strictly
//! consecutive, forming a *suffix* of the log:
//!
//! ```text
//!            log:  1  2  3  ·  5  6  7  8  9      (4 never committed)
//!                                ┌──────────────┐
//!          cache:                │ 5  6  7  8  9 │  consecutive suffix
//!                                └──────────────┘
//!                                  head        tail
//! ```
//!
//! Invariant: for adjacent cached entries, `cache[i+1].id == cache[i].id + 1`.
//! The update rules below preserve it: adopt a batch into an empty cache,
//! append a batch that starts at `tail + 1`, reset on a batch past the tail,
//! ignore a batch that overlaps (a reader far behind the suffix read through;
//! the cache is already ahead of it).
//!
//! ## Concurrency
//!
//! A single reader/writer lock guards the whole cache. Many clients share
//! the fast path under the read lock; a miss takes the write lock, re-checks
//! (another client may have populated the cache while it waited), and only
//! then reads through to the database. The coarse lock is single-flight in
//! effect: the cache has one logical key (the log head) and contention only
//! occurs on the miss path.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::loader::{next_cursor, LoadResult, Loader};
use crate::metrics;
use crate::types::{now_ms, Event, EventId};

/// Default maximum number of cached events.
pub(crate) const DEFAULT_CACHE_LIMIT: usize = 10_000;

// =============================================================================
// Read Cache
// =============================================================================

/// Read-through cache for the head of one events table.
///
/// Implements [`Loader`] so it slots into the composed read path between the
/// noop filter and the gap detector; both of those need the raw consecutive
/// id sequence, and so does the cache itself.
pub(crate) struct ReadCache {
    cache: RwLock<VecDeque<Event>>,
    loader: Arc<dyn Loader>,
    name: String,
    limit: usize,
}

impl ReadCache {
    pub(crate) fn new(loader: Arc<dyn Loader>, name: String, limit: usize) -> Self {
        Self {
            cache: RwLock::new(VecDeque::new()),
            loader,
            name,
            limit,
        }
    }

    /// Exclusive path: re-check, then load from the database and fold the
    /// batch into the cache.
    fn read_through(
        &self,
        conn: &Connection,
        after: EventId,
        lag: Duration,
    ) -> Result<LoadResult> {
        let mut cache = self.cache.write().expect("cache lock poisoned");

        // Another client may have populated the cache while we waited.
        if let Some(events) = maybe_hit(&cache, after.next(), lag) {
            metrics::RCACHE_HITS.with_label_values(&[&self.name]).inc();
            let next = next_cursor(&events, after);
            return Ok(LoadResult { events, next });
        }

        metrics::RCACHE_MISSES.with_label_values(&[&self.name]).inc();
        let res = self.loader.load(conn, after, lag)?;
        if res.events.is_empty() {
            return Ok(LoadResult::empty(after));
        }

        // The consecutive-suffix invariant depends on the loader's contract;
        // verify it before letting the batch anywhere near the cache.
        for pair in res.events.windows(2) {
            if pair[1].id != pair[0].id.next() {
                return Err(Error::ConsecEvent);
            }
        }
        if let Some(last) = res.events.last() {
            if res.next != last.id {
                return Err(Error::NextCursorMismatch);
            }
        }

        maybe_update(&mut cache, &res.events, &self.name);
        maybe_trim(&mut cache, self.limit);

        Ok(res)
    }
}

impl Loader for ReadCache {
    fn load(&self, conn: &Connection, after: EventId, lag: Duration) -> Result<LoadResult> {
        {
            let cache = self.cache.read().expect("cache lock poisoned");
            if let Some(events) = maybe_hit(&cache, after.next(), lag) {
                metrics::RCACHE_HITS.with_label_values(&[&self.name]).inc();
                let next = next_cursor(&events, after);
                return Ok(LoadResult { events, next });
            }
        }

        self.read_through(conn, after, lag)
    }
}

// =============================================================================
// Cache Operations
// =============================================================================

fn head_id(cache: &VecDeque<Event>) -> EventId {
    cache.front().map(|e| e.id).unwrap_or(EventId::ZERO)
}

fn tail_id(cache: &VecDeque<Event>) -> EventId {
    cache.back().map(|e| e.id).unwrap_or(EventId::ZERO)
}

/// Returns the cached events from `from` (inclusive), or `None` on a miss.
///
/// A hit with a non-zero lag walks forward from the offset and stops at the
/// first too-new event, so it may legally return an empty slice: the
/// requested range is cached but still inside the lag window. The caller
/// then backs off with its cursor unchanged.
fn maybe_hit(cache: &VecDeque<Event>, from: EventId, lag: Duration) -> Option<Vec<Event>> {
    if cache.is_empty() || from < head_id(cache) || from > tail_id(cache) {
        return None;
    }

    let offset = (from.as_raw() - head_id(cache).as_raw()) as usize;

    if lag.is_zero() {
        return Some(cache.iter().skip(offset).cloned().collect());
    }

    let cutoff = now_ms() - lag.as_millis() as i64;
    let mut res = Vec::new();
    for event in cache.iter().skip(offset) {
        if event.timestamp_ms > cutoff {
            // Events too new.
            break;
        }
        res.push(event.clone());
    }
    Some(res)
}

/// Folds a validated batch into the cache.
fn maybe_update(cache: &mut VecDeque<Event>, batch: &[Event], name: &str) {
    let Some(first) = batch.first() else {
        return;
    };

    // If empty, adopt.
    if cache.is_empty() {
        cache.extend(batch.iter().cloned());
        return;
    }

    let tail = tail_id(cache);

    // If there is a hole between tail and batch head, the intermediate range
    // can no longer be served from memory; start fresh at the new head.
    if first.id > tail.next() {
        tracing::debug!(
            table = %name,
            tail = tail.as_raw(),
            batch_head = first.id.as_raw(),
            "cache reset past gap"
        );
        cache.clear();
        cache.extend(batch.iter().cloned());
        return;
    }

    // If consecutive, append.
    if first.id == tail.next() {
        cache.extend(batch.iter().cloned());
        return;
    }

    // Overlap: a reader behind the suffix read through; the cache is
    // already ahead. Ignore.
}

fn maybe_trim(cache: &mut VecDeque<Event>, limit: usize) {
    while cache.len() > limit {
        cache.pop_front();
    }
}

// =============================================================================
// Tests
// =============================================================================
