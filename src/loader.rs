//! # Event Loaders
//!
//! A [`Loader`] turns a cursor into the next batch of events. The read path
//! is a stack of loaders composed at table construction:
//!
//! ```text
//! StreamClient → NoopFilter → ReadCache? → GapDetector → BaseLoader → SQLite
//! ```
//!
//! This module holds the trait, the SQL base loader, and the noop filter.
//! The gap detector and cache layers live in [`crate::gap`] and
//! [`crate::cache`].
//!
//! ## Contract
//!
//! Every loader returns events with `id > after` in ascending id order, up to
//! a bounded batch size, and a `next` cursor equal to the last returned id or
//! to `after` when the batch is empty. When `lag` is non-zero, only events
//! older than `now - lag` are eligible; the base loader evaluates that cutoff
//! on the database's own clock.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::schema::EventsSchema;
use crate::types::{Event, EventId, EventType};

/// Default maximum number of events per loader call.
pub(crate) const DEFAULT_LOAD_LIMIT: usize = 1000;

// =============================================================================
// Loader Trait
// =============================================================================

/// One batched read of the event log.
#[derive(Debug, Clone)]
pub struct LoadResult {
    /// Events with `id > after`, ascending.
    pub events: Vec<Event>,

    /// Cursor to resume from: the last returned id, or the request's `after`
    /// when `events` is empty.
    pub next: EventId,
}

impl LoadResult {
    /// An empty result that leaves the cursor where it was.
    pub fn empty(after: EventId) -> Self {
        Self {
            events: Vec::new(),
            next: after,
        }
    }
}

/// Loads batches of events strictly after a cursor.
///
/// Implementations must uphold the contract in the module docs; the cache
/// layer actively verifies it and fails the stream on violations.
pub trait Loader: Send + Sync {
    /// Returns events with `id > after`, subject to the lag window.
    fn load(&self, conn: &Connection, after: EventId, lag: Duration) -> Result<LoadResult>;
}

/// Computes the next cursor for a batch per the loader contract.
pub(crate) fn next_cursor(events: &[Event], after: EventId) -> EventId {
    events.last().map(|e| e.id).unwrap_or(after)
}

// =============================================================================
// Base Loader
// =============================================================================

/// The only loader that talks to the database.
///
/// Issues a single bounded SELECT per call. Rows come back in id order
/// because the table's primary key is the id.
pub struct BaseLoader {
    schema: EventsSchema,
    limit: usize,
}

impl BaseLoader {
    /// Creates a base loader over `schema` with the default batch limit.
    pub fn new(schema: EventsSchema) -> Self {
        Self {
            schema,
            limit: DEFAULT_LOAD_LIMIT,
        }
    }

    fn decode_row(&self, row: &Row<'_>) -> rusqlite::Result<Event> {
        Ok(Event {
            id: EventId::from_raw(row.get(0)?),
            timestamp_ms: row.get(1)?,
            event_type: EventType::from_raw(row.get(2)?),
            foreign_id: row.get(3)?,
            metadata: if self.schema.has_metadata() {
                row.get(4)?
            } else {
                None
            },
        })
    }
}

impl Loader for BaseLoader {
    fn load(&self, conn: &Connection, after: EventId, lag: Duration) -> Result<LoadResult> {
        let lagged = !lag.is_zero();
        let mut stmt = conn.prepare_cached(self.schema.select_sql(lagged))?;

        let mut events = Vec::new();
        if lagged {
            let rows = stmt.query_map(
                params![after.as_raw(), lag.as_millis() as i64, self.limit as i64],
                |row| self.decode_row(row),
            )?;
            for event in rows {
                events.push(event?);
            }
        } else {
            let rows = stmt.query_map(params![after.as_raw(), self.limit as i64], |row| {
                self.decode_row(row)
            })?;
            for event in rows {
                events.push(event?);
            }
        }

        let next = next_cursor(&events, after);
        Ok(LoadResult { events, next })
    }
}

// =============================================================================
// Noop Filter
// =============================================================================

/// Outermost loader layer; consumers never see noop sentinel rows.
///
/// Drops noops from the batch but leaves `next` untouched, so the cursor
/// still advances past the skipped ids. Sits above the cache and gap
/// detector, which both need the raw id sequence (noops are real rows and
/// fill gaps).
pub(crate) struct NoopFilter {
    inner: Arc<dyn Loader>,
}

impl NoopFilter {
    pub(crate) fn new(inner: Arc<dyn Loader>) -> Self {
        Self { inner }
    }
}

impl Loader for NoopFilter {
    fn load(&self, conn: &Connection, after: EventId, lag: Duration) -> Result<LoadResult> {
        let mut res = self.inner.load(conn, after, lag)?;
        res.events.retain(|e| !e.is_noop());
        Ok(res)
    }
}

// =============================================================================
// Head Query
// =============================================================================

/// Returns the id of the newest event, or [`EventId::ZERO`] on an empty
/// table. Used to initialize from-head streams.
pub(crate) fn latest_id(conn: &Connection, schema: &EventsSchema) -> Result<EventId> {
    let id: i64 = conn.query_row(schema.latest_sql(), [], |row| row.get(0))?;
    Ok(EventId::from_raw(id))
}

// =============================================================================
// Tests
// =============================================================================
