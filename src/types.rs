//! # Domain Types
//!
//! Core types for the event log: ids, event records, cursors, and gaps.
//!
//! ## Invariants
//!
//! - [`EventId`]: assigned by the database's auto-increment sequence, strictly
//!   increasing, never reused. Gaps are possible (rolled-back transactions).
//! - An event with id `N` exists ⇒ every id below `N` that will ever exist is
//!   already committed or will never commit. Readers rely on this to treat a
//!   batch `[K+1..M]` as a complete prefix.
//! - The noop sentinel (`foreign_id == "0"`, `type == 0`) is a real row that
//!   allocates an id but is never delivered to consumers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

// =============================================================================
// Event Ids and Cursors
// =============================================================================

/// A position in the event log.
///
/// `EventId` doubles as the cursor type: the cursor of a stream is the id of
/// the last delivered event, and `EventId::ZERO` means "from the beginning".
/// On the wire a cursor is the base-10 string of the id, with the empty
/// string standing in for zero; [`EventId::from_cursor`] and
/// [`EventId::cursor`] convert between the two representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(i64);

impl EventId {
    /// The cursor meaning "before the first event".
    pub const ZERO: EventId = EventId(0);

    /// Creates an `EventId` from a raw database value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw i64 value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// Returns the next id in the sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Parses an opaque cursor string.
    ///
    /// The empty string means "from the beginning". Anything else must be a
    /// base-10 signed 64-bit integer.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidIntId`] if the string is non-empty and not an integer.
    pub fn from_cursor(cursor: &str) -> Result<Self> {
        if cursor.is_empty() {
            return Ok(Self::ZERO);
        }
        cursor
            .parse::<i64>()
            .map(Self)
            .map_err(|_| Error::InvalidIntId)
    }

    /// Returns the opaque cursor string for this id.
    pub fn cursor(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Event Types
// =============================================================================

/// The application-defined classification of an event.
///
/// Type `0` is reserved: together with foreign id `"0"` it marks the noop
/// sentinel used to force id allocation without creating a consumer-visible
/// event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType(i64);

impl EventType {
    /// The reserved noop type.
    pub const NOOP: EventType = EventType(0);

    /// Creates an `EventType` from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw i64 value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl From<i64> for EventType {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// The foreign id of the noop sentinel.
pub(crate) const NOOP_FOREIGN_ID: &str = "0";

/// A committed row in an events table.
///
/// Events are immutable once committed. `timestamp_ms` is assigned by the
/// database at insert time (Unix milliseconds), which keeps the lag window
/// comparison on a single clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Position in the log, assigned by the database sequence.
    pub id: EventId,

    /// Commit wall-clock instant in Unix milliseconds, database-assigned.
    pub timestamp_ms: i64,

    /// Application-defined event type. `0` only for the noop sentinel.
    pub event_type: EventType,

    /// Opaque identifier of the domain entity this event belongs to.
    pub foreign_id: String,

    /// Optional opaque payload. Only populated when the table has a
    /// metadata column configured.
    pub metadata: Option<Vec<u8>>,
}

impl Event {
    /// Returns true if this is the noop sentinel row.
    pub fn is_noop(&self) -> bool {
        is_noop(&self.foreign_id, self.event_type)
    }
}

/// Returns true if the pair marks the noop sentinel.
pub(crate) fn is_noop(foreign_id: &str, event_type: EventType) -> bool {
    foreign_id == NOOP_FOREIGN_ID && event_type == EventType::NOOP
}

// =============================================================================
// Gaps
// =============================================================================

/// A hole in the id sequence observed by the gap detector.
///
/// `prev` is the cursor the reader held and `next` the first id actually
/// returned, with `next > prev + 1`. The ids strictly between the two were
/// allocated by transactions that may never commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Last id known to exist before the hole.
    pub prev: EventId,

    /// First id known to exist after the hole.
    pub next: EventId,
}

// =============================================================================
// Clock
// =============================================================================

/// Current Unix time in milliseconds on the process clock.
///
/// Only the cache's lag comparison uses the process clock; SQL predicates use
/// the database's own clock. The two agree because SQLite is embedded.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
