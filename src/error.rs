//! # Error Handling
//!
//! A single [`Error`] enum covers every failure mode in the crate, which
//! keeps caller-side matching simple.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Input validation | `InvalidIntId`, `NoopInsert` | Fix the input, never retry |
//! | Protocol violation | `ConsecEvent`, `NextCursorMismatch` | Fatal to the stream |
//! | Transient I/O | `Sqlite` | Caller's retry policy decides |
//! | Cancellation | `Cancelled` | Shutdown, not failure |
//! | Setup | `Schema` | Fix configuration |
//!
//! Gaps in the id sequence are deliberately *not* an error; they are reported
//! on a side channel (see [`crate::types::Gap`]) and the stream proceeds.
//!
//! No layer transforms errors on the way up: the noop filter and gap detector
//! pass them through verbatim, and the cache only adds its two protocol
//! variants.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in riptide operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A stream was opened with a cursor that is not a base-10 integer.
    ///
    /// Cursors are opaque strings at the boundary, but this implementation
    /// only understands the base-10 form of an event id (or the empty string
    /// for "from the beginning"). Never retried.
    #[error("invalid cursor: not an integer event id")]
    InvalidIntId,

    /// A loader returned a batch whose ids are not strictly consecutive.
    ///
    /// The read-through cache depends on batches being a gapless run of ids;
    /// the gap detector below it guarantees this for the SQL base loader, so
    /// a violation means a buggy custom loader or schema corruption. Fatal to
    /// the stream.
    #[error("loader returned non-consecutive event ids")]
    ConsecEvent,

    /// A loader's reported next cursor disagrees with its last event id.
    ///
    /// Same severity as [`Error::ConsecEvent`]: the cursor the cache would
    /// hand out no longer describes the cached suffix. Fatal to the stream.
    #[error("loader next cursor does not match last event id")]
    NextCursorMismatch,

    /// An insert was attempted with the reserved noop sentinel values.
    ///
    /// Noop rows (`foreign_id == "0"`, `type == 0`) are allocated internally
    /// to fill id gaps; producers may not insert them.
    #[error("inserting invalid noop event")]
    NoopInsert,

    /// The stream's cancellation token fired.
    ///
    /// Propagated verbatim so callers can distinguish shutdown from failure.
    #[error("stream cancelled")]
    Cancelled,

    /// SQLite operation failed.
    ///
    /// Wraps any `rusqlite` error: locked database file, full disk, syntax
    /// errors from misconfigured column names. Surfaced verbatim; the
    /// consumer loop's retry policy decides what to do.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Table configuration problem.
    ///
    /// For example inserting metadata into a table with no metadata column
    /// configured.
    #[error("schema error: {0}")]
    Schema(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
