//! # riptide: Ordered Event Streaming over an Append-Only SQLite Log
//!
//! riptide turns an ordered-but-gap-prone sequence of rows in a SQLite table
//! into a reliable, low-latency, in-order event stream. Producers insert
//! events inside their own business transactions; consumers subscribe as
//! long-lived streams that deliver every event in commit order and survive
//! restarts via an opaque cursor.
//!
//! ## Read Path
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌───────────┐   ┌──────────────┐
//! │ StreamClient │──►│ Noop Filter │──►│ ReadCache │──►│ Gap Detector │──┐
//! └──────┬───────┘   └─────────────┘   └───────────┘   └──────────────┘  │
//!        │ wake-up                        (optional)          │ side     ▼
//!        ▼                                                    ▼   ┌────────────┐
//! ┌──────────────┐                                     gap channel │ BaseLoader │
//! │   Notifier   │◄── NotifyHandle (producer, post-commit)        └─────┬──────┘
//! └──────────────┘                                                      ▼
//!                                                                    SQLite
//! ```
//!
//! Results flow back unchanged except that the gap detector may side-effect
//! its channel, the cache may serve from memory, and the noop filter may
//! drop sentinel rows.
//!
//! ## Core Invariants
//!
//! 1. **Monotonic delivery**: a stream client returns strictly ascending ids.
//! 2. **Completeness**: every committed non-noop event after the cursor is
//!    delivered exactly once per client.
//! 3. **Consecutive suffix**: cached ids are strictly consecutive and form a
//!    suffix of the log head.
//! 4. **Non-blocking producers**: neither gap reporting nor notification can
//!    ever stall an inserting transaction.
//!
//! ## Example
//!
//! ```rust,ignore
//! use riptide::{Database, EventsTable, EventType, StreamOptions};
//!
//! #[tokio::main]
//! async fn main() -> riptide::Result<()> {
//!     let table = EventsTable::builder("events")
//!         .with_cache_enabled()
//!         .with_in_mem_notifier()
//!         .build();
//!
//!     let db = Database::open("events.db")?;
//!     db.create_events_table(table.schema())?;
//!
//!     // Producer: insert inside a transaction, notify after commit.
//!     let mut conn = Database::open("events.db")?.into_connection();
//!     let tx = conn.transaction()?;
//!     let notify = table.insert(&tx, "account-1", EventType::from_raw(1))?;
//!     tx.commit()?;
//!     notify.notify();
//!
//!     // Consumer: stream from the beginning.
//!     let conn = Database::open("events.db")?.into_connection();
//!     let mut stream = table.stream(conn, "", StreamOptions::default());
//!     let event = stream.recv().await?;
//!     println!("event {} for {}", event.id, event.foreign_id);
//!     Ok(())
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for riptide operations.
pub mod error;

/// Events table DDL, configurable column names, and database initialization.
pub mod schema;

/// Domain types: event ids, events, cursors, gaps.
pub mod types;

/// The loader trait, SQL base loader, and noop filter.
pub mod loader;

/// Read-through cache for the head of the log.
mod cache;

/// Gap detection and listener fan-out.
mod gap;

/// Wake-up signaling between the insert path and stream clients.
pub mod notifier;

/// The per-consumer stream client.
pub mod stream;

/// The events table: composition root, insert path, stream construction.
pub mod table;

/// Prometheus metrics.
mod metrics;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{Error, Result};
pub use loader::{BaseLoader, LoadResult, Loader};
pub use notifier::{EventSignal, EventsNotifier, InMemNotifier, StubNotifier};
pub use schema::{Database, EventsSchema};
pub use stream::{StreamClient, StreamOptions};
pub use table::{EventsTable, EventsTableBuilder, NotifyHandle};
pub use types::{Event, EventId, EventType, Gap};
