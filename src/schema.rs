//! # Events Table Schema
//!
//! DDL and SQL text for an events table, plus a small [`Database`] wrapper
//! for opening and initializing SQLite files.
//!
//! ## Table Shape
//!
//! ```text
//! <name>
//! ┌──────────────┬─────────────────────────────────────────────────────┐
//! │ id           │ INTEGER PRIMARY KEY AUTOINCREMENT                   │
//! │ <time>       │ INTEGER NOT NULL, Unix ms, database-assigned        │
//! │ <type>       │ INTEGER NOT NULL                                    │
//! │ <foreign_id> │ TEXT NOT NULL                                       │
//! │ [<metadata>] │ BLOB, only when configured                          │
//! └──────────────┴─────────────────────────────────────────────────────┘
//! ```
//!
//! Column names are configurable per table; the `id` column is not, since
//! every layer of the read path depends on its auto-increment semantics.
//! The metadata column is absent unless a name is configured for it.
//!
//! All SQL text is rendered once at construction so the hot read path only
//! ever hands prepared-statement caches a stable string.

use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

// =============================================================================
// Defaults
// =============================================================================

/// Default name of the event timestamp column.
pub(crate) const DEFAULT_TIME_FIELD: &str = "timestamp_ms";

/// Default name of the event type column.
pub(crate) const DEFAULT_TYPE_FIELD: &str = "type";

/// Default name of the foreign id column.
pub(crate) const DEFAULT_FOREIGN_ID_FIELD: &str = "foreign_id";

/// SQLite expression for the current Unix time in milliseconds.
///
/// Evaluated by the database at insert time and inside the lag predicate, so
/// the timestamp a row gets and the cutoff it is compared against come from
/// the same clock.
const NOW_MS_EXPR: &str = "CAST(unixepoch('subsec') * 1000 AS INTEGER)";

// =============================================================================
// Events Schema
// =============================================================================

/// The SQL shape of one events table.
///
/// Holds the configured table and column names together with every SQL
/// statement the crate issues against the table.
#[derive(Debug, Clone)]
pub struct EventsSchema {
    name: String,
    time_field: String,
    type_field: String,
    foreign_id_field: String,
    metadata_field: Option<String>,

    ddl: String,
    select_sql: String,
    select_lagged_sql: String,
    insert_sql: String,
    insert_noop_sql: String,
    latest_sql: String,
}

impl EventsSchema {
    /// Builds the schema and renders all SQL text.
    pub(crate) fn new(
        name: String,
        time_field: String,
        type_field: String,
        foreign_id_field: String,
        metadata_field: Option<String>,
    ) -> Self {
        let meta_col = metadata_field
            .as_ref()
            .map(|m| format!(",\n    {m}      BLOB"))
            .unwrap_or_default();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {name} (\n\
             \x20   id      INTEGER PRIMARY KEY AUTOINCREMENT,\n\
             \x20   {time_field} INTEGER NOT NULL DEFAULT ({NOW_MS_EXPR}),\n\
             \x20   {type_field}    INTEGER NOT NULL,\n\
             \x20   {foreign_id_field}      TEXT NOT NULL{meta_col}\n\
             )"
        );

        let cols = match &metadata_field {
            Some(meta) => format!("id, {time_field}, {type_field}, {foreign_id_field}, {meta}"),
            None => format!("id, {time_field}, {type_field}, {foreign_id_field}"),
        };
        let select_sql = format!(
            "SELECT {cols} FROM {name} WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
        );
        let select_lagged_sql = format!(
            "SELECT {cols} FROM {name} \
             WHERE id > ?1 AND {time_field} < {NOW_MS_EXPR} - ?2 \
             ORDER BY id ASC LIMIT ?3"
        );

        let insert_sql = match &metadata_field {
            Some(meta) => format!(
                "INSERT INTO {name} ({foreign_id_field}, {type_field}, {meta}) VALUES (?1, ?2, ?3)"
            ),
            None => format!(
                "INSERT INTO {name} ({foreign_id_field}, {type_field}) VALUES (?1, ?2)"
            ),
        };
        let insert_noop_sql = format!(
            "INSERT OR IGNORE INTO {name} (id, {foreign_id_field}, {type_field}) VALUES (?1, '0', 0)"
        );
        let latest_sql = format!("SELECT COALESCE(MAX(id), 0) FROM {name}");

        Self {
            name,
            time_field,
            type_field,
            foreign_id_field,
            metadata_field,
            ddl,
            select_sql,
            select_lagged_sql,
            insert_sql,
            insert_noop_sql,
            latest_sql,
        }
    }

    /// The events table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a metadata column is configured.
    pub fn has_metadata(&self) -> bool {
        self.metadata_field.is_some()
    }

    /// The `CREATE TABLE IF NOT EXISTS` statement for this table.
    pub fn ddl(&self) -> &str {
        &self.ddl
    }

    pub(crate) fn time_field(&self) -> &str {
        &self.time_field
    }

    pub(crate) fn type_field(&self) -> &str {
        &self.type_field
    }

    pub(crate) fn foreign_id_field(&self) -> &str {
        &self.foreign_id_field
    }

    pub(crate) fn metadata_field(&self) -> Option<&str> {
        self.metadata_field.as_deref()
    }

    pub(crate) fn select_sql(&self, lagged: bool) -> &str {
        if lagged {
            &self.select_lagged_sql
        } else {
            &self.select_sql
        }
    }

    pub(crate) fn insert_sql(&self) -> &str {
        &self.insert_sql
    }

    pub(crate) fn insert_noop_sql(&self) -> &str {
        &self.insert_noop_sql
    }

    pub(crate) fn latest_sql(&self) -> &str {
        &self.latest_sql
    }
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection wrapper that knows how to initialize events tables.
///
/// `Database` owns its [`Connection`]; dropping it closes the connection.
/// Stream clients each take their own connection (see
/// [`EventsTable::stream`](crate::table::EventsTable::stream)), so the usual
/// pattern is one `Database` per producer or consumer.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating it if necessary.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    /// Creates an in-memory database.
    ///
    /// In-memory databases are private to their connection, so they cannot
    /// be shared between a producer and a separately-connected stream
    /// client. Intended for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Creates the events table for `schema` if it does not exist.
    pub fn create_events_table(&self, schema: &EventsSchema) -> Result<()> {
        self.conn.execute_batch(schema.ddl())?;
        Ok(())
    }

    /// Borrows the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the wrapper, returning the underlying connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
