//! # Events Table
//!
//! [`EventsTable`] ties the crate together: it owns the composed loader
//! stack, the notifier, and the gap listeners for one events table, provides
//! the insert path for producers, and hands out [`StreamClient`]s to
//! consumers.
//!
//! ## Loader Composition
//!
//! Built once per table:
//!
//! ```text
//! noop filter ( cache? ( gap detector ( base loader ) ) )
//! ```
//!
//! - base at the bottom: the only layer that talks to the database;
//! - gap detector above it: needs the raw id sequence (noops are real rows
//!   and fill gaps, so filtering first would cause false reports);
//! - cache above the detector: also needs raw consecutive ids, and caches
//!   whatever passed detection; the side channel fires on the read-through
//!   that first observes a hole, cache hits do not re-fire it;
//! - noop filter outermost: consumers never see noops, but the preserved
//!   next cursor still advances past them.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, Transaction};
use tokio::sync::mpsc;

use crate::cache::{ReadCache, DEFAULT_CACHE_LIMIT};
use crate::error::{Error, Result};
use crate::gap::{GapDetector, GapListeners, GAP_CHANNEL_CAPACITY};
use crate::loader::{BaseLoader, Loader};
use crate::metrics;
use crate::notifier::{EventsNotifier, StubNotifier};
use crate::schema::{
    EventsSchema, DEFAULT_FOREIGN_ID_FIELD, DEFAULT_TIME_FIELD, DEFAULT_TYPE_FIELD,
};
use crate::stream::{StreamClient, StreamOptions, DEFAULT_STREAM_BACKOFF};
use crate::types::{is_noop, EventType, Gap};

// =============================================================================
// Notify Handle
// =============================================================================

/// Deferred notification returned by the insert path.
///
/// The producer calls [`NotifyHandle::notify`] after its transaction
/// commits; calling it before commit would wake consumers into a race
/// against the row's visibility.
pub struct NotifyHandle {
    notifier: Arc<dyn EventsNotifier>,
}

impl NotifyHandle {
    /// Signals the table's notifier.
    pub fn notify(self) {
        self.notifier.notify();
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and builds an [`EventsTable`].
pub struct EventsTableBuilder {
    name: String,
    time_field: String,
    type_field: String,
    foreign_id_field: String,
    metadata_field: Option<String>,
    notifier: Arc<dyn EventsNotifier>,
    backoff: Duration,
    enable_cache: bool,
    cache_limit: usize,
    base_loader: Option<Arc<dyn Loader>>,
}

impl EventsTableBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time_field: DEFAULT_TIME_FIELD.to_string(),
            type_field: DEFAULT_TYPE_FIELD.to_string(),
            foreign_id_field: DEFAULT_FOREIGN_ID_FIELD.to_string(),
            metadata_field: None,
            notifier: Arc::new(StubNotifier),
            backoff: DEFAULT_STREAM_BACKOFF,
            enable_cache: false,
            cache_limit: DEFAULT_CACHE_LIMIT,
            base_loader: None,
        }
    }

    /// Sets the timestamp column name. Defaults to `timestamp_ms`.
    pub fn with_time_field(mut self, field: impl Into<String>) -> Self {
        self.time_field = field.into();
        self
    }

    /// Sets the event type column name. Defaults to `type`.
    pub fn with_type_field(mut self, field: impl Into<String>) -> Self {
        self.type_field = field.into();
        self
    }

    /// Sets the foreign id column name. Defaults to `foreign_id`.
    pub fn with_foreign_id_field(mut self, field: impl Into<String>) -> Self {
        self.foreign_id_field = field.into();
        self
    }

    /// Enables the metadata column under the given name. Disabled by
    /// default; without it, inserts with metadata are rejected.
    pub fn with_metadata_field(mut self, field: impl Into<String>) -> Self {
        self.metadata_field = Some(field.into());
        self
    }

    /// Sets the notifier that wakes waiting stream clients on inserts.
    /// Defaults to the stub notifier (pure polling).
    pub fn with_notifier(mut self, notifier: Arc<dyn EventsNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Uses the in-process notifier.
    ///
    /// Note: with the cache disabled this can put significant load on the
    /// database, since every consumer may poll on every event.
    pub fn with_in_mem_notifier(mut self) -> Self {
        self.notifier = Arc::new(crate::notifier::InMemNotifier::default());
        self
    }

    /// Enables the read-through cache on the composed loader.
    pub fn with_cache_enabled(mut self) -> Self {
        self.enable_cache = true;
        self
    }

    /// Sets the cache size limit. Defaults to 10 000 events.
    pub fn with_cache_limit(mut self, limit: usize) -> Self {
        self.cache_limit = limit;
        self
    }

    /// Sets the backoff between polls when no events are found. Defaults to
    /// 10 seconds.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the SQL base loader. The gap detector, cache, and noop
    /// filter still wrap the custom loader, and its batches must satisfy
    /// the loader contract.
    pub fn with_base_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.base_loader = Some(loader);
        self
    }

    /// Builds the table and composes its loader stack.
    pub fn build(self) -> EventsTable {
        let schema = EventsSchema::new(
            self.name,
            self.time_field,
            self.type_field,
            self.foreign_id_field,
            self.metadata_field,
        );

        let base: Arc<dyn Loader> = match &self.base_loader {
            Some(custom) => Arc::clone(custom),
            None => Arc::new(BaseLoader::new(schema.clone())),
        };

        let (gap_tx, gap_rx) = mpsc::channel(GAP_CHANNEL_CAPACITY);
        let gap_listening = Arc::new(AtomicBool::new(false));
        let mut loader: Arc<dyn Loader> = Arc::new(GapDetector::new(
            base,
            gap_tx,
            Arc::clone(&gap_listening),
            schema.name().to_string(),
        ));
        if self.enable_cache {
            loader = Arc::new(ReadCache::new(
                loader,
                schema.name().to_string(),
                self.cache_limit,
            ));
        }
        let loader: Arc<dyn Loader> = Arc::new(crate::loader::NoopFilter::new(loader));

        // Export the gauge at zero so "no listener" is visible, not absent.
        metrics::GAP_LISTEN
            .with_label_values(&[schema.name()])
            .set(0);

        let gap_listeners = Arc::new(GapListeners::new(
            gap_rx,
            gap_listening,
            schema.name().to_string(),
        ));

        EventsTable {
            schema,
            notifier: self.notifier,
            backoff: self.backoff,
            enable_cache: self.enable_cache,
            cache_limit: self.cache_limit,
            base_loader: self.base_loader,
            loader,
            gap_listeners,
        }
    }
}

// =============================================================================
// Events Table
// =============================================================================

/// Event insertion and streaming for one database table.
///
/// The table is cheap to share behind an `Arc`; every [`StreamClient`] it
/// hands out borrows the same composed loader, so with the cache enabled
/// all clients share one cache.
pub struct EventsTable {
    schema: EventsSchema,
    notifier: Arc<dyn EventsNotifier>,
    backoff: Duration,
    enable_cache: bool,
    cache_limit: usize,
    base_loader: Option<Arc<dyn Loader>>,

    // Stateful: never shared with clones of the configuration.
    loader: Arc<dyn Loader>,
    gap_listeners: Arc<GapListeners>,
}

impl EventsTable {
    /// Starts configuring a table with the given name.
    pub fn builder(name: impl Into<String>) -> EventsTableBuilder {
        EventsTableBuilder::new(name)
    }

    /// The table's SQL schema, e.g. for
    /// [`Database::create_events_table`](crate::schema::Database::create_events_table).
    pub fn schema(&self) -> &EventsSchema {
        &self.schema
    }

    /// Inserts an event inside the caller's transaction.
    ///
    /// Returns a [`NotifyHandle`] to be invoked *after* the transaction
    /// commits:
    ///
    /// ```rust,ignore
    /// let tx = conn.transaction()?;
    /// let notify = table.insert(&tx, "account-1", EventType::from_raw(1))?;
    /// tx.commit()?;
    /// notify.notify();
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::NoopInsert`] for sentinel-valued input; database errors
    /// verbatim.
    pub fn insert(
        &self,
        tx: &Transaction<'_>,
        foreign_id: &str,
        event_type: EventType,
    ) -> Result<NotifyHandle> {
        self.insert_event(tx, foreign_id, event_type, None)
    }

    /// Inserts an event with a metadata payload.
    ///
    /// The table must have a metadata column configured via
    /// [`EventsTableBuilder::with_metadata_field`].
    pub fn insert_with_metadata(
        &self,
        tx: &Transaction<'_>,
        foreign_id: &str,
        event_type: EventType,
        metadata: &[u8],
    ) -> Result<NotifyHandle> {
        self.insert_event(tx, foreign_id, event_type, Some(metadata))
    }

    fn insert_event(
        &self,
        tx: &Transaction<'_>,
        foreign_id: &str,
        event_type: EventType,
        metadata: Option<&[u8]>,
    ) -> Result<NotifyHandle> {
        if is_noop(foreign_id, event_type) {
            return Err(Error::NoopInsert);
        }

        if self.schema.has_metadata() {
            tx.execute(
                self.schema.insert_sql(),
                params![foreign_id, event_type.as_raw(), metadata],
            )?;
        } else {
            if metadata.is_some() {
                return Err(Error::Schema(format!(
                    "table {} has no metadata column configured",
                    self.schema.name()
                )));
            }
            tx.execute(
                self.schema.insert_sql(),
                params![foreign_id, event_type.as_raw()],
            )?;
        }

        Ok(NotifyHandle {
            notifier: Arc::clone(&self.notifier),
        })
    }

    /// Opens a stream of events after the given cursor.
    ///
    /// The client owns `conn` and is only safe for a single consumer; open
    /// one client (with its own connection) per consumer.
    pub fn stream(&self, conn: Connection, after: &str, options: StreamOptions) -> StreamClient {
        StreamClient::new(
            conn,
            self.schema.clone(),
            Arc::clone(&self.loader),
            Arc::clone(&self.notifier),
            self.backoff,
            after.to_string(),
            options,
        )
    }

    /// Registers `f` to be called on every detected gap.
    ///
    /// The first registration attaches the listener machinery; until then
    /// gap notifications are dropped, which keeps gap handling strictly
    /// optional. Handlers must be fast: they run sequentially on a shared
    /// dispatcher task. Must be called from within a tokio runtime.
    pub fn listen_gaps(&self, f: impl Fn(Gap) + Send + 'static) {
        self.gap_listeners.listen(Box::new(f));
    }

    /// Fills detected gaps with noop rows after a grace period.
    ///
    /// A permanent hole (a rolled-back transaction) would otherwise
    /// re-trigger detection for every fresh reader passing the region. A
    /// noop at each missing id closes the hole; the noop filter keeps the
    /// fillers invisible to consumers. The grace period lets a
    /// slow-but-committing transaction win the race for its id: the insert
    /// uses `OR IGNORE`, so a row that appeared in the meantime is left
    /// alone.
    ///
    /// Must be called from within a tokio runtime. The connection is moved
    /// to a background task for the life of the table.
    pub fn fill_gaps(&self, conn: Connection, grace: Duration) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.listen_gaps(move |gap| {
            let _ = tx.send(gap);
        });

        let schema = self.schema.clone();
        tokio::spawn(async move {
            while let Some(gap) = rx.recv().await {
                tokio::time::sleep(grace).await;
                for id in gap.prev.as_raw() + 1..gap.next.as_raw() {
                    if let Err(err) = conn.execute(schema.insert_noop_sql(), params![id]) {
                        tracing::warn!(
                            table = %schema.name(),
                            id,
                            error = %err,
                            "failed to fill gap with noop"
                        );
                    }
                }
            }
        });
    }

    /// Returns a builder seeded with this table's configuration.
    ///
    /// Stateful parts (the cache, the gap channel, registered listeners)
    /// are never shared: the built table starts fresh.
    pub fn clone_config(&self) -> EventsTableBuilder {
        let mut builder = EventsTableBuilder::new(self.schema.name());
        builder.time_field = self.schema.time_field().to_string();
        builder.type_field = self.schema.type_field().to_string();
        builder.foreign_id_field = self.schema.foreign_id_field().to_string();
        builder.metadata_field = self.schema.metadata_field().map(str::to_string);
        builder.notifier = Arc::clone(&self.notifier);
        builder.backoff = self.backoff;
        builder.enable_cache = self.enable_cache;
        builder.cache_limit = self.cache_limit;
        builder.base_loader = self.base_loader.as_ref().map(Arc::clone);
        builder
    }
}

// =============================================================================
// Tests
// =============================================================================
