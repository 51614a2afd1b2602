//! # Stream Client
//!
//! Turns batched loader results into an event-by-event blocking receive.
//!
//! ## Receive Loop
//!
//! ```text
//! recv() ──► cursor initialized? ──► buffer non-empty? ──► pop, return
//!                 │ once                    │ no
//!                 ▼                         ▼
//!          head query / parse        poll loader ──► got events ──► buffer
//!                                           │ empty
//!                                           ▼
//!                              wait: notifier │ backoff │ cancel
//! ```
//!
//! The client suspends only inside the wait; loader calls are short
//! synchronous SQLite reads on the client's own connection. A client is
//! single-consumer by construction (`recv` takes `&mut self`) and holds a
//! buffered prefix across calls, so no event is returned twice.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::loader::{latest_id, Loader};
use crate::metrics;
use crate::notifier::EventsNotifier;
use crate::schema::EventsSchema;
use crate::types::{Event, EventId};

/// Default backoff between polls when no events are found.
pub(crate) const DEFAULT_STREAM_BACKOFF: Duration = Duration::from_secs(10);

// =============================================================================
// Stream Options
// =============================================================================

/// Per-stream configuration.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Start at the current head of the log instead of at the cursor. The
    /// head is resolved on the first `recv` call, not at construction.
    pub from_head: bool,

    /// Minimum age an event must have before it is streamed. Gives
    /// committed transactions a grace period in which to become visible to
    /// all readers.
    pub lag: Duration,

    /// Cancels the stream; `recv` then fails with [`Error::Cancelled`].
    pub cancel: CancellationToken,
}

impl StreamOptions {
    /// Starts the stream at the current head of the log.
    pub fn from_head(mut self) -> Self {
        self.from_head = true;
        self
    }

    /// Sets the lag window.
    pub fn with_lag(mut self, lag: Duration) -> Self {
        self.lag = lag;
        self
    }

    /// Sets the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// =============================================================================
// Stream Client
// =============================================================================

/// A long-lived, per-consumer event stream.
///
/// Obtained from [`EventsTable::stream`](crate::table::EventsTable::stream).
/// The client owns its database connection; the composed loader (and thus
/// the shared cache) is borrowed from the table.
pub struct StreamClient {
    conn: Connection,
    schema: EventsSchema,
    loader: Arc<dyn Loader>,
    notifier: Arc<dyn EventsNotifier>,
    backoff: Duration,
    options: StreamOptions,

    /// Raw cursor string, parsed lazily on the first `recv`.
    after: String,
    /// Id of the last delivered (or skipped-past) event.
    prev: EventId,
    /// Events fetched but not yet returned.
    buf: VecDeque<Event>,
    /// Whether the from-head resolution already ran.
    from_head_pending: bool,
}

impl StreamClient {
    pub(crate) fn new(
        conn: Connection,
        schema: EventsSchema,
        loader: Arc<dyn Loader>,
        notifier: Arc<dyn EventsNotifier>,
        backoff: Duration,
        after: String,
        options: StreamOptions,
    ) -> Self {
        let from_head_pending = options.from_head;
        Self {
            conn,
            schema,
            loader,
            notifier,
            backoff,
            options,
            after,
            prev: EventId::ZERO,
            buf: VecDeque::new(),
            from_head_pending,
        }
    }

    /// Blocks until the next event is available and returns it.
    ///
    /// Queries the database in batches and buffers the results; when the
    /// buffer is non-empty an event is popped without touching the
    /// database. When a poll finds nothing, the client waits for a notifier
    /// signal or its backoff timer, whichever fires first.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] once the cancellation token fires.
    /// - [`Error::InvalidIntId`] if the configured cursor does not parse.
    /// - Loader errors, surfaced verbatim; the client itself never retries.
    pub async fn recv(&mut self) -> Result<Event> {
        if self.options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Initialize the cursor once. From-head wins over a configured
        // cursor, which is discarded so it cannot re-initialize later.
        if self.from_head_pending {
            self.prev = latest_id(&self.conn, &self.schema)?;
            self.from_head_pending = false;
            self.after.clear();
            tracing::debug!(
                table = %self.schema.name(),
                head = self.prev.as_raw(),
                "stream starting from head"
            );
        } else if !self.after.is_empty() {
            self.prev = EventId::from_cursor(&self.after)?;
            self.after.clear();
        }

        while self.buf.is_empty() {
            if self.options.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            metrics::EVENTS_POLL
                .with_label_values(&[self.schema.name()])
                .inc();
            let res = self
                .loader
                .load(&self.conn, self.prev, self.options.lag)?;
            self.prev = res.next;
            self.buf = res.events.into();

            if !self.buf.is_empty() {
                break;
            }

            self.wait().await?;
        }

        let event = self.buf.pop_front().expect("buffer checked non-empty");
        self.prev = event.id;
        Ok(event)
    }

    /// The opaque cursor of the last delivered event.
    ///
    /// Before the first successful `recv` this is the cursor the stream was
    /// opened with.
    pub fn cursor(&self) -> String {
        if !self.after.is_empty() {
            return self.after.clone();
        }
        self.prev.cursor()
    }

    /// Converts the client into a [`futures::Stream`] of events.
    ///
    /// The stream yields events until the first error, emits that error, and
    /// then terminates.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<Event>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut client = state?;
            match client.recv().await {
                Ok(event) => Some((Ok(event), Some(client))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    async fn wait(&self) -> Result<()> {
        if self.backoff.is_zero() {
            return Ok(());
        }
        let signal = self.notifier.subscribe();
        tokio::select! {
            _ = signal.wait() => Ok(()),
            _ = tokio::time::sleep(self.backoff) => Ok(()),
            _ = self.options.cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::loader::LoadResult;
    use crate::notifier::StubNotifier;
    use crate::schema::{
        DEFAULT_FOREIGN_ID_FIELD, DEFAULT_TIME_FIELD, DEFAULT_TYPE_FIELD,
    };
    use crate::types::EventType;

    struct ScriptedLoader {
        batches: Mutex<VecDeque<LoadResult>>,
    }

    impl Loader for ScriptedLoader {
        fn load(&self, _: &Connection, after: EventId, _: Duration) -> Result<LoadResult> {
            Ok(self
                .batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| LoadResult::empty(after)))
        }
    }

    fn event(id: i64) -> Event {
        Event {
            id: EventId::from_raw(id),
            timestamp_ms: 0,
            event_type: EventType::from_raw(1),
            foreign_id: format!("fid-{id}"),
            metadata: None,
        }
    }

    fn client(after: &str, batches: Vec<LoadResult>, options: StreamOptions) -> StreamClient {
        let schema = EventsSchema::new(
            "events".to_string(),
            DEFAULT_TIME_FIELD.to_string(),
            DEFAULT_TYPE_FIELD.to_string(),
            DEFAULT_FOREIGN_ID_FIELD.to_string(),
            None,
        );
        StreamClient::new(
            Connection::open_in_memory().unwrap(),
            schema,
            Arc::new(ScriptedLoader {
                batches: Mutex::new(batches.into()),
            }),
            Arc::new(StubNotifier),
            Duration::from_millis(10),
            after.to_string(),
            options,
        )
    }

    #[tokio::test]
    async fn test_recv_pops_buffered_batch_in_order() {
        let batch = LoadResult {
            events: vec![event(1), event(2), event(3)],
            next: EventId::from_raw(3),
        };
        let mut c = client("", vec![batch], StreamOptions::default());

        for want in 1..=3 {
            let e = c.recv().await.unwrap();
            assert_eq!(e.id.as_raw(), want);
            assert_eq!(c.cursor(), want.to_string());
        }
    }

    #[tokio::test]
    async fn test_invalid_cursor_fails_first_recv() {
        let mut c = client("abc", vec![], StreamOptions::default());
        let err = c.recv().await.unwrap_err();
        assert!(matches!(err, Error::InvalidIntId));
        // The raw cursor is still reported until parsed.
        assert_eq!(c.cursor(), "abc");
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let options = StreamOptions::default().with_cancel(cancel.clone());
        let mut c = client("", vec![], options);
        c.backoff = Duration::from_secs(60);

        let handle = tokio::spawn(async move { c.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_before_recv() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = StreamOptions::default().with_cancel(cancel);
        let mut c = client("", vec![], options);
        assert!(matches!(c.recv().await.unwrap_err(), Error::Cancelled));
    }

    #[tokio::test]
    async fn test_cursor_tracks_popped_event_not_batch_next() {
        // The loader advances next past a trailing hidden id (a filtered
        // noop); the cursor still tracks the event actually delivered.
        let batch = LoadResult {
            events: vec![event(1)],
            next: EventId::from_raw(2),
        };
        let mut c = client("", vec![batch], StreamOptions::default());

        let e = c.recv().await.unwrap();
        assert_eq!(e.id.as_raw(), 1);
        assert_eq!(c.cursor(), "1");
    }
}
