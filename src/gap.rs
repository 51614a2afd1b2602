//! # Gap Detection
//!
//! The database's auto-increment sequence can leave permanent holes: a
//! transaction allocates an id, then rolls back. Readers cannot tell such a
//! hole apart from a transaction that simply has not committed yet, so the
//! detector only *reports* what it sees and leaves the waiting policy to the
//! registered gap handlers (which typically apply their own grace period and
//! then fill the hole with a noop row, see
//! [`EventsTable::fill_gaps`](crate::table::EventsTable::fill_gaps)).
//!
//! Reporting is non-blocking by contract: gap messages are dropped when no
//! dispatcher is attached or the channel is full, and the batch itself
//! passes through unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::loader::{LoadResult, Loader};
use crate::metrics;
use crate::types::{EventId, Gap};

/// Capacity of the gap side channel. Gaps are rare and delivery is
/// best-effort; a small buffer absorbs a burst from several concurrent
/// read-throughs without ever blocking a loader.
pub(crate) const GAP_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// Detector Layer
// =============================================================================

/// Loader layer that reports holes in the id sequence.
///
/// Sits directly above the base loader so it sees the raw, unfiltered ids;
/// noops are real rows and fill gaps, so filtering them first would cause
/// false reports. The cache sits above this layer, which means detection
/// fires on the read-through that first observes the hole and cache hits do
/// not re-fire it.
pub(crate) struct GapDetector {
    inner: Arc<dyn Loader>,
    gap_tx: mpsc::Sender<Gap>,
    listening: Arc<AtomicBool>,
    table_name: String,
}

impl GapDetector {
    pub(crate) fn new(
        inner: Arc<dyn Loader>,
        gap_tx: mpsc::Sender<Gap>,
        listening: Arc<AtomicBool>,
        table_name: String,
    ) -> Self {
        Self {
            inner,
            gap_tx,
            listening,
            table_name,
        }
    }
}

impl Loader for GapDetector {
    fn load(&self, conn: &Connection, after: EventId, lag: Duration) -> Result<LoadResult> {
        let res = self.inner.load(conn, after, lag)?;

        if let Some(first) = res.events.first() {
            let expected = after.next();
            if first.id != expected {
                let gap = Gap {
                    prev: after,
                    next: first.id,
                };
                metrics::GAP_DETECT
                    .with_label_values(&[&self.table_name])
                    .inc();
                tracing::debug!(
                    table = %self.table_name,
                    prev = gap.prev.as_raw(),
                    next = gap.next.as_raw(),
                    "gap detected in event id sequence"
                );
                // Best-effort: dropped until a listener attaches, and dropped
                // when the buffer is full.
                if self.listening.load(Ordering::Relaxed) {
                    let _ = self.gap_tx.try_send(gap);
                }
            }
        }

        Ok(res)
    }
}

// =============================================================================
// Listener Fan-Out
// =============================================================================

type GapFn = Box<dyn Fn(Gap) + Send + 'static>;

/// Registered gap handlers for one events table.
///
/// The first registration takes the channel receiver and spawns the single
/// dispatcher task; later registrations only extend the handler list.
/// Handlers run sequentially under the registration lock; slow handlers
/// serialize gap delivery, which is acceptable because gaps are rare.
pub(crate) struct GapListeners {
    fns: Arc<Mutex<Vec<GapFn>>>,
    rx: Mutex<Option<mpsc::Receiver<Gap>>>,
    listening: Arc<AtomicBool>,
    table_name: String,
}

impl GapListeners {
    pub(crate) fn new(
        rx: mpsc::Receiver<Gap>,
        listening: Arc<AtomicBool>,
        table_name: String,
    ) -> Self {
        Self {
            fns: Arc::new(Mutex::new(Vec::new())),
            rx: Mutex::new(Some(rx)),
            listening,
            table_name,
        }
    }

    /// Adds `f` to the handler list, spawning the dispatcher on first call.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn listen(&self, f: GapFn) {
        let mut fns = self.fns.lock().expect("gap listener mutex poisoned");
        fns.push(f);

        let mut rx_slot = self.rx.lock().expect("gap receiver mutex poisoned");
        if let Some(mut rx) = rx_slot.take() {
            self.listening.store(true, Ordering::Relaxed);
            metrics::GAP_LISTEN
                .with_label_values(&[&self.table_name])
                .set(1);
            let fns = Arc::clone(&self.fns);
            tokio::spawn(async move {
                while let Some(gap) = rx.recv().await {
                    let fns = fns.lock().expect("gap listener mutex poisoned");
                    for f in fns.iter() {
                        f(gap);
                    }
                }
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, EventType};

    struct FixedLoader {
        events: Vec<Event>,
    }

    impl Loader for FixedLoader {
        fn load(&self, _: &Connection, after: EventId, _: Duration) -> Result<LoadResult> {
            let events = self.events.clone();
            let next = crate::loader::next_cursor(&events, after);
            Ok(LoadResult { events, next })
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

    fn test_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn attached() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn test_detects_gap_at_batch_head() {
        let (tx, mut rx) = mpsc::channel(GAP_CHANNEL_CAPACITY);
        let detector = GapDetector::new(
            Arc::new(FixedLoader {
                events: vec![event(2), event(3)],
            }),
            tx,
            attached(),
            "t".to_string(),
        );

        let res = detector
            .load(&test_conn(), EventId::ZERO, Duration::ZERO)
            .unwrap();
        // Batch passes through unchanged.
        assert_eq!(res.events.len(), 2);
        assert_eq!(res.next.as_raw(), 3);

        let gap = rx.try_recv().unwrap();
        assert_eq!(
            gap,
            Gap {
                prev: EventId::ZERO,
                next: EventId::from_raw(2),
            }
        );
    }

    #[test]
    fn test_no_gap_when_batch_starts_at_expected() {
        let (tx, mut rx) = mpsc::channel(GAP_CHANNEL_CAPACITY);
        let detector = GapDetector::new(
            Arc::new(FixedLoader {
                events: vec![event(1), event(2)],
            }),
            tx,
            attached(),
            "t".to_string(),
        );

        detector
            .load(&test_conn(), EventId::ZERO, Duration::ZERO)
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_batch_reports_nothing() {
        let (tx, mut rx) = mpsc::channel(GAP_CHANNEL_CAPACITY);
        let detector = GapDetector::new(
            Arc::new(FixedLoader { events: vec![] }),
            tx,
            attached(),
            "t".to_string(),
        );

        let res = detector
            .load(&test_conn(), EventId::from_raw(9), Duration::ZERO)
            .unwrap();
        assert_eq!(res.next.as_raw(), 9);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_never_blocks_on_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let detector = GapDetector::new(
            Arc::new(FixedLoader {
                events: vec![event(5)],
            }),
            tx,
            attached(),
            "t".to_string(),
        );

        // Fill the channel, then detect again; try_send drops silently.
        for _ in 0..3 {
            detector
                .load(&test_conn(), EventId::ZERO, Duration::ZERO)
                .unwrap();
        }
    }

    #[test]
    fn test_gaps_dropped_until_listener_attaches() {
        let (tx, mut rx) = mpsc::channel(GAP_CHANNEL_CAPACITY);
        let listening = Arc::new(AtomicBool::new(false));
        let detector = GapDetector::new(
            Arc::new(FixedLoader {
                events: vec![event(5)],
            }),
            tx,
            Arc::clone(&listening),
            "t".to_string(),
        );

        detector
            .load(&test_conn(), EventId::ZERO, Duration::ZERO)
            .unwrap();
        assert!(rx.try_recv().is_err(), "pre-listener gap must not buffer");

        listening.store(true, Ordering::Relaxed);
        detector
            .load(&test_conn(), EventId::ZERO, Duration::ZERO)
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_listeners_fan_out() {
        let (tx, rx) = mpsc::channel(GAP_CHANNEL_CAPACITY);
        let listeners = GapListeners::new(rx, attached(), "t".to_string());

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&seen_a), Arc::clone(&seen_b));
        listeners.listen(Box::new(move |gap| a.lock().unwrap().push(gap)));
        listeners.listen(Box::new(move |gap| b.lock().unwrap().push(gap)));

        let gap = Gap {
            prev: EventId::ZERO,
            next: EventId::from_raw(3),
        };
        tx.send(gap).await.unwrap();

        // The dispatcher task delivers shortly after.
        for _ in 0..100 {
            if !seen_a.lock().unwrap().is_empty() && !seen_b.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen_a.lock().unwrap(), vec![gap]);
        assert_eq!(*seen_b.lock().unwrap(), vec![gap]);
    }
}
