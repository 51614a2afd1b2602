//! # Prometheus Metrics
//!
//! All metrics are registered against the default registry and labeled with
//! the events table name, so several tables in one process stay
//! distinguishable. Registration happens lazily on first use.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec,
};

/// Label identifying the events table a sample belongs to.
const TABLE_LABEL: &str = "table_name";

/// Read-through cache hits (fast path or re-check under the write lock).
pub(crate) static RCACHE_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "riptide_rcache_hits_total",
        "Number of read-through cache hits",
        &[TABLE_LABEL]
    )
    .expect("rcache hits metric registered twice")
});

/// Read-through cache misses (a database read actually happened).
pub(crate) static RCACHE_MISSES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "riptide_rcache_misses_total",
        "Number of read-through cache misses",
        &[TABLE_LABEL]
    )
    .expect("rcache misses metric registered twice")
});

/// Loader polls issued by stream clients.
pub(crate) static EVENTS_POLL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "riptide_events_poll_total",
        "Number of times stream clients polled the loader for new events",
        &[TABLE_LABEL]
    )
    .expect("events poll metric registered twice")
});

/// Gaps observed in the id sequence.
pub(crate) static GAP_DETECT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "riptide_events_gap_detect_total",
        "Number of gaps detected in the event id sequence",
        &[TABLE_LABEL]
    )
    .expect("gap detect metric registered twice")
});

/// Whether a gap listener is attached (0 or 1).
pub(crate) static GAP_LISTEN: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "riptide_events_gap_listen",
        "Whether gap listeners are attached to the events table",
        &[TABLE_LABEL]
    )
    .expect("gap listen metric registered twice")
});
