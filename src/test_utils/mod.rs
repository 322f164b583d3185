//! Shared helpers for the unit tests.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use crate::Grid;
use crate::Record;
use crate::SubjectListener;
use crate::Subscription;
use crate::SubscriptionHandle;
use crate::WatchConfig;
use crate::WatchError;

/// Record `{"id": id, "curVal": val}`.
pub(crate) fn record(
    id: &str,
    val: i64,
) -> Record {
    let mut record = Record::new();
    record.insert("id".to_string(), json!(id));
    record.insert("curVal".to_string(), json!(val));
    record
}

/// Record reporting that `id` left the watch.
pub(crate) fn removed(id: &str) -> Record {
    let mut record = Record::new();
    record.insert("id".to_string(), json!(id));
    record.insert("removed".to_string(), json!(true));
    record
}

pub(crate) fn grid_of(rows: &[(&str, i64)]) -> Grid {
    Grid::from_rows(rows.iter().map(|(id, val)| record(id, *val)))
}

pub(crate) fn cur_val(
    grid: &Grid,
    id: &str,
) -> Option<i64> {
    grid.get(id).and_then(|row| row.get("curVal")).and_then(|v| v.as_i64())
}

/// 1s default rate, 100ms floor, flush on the next scheduler turn.
pub(crate) fn watch_config() -> WatchConfig {
    WatchConfig {
        default_poll_rate_ms: 1000,
        min_poll_rate_ms: 100,
        ..WatchConfig::default()
    }
}

pub(crate) fn subscription(
    handle: &str,
    rate: Duration,
    grid: Grid,
) -> Subscription {
    Subscription {
        handle: SubscriptionHandle::new(handle),
        poll_rate: rate,
        grid,
    }
}

/// Listener that keeps everything it is told.
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub changed: Mutex<Vec<Grid>>,
    pub lost: Mutex<Vec<WatchError>>,
    pub closed: AtomicUsize,
}

impl RecordingListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SubjectListener for RecordingListener {
    fn on_changed(
        &self,
        changed: &Grid,
    ) {
        self.changed.lock().push(changed.clone());
    }

    fn on_lost(
        &self,
        error: &WatchError,
    ) {
        self.lost.lock().push(error.clone());
    }

    fn on_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
