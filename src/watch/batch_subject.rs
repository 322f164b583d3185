//! Coalesces add/remove requests made in the same batch window.
//!
//! Each `add_ids`/`remove_ids` call is merged into a pending batch and waits
//! for the flush of that batch. The first call into an empty batch schedules
//! a flush task:
//!
//! - `batch_window == 0`: the task yields once, so the flush runs after every
//!   task that was ready in the current scheduler turn has had its go
//! - `batch_window > 0`: the task sleeps for the window (debounce)
//!
//! A flush nets adds against removes of the same ids and issues at most one
//! `add_ids` then at most one `remove_ids` on the inner subject. If that add
//! fails, the releases it had offset are sent with the remove. Flushes run
//! one at a time; requests made while a flush is in flight land in the next
//! batch. `poll`, `refresh` and `close` are not batched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;

use super::ListenerId;
use super::Subject;
use super::SubjectListener;
use super::SubjectStatus;
use crate::Grid;
use crate::IdRefs;
use crate::Ids;
use crate::WatchError;
use crate::WatchResult;

type Waiter = oneshot::Sender<WatchResult<()>>;

#[derive(Clone)]
pub struct BatchSubject {
    shared: Arc<BatchShared>,
}

struct BatchShared {
    inner: Arc<dyn Subject>,
    window: Duration,
    pending: Mutex<Pending>,
    /// Serialises flushes so a later batch never overtakes an earlier one
    flush_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Pending {
    batch: PendingBatch,
    scheduled: bool,
    closed: bool,
}

#[derive(Default)]
struct PendingBatch {
    adds: IdRefs,
    removes: IdRefs,
    add_waiters: Vec<Waiter>,
    remove_waiters: Vec<Waiter>,
}

impl PendingBatch {
    fn is_empty(&self) -> bool {
        self.add_waiters.is_empty() && self.remove_waiters.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Add,
    Remove,
}

impl BatchSubject {
    pub fn new(
        inner: Arc<dyn Subject>,
        window: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(BatchShared {
                inner,
                window,
                pending: Mutex::new(Pending::default()),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Number of requests waiting for the next flush.
    pub fn pending_requests(&self) -> usize {
        let pending = self.shared.pending.lock();
        pending.batch.add_waiters.len() + pending.batch.remove_waiters.len()
    }

    /// Flushes the pending batch now instead of waiting for the scheduled
    /// flush. Returns the first error of the inner calls; every request in
    /// the batch also receives the result of its own kind.
    pub async fn flush(&self) -> WatchResult<()> {
        let _flush = self.shared.flush_lock.lock().await;

        let batch = {
            let mut pending = self.shared.pending.lock();
            pending.scheduled = false;
            std::mem::take(&mut pending.batch)
        };
        if batch.is_empty() {
            return Ok(());
        }

        let PendingBatch {
            mut adds,
            mut removes,
            add_waiters,
            remove_waiters,
        } = batch;
        let offset = adds.cancel(&mut removes);

        debug!(
            requests = add_waiters.len() + remove_waiters.len(),
            add_ids = adds.len(),
            remove_ids = removes.len(),
            offset_ids = offset.len(),
            "Flushing watch batch"
        );

        let added = if adds.is_empty() {
            Ok(())
        } else {
            self.shared.inner.add_ids(adds).await
        };
        // the adds that offset these releases never took effect
        if added.is_err() {
            removes.extend(&offset);
        }
        let removed = if removes.is_empty() {
            Ok(())
        } else {
            self.shared.inner.remove_ids(removes).await
        };

        for waiter in add_waiters {
            let _ = waiter.send(added.clone());
        }
        for waiter in remove_waiters {
            let _ = waiter.send(removed.clone());
        }

        added.and(removed)
    }

    async fn enqueue(
        &self,
        op: Op,
        ids: IdRefs,
    ) -> WatchResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if self.shared.inner.status().is_terminal() {
            return Err(WatchError::Closed("subject"));
        }

        let (rx, schedule) = {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return Err(WatchError::Closed("subject"));
            }
            let (tx, rx) = oneshot::channel();
            match op {
                Op::Add => {
                    pending.batch.adds.extend(&ids);
                    pending.batch.add_waiters.push(tx);
                }
                Op::Remove => {
                    pending.batch.removes.extend(&ids);
                    pending.batch.remove_waiters.push(tx);
                }
            }
            let schedule = !pending.scheduled;
            pending.scheduled = true;
            (rx, schedule)
        };
        trace!(?op, ids = ids.len(), "Queued for next watch flush");

        if schedule {
            self.schedule_flush();
        }

        rx.await.unwrap_or(Err(WatchError::Closed("subject")))
    }

    fn schedule_flush(&self) {
        let subject = self.clone();
        tokio::spawn(async move {
            if subject.shared.window.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(subject.shared.window).await;
            }
            // each request already received its own result
            let _ = subject.flush().await;
        });
    }
}

#[async_trait]
impl Subject for BatchSubject {
    async fn add_ids(
        &self,
        ids: IdRefs,
    ) -> WatchResult<()> {
        self.enqueue(Op::Add, ids).await
    }

    async fn remove_ids(
        &self,
        ids: IdRefs,
    ) -> WatchResult<()> {
        self.enqueue(Op::Remove, ids).await
    }

    async fn poll(&self) -> WatchResult<Grid> {
        self.shared.inner.poll().await
    }

    async fn refresh(&self) -> WatchResult<Grid> {
        self.shared.inner.refresh().await
    }

    /// Pending adds fail with `Closed`; pending removes succeed since closing
    /// releases them anyway.
    async fn close(&self) -> WatchResult<()> {
        let batch = {
            let mut pending = self.shared.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.batch)
        };
        for waiter in batch.add_waiters {
            let _ = waiter.send(Err(WatchError::Closed("subject")));
        }
        for waiter in batch.remove_waiters {
            let _ = waiter.send(Ok(()));
        }

        self.shared.inner.close().await
    }

    fn snapshot(
        &self,
        ids: &Ids,
    ) -> WatchResult<Grid> {
        self.shared.inner.snapshot(ids)
    }

    fn subscribe(
        &self,
        listener: Arc<dyn SubjectListener>,
    ) -> WatchResult<ListenerId> {
        if self.shared.pending.lock().closed {
            return Err(WatchError::Closed("subject"));
        }
        self.shared.inner.subscribe(listener)
    }

    fn unsubscribe(
        &self,
        id: ListenerId,
    ) {
        self.shared.inner.unsubscribe(id)
    }

    fn status(&self) -> SubjectStatus {
        self.shared.inner.status()
    }

    fn poll_rate(&self) -> Duration {
        self.shared.inner.poll_rate()
    }
}
