use std::sync::Arc;

use futures::future::join_all;
use nanoid::nanoid;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;

use super::ListenerId;
use super::Subject;
use super::SubjectListener;
use crate::Grid;
use crate::IdRefs;
use crate::Ids;
use crate::WatchError;
use crate::WatchResult;

/// Lifecycle of a [`Watch`].
///
/// `Open` only ever moves to `Lost` (the server dropped the shared
/// subscription) or `Closed`; both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    Open,
    Lost,
    Closed,
}

/// Application handle for a live interest in a set of records.
///
/// Many watches share one subject; each contributes its own ids and keeps its
/// own snapshot, which the subject's polls update in place. Cloning gives
/// another handle to the same watch.
#[derive(Clone)]
pub struct Watch {
    inner: Arc<WatchInner>,
}

struct WatchInner {
    id: String,
    display: String,
    ids: Ids,
    subject: Arc<dyn Subject>,
    state: RwLock<WatchState>,
    listener: Mutex<Option<ListenerId>>,
    version: watch::Sender<u64>,
}

struct WatchState {
    status: WatchStatus,
    grid: Grid,
    /// The grid was supplied by the caller and has not yet been replaced by
    /// a server result
    seeded: bool,
    /// The watch's own add is still in flight
    opening: bool,
    failure: Option<WatchError>,
}

impl std::fmt::Debug for Watch {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.inner.id)
            .field("display", &self.inner.display)
            .field("ids", &self.inner.ids)
            .field("status", &self.status())
            .finish()
    }
}

impl Watch {
    /// Opens a watch over `ids` on `subject`.
    ///
    /// When `grid` is given it becomes the initial snapshot. Results that
    /// arrive while this watch's own add is in flight are ignored; the first
    /// poll or refresh touching these ids afterwards replaces the snapshot
    /// wholesale. Otherwise the snapshot starts from the subject's current
    /// values.
    ///
    /// # Errors
    /// - [`WatchError::Closed`] if the subject is closed
    /// - any error of the coalesced add that carried these ids
    pub async fn open(
        subject: Arc<dyn Subject>,
        ids: Ids,
        display: String,
        grid: Option<Grid>,
    ) -> WatchResult<Watch> {
        let seeded = grid.is_some();
        let inner = Arc::new(WatchInner {
            id: nanoid!(),
            display,
            ids,
            subject,
            state: RwLock::new(WatchState {
                status: WatchStatus::Open,
                grid: grid.unwrap_or_default(),
                seeded,
                opening: true,
                failure: None,
            }),
            listener: Mutex::new(None),
            version: watch::channel(0).0,
        });

        let listener_id = inner.subject.subscribe(inner.clone())?;
        *inner.listener.lock() = Some(listener_id);

        if let Err(e) = inner.subject.add_ids(IdRefs::from(&inner.ids)).await {
            inner.detach();
            inner.state.write().status = WatchStatus::Closed;
            return Err(e);
        }

        inner.state.write().opening = false;

        if !seeded {
            let current = match inner.subject.snapshot(&inner.ids) {
                Ok(current) => current,
                Err(e) => {
                    inner.detach();
                    inner.state.write().status = WatchStatus::Closed;
                    return Err(e);
                }
            };
            inner.state.write().grid.merge(&current);
        }

        debug!(
            watch_id = %inner.id,
            display = %inner.display,
            ids = %inner.ids,
            "Watch opened"
        );
        Ok(Watch { inner })
    }

    /// Closes every watch in `watches` that is still open, then `subject`
    /// itself. Watches that are already closed are skipped.
    ///
    /// Watches are closed concurrently, so their removals share one batch.
    /// Returns the first error encountered after everything was attempted.
    pub async fn close_all(
        subject: &Arc<dyn Subject>,
        watches: impl IntoIterator<Item = Watch>,
    ) -> WatchResult<()> {
        let results = join_all(watches.into_iter().map(|watch| async move { watch.close().await })).await;
        let closed = subject.close().await;

        info!(watches = results.len(), "Closed all watches on subject");
        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(e),
            None => closed,
        }
    }

    /// Unique id of this watch handle (client side only).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn display(&self) -> &str {
        &self.inner.display
    }

    pub fn ids(&self) -> &Ids {
        &self.inner.ids
    }

    pub fn status(&self) -> WatchStatus {
        self.inner.state.read().status
    }

    pub fn is_open(&self) -> bool {
        self.status() == WatchStatus::Open
    }

    /// Current snapshot of the watched records.
    ///
    /// # Errors
    /// - [`WatchError::Closed`] once the watch is closed
    /// - [`WatchError::SubscriptionLost`] once the shared subscription is lost
    pub fn grid(&self) -> WatchResult<Grid> {
        let state = self.inner.state.read();
        state.ensure_open()?;
        Ok(state.grid.clone())
    }

    /// Receiver whose value is bumped each time the snapshot or status
    /// changes.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Forces a full resynchronisation and replaces the snapshot with the
    /// server's current values for this watch's ids.
    pub async fn refresh(&self) -> WatchResult<Grid> {
        self.inner.state.read().ensure_open()?;

        self.inner.subject.refresh().await?;
        let current = self.inner.subject.snapshot(&self.inner.ids)?;

        {
            let mut state = self.inner.state.write();
            state.ensure_open()?;
            state.grid = current.clone();
            state.seeded = false;
        }
        self.inner.bump();
        Ok(current)
    }

    /// Releases this watch's ids and marks it closed. Closing an already
    /// closed watch is a no-op.
    pub async fn close(&self) -> WatchResult<()> {
        let previous = {
            let mut state = self.inner.state.write();
            std::mem::replace(&mut state.status, WatchStatus::Closed)
        };
        if previous == WatchStatus::Closed {
            return Ok(());
        }

        self.inner.detach();
        self.inner.bump();
        debug!(watch_id = %self.inner.id, display = %self.inner.display, "Watch closed");

        // a lost subject has nothing left to release
        if previous == WatchStatus::Open {
            self.inner.subject.remove_ids(IdRefs::from(&self.inner.ids)).await?;
        }
        Ok(())
    }
}

impl WatchState {
    fn ensure_open(&self) -> WatchResult<()> {
        match self.status {
            WatchStatus::Open => Ok(()),
            WatchStatus::Closed => Err(WatchError::Closed("watch")),
            WatchStatus::Lost => Err(self.failure.clone().unwrap_or(WatchError::SubscriptionLost {
                handle: String::new(),
            })),
        }
    }
}

impl WatchInner {
    fn detach(&self) {
        if let Some(listener_id) = self.listener.lock().take() {
            self.subject.unsubscribe(listener_id);
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl SubjectListener for WatchInner {
    fn on_changed(
        &self,
        changed: &Grid,
    ) {
        if !changed.touches(&self.ids) {
            return;
        }
        {
            let mut state = self.state.write();
            if state.status != WatchStatus::Open {
                return;
            }
            if state.seeded && state.opening {
                return;
            }
            if state.seeded {
                // first server result replaces the caller's grid
                state.grid = self
                    .subject
                    .snapshot(&self.ids)
                    .unwrap_or_else(|_| changed.filtered(&self.ids));
                state.seeded = false;
            } else {
                state.grid.merge(&changed.filtered(&self.ids));
            }
        }
        self.bump();
    }

    fn on_lost(
        &self,
        error: &WatchError,
    ) {
        {
            let mut state = self.state.write();
            if state.status != WatchStatus::Open {
                return;
            }
            state.status = WatchStatus::Lost;
            state.failure = Some(error.clone());
        }
        self.bump();
    }

    fn on_closed(&self) {
        {
            let mut state = self.state.write();
            if state.status != WatchStatus::Open {
                return;
            }
            state.status = WatchStatus::Closed;
        }
        self.listener.lock().take();
        self.bump();
    }
}
