//! The capability contract shared by every layer of the watch stack.
//!
//! ```text
//! Watch ──► BatchSubject ──► ApiSubject ──► WatchApis (network)
//!   ▲                            │
//!   └──── SubjectListener ◄──────┘  (changed / lost / closed)
//! ```

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use tracing::trace;

use crate::Grid;
use crate::IdRefs;
use crate::Ids;
use crate::WatchError;
use crate::WatchResult;

/// Identifies a listener attached to a subject.
pub type ListenerId = u64;

/// Lifecycle of a subject.
///
/// ```text
/// Idle ──first add──► Open ──last remove──► Idle
///                      │
///                      ├──poll NotFound──► Lost    (terminal)
///                      └──close()──► Closing ──► Closed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectStatus {
    /// No network subscription is held
    Idle,
    /// A network subscription is held and polled
    Open,
    Closing,
    Closed,
    /// The server dropped the subscription
    Lost,
}

impl SubjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubjectStatus::Closing | SubjectStatus::Closed | SubjectStatus::Lost)
    }
}

/// Receives updates from a subject. Called synchronously from whichever task
/// applied the update, so implementations must not block.
pub trait SubjectListener: Send + Sync + 'static {
    /// Records changed; removed records carry the `removed` tag.
    fn on_changed(
        &self,
        changed: &Grid,
    );

    /// The underlying subscription is gone for good.
    fn on_lost(
        &self,
        error: &WatchError,
    );

    /// The subject was closed.
    fn on_closed(&self);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Subject: Send + Sync + 'static {
    /// Registers interest in ids. The network effect may be deferred and
    /// coalesced by a decorating implementation.
    async fn add_ids(
        &self,
        ids: IdRefs,
    ) -> WatchResult<()>;

    /// Releases interest in ids. Once nothing is referenced any more the
    /// underlying subscription may be closed.
    async fn remove_ids(
        &self,
        ids: IdRefs,
    ) -> WatchResult<()>;

    /// Records changed since the previous poll.
    async fn poll(&self) -> WatchResult<Grid>;

    /// Full resynchronisation of every watched record.
    async fn refresh(&self) -> WatchResult<Grid>;

    /// Releases the network subscription regardless of remaining watchers.
    /// Every later call fails with [`WatchError::Closed`].
    async fn close(&self) -> WatchResult<()>;

    /// Cached current values of `ids`.
    fn snapshot(
        &self,
        ids: &Ids,
    ) -> WatchResult<Grid>;

    fn subscribe(
        &self,
        listener: Arc<dyn SubjectListener>,
    ) -> WatchResult<ListenerId>;

    fn unsubscribe(
        &self,
        id: ListenerId,
    );

    fn status(&self) -> SubjectStatus;

    /// Current delay between the end of one poll and the start of the next.
    fn poll_rate(&self) -> Duration;
}

/// Listener registry used by subjects that fan updates out.
#[derive(Default)]
pub(crate) struct Listeners {
    entries: DashMap<ListenerId, Arc<dyn SubjectListener>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub(crate) fn register(
        &self,
        listener: Arc<dyn SubjectListener>,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, listener);
        trace!(listener_id = id, "listener registered");
        id
    }

    pub(crate) fn unregister(
        &self,
        id: ListenerId,
    ) {
        if self.entries.remove(&id).is_some() {
            trace!(listener_id = id, "listener unregistered");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Copies the current listeners out so callbacks run without holding any
    /// map shard lock; a callback may itself subscribe or unsubscribe.
    fn collect(&self) -> Vec<Arc<dyn SubjectListener>> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub(crate) fn changed(
        &self,
        changed: &Grid,
    ) {
        if changed.is_empty() {
            return;
        }
        for listener in self.collect() {
            listener.on_changed(changed);
        }
    }

    pub(crate) fn lost(
        &self,
        error: &WatchError,
    ) {
        for listener in self.collect() {
            listener.on_lost(error);
        }
    }

    /// Notifies and drops every listener; nothing is delivered after close.
    pub(crate) fn closed(&self) {
        let listeners = self.collect();
        self.entries.clear();
        for listener in listeners {
            listener.on_closed();
        }
    }
}
