//! Network watch operations consumed by the watch core.
//!
//! Implemented by the transport layer (REST, gRPC, in-memory fakes). Every
//! call is a round trip, so the core batches and rate-limits what it sends
//! here. Timeouts are the implementation's responsibility; the core treats
//! any failure as the failure of that one operation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;

use crate::Grid;
use crate::Ids;
use crate::WatchResult;

/// Opaque server-side token identifying one open subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionHandle(String);

impl SubscriptionHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of opening a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    /// Rate the server asks the client to poll at
    pub poll_rate: Duration,
    /// Current values of the subscribed records
    pub grid: Grid,
}

/// Result of polling (or refreshing) a subscription.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PollResult {
    /// Records changed since the previous poll; removed records carry the
    /// `removed` tag
    pub changed: Grid,
    /// Current server poll rate; zero when the server did not report one
    pub poll_rate: Duration,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait WatchApis: Send + Sync + 'static {
    /// Opens a subscription over `ids`.
    async fn open(
        &self,
        ids: Ids,
        display: String,
    ) -> WatchResult<Subscription>;

    /// Extends a subscription; returns the current values of `ids`.
    ///
    /// # Errors
    /// - [`WatchError::NotFound`](crate::WatchError::NotFound) if the handle is gone
    async fn add(
        &self,
        handle: &SubscriptionHandle,
        ids: Ids,
    ) -> WatchResult<Grid>;

    /// Shrinks a subscription.
    async fn remove(
        &self,
        handle: &SubscriptionHandle,
        ids: Ids,
    ) -> WatchResult<()>;

    /// Fetches records changed since the last poll.
    ///
    /// # Errors
    /// - [`WatchError::NotFound`](crate::WatchError::NotFound) if the handle is gone
    async fn poll(
        &self,
        handle: &SubscriptionHandle,
    ) -> WatchResult<PollResult>;

    /// Fetches every subscribed record regardless of change state.
    async fn refresh(
        &self,
        handle: &SubscriptionHandle,
    ) -> WatchResult<PollResult>;

    /// Releases a subscription.
    async fn close(
        &self,
        handle: &SubscriptionHandle,
    ) -> WatchResult<()>;
}
