//! In-memory watch server used by the integration tests.
//!
//! Records every call it receives, tracks how many calls are in flight at
//! once, and can be told to forget its subscriptions.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use haystack_client::Grid;
use haystack_client::Ids;
use haystack_client::PollResult;
use haystack_client::Record;
use haystack_client::Subscription;
use haystack_client::SubscriptionHandle;
use haystack_client::WatchApis;
use haystack_client::WatchConfig;
use haystack_client::WatchError;
use haystack_client::WatchResult;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(Ids),
    Add(String, Ids),
    Remove(String, Ids),
    Poll(String),
    Refresh(String),
    Close(String),
}

pub fn record(
    id: &str,
    val: i64,
) -> Record {
    let mut record = Record::new();
    record.insert("id".to_string(), json!(id));
    record.insert("curVal".to_string(), json!(val));
    record
}

pub fn cur_val(
    grid: &Grid,
    id: &str,
) -> Option<i64> {
    grid.get(id).and_then(|row| row.get("curVal")).and_then(|v| v.as_i64())
}

/// 1s default rate, 100ms floor, flush on the next scheduler turn.
pub fn watch_config() -> WatchConfig {
    WatchConfig {
        default_poll_rate_ms: 1000,
        min_poll_rate_ms: 100,
        ..WatchConfig::default()
    }
}

#[derive(Default)]
struct ServerState {
    calls: Vec<Call>,
    values: HashMap<String, i64>,
    /// Live subscriptions and the ids each one covers
    subscriptions: HashMap<String, Ids>,
    /// Ids changed since the last poll, per subscription
    dirty: HashMap<String, Ids>,
    next_handle: u64,
    /// (start, end) of every poll
    poll_spans: Vec<(Instant, Instant)>,
}

pub struct FakeWatchServer {
    state: Mutex<ServerState>,
    latency: Duration,
    poll_rate: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a FakeWatchServer);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeWatchServer {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO, Duration::ZERO)
    }

    /// Every call takes `latency`; polls report `poll_rate` (zero: none).
    pub fn with_latency(
        latency: Duration,
        poll_rate: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            latency,
            poll_rate,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Updates a point value; subscriptions covering it see it on the next poll.
    pub fn set_value(
        &self,
        id: &str,
        val: i64,
    ) {
        let mut state = self.state.lock();
        state.values.insert(id.to_string(), val);
        let ServerState {
            subscriptions, dirty, ..
        } = &mut *state;
        for (handle, ids) in subscriptions.iter() {
            if ids.contains(id) {
                dirty.entry(handle.clone()).or_default().insert(id);
            }
        }
    }

    /// Drops every subscription, as a server restart would.
    pub fn forget_subscriptions(&self) {
        let mut state = self.state.lock();
        state.subscriptions.clear();
        state.dirty.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(
        &self,
        matches: impl Fn(&Call) -> bool,
    ) -> usize {
        self.state.lock().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn polls(&self) -> usize {
        self.count(|call| matches!(call, Call::Poll(_)))
    }

    pub fn closes(&self) -> usize {
        self.count(|call| matches!(call, Call::Close(_)))
    }

    pub fn poll_spans(&self) -> Vec<(Instant, Instant)> {
        self.state.lock().poll_spans.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn live_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    async fn round_trip(
        &self,
        call: Call,
    ) -> InFlight<'_> {
        self.state.lock().calls.push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(self);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }

    fn current(
        &self,
        state: &ServerState,
        ids: &Ids,
    ) -> Grid {
        Grid::from_rows(
            ids.iter()
                .map(|id| record(id, state.values.get(id).copied().unwrap_or_default())),
        )
    }
}

#[async_trait]
impl WatchApis for FakeWatchServer {
    async fn open(
        &self,
        ids: Ids,
        _display: String,
    ) -> WatchResult<Subscription> {
        let _call = self.round_trip(Call::Open(ids.clone())).await;
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = format!("w-{}", state.next_handle);
        state.subscriptions.insert(handle.clone(), ids.clone());
        Ok(Subscription {
            handle: SubscriptionHandle::new(handle),
            poll_rate: self.poll_rate,
            grid: self.current(&state, &ids),
        })
    }

    async fn add(
        &self,
        handle: &SubscriptionHandle,
        ids: Ids,
    ) -> WatchResult<Grid> {
        let _call = self.round_trip(Call::Add(handle.to_string(), ids.clone())).await;
        let mut state = self.state.lock();
        let watched = state
            .subscriptions
            .get_mut(handle.as_str())
            .ok_or_else(|| WatchError::NotFound(handle.to_string()))?;
        *watched = watched.union(&ids);
        Ok(self.current(&state, &ids))
    }

    async fn remove(
        &self,
        handle: &SubscriptionHandle,
        ids: Ids,
    ) -> WatchResult<()> {
        let _call = self.round_trip(Call::Remove(handle.to_string(), ids.clone())).await;
        let mut state = self.state.lock();
        let watched = state
            .subscriptions
            .get_mut(handle.as_str())
            .ok_or_else(|| WatchError::NotFound(handle.to_string()))?;
        *watched = watched.difference(&ids);
        Ok(())
    }

    async fn poll(
        &self,
        handle: &SubscriptionHandle,
    ) -> WatchResult<PollResult> {
        let start = Instant::now();
        let _call = self.round_trip(Call::Poll(handle.to_string())).await;
        let mut state = self.state.lock();
        state.poll_spans.push((start, Instant::now()));
        if !state.subscriptions.contains_key(handle.as_str()) {
            return Err(WatchError::NotFound(handle.to_string()));
        }
        let dirty = state.dirty.remove(handle.as_str()).unwrap_or_default();
        Ok(PollResult {
            changed: self.current(&state, &dirty),
            poll_rate: self.poll_rate,
        })
    }

    async fn refresh(
        &self,
        handle: &SubscriptionHandle,
    ) -> WatchResult<PollResult> {
        let _call = self.round_trip(Call::Refresh(handle.to_string())).await;
        let mut state = self.state.lock();
        let watched = state
            .subscriptions
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| WatchError::NotFound(handle.to_string()))?;
        state.dirty.remove(handle.as_str());
        Ok(PollResult {
            changed: self.current(&state, &watched),
            poll_rate: self.poll_rate,
        })
    }

    async fn close(
        &self,
        handle: &SubscriptionHandle,
    ) -> WatchResult<()> {
        let _call = self.round_trip(Call::Close(handle.to_string())).await;
        let mut state = self.state.lock();
        state
            .subscriptions
            .remove(handle.as_str())
            .map(|_| ())
            .ok_or_else(|| WatchError::NotFound(handle.to_string()))
    }
}
