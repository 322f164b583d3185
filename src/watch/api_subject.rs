//! Subject backed by exactly one network subscription.
//!
//! - Reference counts every id; an id reaches the network only when its count
//!   goes 0→1 (add) or 1→0 (remove).
//! - The first add opens the subscription, the last remove closes it and the
//!   subject returns to `Idle`.
//! - A poll loop re-arms itself after each completed poll, so the delay is
//!   measured from the end of one poll to the start of the next and polls
//!   never overlap.
//! - `NotFound` from the server is terminal: the subject becomes `Lost`,
//!   the loop stops and listeners are told. Nothing resubscribes.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::subject::Listeners;
use super::ListenerId;
use super::PollResult;
use super::Subject;
use super::SubjectListener;
use super::SubjectStatus;
use super::SubscriptionHandle;
use super::WatchApis;
use crate::utils::ScopedTimer;
use crate::Grid;
use crate::IdRefs;
use crate::Ids;
use crate::WatchConfig;
use crate::WatchError;
use crate::WatchResult;

#[derive(Clone)]
pub struct ApiSubject {
    shared: Arc<Shared>,
}

struct Shared {
    apis: Arc<dyn WatchApis>,
    config: WatchConfig,
    /// Held across every network call: polls, adds and removes run one at a time
    op_lock: tokio::sync::Mutex<()>,
    /// Never held across an await
    state: Mutex<State>,
    listeners: Listeners,
}

struct State {
    status: SubjectStatus,
    handle: Option<SubscriptionHandle>,
    poll_rate: Duration,
    refs: IdRefs,
    /// Current values of every watched record
    grid: Grid,
    /// Cancels the poll loop of the current subscription
    poll_timer: Option<CancellationToken>,
}

impl State {
    fn ensure_usable(&self) -> WatchResult<()> {
        if self.status.is_terminal() {
            return Err(WatchError::Closed("subject"));
        }
        Ok(())
    }

    fn stop_poll_timer(&mut self) {
        if let Some(token) = self.poll_timer.take() {
            token.cancel();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Fetch {
    Poll,
    Refresh,
}

impl Fetch {
    fn op(self) -> &'static str {
        match self {
            Fetch::Poll => "watch::poll",
            Fetch::Refresh => "watch::refresh",
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.state.get_mut().stop_poll_timer();
    }
}

impl ApiSubject {
    pub fn new(
        apis: Arc<dyn WatchApis>,
        config: WatchConfig,
    ) -> Self {
        let poll_rate = config.default_poll_rate();
        Self {
            shared: Arc::new(Shared {
                apis,
                config,
                op_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(State {
                    status: SubjectStatus::Idle,
                    handle: None,
                    poll_rate,
                    refs: IdRefs::new(),
                    grid: Grid::new(),
                    poll_timer: None,
                }),
                listeners: Listeners::default(),
            }),
        }
    }

    /// Handle of the live subscription, if any.
    pub fn handle(&self) -> Option<SubscriptionHandle> {
        self.shared.state.lock().handle.clone()
    }

    /// Distinct ids currently referenced by at least one registration.
    pub fn watched_ids(&self) -> Ids {
        self.shared.state.lock().refs.ids()
    }

    /// Number of registrations referencing `id`.
    pub fn ref_count(
        &self,
        id: &str,
    ) -> usize {
        self.shared.state.lock().refs.count(id)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    async fn open_subscription(
        &self,
        ids: Ids,
    ) -> WatchResult<Grid> {
        let display = self.shared.config.subscription_display.clone();
        let opened = {
            let _timer = ScopedTimer::new("watch::open");
            self.shared.apis.open(ids.clone(), display).await?
        };

        let (token, rate) = {
            let mut state = self.shared.state.lock();
            state.handle = Some(opened.handle.clone());
            if let Some(rate) = self.shared.config.effective_poll_rate(opened.poll_rate) {
                state.poll_rate = rate;
            }
            // close() arrived while the open was in flight; it closes the
            // handle stored above once it gets the op lock
            if state.status.is_terminal() {
                return Err(WatchError::Closed("subject"));
            }
            state.status = SubjectStatus::Open;
            let token = CancellationToken::new();
            state.poll_timer = Some(token.clone());
            (token, state.poll_rate)
        };

        info!(
            handle = %opened.handle,
            ids = ids.len(),
            rate_ms = rate.as_millis() as u64,
            "Watch subscription opened"
        );
        self.spawn_poll_loop(token);
        Ok(opened.grid)
    }

    fn spawn_poll_loop(
        &self,
        token: CancellationToken,
    ) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                let delay = match weak.upgrade() {
                    Some(shared) => {
                        let rate = shared.state.lock().poll_rate;
                        rate
                    }
                    None => break,
                };

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(delay) => {}
                }

                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let subject = ApiSubject { shared };
                match subject.fetch(Fetch::Poll).await {
                    Ok(_) => {}
                    Err(e) if e.is_terminal() => {
                        debug!(error = %e, "Poll loop stopped");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Watch poll failed, next attempt at the regular rate");
                    }
                }
            }
        });
    }

    async fn fetch(
        &self,
        fetch: Fetch,
    ) -> WatchResult<Grid> {
        let _op = self.shared.op_lock.lock().await;

        let (handle, token) = {
            let state = self.shared.state.lock();
            state.ensure_usable()?;
            match (&state.handle, &state.poll_timer) {
                (Some(handle), Some(token)) => (handle.clone(), token.clone()),
                // idle: nothing is watched, nothing to fetch
                _ => return Ok(Grid::new()),
            }
        };

        let result = {
            let _timer = ScopedTimer::for_handle(fetch.op(), &handle);
            match fetch {
                Fetch::Poll => self.shared.apis.poll(&handle).await,
                Fetch::Refresh => self.shared.apis.refresh(&handle).await,
            }
        };

        if token.is_cancelled() {
            debug!(%handle, "Discarding result that arrived after close");
            return Err(WatchError::Closed("subject"));
        }

        let PollResult { changed, poll_rate } = match result {
            Ok(polled) => polled,
            Err(e) => return Err(self.fail(&handle, e)),
        };

        {
            let mut state = self.shared.state.lock();
            if let Some(rate) = self.shared.config.effective_poll_rate(poll_rate) {
                if rate != state.poll_rate {
                    debug!(
                        %handle,
                        from_ms = state.poll_rate.as_millis() as u64,
                        to_ms = rate.as_millis() as u64,
                        "Server changed poll rate"
                    );
                    state.poll_rate = rate;
                }
            }
            match fetch {
                Fetch::Poll => {
                    state.grid.merge(&changed);
                }
                Fetch::Refresh => {
                    let mut resynced = Grid::new();
                    resynced.merge(&changed);
                    state.grid = resynced;
                }
            }
        }

        self.shared.listeners.changed(&changed);
        Ok(changed)
    }

    /// Maps a network failure on `handle`. `NotFound` means the server no
    /// longer knows the subscription: the subject becomes `Lost`.
    fn fail(
        &self,
        handle: &SubscriptionHandle,
        error: WatchError,
    ) -> WatchError {
        if !matches!(error, WatchError::NotFound(_)) {
            return error;
        }

        let lost = WatchError::SubscriptionLost {
            handle: handle.to_string(),
        };
        {
            let mut state = self.shared.state.lock();
            state.stop_poll_timer();
            state.status = SubjectStatus::Lost;
            state.handle = None;
            state.grid.clear();
        }
        warn!(%handle, "Watch subscription lost");
        self.shared.listeners.lost(&lost);
        lost
    }
}

#[async_trait]
impl Subject for ApiSubject {
    async fn add_ids(
        &self,
        ids: IdRefs,
    ) -> WatchResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _op = self.shared.op_lock.lock().await;

        let (fresh, handle) = {
            let state = self.shared.state.lock();
            state.ensure_usable()?;
            let fresh: Ids = ids
                .iter()
                .filter(|(id, _)| !state.refs.contains(id))
                .map(|(id, _)| id)
                .collect();
            (fresh, state.handle.clone())
        };

        if fresh.is_empty() {
            self.shared.state.lock().refs.extend(&ids);
            return Ok(());
        }

        let received = match handle {
            None => self.open_subscription(fresh).await?,
            Some(handle) => {
                debug!(%handle, ids = %fresh, "Adding ids to watch subscription");
                let added = {
                    let _timer = ScopedTimer::for_handle("watch::add", &handle);
                    self.shared.apis.add(&handle, fresh).await
                };
                added.map_err(|e| self.fail(&handle, e))?
            }
        };

        {
            let mut state = self.shared.state.lock();
            state.refs.extend(&ids);
            state.grid.merge(&received);
        }
        self.shared.listeners.changed(&received);
        Ok(())
    }

    async fn remove_ids(
        &self,
        ids: IdRefs,
    ) -> WatchResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _op = self.shared.op_lock.lock().await;

        let (released, handle, last) = {
            let mut state = self.shared.state.lock();
            state.ensure_usable()?;

            let mut released = Ids::new();
            for (id, n) in ids.iter() {
                if state.refs.contains(id) && state.refs.release(id, n) == 0 {
                    released.insert(id);
                }
            }
            if released.is_empty() {
                return Ok(());
            }
            state.grid.remove_ids(&released);

            let last = state.refs.is_empty();
            let handle = if last {
                state.stop_poll_timer();
                state.status = SubjectStatus::Idle;
                state.handle.take()
            } else {
                state.handle.clone()
            };
            (released, handle, last)
        };

        let Some(handle) = handle else {
            return Ok(());
        };

        if last {
            let closed = {
                let _timer = ScopedTimer::for_handle("watch::close", &handle);
                self.shared.apis.close(&handle).await
            };
            info!(%handle, "Watch subscription closed, no ids remain");
            return match closed {
                Ok(()) | Err(WatchError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            };
        }

        debug!(%handle, ids = %released, "Removing ids from watch subscription");
        let removed = {
            let _timer = ScopedTimer::for_handle("watch::remove", &handle);
            self.shared.apis.remove(&handle, released).await
        };
        removed.map_err(|e| self.fail(&handle, e))
    }

    async fn poll(&self) -> WatchResult<Grid> {
        self.fetch(Fetch::Poll).await
    }

    async fn refresh(&self) -> WatchResult<Grid> {
        self.fetch(Fetch::Refresh).await
    }

    async fn close(&self) -> WatchResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.status.is_terminal() {
                return Ok(());
            }
            state.status = SubjectStatus::Closing;
            // synchronous: no further poll is scheduled from here on
            state.stop_poll_timer();
        }

        let _op = self.shared.op_lock.lock().await;
        let handle = {
            let mut state = self.shared.state.lock();
            state.status = SubjectStatus::Closed;
            state.refs = IdRefs::new();
            state.grid.clear();
            state.handle.take()
        };

        let result = match handle {
            Some(handle) => {
                let closed = {
                    let _timer = ScopedTimer::for_handle("watch::close", &handle);
                    self.shared.apis.close(&handle).await
                };
                info!(%handle, "Watch subscription closed");
                match closed {
                    Ok(()) | Err(WatchError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            None => Ok(()),
        };

        self.shared.listeners.closed();
        result
    }

    fn snapshot(
        &self,
        ids: &Ids,
    ) -> WatchResult<Grid> {
        let state = self.shared.state.lock();
        state.ensure_usable()?;
        Ok(state.grid.filtered(ids))
    }

    fn subscribe(
        &self,
        listener: Arc<dyn SubjectListener>,
    ) -> WatchResult<ListenerId> {
        self.shared.state.lock().ensure_usable()?;
        Ok(self.shared.listeners.register(listener))
    }

    fn unsubscribe(
        &self,
        id: ListenerId,
    ) {
        self.shared.listeners.unregister(id);
    }

    fn status(&self) -> SubjectStatus {
        self.shared.state.lock().status
    }

    fn poll_rate(&self) -> Duration {
        self.shared.state.lock().poll_rate
    }
}
