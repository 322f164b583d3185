use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;

use super::ApiSubject;
use super::BatchSubject;
use super::Subject;
use super::SubjectStatus;
use super::Watch;
use super::WatchApis;
use crate::Grid;
use crate::Ids;
use crate::Result;
use crate::WatchConfig;
use crate::WatchError;
use crate::WatchResult;

/// Entry point for applications: hands out [`Watch`]es that share one
/// batched network subscription.
///
/// The shared subject is created on the first [`make`](Self::make). If the
/// server loses it, watches already made stay failed and the next `make`
/// builds a fresh one.
pub struct WatchService {
    apis: Arc<dyn WatchApis>,
    config: WatchConfig,
    subject: Mutex<Option<Arc<dyn Subject>>>,
    watches: DashMap<String, Watch>,
    closed: AtomicBool,
}

impl std::fmt::Debug for WatchService {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchService")
            .field("config", &self.config)
            .field("watches", &self.watches.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl WatchService {
    pub fn new(
        apis: Arc<dyn WatchApis>,
        config: WatchConfig,
    ) -> Self {
        Self {
            apis,
            config,
            subject: Mutex::new(None),
            watches: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn builder(apis: Arc<dyn WatchApis>) -> WatchServiceBuilder {
        WatchServiceBuilder::new(apis)
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Opens a watch over `ids`.
    ///
    /// Watches made concurrently (for example from one `join!`) are coalesced
    /// into a single network call. `grid`, if given, is the initial snapshot
    /// until the server first reports on these ids.
    ///
    /// # Errors
    /// - [`WatchError::Closed`] after [`close`](Self::close)
    /// - any failure of the network open/add carrying these ids
    pub async fn make(
        &self,
        display: impl Into<String>,
        ids: impl Into<Ids>,
        grid: Option<Grid>,
    ) -> WatchResult<Watch> {
        let subject = self.current_subject()?;
        let watch = Watch::open(subject, ids.into(), display.into(), grid).await?;

        if self.closed.load(Ordering::Acquire) {
            // service closed while the open was in flight
            let _ = watch.close().await;
            return Err(WatchError::Closed("watch service"));
        }

        self.prune();
        self.watches.insert(watch.id().to_string(), watch.clone());
        debug!(watch_id = %watch.id(), open_watches = self.watches.len(), "Watch registered");
        Ok(watch)
    }

    /// Closes every watch made by this service, then the shared subject.
    /// Calling it again is a no-op.
    pub async fn close(&self) -> WatchResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let watches: Vec<Watch> = self.watches.iter().map(|entry| entry.value().clone()).collect();
        self.watches.clear();

        let subject = self.subject.lock().take();
        let result = match subject {
            Some(subject) => Watch::close_all(&subject, watches).await,
            None => Ok(()),
        };
        info!("Watch service closed");
        result
    }

    /// Watches made by this service that are still open. Closed and lost
    /// watches are dropped from the registry on the way.
    pub fn open_watches(&self) -> Vec<Watch> {
        self.prune();
        self.watches.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Status of the shared subject, `None` before the first `make`.
    pub fn subject_status(&self) -> Option<SubjectStatus> {
        self.subject.lock().as_ref().map(|subject| subject.status())
    }

    fn prune(&self) {
        self.watches.retain(|_, watch| watch.is_open());
    }

    #[cfg(test)]
    pub(super) fn registered_watches(&self) -> usize {
        self.watches.len()
    }

    fn current_subject(&self) -> WatchResult<Arc<dyn Subject>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WatchError::Closed("watch service"));
        }

        let mut slot = self.subject.lock();
        if let Some(subject) = slot.as_ref() {
            if !subject.status().is_terminal() {
                return Ok(subject.clone());
            }
            info!(status = ?subject.status(), "Replacing terminated watch subject");
        }

        let api: Arc<dyn Subject> = Arc::new(ApiSubject::new(self.apis.clone(), self.config.clone()));
        let subject: Arc<dyn Subject> = Arc::new(BatchSubject::new(api, self.config.batch_window()));
        *slot = Some(subject.clone());
        Ok(subject)
    }
}

pub struct WatchServiceBuilder {
    apis: Arc<dyn WatchApis>,
    config: WatchConfig,
}

impl WatchServiceBuilder {
    /// Create a new builder with default config
    pub fn new(apis: Arc<dyn WatchApis>) -> Self {
        Self {
            apis,
            config: WatchConfig::default(),
        }
    }

    /// Set the poll interval used until the server reports one (default: 5s)
    pub fn default_poll_rate(
        mut self,
        rate: Duration,
    ) -> Self {
        self.config.default_poll_rate_ms = rate.as_millis() as u64;
        self
    }

    /// Set the floor for server-reported poll rates (default: 500ms)
    pub fn min_poll_rate(
        mut self,
        rate: Duration,
    ) -> Self {
        self.config.min_poll_rate_ms = rate.as_millis() as u64;
        self
    }

    /// Set the add/remove coalescing window (default: next scheduler turn)
    pub fn batch_window(
        mut self,
        window: Duration,
    ) -> Self {
        self.config.batch_window_ms = window.as_millis() as u64;
        self
    }

    pub fn subscription_display(
        mut self,
        display: impl Into<String>,
    ) -> Self {
        self.config.subscription_display = display.into();
        self
    }

    /// Completely replaces the configuration, discarding anything set through
    /// the individual setters so far.
    ///
    /// # Example
    /// ```ignore
    /// let config = ClientConfig::new()?.validate()?;
    /// let service = WatchService::builder(apis).set_config(config.watch).build()?;
    /// ```
    pub fn set_config(
        mut self,
        config: WatchConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and builds the service
    pub fn build(self) -> Result<WatchService> {
        self.config.validate()?;
        Ok(WatchService::new(self.apis, self.config))
    }
}
