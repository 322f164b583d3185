use tokio::time::Instant;
use tracing::trace;

/// Emits a `timing` trace event for one network round trip when dropped.
pub(crate) struct ScopedTimer {
    start: Instant,
    op: &'static str,
    handle: Option<String>,
}

impl ScopedTimer {
    pub(crate) fn new(op: &'static str) -> Self {
        Self {
            start: Instant::now(),
            op,
            handle: None,
        }
    }

    pub(crate) fn for_handle(
        op: &'static str,
        handle: &impl ToString,
    ) -> Self {
        Self {
            start: Instant::now(),
            op,
            handle: Some(handle.to_string()),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        match &self.handle {
            Some(handle) => trace!(target: "timing", op = self.op, %handle, elapsed_ms, "watch api call"),
            None => trace!(target: "timing", op = self.op, elapsed_ms, "watch api call"),
        }
    }
}
