use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use opsgraph_core::error::Result;

/// One independent sub-call of a composite tool.
pub struct SubCall<T> {
    pub label: String,
    pub call: BoxFuture<'static, Result<T>>,
}

impl<T> SubCall<T> {
    pub fn new(label: impl Into<String>, call: BoxFuture<'static, Result<T>>) -> Self {
        Self {
            label: label.into(),
            call,
        }
    }
}

/// Outcome of one slot. Failures are carried as text so one bad sub-call
/// never aborts its siblings.
#[derive(Debug, Clone)]
pub struct SlotResult<T> {
    pub label: String,
    pub outcome: std::result::Result<T, String>,
    pub duration_ms: u64,
}

impl<T> SlotResult<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Bounded concurrent dispatcher for composite tools.
#[derive(Debug, Clone)]
pub struct FanOut {
    max_concurrency: usize,
    call_timeout: Duration,
}

impl FanOut {
    pub fn new(max_concurrency: usize, call_timeout: Duration) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run every sub-call and return one slot per call, in declared order.
    ///
    /// Completes only when every sub-call has finished, failed, timed out
    /// or panicked.
    pub async fn run<T: Send + 'static>(&self, calls: Vec<SubCall<T>>) -> Vec<SlotResult<T>> {
        let total = calls.len();
        debug!(calls = total, max_concurrency = self.max_concurrency, "Fan-out started");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let call_timeout = self.call_timeout;

        let mut handles = Vec::with_capacity(total);
        for SubCall { label, call } in calls {
            let semaphore = semaphore.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| format!("worker pool closed: {}", e))?;
                let started = Instant::now();
                let outcome = match tokio::time::timeout(call_timeout, call).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {}s", call_timeout.as_secs())),
                };
                Ok::<_, String>((outcome, started.elapsed().as_millis() as u64))
            });
            handles.push((label, handle));
        }

        let mut slots = Vec::with_capacity(total);
        for (label, handle) in handles {
            let (outcome, duration_ms) = match handle.await {
                Ok(Ok((outcome, ms))) => (outcome, ms),
                Ok(Err(pool_err)) => (Err(pool_err), 0),
                Err(join_err) => {
                    warn!(slot = %label, error = %join_err, "Sub-call task failed");
                    (Err(format!("sub-call aborted: {}", join_err)), 0)
                }
            };
            slots.push(SlotResult {
                label,
                outcome,
                duration_ms,
            });
        }

        let failed = slots.iter().filter(|s| !s.is_ok()).count();
        debug!(calls = total, failed, "Fan-out finished");
        slots
    }
}
