//! Utilities used in [`blobsync`][`crate`]

use std::{
    future::Future,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use n0_future::task::AbortOnDropHandle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// A debounced background job.
///
/// [`DeferredTask::schedule`] requests one run of the job. Requests made while a run is
/// already pending collapse into that run; a request made while the job is running results
/// in exactly one more run once it finishes. Runs never overlap.
///
/// The job stops when the cancellation token fires or the task is dropped.
#[derive(Debug, Clone)]
pub(crate) struct DeferredTask {
    notify: Arc<Notify>,
    cancel: CancellationToken,
    _task: Arc<AbortOnDropHandle<()>>,
}

impl DeferredTask {
    /// Spawns the job loop. The job is not run until scheduled.
    pub(crate) fn spawn<F, Fut>(cancel: CancellationToken, span: Span, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let notify = Arc::new(Notify::new());
        let task = tokio::task::spawn({
            let notify = notify.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = notify.notified() => {}
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = job() => {}
                    }
                }
            }
            .instrument(span)
        });
        Self {
            notify,
            cancel,
            _task: Arc::new(AbortOnDropHandle::new(task)),
        }
    }

    /// Requests a run of the job.
    pub(crate) fn schedule(&self) {
        if !self.cancel.is_cancelled() {
            self.notify.notify_one();
        }
    }

    /// Stops the job loop. A run in progress is interrupted at its next suspension point.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Milliseconds since the unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
