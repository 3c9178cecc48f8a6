//! Periodic status reports for long transfers.
//!
//! A [`Monitor`] samples the position of a transfer at a fixed interval and
//! hands it to a [`StatusSetter`], skipping samples that have not moved. An
//! upload feeds it through the [`Progress`] returned by [`Monitor::progress`].

use crate::TroveError;
use crate::progress::Progress;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    pub current: u64,
    pub total: u64,
}

pub trait StatusSetter: Send + Sync {
    fn set_status(&self, status: Status);
}

pub struct Monitor {
    current: Arc<AtomicU64>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Monitor {
    /// Starts reporting on a transfer of `total` bytes. A zero interval
    /// means [`DEFAULT_UPDATE_INTERVAL`]. Must be called within a tokio
    /// runtime.
    pub fn start(total: u64, interval: Duration, setter: Arc<dyn StatusSetter>) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_UPDATE_INTERVAL
        } else {
            interval
        };
        let current = Arc::new(AtomicU64::new(0));
        let (stop, mut stopped) = oneshot::channel::<()>();

        let sampled = current.clone();
        let task = tokio::spawn(async move {
            let mut last = None;
            loop {
                report(&sampled, total, setter.as_ref(), &mut last);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = &mut stopped => {
                        report(&sampled, total, setter.as_ref(), &mut last);
                        return;
                    }
                }
            }
        });

        Self {
            current,
            stop: Some(stop),
            task,
        }
    }

    pub fn update(&self, current: u64) {
        self.current.store(current, Ordering::Relaxed);
    }

    /// Returns a [`Progress`] that records transferred totals on this
    /// monitor and forwards every event to `inner`.
    pub fn progress(&self, inner: Arc<dyn Progress>) -> MonitorProgress {
        MonitorProgress {
            current: self.current.clone(),
            inner,
        }
    }

    /// Sends a final status and waits for the reporting task to exit.
    /// The setter is not called again after this returns.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "transfer monitor exited abnormally");
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn report(current: &AtomicU64, total: u64, setter: &dyn StatusSetter, last: &mut Option<Status>) {
    let status = Status {
        current: current.load(Ordering::Relaxed),
        total,
    };
    if *last != Some(status) {
        setter.set_status(status);
        *last = Some(status);
    }
}

pub struct MonitorProgress {
    current: Arc<AtomicU64>,
    inner: Arc<dyn Progress>,
}

impl Progress for MonitorProgress {
    fn start(&self, upload_id: &str, expires: Option<DateTime<Utc>>) {
        self.inner.start(upload_id, expires);
    }

    fn transferred(&self, total: u64) {
        self.current.store(total, Ordering::Relaxed);
        self.inner.transferred(total);
    }

    fn error(&self, err: &TroveError) {
        self.inner.error(err);
    }

    fn finalizing(&self) {
        self.inner.finalizing();
    }
}
