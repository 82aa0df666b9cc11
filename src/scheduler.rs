//! Named periodic tasks.
//!
//! Each task runs its job on a fixed period inside one spawned loop, so runs
//! of the same task never overlap. The returned [`PeriodicTask`] handle
//! exposes the next scheduled run, the last error and a cancellation method,
//! and can trigger an out-of-schedule run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::logging::structured::LogContext;
use crate::resilience::CancelToken;
use crate::{log_debug, log_error, log_info};

/// Work executed on every tick.
#[async_trait]
pub trait TaskJob: Send + Sync {
    async fn run(&self, cancel: &CancelToken) -> Result<()>;

    /// Called after a failed run, before waiting for the next tick.
    async fn on_failure(&self, _err: &Error) {}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatus {
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub failure_count: u64,
}

pub struct PeriodicTask {
    name: String,
    status: Arc<Mutex<TaskStatus>>,
    cancel: CancelToken,
    trigger: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawn `job` every `period`, first run one period from now.
    pub fn spawn(
        name: &str,
        period: Duration,
        job: Arc<dyn TaskJob>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Self {
        let status = Arc::new(Mutex::new(TaskStatus {
            next_run: Some(clock.now() + to_chrono(period)),
            ..TaskStatus::default()
        }));
        let trigger = Arc::new(Notify::new());

        let loop_name = name.to_string();
        let loop_status = status.clone();
        let loop_cancel = cancel.clone();
        let loop_trigger = trigger.clone();
        let handle = tokio::spawn(async move {
            let ctx = LogContext::for_task(&loop_name);
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log_info!(ctx, "TASK_STARTED", period_secs = period.as_secs());

            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = loop_trigger.notified() => {
                        log_debug!(ctx, "TASK_TRIGGERED");
                    }
                }

                let started = clock.now();
                let outcome = job.run(&loop_cancel).await;
                {
                    let mut status = loop_status.lock();
                    status.last_run = Some(started);
                    status.run_count += 1;
                    status.next_run = Some(clock.now() + to_chrono(period));
                    match &outcome {
                        Ok(()) => status.last_error = None,
                        Err(err) => {
                            status.failure_count += 1;
                            status.last_error = Some(err.to_string());
                        }
                    }
                }
                match outcome {
                    Ok(()) => {}
                    Err(Error::Cancelled) => break,
                    Err(err) => {
                        log_error!(ctx, "TASK_FAILED", error = err.to_string());
                        job.on_failure(&err).await;
                    }
                }
            }

            loop_status.lock().next_run = None;
            log_info!(ctx, "TASK_STOPPED");
        });

        Self {
            name: name.to_string(),
            status,
            cancel,
            trigger,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.status.lock().clone()
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.status.lock().next_run
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.lock().last_error.clone()
    }

    pub fn run_count(&self) -> u64 {
        self.status.lock().run_count
    }

    /// Run once as soon as the current run, if any, finishes.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for the loop to exit, up to `deadline`.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log_error!(
                        LogContext::for_task(&self.name),
                        "TASK_PANICKED",
                        error = err.to_string()
                    );
                }
                Err(_) => return Err(Error::Timeout(deadline)),
            }
        }
        Ok(())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn to_chrono(period: Duration) -> chrono::Duration {
    chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
