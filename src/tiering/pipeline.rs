//! Hot → cold → archive promotion, integrity scans and retention.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::broker::EventPublisher;
use crate::clock::Clock;
use crate::config::TieringConfig;
use crate::error::{Error, Result};
use crate::events::EventEnvelope;
use crate::logging::structured::LogContext;
use crate::resilience::CancelToken;
use crate::scheduler::{PeriodicTask, TaskJob};
use crate::storage::{ArchiveStore, ColdStore, HotStore, StreamId};
use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TieringTask {
    HotToCold,
    ColdToArchive,
    IntegrityCheck,
    RetentionSweep,
}

impl TieringTask {
    pub const ALL: [TieringTask; 4] = [
        TieringTask::HotToCold,
        TieringTask::ColdToArchive,
        TieringTask::IntegrityCheck,
        TieringTask::RetentionSweep,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TieringTask::HotToCold => "hot_to_cold",
            TieringTask::ColdToArchive => "cold_to_archive",
            TieringTask::IntegrityCheck => "integrity_check",
            TieringTask::RetentionSweep => "retention_sweep",
        }
    }

    pub fn period(&self, config: &TieringConfig) -> Duration {
        let secs = match self {
            TieringTask::HotToCold => config.hot_to_cold_interval_secs,
            TieringTask::ColdToArchive => config.cold_to_archive_interval_secs,
            TieringTask::IntegrityCheck => config.integrity_check_interval_secs,
            TieringTask::RetentionSweep => config.retention_sweep_interval_secs,
        };
        Duration::from_secs(secs)
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromotionReport {
    /// Hot entries moved (and removed from the hot tier).
    pub promoted: usize,
    /// Rows newly written to cold; replays of already-promoted ids are not counted.
    pub inserted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub archived: usize,
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub scanned: usize,
    pub tampered: Vec<i64>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.tampered.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub deleted: usize,
    /// Rows deleted per `event_type/agent_mode`, only policies that deleted something.
    pub by_policy: BTreeMap<String, usize>,
}

pub struct TieringPipeline {
    hot: Arc<dyn HotStore>,
    cold: Arc<dyn ColdStore>,
    archive: Arc<dyn ArchiveStore>,
    publisher: Arc<dyn EventPublisher>,
    config: TieringConfig,
    insert_batch_size: usize,
    clock: Arc<dyn Clock>,
    running: [Mutex<()>; 4],
}

impl TieringPipeline {
    pub fn new(
        hot: Arc<dyn HotStore>,
        cold: Arc<dyn ColdStore>,
        archive: Arc<dyn ArchiveStore>,
        publisher: Arc<dyn EventPublisher>,
        config: TieringConfig,
        insert_batch_size: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            hot,
            cold,
            archive,
            publisher,
            config,
            insert_batch_size: insert_batch_size.max(1),
            clock,
            running: Default::default(),
        }
    }

    pub fn config(&self) -> &TieringConfig {
        &self.config
    }

    fn claim(&self, task: TieringTask) -> Result<MutexGuard<'_, ()>> {
        self.running[task.slot()].try_lock().map_err(|_| {
            log_warn!(LogContext::for_task(task.name()), "TIER_RUN_SKIPPED_OVERLAP");
            Error::Conflict(format!("{} is already running", task.name()))
        })
    }

    /// Move hot entries older than `hot_age_secs` into cold.
    ///
    /// Hot entries are removed only after their cold batch commits.
    pub async fn run_hot_to_cold(&self, cancel: &CancelToken) -> Result<PromotionReport> {
        let task = TieringTask::HotToCold;
        let _guard = self.claim(task)?;
        let ctx = LogContext::for_task(task.name());
        let cutoff = self.clock.now() - chrono::Duration::seconds(self.config.hot_age_secs);

        let mut report = PromotionReport::default();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let entries = self.hot.entries_older_than(cutoff, self.insert_batch_size)?;
            if entries.is_empty() {
                break;
            }

            let events: Vec<EventEnvelope> = entries.iter().map(|e| e.event.clone()).collect();
            report.inserted += self.cold.insert_batch(&events)?;

            let mut by_stream: BTreeMap<&str, Vec<StreamId>> = BTreeMap::new();
            for entry in &entries {
                by_stream.entry(entry.key.as_str()).or_default().push(entry.id);
            }
            let mut removed = 0;
            for (key, ids) in &by_stream {
                removed += self.hot.delete(key, ids)?;
            }
            report.promoted += removed;
            log_debug!(ctx, "TIER_HOT_BATCH_PROMOTED", batch = entries.len(), removed = removed);
            if removed == 0 {
                break;
            }
        }

        log_info!(
            ctx,
            "TIER_HOT_TO_COLD_COMPLETE",
            promoted = report.promoted,
            inserted = report.inserted
        );
        Ok(report)
    }

    /// Write expired, archivable cold rows to the archive and flag them.
    pub async fn run_cold_to_archive(&self, cancel: &CancelToken) -> Result<ArchiveReport> {
        let task = TieringTask::ColdToArchive;
        let _guard = self.claim(task)?;
        let ctx = LogContext::for_task(task.name());
        let now = self.clock.now();

        let mut report = ArchiveReport::default();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let rows = self
                .cold
                .archive_candidates(now, self.config.archive_batch_size.max(1))?;
            if rows.is_empty() {
                break;
            }
            let objects = self.archive.put(&rows)?;
            let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
            let marked = self.cold.mark_archived(&ids)?;
            report.archived += marked;
            report.objects.extend(objects);
            if marked == 0 {
                break;
            }
        }

        log_info!(
            ctx,
            "TIER_COLD_TO_ARCHIVE_COMPLETE",
            archived = report.archived,
            objects = report.objects.len()
        );
        Ok(report)
    }

    /// Full scan of the cold tier. Tampered rows raise a `system.error` event.
    pub async fn run_integrity_check(&self, cancel: &CancelToken) -> Result<IntegrityReport> {
        let task = TieringTask::IntegrityCheck;
        let _guard = self.claim(task)?;
        let ctx = LogContext::for_task(task.name());

        let mut report = IntegrityReport::default();
        let mut after_id = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let scan = self
                .cold
                .scan_integrity(after_id, self.config.integrity_batch_size.max(1))?;
            if scan.scanned == 0 {
                break;
            }
            report.scanned += scan.scanned;
            report.tampered.extend(scan.tampered);
            after_id = scan.last_id;
        }

        if report.is_clean() {
            log_info!(ctx, "TIER_INTEGRITY_CHECK_COMPLETE", scanned = report.scanned);
        } else {
            log_error!(
                ctx,
                "TIER_INTEGRITY_VIOLATION",
                scanned = report.scanned,
                tampered = report.tampered.len()
            );
            let mut event = EventEnvelope::system_error(
                self.clock.now(),
                task.name(),
                &format!(
                    "integrity check found {} tampered cold rows",
                    report.tampered.len()
                ),
            );
            event.metadata.insert(
                "tampered_ids".to_string(),
                serde_json::to_value(&report.tampered)?,
            );
            self.announce(&ctx, &event).await;
        }
        Ok(report)
    }

    /// Apply every retention policy once.
    pub async fn run_retention_sweep(&self, cancel: &CancelToken) -> Result<RetentionReport> {
        let task = TieringTask::RetentionSweep;
        let _guard = self.claim(task)?;
        let ctx = LogContext::for_task(task.name());
        let now = self.clock.now();

        let mut report = RetentionReport::default();
        for policy in self.cold.retention_policies()? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let deleted = self.cold.delete_expired(&policy, now)?;
            if deleted > 0 {
                report
                    .by_policy
                    .insert(format!("{}/{}", policy.event_type, policy.agent_mode), deleted);
                report.deleted += deleted;
            }
        }

        log_info!(ctx, "TIER_RETENTION_SWEEP_COMPLETE", deleted = report.deleted);
        Ok(report)
    }

    pub async fn run(&self, task: TieringTask, cancel: &CancelToken) -> Result<()> {
        match task {
            TieringTask::HotToCold => self.run_hot_to_cold(cancel).await.map(drop),
            TieringTask::ColdToArchive => self.run_cold_to_archive(cancel).await.map(drop),
            TieringTask::IntegrityCheck => self.run_integrity_check(cancel).await.map(drop),
            TieringTask::RetentionSweep => self.run_retention_sweep(cancel).await.map(drop),
        }
    }

    async fn announce(&self, ctx: &LogContext, event: &EventEnvelope) {
        if let Err(err) = self.publisher.publish_event(event).await {
            log_warn!(ctx, "TIER_SYSTEM_EVENT_NOT_PUBLISHED", error = err.to_string());
        }
    }

    /// Spawn the four periodic tasks.
    pub fn spawn_all(self: &Arc<Self>, cancel: &CancelToken) -> Vec<PeriodicTask> {
        TieringTask::ALL
            .iter()
            .map(|task| {
                let job = Arc::new(TieringJob {
                    pipeline: self.clone(),
                    task: *task,
                });
                PeriodicTask::spawn(
                    task.name(),
                    task.period(&self.config),
                    job,
                    self.clock.clone(),
                    cancel.child(),
                )
            })
            .collect()
    }
}

/// One tiering task bound to its pipeline.
pub struct TieringJob {
    pipeline: Arc<TieringPipeline>,
    task: TieringTask,
}

#[async_trait]
impl TaskJob for TieringJob {
    async fn run(&self, cancel: &CancelToken) -> Result<()> {
        self.pipeline.run(self.task, cancel).await
    }

    async fn on_failure(&self, err: &Error) {
        if matches!(err, Error::Conflict(_)) {
            return;
        }
        let event = EventEnvelope::system_error(
            self.pipeline.clock.now(),
            self.task.name(),
            &format!("{} failed: {}", self.task.name(), err),
        );
        self.pipeline
            .announce(&LogContext::for_task(self.task.name()), &event)
            .await;
    }
}
