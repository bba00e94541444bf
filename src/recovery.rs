use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionConfig;
use crate::error::PipelineResult;
use crate::ledger::TaskLedger;
use crate::queue::WorkQueue;
use crate::store::{task_from_row, Store};
use crate::types::Stage;
use crate::{log_debug, log_info, log_warn};

/// Counts from one recovery pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    /// Stale in-progress claims returned to pending and re-emitted.
    pub reclaimed: u64,
    /// Succeeded tasks whose successor was missing and has been re-enqueued.
    pub reconciled: u64,
    /// Pending tasks re-emitted because no worker picked them up in time.
    pub re_emitted: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed == 0 && self.reconciled == 0 && self.re_emitted == 0
    }
}

/// Repair pass for the gaps concurrent workers cannot close themselves:
/// claims orphaned by a crashed worker, and the window between a committed
/// `complete` and the publish of the successor message.
///
/// Runs at worker startup and then on a fixed cadence. Every action is
/// idempotent: re-emission produces duplicate deliveries at worst, and the
/// claim CAS discards those.
pub struct Recovery {
    pool: SqlitePool,
    ledger: TaskLedger,
    queue: Arc<dyn WorkQueue>,
    stale_claim_secs: i64,
    /// Pending tasks older than this get their envelope re-emitted; one sweep
    /// interval, so a lost publish is repaired within a single sweep.
    pending_cutoff_secs: i64,
}

impl Recovery {
    pub fn new(
        store: &Store,
        ledger: TaskLedger,
        queue: Arc<dyn WorkQueue>,
        execution: &ExecutionConfig,
    ) -> Self {
        Self {
            pool: store.pool().clone(),
            ledger,
            queue,
            stale_claim_secs: execution.stale_claim_secs,
            pending_cutoff_secs: execution.sweep_interval_secs as i64,
        }
    }

    /// Run all repair steps once.
    pub async fn run_once(&self) -> PipelineResult<SweepReport> {
        let mut report = SweepReport::default();
        report.reclaimed = self.sweep_stale_claims().await?;
        report.reconciled = self.reconcile_missing_successors().await?;
        report.re_emitted = self.re_emit_stuck_pending().await?;
        Ok(report)
    }

    /// Re-queue tasks stuck in `in_progress` past the stale-claim timeout.
    /// A claim without a matching completion means the worker crashed; the
    /// attempt counter is preserved so a crash loop still dead-letters.
    pub async fn sweep_stale_claims(&self) -> PipelineResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.stale_claim_secs);
        let rows = sqlx::query(
            "UPDATE stage_tasks SET status = 'pending', updated_at = ?
             WHERE status = 'in_progress' AND updated_at < ?
             RETURNING *",
        )
        .bind(Utc::now())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = 0u64;
        for row in &rows {
            let task = task_from_row(row)?;
            log_warn!(
                "recovery: reclaimed stale claim on task {} ({} / {})",
                task.id,
                task.product_external_id,
                task.stage
            );
            self.publish(task.envelope()).await;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Find succeeded tasks with no successor task at the next stage and
    /// re-enqueue the successor. Closes the crash window between marking a
    /// stage succeeded and publishing the next stage's message.
    pub async fn reconcile_missing_successors(&self) -> PipelineResult<u64> {
        let mut reconciled = 0u64;

        for stage in Stage::ALL {
            let Some(next_stage) = stage.next() else {
                continue;
            };

            let rows = sqlx::query(
                "SELECT t.product_external_id AS pid, t.run_id AS run_id, MAX(t.id) AS tid
                 FROM stage_tasks t
                 JOIN products p ON p.external_id = t.product_external_id
                 WHERE t.stage = ? AND t.status = 'succeeded' AND p.status = 'active'
                   AND NOT EXISTS (
                        SELECT 1 FROM stage_tasks s
                        WHERE s.product_external_id = t.product_external_id
                          AND s.stage = ?)
                 GROUP BY t.product_external_id",
            )
            .bind(stage.as_str())
            .bind(next_stage.as_str())
            .fetch_all(&self.pool)
            .await?;

            for row in &rows {
                let pid: String = row.try_get("pid")?;
                let run_id: String = row.try_get("run_id")?;
                let task = self.ledger.enqueue(&pid, next_stage, &run_id).await?;
                log_warn!(
                    "recovery: re-enqueued missing {} task for {} (task {})",
                    next_stage,
                    pid,
                    task.id
                );
                self.publish(task.envelope()).await;
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    /// Re-emit envelopes for pending tasks that have sat unclaimed past the
    /// stale window. Covers messages lost between a ledger commit and the
    /// queue publish. Duplicate deliveries are harmless: the claim CAS keeps
    /// processing at-most-once per task.
    pub async fn re_emit_stuck_pending(&self) -> PipelineResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.pending_cutoff_secs);
        let rows = sqlx::query(
            "SELECT t.* FROM stage_tasks t
             JOIN products p ON p.external_id = t.product_external_id
             WHERE t.status = 'pending' AND t.updated_at < ? AND p.status = 'active'",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut re_emitted = 0u64;
        for row in &rows {
            let task = task_from_row(row)?;
            log_debug!(
                "recovery: re-emitting pending task {} ({} / {})",
                task.id,
                task.product_external_id,
                task.stage
            );
            self.publish(task.envelope()).await;
            re_emitted += 1;
        }
        Ok(re_emitted)
    }

    async fn publish(&self, envelope: crate::types::TaskEnvelope) {
        if let Err(e) = self.queue.publish(envelope.clone()).await {
            log_warn!(
                "recovery: publish failed for task {}: {}",
                envelope.task_id,
                e
            );
        }
    }
}

/// Periodic recovery loop: one pass per interval, never overlapping, until
/// cancelled. The first pass runs immediately so startup repairs whatever a
/// previous process left behind.
pub async fn run_sweep_loop(
    recovery: Recovery,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    loop {
        match recovery.run_once().await {
            Ok(report) if !report.is_empty() => {
                log_info!(
                    "recovery: {} reclaimed, {} reconciled, {} re-emitted",
                    report.reclaimed,
                    report.reconciled,
                    report.re_emitted
                );
            }
            Ok(_) => {}
            Err(e) => log_warn!("recovery pass failed: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
