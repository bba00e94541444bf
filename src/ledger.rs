use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::{PipelineError, PipelineResult};
use crate::log_error;
use crate::store::{task_from_row, Store};
use crate::types::{Stage, StageTask, TaskEnvelope, TaskStatus};

/// Outcome of a `fail` call.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Transient failure under the attempt cap: the task is pending again and
    /// its envelope should be re-published (after backoff).
    Requeued(StageTask),
    /// Retries exhausted or the failure was permanent.
    DeadLettered(StageTask),
}

/// Durable record of each product's progress through pipeline stages; the
/// single source of truth for "has this unit of work already been done."
///
/// Every transition is an atomically-checked conditional update, so the
/// ledger is safe to drive from any number of concurrent workers.
#[derive(Clone)]
pub struct TaskLedger {
    pool: SqlitePool,
}

impl TaskLedger {
    pub fn new(store: &Store) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    /// Create a pending task for (product, stage) unless a live one already
    /// exists, in which case the existing task is returned unchanged.
    ///
    /// Idempotent by the partial unique index on live tasks: redundant
    /// upstream messages cannot produce duplicate work.
    pub async fn enqueue(
        &self,
        product_external_id: &str,
        stage: Stage,
        run_id: &str,
    ) -> PipelineResult<StageTask> {
        if let Some(existing) = self.find_live(product_external_id, stage).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let insert = sqlx::query(
            "INSERT INTO stage_tasks
                (product_external_id, stage, run_id, attempt, status, created_at, updated_at)
             VALUES (?, ?, ?, 0, 'pending', ?, ?)",
        )
        .bind(product_external_id)
        .bind(stage.as_str())
        .bind(run_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(result) => self.get(result.last_insert_rowid()).await,
            // Lost the insert race to a concurrent enqueue: the winner's row
            // satisfies this call.
            Err(e) if is_unique_violation(&e) => self
                .find_live(product_external_id, stage)
                .await?
                .ok_or_else(|| PipelineError::Storage(e)),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically transition `pending -> in_progress`.
    ///
    /// This is the sole serialization point for at-least-once delivery: the
    /// conditional update succeeds for exactly one concurrent claimer; losers
    /// get `false` and must discard the message without error.
    pub async fn claim(&self, task_id: i64) -> PipelineResult<bool> {
        let result = sqlx::query(
            "UPDATE stage_tasks SET status = 'in_progress', updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Transition `in_progress -> succeeded` and, as one atomic unit, enqueue
    /// the next stage's task and advance the product's stage pointer.
    ///
    /// The stage's own output (product snapshot, tag record, cluster rows) is
    /// persisted by the handler before this call; `complete` seals the ledger
    /// transition. Returns the successor's envelope for publication, or
    /// `None` if this was the final stage. A crash after commit but before
    /// the publish leaves a pending successor with no message, which the
    /// reconciliation pass re-emits.
    pub async fn complete(&self, task_id: i64) -> PipelineResult<Option<TaskEnvelope>> {
        let mut tx = self.pool.begin().await?;

        let task = fetch_task(&mut tx, task_id).await?;
        require_transition(&task, TaskStatus::Succeeded)?;

        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE stage_tasks SET status = 'succeeded', updated_at = ?
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(PipelineError::InvalidTransition {
                task_id,
                from: task.status.to_string(),
                to: TaskStatus::Succeeded.to_string(),
            });
        }

        let successor = match task.stage.next() {
            Some(next_stage) => {
                let successor =
                    enqueue_in_tx(&mut tx, &task.product_external_id, next_stage, &task.run_id)
                        .await?;
                sqlx::query("UPDATE products SET stage = ?, updated_at = ? WHERE external_id = ?")
                    .bind(next_stage.as_str())
                    .bind(now)
                    .bind(&task.product_external_id)
                    .execute(&mut *tx)
                    .await?;
                Some(successor)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(successor.map(|t| t.envelope()))
    }

    /// Record a failure for an in-progress task.
    ///
    /// Retryable failures under the attempt cap re-pend the task with the
    /// attempt counter incremented; permanent failures and exhausted retries
    /// dead-letter it and mark the product failed. Dead-lettering raises the
    /// operator-visible signal (an unconditional error log line).
    pub async fn fail(
        &self,
        task_id: i64,
        error: &PipelineError,
        max_attempts: u32,
    ) -> PipelineResult<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let task = fetch_task(&mut tx, task_id).await?;
        require_transition(&task, TaskStatus::Failed)?;

        let now = Utc::now();
        let message = error.to_string();
        sqlx::query(
            "UPDATE stage_tasks SET status = 'failed', last_error = ?, updated_at = ?
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(&message)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        let attempts_used = task.attempt + 1;
        let retry = error.is_retryable() && attempts_used < max_attempts;

        let outcome = if retry {
            sqlx::query(
                "UPDATE stage_tasks SET status = 'pending', attempt = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(attempts_used as i64)
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            FailOutcome::Requeued(self.get(task_id).await?)
        } else {
            sqlx::query(
                "UPDATE stage_tasks SET status = 'dead_lettered', attempt = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(attempts_used as i64)
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE products SET status = 'failed', updated_at = ? WHERE external_id = ?")
                .bind(now)
                .bind(&task.product_external_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            log_error!(
                "dead-letter: task {} ({} / {}) after {} attempts: {}",
                task_id,
                task.product_external_id,
                task.stage,
                attempts_used,
                message
            );
            FailOutcome::DeadLettered(self.get(task_id).await?)
        };

        Ok(outcome)
    }

    /// Operator replay of a dead-lettered task: reset to pending with a fresh
    /// attempt budget and re-activate the product. Returns the envelope to
    /// publish.
    pub async fn replay(&self, task_id: i64) -> PipelineResult<TaskEnvelope> {
        let mut tx = self.pool.begin().await?;

        let task = fetch_task(&mut tx, task_id).await?;
        require_transition(&task, TaskStatus::Pending)?;

        let now = Utc::now();
        sqlx::query(
            "UPDATE stage_tasks SET status = 'pending', attempt = 0, last_error = NULL,
                updated_at = ?
             WHERE id = ? AND status = 'dead_lettered'",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE products SET status = 'active', updated_at = ? WHERE external_id = ?")
            .bind(now)
            .bind(&task.product_external_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(self.get(task_id).await?.envelope())
    }

    pub async fn get(&self, task_id: i64) -> PipelineResult<StageTask> {
        let row = sqlx::query("SELECT * FROM stage_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => task_from_row(&r),
            None => Err(PipelineError::TaskNotFound(task_id)),
        }
    }

    /// The live (pending or in_progress) task for (product, stage), if any.
    pub async fn find_live(
        &self,
        product_external_id: &str,
        stage: Stage,
    ) -> PipelineResult<Option<StageTask>> {
        let row = sqlx::query(
            "SELECT * FROM stage_tasks
             WHERE product_external_id = ? AND stage = ?
               AND status IN ('pending', 'in_progress')",
        )
        .bind(product_external_id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }
}

// --- Transaction-scoped helpers (shared with the recovery pass) ---

pub(crate) async fn fetch_task(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: i64,
) -> PipelineResult<StageTask> {
    let row = sqlx::query("SELECT * FROM stage_tasks WHERE id = ?")
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await?;
    match row {
        Some(r) => task_from_row(&r),
        None => Err(PipelineError::TaskNotFound(task_id)),
    }
}

/// Enqueue inside an open transaction, reusing a live task if one exists.
pub(crate) async fn enqueue_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    product_external_id: &str,
    stage: Stage,
    run_id: &str,
) -> PipelineResult<StageTask> {
    let existing = sqlx::query(
        "SELECT * FROM stage_tasks
         WHERE product_external_id = ? AND stage = ?
           AND status IN ('pending', 'in_progress')",
    )
    .bind(product_external_id)
    .bind(stage.as_str())
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(row) = existing {
        return task_from_row(&row);
    }

    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO stage_tasks
            (product_external_id, stage, run_id, attempt, status, created_at, updated_at)
         VALUES (?, ?, ?, 0, 'pending', ?, ?)",
    )
    .bind(product_external_id)
    .bind(stage.as_str())
    .bind(run_id)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    fetch_task(tx, result.last_insert_rowid()).await
}

fn require_transition(task: &StageTask, to: TaskStatus) -> PipelineResult<()> {
    if task.status.is_valid_transition(&to) {
        Ok(())
    } else {
        Err(PipelineError::InvalidTransition {
            task_id: task.id,
            from: task.status.to_string(),
            to: to.to_string(),
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}
