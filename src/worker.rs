use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterEngine;
use crate::collab::Providers;
use crate::config::ExecutionConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::ledger::{FailOutcome, TaskLedger};
use crate::queue::{publish_after, WorkQueue};
use crate::stages;
use crate::store::Store;
use crate::types::{Stage, TaskEnvelope};
use crate::{log_debug, log_info, log_warn};

// --- Shared context ---

/// Everything a stage worker needs: storage, the ledger, the queue, the
/// collaborator bundle, and the clustering engine for the cluster stage.
pub struct WorkerContext {
    pub store: Store,
    pub ledger: TaskLedger,
    pub queue: Arc<dyn WorkQueue>,
    pub providers: Providers,
    pub engine: ClusterEngine,
    pub execution: ExecutionConfig,
}

impl WorkerContext {
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.collaborator_timeout_secs)
    }
}

/// Wrap a collaborator call with the configured timeout. The call is the only
/// suspension point in a handler; everything after it is local persistence.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout(timeout)),
    }
}

/// Exponential backoff for re-delivery of a re-queued task, capped.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let shift = attempt.min(20);
    let delay = base_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(cap_ms))
}

// --- Handler accounting ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandlerOutcome {
    Succeeded,
    Retried,
    DeadLettered,
    /// Claim lost to a concurrent worker; message discarded without error.
    Discarded,
    /// Ledger refused the transition (e.g. a recovery sweep raced us).
    Dropped,
}

/// Totals for one worker's run, returned on shutdown.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerSummary {
    pub handled: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
    pub dropped: u64,
}

impl WorkerSummary {
    fn record(&mut self, outcome: HandlerOutcome) {
        self.handled += 1;
        match outcome {
            HandlerOutcome::Succeeded => self.succeeded += 1,
            HandlerOutcome::Retried => self.retried += 1,
            HandlerOutcome::DeadLettered => self.dead_lettered += 1,
            HandlerOutcome::Discarded => self.discarded += 1,
            HandlerOutcome::Dropped => self.dropped += 1,
        }
    }
}

// --- Worker loop ---

/// Run one stage worker until cancelled or the queue closes.
///
/// Handlers run concurrently up to `max_concurrent`. On cancellation the
/// worker stops claiming new messages but drains in-flight handlers to
/// completion, so no task is stranded in `in_progress` by a clean shutdown.
pub async fn run_worker(
    stage: Stage,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
) -> WorkerSummary {
    let mut summary = WorkerSummary::default();
    let mut handlers: JoinSet<HandlerOutcome> = JoinSet::new();
    let max_concurrent = ctx.execution.max_concurrent.max(1) as usize;

    log_info!(
        "[{}] worker started (max_concurrent={})",
        stage,
        max_concurrent
    );

    loop {
        // Free a slot before taking more work.
        while handlers.len() >= max_concurrent {
            if let Some(joined) = handlers.join_next().await {
                record_joined(&mut summary, stage, joined);
            }
        }

        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            received = ctx.queue.recv(stage) => match received {
                Ok(envelope) => envelope,
                Err(PipelineError::QueueClosed) => break,
                Err(e) => {
                    // Undecodable message: drop it, the ledger row stays
                    // pending and reconciliation will re-emit a clean one.
                    log_warn!("[{}] dropping undecodable message: {}", stage, e);
                    continue;
                }
            }
        };

        if envelope.stage != stage {
            log_warn!(
                "[{}] mis-routed message for stage {} (task {}), discarding",
                stage,
                envelope.stage,
                envelope.task_id
            );
            continue;
        }

        let handler_ctx = Arc::clone(&ctx);
        handlers.spawn(async move { handle_message(handler_ctx, envelope).await });
    }

    // Drain in-flight handlers before exiting.
    while let Some(joined) = handlers.join_next().await {
        record_joined(&mut summary, stage, joined);
    }

    log_info!(
        "[{}] worker stopped: {} handled, {} succeeded, {} retried, {} dead-lettered, {} discarded",
        stage,
        summary.handled,
        summary.succeeded,
        summary.retried,
        summary.dead_lettered,
        summary.discarded
    );
    summary
}

fn record_joined(
    summary: &mut WorkerSummary,
    stage: Stage,
    joined: Result<HandlerOutcome, tokio::task::JoinError>,
) {
    match joined {
        Ok(outcome) => summary.record(outcome),
        Err(e) => log_warn!("[{}] handler task panicked: {}", stage, e),
    }
}

/// Handle one delivered message: claim, run the stage, complete or fail.
///
/// Claim failure means another worker holds (or held) the task; the message
/// is discarded without error. Collaborator errors are translated into a
/// ledger `fail` and never propagate past this function.
pub async fn handle_message(ctx: Arc<WorkerContext>, envelope: TaskEnvelope) -> HandlerOutcome {
    match ctx.ledger.claim(envelope.task_id).await {
        Ok(true) => {}
        Ok(false) => {
            log_debug!(
                "[{}] task {} already handled elsewhere, discarding",
                envelope.stage,
                envelope.task_id
            );
            return HandlerOutcome::Discarded;
        }
        Err(e) => {
            log_warn!(
                "[{}] claim failed for task {}: {}",
                envelope.stage,
                envelope.task_id,
                e
            );
            return HandlerOutcome::Dropped;
        }
    }

    match stages::run_stage(&ctx, &envelope).await {
        Ok(()) => match ctx.ledger.complete(envelope.task_id).await {
            Ok(Some(next)) => {
                if let Err(e) = ctx.queue.publish(next.clone()).await {
                    // Pending successor persists; reconciliation re-emits it.
                    log_warn!(
                        "[{}] publish of successor task {} failed: {}",
                        envelope.stage,
                        next.task_id,
                        e
                    );
                }
                log_info!(
                    "[{}] task {} ({}) succeeded, emitted {}",
                    envelope.stage,
                    envelope.task_id,
                    envelope.product_external_id,
                    next.stage
                );
                HandlerOutcome::Succeeded
            }
            Ok(None) => {
                log_info!(
                    "[{}] task {} ({}) succeeded, pipeline complete",
                    envelope.stage,
                    envelope.task_id,
                    envelope.product_external_id
                );
                HandlerOutcome::Succeeded
            }
            Err(e) => {
                log_warn!(
                    "[{}] complete refused for task {}: {}",
                    envelope.stage,
                    envelope.task_id,
                    e
                );
                HandlerOutcome::Dropped
            }
        },
        Err(error) => {
            log_warn!(
                "[{}] task {} ({}) failed: {}",
                envelope.stage,
                envelope.task_id,
                envelope.product_external_id,
                error
            );
            match ctx
                .ledger
                .fail(envelope.task_id, &error, ctx.execution.max_attempts)
                .await
            {
                Ok(FailOutcome::Requeued(task)) => {
                    let delay = backoff_delay(
                        task.attempt,
                        ctx.execution.backoff_base_ms,
                        ctx.execution.backoff_cap_ms,
                    );
                    publish_after(Arc::clone(&ctx.queue), task.envelope(), delay);
                    HandlerOutcome::Retried
                }
                Ok(FailOutcome::DeadLettered(_)) => HandlerOutcome::DeadLettered,
                Err(e) => {
                    log_warn!(
                        "[{}] fail refused for task {}: {}",
                        envelope.stage,
                        envelope.task_id,
                        e
                    );
                    HandlerOutcome::Dropped
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(backoff_delay(0, 500, 30_000), Duration::from_millis(500));
        assert_eq!(backoff_delay(1, 500, 30_000), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(2, 500, 30_000), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(3, 500, 30_000), Duration::from_millis(4_000));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(10, 500, 30_000), Duration::from_millis(30_000));
        // Huge attempt counts must not overflow the shift
        assert_eq!(backoff_delay(200, 500, 30_000), Duration::from_millis(30_000));
    }
}
