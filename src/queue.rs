use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{PipelineError, PipelineResult};
use crate::log_warn;
use crate::types::{Stage, TaskEnvelope};

/// Ordered, at-least-once delivery channel carrying stage-transition messages
/// between workers. One logical queue per stage; messages are the JSON
/// envelope shape shared by all stages.
///
/// Implementations must preserve publish order per stage. Duplicate delivery
/// is allowed (and produced by the recovery pass); consumers de-duplicate via
/// the ledger claim.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, envelope: TaskEnvelope) -> PipelineResult<()>;

    /// Wait for the next message for `stage`. Errors with `QueueClosed` once
    /// the queue can produce no more messages.
    async fn recv(&self, stage: Stage) -> PipelineResult<TaskEnvelope>;
}

// --- Envelope codec ---

pub fn encode_envelope(envelope: &TaskEnvelope) -> PipelineResult<String> {
    serde_json::to_string(envelope)
        .map_err(|e| PipelineError::MalformedPayload(format!("envelope encode: {}", e)))
}

pub fn decode_envelope(raw: &str) -> PipelineResult<TaskEnvelope> {
    serde_json::from_str(raw)
        .map_err(|e| PipelineError::MalformedPayload(format!("envelope decode: {}", e)))
}

// --- In-process queue ---

struct StageChannel {
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

/// In-process work queue: one bounded FIFO channel per stage, shared by all
/// workers of that stage. Messages travel as encoded envelopes so the wire
/// shape is exercised even without an external broker.
pub struct MemoryQueue {
    channels: HashMap<Stage, StageChannel>,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        let mut channels = HashMap::new();
        for stage in Stage::ALL {
            let (tx, rx) = mpsc::channel(capacity);
            channels.insert(
                stage,
                StageChannel {
                    tx,
                    rx: Mutex::new(rx),
                },
            );
        }
        Self { channels }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, envelope: TaskEnvelope) -> PipelineResult<()> {
        let raw = encode_envelope(&envelope)?;
        let channel = self
            .channels
            .get(&envelope.stage)
            .ok_or(PipelineError::QueueClosed)?;
        channel
            .tx
            .send(raw)
            .await
            .map_err(|_| PipelineError::QueueClosed)
    }

    async fn recv(&self, stage: Stage) -> PipelineResult<TaskEnvelope> {
        let channel = self.channels.get(&stage).ok_or(PipelineError::QueueClosed)?;
        let mut rx = channel.rx.lock().await;
        match rx.recv().await {
            Some(raw) => decode_envelope(&raw),
            None => Err(PipelineError::QueueClosed),
        }
    }
}

/// Publish `envelope` after `delay` without holding up the caller. Used for
/// backoff between re-deliveries of a re-queued task. If the publish fails
/// the message is only logged: the pending ledger row remains, and the
/// reconciliation pass will re-emit it.
pub fn publish_after(queue: Arc<dyn WorkQueue>, envelope: TaskEnvelope, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = queue.publish(envelope.clone()).await {
            log_warn!(
                "delayed publish failed for task {} ({}): {}",
                envelope.task_id,
                envelope.stage,
                e
            );
        }
    });
}
