use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Enums ---

/// Ordered pipeline stages. Data flows strictly forward.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Enrich,
    Cluster,
}

impl Stage {
    /// The stage that follows this one, or `None` after the final stage.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Ingest => Some(Stage::Enrich),
            Stage::Enrich => Some(Stage::Cluster),
            Stage::Cluster => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Enrich => "enrich",
            Stage::Cluster => "cluster",
        }
    }

    pub const ALL: [Stage; 3] = [Stage::Ingest, Stage::Enrich, Stage::Cluster];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn parse_stage(s: &str) -> Result<Stage, String> {
    match s.to_lowercase().as_str() {
        "ingest" => Ok(Stage::Ingest),
        "enrich" => Ok(Stage::Enrich),
        "cluster" => Ok(Stage::Cluster),
        _ => Err(format!(
            "Invalid stage '{}': expected ingest, enrich, or cluster",
            s
        )),
    }
}

/// Stage task lifecycle states.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
    DeadLettered,
}

impl TaskStatus {
    /// Validates whether a transition from this status to `to` is allowed.
    ///
    /// Rules:
    /// - Pending -> InProgress (claim)
    /// - InProgress -> Succeeded (complete)
    /// - InProgress -> Failed (fail, before the retry decision)
    /// - Failed -> Pending (retryable, under the attempt cap)
    /// - Failed -> DeadLettered (non-retryable, or cap exhausted)
    /// - DeadLettered -> Pending (operator replay)
    /// - Succeeded is terminal
    pub fn is_valid_transition(&self, to: &TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Succeeded)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (Failed, DeadLettered)
                | (DeadLettered, Pending)
        )
    }

    /// A live task occupies the (product, stage) uniqueness slot.
    pub fn is_live(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn parse_task_status(s: &str) -> Result<TaskStatus, String> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(TaskStatus::Pending),
        "in_progress" => Ok(TaskStatus::InProgress),
        "succeeded" => Ok(TaskStatus::Succeeded),
        "failed" => Ok(TaskStatus::Failed),
        "dead_lettered" => Ok(TaskStatus::DeadLettered),
        _ => Err(format!(
            "Invalid task status '{}': expected pending, in_progress, succeeded, failed, or dead_lettered",
            s
        )),
    }
}

/// Product-level disposition. `Excluded` is a soft delete: the row stays but
/// every read path and the reconciliation pass skip it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    #[default]
    Active,
    Excluded,
    Failed,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Active => "active",
            ProductStatus::Excluded => "excluded",
            ProductStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn parse_product_status(s: &str) -> Result<ProductStatus, String> {
    match s.to_lowercase().as_str() {
        "active" => Ok(ProductStatus::Active),
        "excluded" => Ok(ProductStatus::Excluded),
        "failed" => Ok(ProductStatus::Failed),
        _ => Err(format!(
            "Invalid product status '{}': expected active, excluded, or failed",
            s
        )),
    }
}

// --- Structs ---

/// One external catalog item.
///
/// `external_id` is unique and immutable; re-ingestion of the same identifier
/// is an upsert. `price` is opaque text -- source formats vary and are never
/// coerced to a numeric type.
#[derive(Clone, Debug, PartialEq)]
pub struct Product {
    pub id: i64,
    pub external_id: String,
    pub marketplace: String,
    pub category: Option<String>,
    pub price: Option<String>,
    pub image_urls: Vec<String>,
    /// Image chosen at enrich time to represent the product in similarity search.
    pub rep_image: Option<String>,
    pub sales_count: Option<i64>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub stage: Stage,
    pub status: ProductStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row per (product, pipeline run, stage) in the task ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct StageTask {
    pub id: i64,
    pub product_external_id: String,
    pub stage: Stage,
    pub run_id: String,
    pub attempt: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageTask {
    /// Build the queue envelope for this task, stamped now.
    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope {
            task_id: self.id,
            product_external_id: self.product_external_id.clone(),
            stage: self.stage,
            attempt: self.attempt,
            emitted_at: Utc::now(),
        }
    }
}

/// AI-derived attributes of a product, one-to-one with `Product`.
/// Written only after the enrich stage succeeds; replaced atomically,
/// never partially updated.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TagRecord {
    pub product_external_id: String,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub audience: Option<String>,
    pub season: Option<String>,
    pub keywords: Vec<String>,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

/// A group of near-duplicate products.
///
/// `cluster_code` derives deterministically from the founding member so that
/// re-runs are idempotent. `member_count` always equals the count of
/// associated member rows; a cluster with zero members is deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    pub id: i64,
    pub cluster_code: String,
    pub founder_external_id: String,
    pub founder_marketplace: String,
    pub member_count: i64,
    pub total_sales: i64,
    pub created_at: DateTime<Utc>,
}

/// Association between a cluster and a product. A product belongs to at most
/// one cluster at any time.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterMember {
    pub id: i64,
    pub cluster_code: String,
    pub product_external_id: String,
    pub joined_at: DateTime<Utc>,
}

// --- Queue envelope ---

/// Work queue message carrying one stage transition. JSON shape shared by all
/// stages; delivery is at-least-once, so consumers must tolerate duplicates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskEnvelope {
    pub task_id: i64,
    pub product_external_id: String,
    pub stage: Stage,
    pub attempt: u32,
    pub emitted_at: DateTime<Utc>,
}

// --- Collaborator payloads ---

/// Normalized product snapshot returned by the source-listing collaborator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ListingSnapshot {
    pub external_id: String,
    pub marketplace: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub sales_count: Option<i64>,
    #[serde(default)]
    pub listed_at: Option<DateTime<Utc>>,
}

/// Tag set produced by the tagging collaborator for one product's images.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TagObservation {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    /// Image the tagger considers most representative, if it designates one.
    #[serde(default)]
    pub rep_image: Option<String>,
}

/// One candidate description from the look-alike lookup collaborator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LookalikeHit {
    pub description: String,
}

/// One ranked result from the similarity-search collaborator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SimilarityCandidate {
    pub external_id: String,
    pub marketplace: String,
    pub score: f64,
}
