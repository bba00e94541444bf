#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use clusterline::cluster::ClusterEngine;
use clusterline::collab::{Providers, Scripted};
use clusterline::config::{ClusteringConfig, ExecutionConfig};
use clusterline::error::PipelineResult;
use clusterline::ledger::TaskLedger;
use clusterline::queue::{MemoryQueue, WorkQueue};
use clusterline::store::Store;
use clusterline::types::{
    ListingSnapshot, LookalikeHit, Product, SimilarityCandidate, TagObservation,
};
use clusterline::worker::WorkerContext;

/// Opens a store backed by a fresh temp-dir SQLite file. The `TempDir` must
/// be held for the lifetime of the test.
pub async fn temp_store() -> (TempDir, Store) {
    let dir = TempDir::new().expect("create tempdir");
    let store = Store::open(&dir.path().join("clusterline.db"))
        .await
        .expect("open store");
    (dir, store)
}

/// A listing snapshot with one image and a fixed sales count.
pub fn snapshot(external_id: &str, marketplace: &str) -> ListingSnapshot {
    snapshot_with_sales(external_id, marketplace, 10)
}

pub fn snapshot_with_sales(
    external_id: &str,
    marketplace: &str,
    sales_count: i64,
) -> ListingSnapshot {
    ListingSnapshot {
        external_id: external_id.to_string(),
        marketplace: marketplace.to_string(),
        category: Some("sneakers".to_string()),
        price: Some("128-168".to_string()),
        image_urls: vec![format!("https://img.example/{}/main.jpg", external_id)],
        sales_count: Some(sales_count),
        listed_at: Some(Utc::now()),
    }
}

/// Upserts a full product row (with images and sales) and returns it.
pub async fn stored_product(store: &Store, external_id: &str, marketplace: &str) -> Product {
    let (product, _) = store
        .upsert_product(&snapshot(external_id, marketplace))
        .await
        .expect("upsert product");
    product
}

pub fn candidate(external_id: &str, score: f64) -> SimilarityCandidate {
    SimilarityCandidate {
        external_id: external_id.to_string(),
        marketplace: "mk".to_string(),
        score,
    }
}

pub fn tag_observation(confidence: f64) -> TagObservation {
    TagObservation {
        category: Some("sneakers".to_string()),
        brand: Some("acme".to_string()),
        model: Some("runner-2".to_string()),
        audience: Some("unisex".to_string()),
        season: Some("all".to_string()),
        keywords: vec!["mesh".to_string(), "white".to_string()],
        confidence,
        rep_image: None,
    }
}

/// Providers that return scripted result sequences, one per call, in order.
pub fn scripted_providers(
    listings: Vec<PipelineResult<ListingSnapshot>>,
    tags: Vec<PipelineResult<TagObservation>>,
    lookalikes: Vec<PipelineResult<Vec<LookalikeHit>>>,
    similars: Vec<PipelineResult<Vec<SimilarityCandidate>>>,
) -> Providers {
    Providers {
        listing: Arc::new(Scripted::new(listings)),
        tagging: Arc::new(Scripted::new(tags)),
        lookalike: Arc::new(Scripted::new(lookalikes)),
        similarity: Arc::new(Scripted::new(similars)),
    }
}

/// Execution config with near-instant backoff so retry tests run fast.
pub fn test_execution() -> ExecutionConfig {
    ExecutionConfig {
        max_attempts: 3,
        collaborator_timeout_secs: 5,
        backoff_base_ms: 1,
        backoff_cap_ms: 4,
        max_concurrent: 4,
        stale_claim_secs: 600,
        sweep_interval_secs: 60,
    }
}

/// Full worker context over the given store and providers, with its own
/// in-process queue (reachable as `ctx.queue`).
pub fn make_context(store: &Store, providers: Providers) -> Arc<WorkerContext> {
    let ledger = TaskLedger::new(store);
    let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new(64));
    let engine = ClusterEngine::new(store, &ClusteringConfig::default());
    Arc::new(WorkerContext {
        store: store.clone(),
        ledger,
        queue,
        providers,
        engine,
        execution: test_execution(),
    })
}
