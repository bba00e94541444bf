use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::PipelineResult;
use crate::types::{ListingSnapshot, LookalikeHit, SimilarityCandidate, TagObservation};

// --- Collaborator traits ---

/// Source-listing lookup by external id. Returns a normalized snapshot, or
/// `SourceMissing` / `RateLimited` through the error channel.
#[async_trait]
pub trait ListingProvider: Send + Sync {
    async fn fetch_listing(
        &self,
        marketplace: &str,
        external_id: &str,
    ) -> PipelineResult<ListingSnapshot>;
}

/// Tagging model: image set in, tag set plus confidence out.
#[async_trait]
pub trait TaggingProvider: Send + Sync {
    async fn tags_for_images(&self, image_urls: &[String]) -> PipelineResult<TagObservation>;
}

/// Secondary lookup: representative image in, candidate look-alike
/// descriptions out. Merged into the tag record's keywords.
#[async_trait]
pub trait LookalikeProvider: Send + Sync {
    async fn lookalikes(&self, image_url: &str) -> PipelineResult<Vec<LookalikeHit>>;
}

/// Similarity search: representative image in, ranked candidate list out.
#[async_trait]
pub trait SimilarityProvider: Send + Sync {
    async fn similar_to(&self, image_url: &str) -> PipelineResult<Vec<SimilarityCandidate>>;
}

/// The full collaborator bundle a worker set needs.
#[derive(Clone)]
pub struct Providers {
    pub listing: Arc<dyn ListingProvider>,
    pub tagging: Arc<dyn TaggingProvider>,
    pub lookalike: Arc<dyn LookalikeProvider>,
    pub similarity: Arc<dyn SimilarityProvider>,
}

// --- Scripted providers for tests ---

/// Scripted provider backing: returns a configured sequence of results, one
/// per call, in order. Enables deterministic worker and engine tests.
pub struct Scripted<T> {
    results: Mutex<Vec<PipelineResult<T>>>,
}

impl<T> Scripted<T> {
    pub fn new(results: Vec<PipelineResult<T>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: Mutex::new(reversed),
        }
    }

    async fn next(&self, provider: &str) -> PipelineResult<T> {
        let mut results = self.results.lock().await;
        results.pop().unwrap_or_else(|| {
            Err(crate::error::PipelineError::MalformedPayload(format!(
                "scripted {} provider: no more results in sequence",
                provider
            )))
        })
    }
}

#[async_trait]
impl ListingProvider for Scripted<ListingSnapshot> {
    async fn fetch_listing(
        &self,
        _marketplace: &str,
        _external_id: &str,
    ) -> PipelineResult<ListingSnapshot> {
        self.next("listing").await
    }
}

#[async_trait]
impl TaggingProvider for Scripted<TagObservation> {
    async fn tags_for_images(&self, _image_urls: &[String]) -> PipelineResult<TagObservation> {
        self.next("tagging").await
    }
}

#[async_trait]
impl LookalikeProvider for Scripted<Vec<LookalikeHit>> {
    async fn lookalikes(&self, _image_url: &str) -> PipelineResult<Vec<LookalikeHit>> {
        self.next("lookalike").await
    }
}

#[async_trait]
impl SimilarityProvider for Scripted<Vec<SimilarityCandidate>> {
    async fn similar_to(&self, _image_url: &str) -> PipelineResult<Vec<SimilarityCandidate>> {
        self.next("similarity").await
    }
}
