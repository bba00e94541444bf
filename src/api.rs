use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;

use crate::collab::{ListingProvider, LookalikeProvider, SimilarityProvider, TaggingProvider};
use crate::config::ProvidersConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{ListingSnapshot, LookalikeHit, SimilarityCandidate, TagObservation};

/// HTTP client for the four external collaborators, sharing one base URL and
/// connection pool. Every call carries the configured timeout; response
/// statuses are mapped onto the pipeline error taxonomy so workers can decide
/// retry vs dead-letter without looking at HTTP details.
#[derive(Clone)]
pub struct HttpCollaborators {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpCollaborators {
    pub fn new(config: &ProvidersConfig, timeout: Duration) -> PipelineResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            let auth = format!("Bearer {}", key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth)
                    .map_err(|_| PipelineError::Config("invalid api_key value".to_string()))?,
            );
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        subject: &str,
    ) -> PipelineResult<T> {
        let response = self
            .client
            .get(self.endpoint(path))
            .send()
            .await
            .map_err(|e| classify_transport(e, subject, self.timeout))?;
        decode_response(response, subject).await
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        subject: &str,
    ) -> PipelineResult<T> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(e, subject, self.timeout))?;
        decode_response(response, subject).await
    }
}

fn classify_transport(err: reqwest::Error, subject: &str, timeout: Duration) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Timeout(timeout)
    } else {
        PipelineError::Transport(format!("{}: {}", subject, err))
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    subject: &str,
) -> PipelineResult<T> {
    let status = response.status();
    match status {
        StatusCode::NOT_FOUND => Err(PipelineError::SourceMissing(subject.to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(PipelineError::RateLimited(subject.to_string())),
        s if s.is_server_error() => Err(PipelineError::Transport(format!(
            "{}: server returned {}",
            subject, s
        ))),
        s if !s.is_success() => Err(PipelineError::MalformedPayload(format!(
            "{}: unexpected status {}",
            subject, s
        ))),
        _ => response
            .json::<T>()
            .await
            .map_err(|e| PipelineError::MalformedPayload(format!("{}: {}", subject, e))),
    }
}

#[derive(Serialize)]
struct ImageSetRequest<'a> {
    image_urls: &'a [String],
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    image_url: &'a str,
}

#[async_trait]
impl ListingProvider for HttpCollaborators {
    async fn fetch_listing(
        &self,
        marketplace: &str,
        external_id: &str,
    ) -> PipelineResult<ListingSnapshot> {
        let path = format!("/listings/{}/{}", marketplace, external_id);
        self.get_json(&path, external_id).await
    }
}

#[async_trait]
impl TaggingProvider for HttpCollaborators {
    async fn tags_for_images(&self, image_urls: &[String]) -> PipelineResult<TagObservation> {
        self.post_json("/tags", &ImageSetRequest { image_urls }, "tagging")
            .await
    }
}

#[async_trait]
impl LookalikeProvider for HttpCollaborators {
    async fn lookalikes(&self, image_url: &str) -> PipelineResult<Vec<LookalikeHit>> {
        self.post_json("/lookalikes", &ImageRequest { image_url }, "lookalike")
            .await
    }
}

#[async_trait]
impl SimilarityProvider for HttpCollaborators {
    async fn similar_to(&self, image_url: &str) -> PipelineResult<Vec<SimilarityCandidate>> {
        self.post_json("/similar", &ImageRequest { image_url }, "similarity")
            .await
    }
}
