use chrono::Utc;

use crate::error::{PipelineError, PipelineResult};
use crate::types::{Product, Stage, TagRecord, TaskEnvelope};
use crate::worker::{with_timeout, WorkerContext};

/// Dispatch one claimed task to its stage handler.
///
/// Each handler makes its collaborator round first and persists only after
/// the collaborator has returned; nothing is written speculatively.
pub async fn run_stage(ctx: &WorkerContext, envelope: &TaskEnvelope) -> PipelineResult<()> {
    match envelope.stage {
        Stage::Ingest => ingest(ctx, envelope).await,
        Stage::Enrich => enrich(ctx, envelope).await,
        Stage::Cluster => cluster(ctx, envelope).await,
    }
}

async fn load_product(ctx: &WorkerContext, external_id: &str) -> PipelineResult<Product> {
    ctx.store
        .get_product(external_id)
        .await?
        .ok_or_else(|| PipelineError::ProductNotFound(external_id.to_string()))
}

/// Ingest: fetch the normalized listing snapshot and upsert the product row.
/// Re-ingestion of a known external id updates in place, never duplicates.
async fn ingest(ctx: &WorkerContext, envelope: &TaskEnvelope) -> PipelineResult<()> {
    let product = load_product(ctx, &envelope.product_external_id).await?;

    let snapshot = with_timeout(
        ctx.collaborator_timeout(),
        ctx.providers
            .listing
            .fetch_listing(&product.marketplace, &product.external_id),
    )
    .await?;

    if snapshot.external_id != product.external_id {
        return Err(PipelineError::MalformedPayload(format!(
            "listing returned external id '{}' for '{}'",
            snapshot.external_id, product.external_id
        )));
    }

    ctx.store.upsert_product(&snapshot).await?;
    Ok(())
}

/// Enrich: run the tagging model over the image set, look up look-alike
/// descriptions for the representative image, and write the merged tag
/// record in one atomic replacement.
async fn enrich(ctx: &WorkerContext, envelope: &TaskEnvelope) -> PipelineResult<()> {
    let product = load_product(ctx, &envelope.product_external_id).await?;

    if product.image_urls.is_empty() {
        return Err(PipelineError::MalformedPayload(format!(
            "product {} has no images to tag",
            product.external_id
        )));
    }

    let tags = with_timeout(
        ctx.collaborator_timeout(),
        ctx.providers.tagging.tags_for_images(&product.image_urls),
    )
    .await?;

    let rep_image = tags
        .rep_image
        .clone()
        .or_else(|| product.rep_image.clone())
        .unwrap_or_else(|| product.image_urls[0].clone());

    let hits = with_timeout(
        ctx.collaborator_timeout(),
        ctx.providers.lookalike.lookalikes(&rep_image),
    )
    .await?;

    let mut keywords = tags.keywords.clone();
    for hit in &hits {
        if !keywords.contains(&hit.description) {
            keywords.push(hit.description.clone());
        }
    }

    let record = TagRecord {
        product_external_id: product.external_id.clone(),
        category: tags.category,
        brand: tags.brand,
        model: tags.model,
        audience: tags.audience,
        season: tags.season,
        keywords,
        confidence: tags.confidence.clamp(0.0, 1.0),
        updated_at: Utc::now(),
    };

    ctx.store.replace_tag_record(&record).await?;
    ctx.store
        .set_rep_image(&product.external_id, &rep_image)
        .await?;
    Ok(())
}

/// Cluster: fetch similarity candidates for the representative image and run
/// the incremental assignment. A similarity failure fails the task retryably;
/// the engine itself never partially writes.
async fn cluster(ctx: &WorkerContext, envelope: &TaskEnvelope) -> PipelineResult<()> {
    let product = load_product(ctx, &envelope.product_external_id).await?;

    let rep_image = product
        .rep_image
        .clone()
        .or_else(|| product.image_urls.first().cloned())
        .ok_or_else(|| {
            PipelineError::MalformedPayload(format!(
                "product {} has no representative image",
                product.external_id
            ))
        })?;

    let candidates = with_timeout(
        ctx.collaborator_timeout(),
        ctx.providers.similarity.similar_to(&rep_image),
    )
    .await?;

    ctx.engine.assign(&product, &candidates).await?;
    Ok(())
}
