use chrono::Utc;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::config::ClusteringConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::log_debug;
use crate::store::Store;
use crate::types::{Product, SimilarityCandidate};

/// Cluster code derived from the founding member: stable across re-runs, so
/// re-processing the same product from scratch lands on the same code.
pub fn derive_cluster_code(marketplace: &str, external_id: &str) -> String {
    format!("{}_{}", marketplace, external_id)
}

/// What `assign` did for a product.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignOutcome {
    /// Existing membership already matches the target; nothing written.
    Unchanged(String),
    /// No surviving candidate: a new singleton cluster was founded.
    CreatedSingleton(String),
    /// Bootstrap case: highest-scoring unclustered candidate founded a new
    /// cluster holding both it and the assigned product.
    CreatedPair { code: String, partner: String },
    /// Joined an existing cluster.
    Joined(String),
    /// Membership moved from one cluster to another as one atomic unit.
    Moved { from: String, to: String },
}

/// A surviving candidate that already belongs to a cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberedCandidate {
    pub external_id: String,
    pub score: f64,
    pub cluster_code: String,
    pub member_count: i64,
}

/// Tie-break among clusters that already hold a surviving candidate: largest
/// member count wins, then lowest cluster code for determinism.
pub fn choose_target_cluster(membered: &[MemberedCandidate]) -> Option<&MemberedCandidate> {
    membered.iter().min_by(|a, b| {
        b.member_count
            .cmp(&a.member_count)
            .then_with(|| a.cluster_code.cmp(&b.cluster_code))
    })
}

/// Candidates at or above the threshold, excluding the product itself (the
/// search provider may echo the query product back).
pub fn surviving_candidates<'a>(
    product_external_id: &str,
    candidates: &'a [SimilarityCandidate],
    threshold: f64,
) -> Vec<&'a SimilarityCandidate> {
    candidates
        .iter()
        .filter(|c| c.score >= threshold && c.external_id != product_external_id)
        .collect()
}

/// Incremental cluster assignment over the Cluster/ClusterMember tables.
///
/// Every `assign` runs inside a single transaction; member counts and the
/// aggregate sales statistic move with the membership rows, never separately.
/// Concurrent assigns that touch the same cluster serialize on the storage
/// write lock; past the busy timeout the whole operation retries, re-reading
/// all state, so no increment is ever based on a stale count.
///
/// Founding-member choice is order-dependent: two products discovered as
/// mutual near-duplicates in opposite orders converge on one cluster only
/// because code derivation is deterministic from whichever is processed
/// first. This is best-effort, not a strict guarantee.
#[derive(Clone)]
pub struct ClusterEngine {
    pool: SqlitePool,
    threshold: f64,
    max_retries: u32,
}

impl ClusterEngine {
    pub fn new(store: &Store, config: &ClusteringConfig) -> Self {
        Self {
            pool: store.pool().clone(),
            threshold: config.score_threshold,
            max_retries: config.assign_max_retries,
        }
    }

    /// Assign `product` to a cluster given its similarity candidates.
    ///
    /// Idempotent: re-running with unchanged candidates is a no-op; changed
    /// candidates produce a move (old membership removed, counts adjusted,
    /// new membership added, all in one transaction).
    pub async fn assign(
        &self,
        product: &Product,
        candidates: &[SimilarityCandidate],
    ) -> PipelineResult<AssignOutcome> {
        let mut attempt = 0u32;
        loop {
            match self.try_assign(product, candidates).await {
                Err(PipelineError::Contention(e)) if attempt < self.max_retries => {
                    attempt += 1;
                    log_debug!(
                        "assign contention for {} (attempt {}): {}",
                        product.external_id,
                        attempt,
                        e
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(25 * attempt as u64))
                        .await;
                }
                other => return other,
            }
        }
    }

    async fn try_assign(
        &self,
        product: &Product,
        candidates: &[SimilarityCandidate],
    ) -> PipelineResult<AssignOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = current_membership(&mut tx, &product.external_id).await?;
        let surviving = surviving_candidates(&product.external_id, candidates, self.threshold);

        let outcome = if surviving.is_empty() {
            match existing {
                // Candidates disappearing does not eject an existing member;
                // provider noise must not split clusters.
                Some(code) => AssignOutcome::Unchanged(code),
                None => {
                    let code = derive_cluster_code(&product.marketplace, &product.external_id);
                    let created = create_cluster_if_absent(
                        &mut tx,
                        &code,
                        &product.external_id,
                        &product.marketplace,
                    )
                    .await?;
                    add_member(&mut tx, &code, &product.external_id).await?;
                    if created {
                        AssignOutcome::CreatedSingleton(code)
                    } else {
                        // Same code already exists from an earlier run; the
                        // deterministic derivation makes this a re-join.
                        AssignOutcome::Joined(code)
                    }
                }
            }
        } else {
            let membered = membered_candidates(&mut tx, &surviving).await?;
            match choose_target_cluster(&membered) {
                Some(target) => {
                    let code = target.cluster_code.clone();
                    match existing {
                        Some(old) if old == code => AssignOutcome::Unchanged(code),
                        Some(old) => {
                            remove_member(&mut tx, &old, &product.external_id).await?;
                            add_member(&mut tx, &code, &product.external_id).await?;
                            AssignOutcome::Moved { from: old, to: code }
                        }
                        None => {
                            add_member(&mut tx, &code, &product.external_id).await?;
                            AssignOutcome::Joined(code)
                        }
                    }
                }
                None => {
                    // Bootstrap: no surviving candidate is clustered yet. The
                    // highest-scoring one founds the cluster and joins it
                    // together with the product.
                    let best = surviving
                        .iter()
                        .max_by(|a, b| {
                            a.score
                                .partial_cmp(&b.score)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .expect("surviving is non-empty");
                    let code = derive_cluster_code(&best.marketplace, &best.external_id);
                    create_cluster_if_absent(&mut tx, &code, &best.external_id, &best.marketplace)
                        .await?;
                    add_member(&mut tx, &code, &best.external_id).await?;
                    match existing {
                        Some(old) if old == code => AssignOutcome::Unchanged(code),
                        Some(old) => {
                            remove_member(&mut tx, &old, &product.external_id).await?;
                            add_member(&mut tx, &code, &product.external_id).await?;
                            AssignOutcome::Moved { from: old, to: code }
                        }
                        None => {
                            add_member(&mut tx, &code, &product.external_id).await?;
                            AssignOutcome::CreatedPair {
                                code,
                                partner: best.external_id.clone(),
                            }
                        }
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

// --- Transaction-scoped operations ---

async fn current_membership(
    tx: &mut Transaction<'_, Sqlite>,
    external_id: &str,
) -> PipelineResult<Option<String>> {
    let row = sqlx::query("SELECT cluster_code FROM cluster_members WHERE product_external_id = ?")
        .bind(external_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row
        .map(|r| r.try_get::<String, _>("cluster_code"))
        .transpose()?)
}

async fn membered_candidates(
    tx: &mut Transaction<'_, Sqlite>,
    surviving: &[&SimilarityCandidate],
) -> PipelineResult<Vec<MemberedCandidate>> {
    let mut membered = Vec::new();
    for candidate in surviving {
        let row = sqlx::query(
            "SELECT m.cluster_code AS cluster_code, c.member_count AS member_count
             FROM cluster_members m
             JOIN clusters c ON c.cluster_code = m.cluster_code
             WHERE m.product_external_id = ?",
        )
        .bind(&candidate.external_id)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some(row) = row {
            membered.push(MemberedCandidate {
                external_id: candidate.external_id.clone(),
                score: candidate.score,
                cluster_code: row.try_get("cluster_code")?,
                member_count: row.try_get("member_count")?,
            });
        }
    }
    Ok(membered)
}

/// Insert the cluster row if absent. Returns true when a new cluster was
/// created.
async fn create_cluster_if_absent(
    tx: &mut Transaction<'_, Sqlite>,
    code: &str,
    founder_external_id: &str,
    founder_marketplace: &str,
) -> PipelineResult<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO clusters
            (cluster_code, founder_external_id, founder_marketplace,
             member_count, total_sales, created_at)
         VALUES (?, ?, ?, 0, 0, ?)",
    )
    .bind(code)
    .bind(founder_external_id)
    .bind(founder_marketplace)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Sales contribution of a product, for the cluster aggregate. Candidates
/// that are not in the local store contribute zero.
async fn sales_of(tx: &mut Transaction<'_, Sqlite>, external_id: &str) -> PipelineResult<i64> {
    let row = sqlx::query("SELECT sales_count FROM products WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row
        .and_then(|r| r.try_get::<Option<i64>, _>("sales_count").ok().flatten())
        .unwrap_or(0))
}

/// Add a membership row and move the count and sales aggregate with it, in
/// the enclosing transaction. Skips silently if the product is already a
/// member of this cluster.
async fn add_member(
    tx: &mut Transaction<'_, Sqlite>,
    code: &str,
    external_id: &str,
) -> PipelineResult<()> {
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO cluster_members (cluster_code, product_external_id, joined_at)
         VALUES (?, ?, ?)",
    )
    .bind(code)
    .bind(external_id)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    if inserted.rows_affected() == 1 {
        let sales = sales_of(tx, external_id).await?;
        sqlx::query(
            "UPDATE clusters SET member_count = member_count + 1, total_sales = total_sales + ?
             WHERE cluster_code = ?",
        )
        .bind(sales)
        .bind(code)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Remove a membership row with its count and sales contribution; delete the
/// cluster when its last member leaves.
async fn remove_member(
    tx: &mut Transaction<'_, Sqlite>,
    code: &str,
    external_id: &str,
) -> PipelineResult<()> {
    let removed = sqlx::query(
        "DELETE FROM cluster_members WHERE cluster_code = ? AND product_external_id = ?",
    )
    .bind(code)
    .bind(external_id)
    .execute(&mut **tx)
    .await?;

    if removed.rows_affected() == 1 {
        let sales = sales_of(tx, external_id).await?;
        sqlx::query(
            "UPDATE clusters SET member_count = member_count - 1, total_sales = total_sales - ?
             WHERE cluster_code = ?",
        )
        .bind(sales)
        .bind(code)
        .execute(&mut **tx)
        .await?;
        sqlx::query("DELETE FROM clusters WHERE cluster_code = ? AND member_count <= 0")
            .bind(code)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(external_id: &str, score: f64) -> SimilarityCandidate {
        SimilarityCandidate {
            external_id: external_id.to_string(),
            marketplace: "mk".to_string(),
            score,
        }
    }

    fn membered(
        external_id: &str,
        score: f64,
        cluster_code: &str,
        member_count: i64,
    ) -> MemberedCandidate {
        MemberedCandidate {
            external_id: external_id.to_string(),
            score,
            cluster_code: cluster_code.to_string(),
            member_count,
        }
    }

    #[test]
    fn cluster_code_is_deterministic() {
        assert_eq!(derive_cluster_code("taobao", "item-9"), "taobao_item-9");
        assert_eq!(
            derive_cluster_code("taobao", "item-9"),
            derive_cluster_code("taobao", "item-9")
        );
    }

    #[test]
    fn surviving_filters_below_threshold() {
        let candidates = vec![candidate("a", 0.84), candidate("b", 0.85), candidate("c", 0.99)];
        let surviving = surviving_candidates("q", &candidates, 0.85);
        let ids: Vec<&str> = surviving.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn surviving_excludes_the_product_itself() {
        let candidates = vec![candidate("q", 1.0), candidate("b", 0.9)];
        let surviving = surviving_candidates("q", &candidates, 0.85);
        let ids: Vec<&str> = surviving.iter().map(|c| c.external_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn target_prefers_largest_cluster() {
        let membered = vec![
            membered("a", 0.99, "mk_a", 2),
            membered("b", 0.86, "mk_b", 5),
        ];
        let target = choose_target_cluster(&membered).unwrap();
        assert_eq!(target.cluster_code, "mk_b");
    }

    #[test]
    fn target_tie_breaks_on_lowest_code() {
        let membered = vec![
            membered("a", 0.9, "mk_zz", 3),
            membered("b", 0.9, "mk_aa", 3),
        ];
        let target = choose_target_cluster(&membered).unwrap();
        assert_eq!(target.cluster_code, "mk_aa");
    }

    #[test]
    fn target_of_empty_is_none() {
        assert!(choose_target_cluster(&[]).is_none());
    }
}
