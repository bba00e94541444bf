use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::PipelineResult;
use crate::types::{
    parse_product_status, parse_stage, parse_task_status, Cluster, ClusterMember, ListingSnapshot,
    Product, ProductStatus, Stage, StageTask, TagRecord,
};

/// SQLite busy timeout. Writers queue behind the single write lock instead of
/// failing immediately; genuine contention past this surfaces as retryable.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Relational store for products, tasks, tags, and clusters.
///
/// All invariant-bearing mutations (claim CAS, complete, cluster moves) run
/// through the ledger and clustering engine against this pool; the store owns
/// the schema plus the Product and Tag Record persistence.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> PipelineResult<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> PipelineResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT NOT NULL UNIQUE,
                marketplace TEXT NOT NULL,
                category TEXT,
                price TEXT,
                image_urls TEXT NOT NULL DEFAULT '[]',
                rep_image TEXT,
                sales_count INTEGER,
                last_seen_at TEXT,
                stage TEXT NOT NULL DEFAULT 'ingest',
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stage_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_external_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                run_id TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // The at-most-one-in-progress invariant: at most one live (pending or
        // in_progress) task may exist per (product, stage).
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_stage_tasks_one_live
                ON stage_tasks (product_external_id, stage)
                WHERE status IN ('pending', 'in_progress')",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_stage_tasks_status
                ON stage_tasks (status, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tag_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_external_id TEXT NOT NULL UNIQUE,
                category TEXT,
                brand TEXT,
                model TEXT,
                audience TEXT,
                season TEXT,
                keywords TEXT NOT NULL DEFAULT '[]',
                confidence REAL NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS clusters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_code TEXT NOT NULL UNIQUE,
                founder_external_id TEXT NOT NULL,
                founder_marketplace TEXT NOT NULL,
                member_count INTEGER NOT NULL DEFAULT 0,
                total_sales INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // product_external_id UNIQUE enforces single-cluster membership.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cluster_members (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_code TEXT NOT NULL
                    REFERENCES clusters(cluster_code) ON DELETE CASCADE,
                product_external_id TEXT NOT NULL UNIQUE,
                joined_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cluster_members_code
                ON cluster_members (cluster_code)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- Products ---

    /// Upsert a product from a listing snapshot, keyed on the external id.
    ///
    /// Listing-owned fields (marketplace, category, price, images, sales,
    /// last-seen) are overwritten; pipeline-owned fields (stage, status,
    /// rep_image) are preserved on update. Returns the stored product and
    /// whether a new row was created.
    pub async fn upsert_product(
        &self,
        snapshot: &ListingSnapshot,
    ) -> PipelineResult<(Product, bool)> {
        let now = Utc::now();
        let images = serde_json::to_string(&snapshot.image_urls).unwrap_or_else(|_| "[]".into());

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id FROM products WHERE external_id = ?")
            .bind(&snapshot.external_id)
            .fetch_optional(&mut *tx)
            .await?;

        let created = existing.is_none();
        if created {
            sqlx::query(
                "INSERT INTO products
                    (external_id, marketplace, category, price, image_urls,
                     sales_count, last_seen_at, stage, status, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 'ingest', 'active', ?, ?)",
            )
            .bind(&snapshot.external_id)
            .bind(&snapshot.marketplace)
            .bind(&snapshot.category)
            .bind(&snapshot.price)
            .bind(&images)
            .bind(snapshot.sales_count)
            .bind(snapshot.listed_at)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE products SET marketplace = ?, category = ?, price = ?,
                    image_urls = ?, sales_count = ?, last_seen_at = ?, updated_at = ?
                 WHERE external_id = ?",
            )
            .bind(&snapshot.marketplace)
            .bind(&snapshot.category)
            .bind(&snapshot.price)
            .bind(&images)
            .bind(snapshot.sales_count)
            .bind(snapshot.listed_at)
            .bind(now)
            .bind(&snapshot.external_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let product = self
            .get_product(&snapshot.external_id)
            .await?
            .expect("product row just written");
        Ok((product, created))
    }

    /// Insert a placeholder product awaiting ingest, or re-activate an
    /// existing one. Used by `seed` before any listing data is known.
    pub async fn seed_product(
        &self,
        marketplace: &str,
        external_id: &str,
    ) -> PipelineResult<Product> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO products (external_id, marketplace, stage, status, created_at, updated_at)
             VALUES (?, ?, 'ingest', 'active', ?, ?)
             ON CONFLICT(external_id)
             DO UPDATE SET status = 'active', updated_at = excluded.updated_at",
        )
        .bind(external_id)
        .bind(marketplace)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(self
            .get_product(external_id)
            .await?
            .expect("product row just written"))
    }

    pub async fn get_product(&self, external_id: &str) -> PipelineResult<Option<Product>> {
        let row = sqlx::query("SELECT * FROM products WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| product_from_row(&r)).transpose()
    }

    pub async fn set_product_status(
        &self,
        external_id: &str,
        status: ProductStatus,
    ) -> PipelineResult<()> {
        sqlx::query("UPDATE products SET status = ?, updated_at = ? WHERE external_id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_rep_image(&self, external_id: &str, url: &str) -> PipelineResult<()> {
        sqlx::query("UPDATE products SET rep_image = ?, updated_at = ? WHERE external_id = ?")
            .bind(url)
            .bind(Utc::now())
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Tag records ---

    /// Replace a product's tag record in one statement. The record is written
    /// whole or not at all; re-enrichment overwrites the previous row.
    pub async fn replace_tag_record(&self, record: &TagRecord) -> PipelineResult<()> {
        let keywords = serde_json::to_string(&record.keywords).unwrap_or_else(|_| "[]".into());
        sqlx::query(
            "INSERT INTO tag_records
                (product_external_id, category, brand, model, audience, season,
                 keywords, confidence, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(product_external_id) DO UPDATE SET
                category = excluded.category,
                brand = excluded.brand,
                model = excluded.model,
                audience = excluded.audience,
                season = excluded.season,
                keywords = excluded.keywords,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at",
        )
        .bind(&record.product_external_id)
        .bind(&record.category)
        .bind(&record.brand)
        .bind(&record.model)
        .bind(&record.audience)
        .bind(&record.season)
        .bind(&keywords)
        .bind(record.confidence)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_tag_record(&self, external_id: &str) -> PipelineResult<Option<TagRecord>> {
        let row = sqlx::query("SELECT * FROM tag_records WHERE product_external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| tag_record_from_row(&r)).transpose()
    }

    // --- Clusters (reads; mutation is the clustering engine's) ---

    pub async fn get_cluster(&self, cluster_code: &str) -> PipelineResult<Option<Cluster>> {
        let row = sqlx::query("SELECT * FROM clusters WHERE cluster_code = ?")
            .bind(cluster_code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| cluster_from_row(&r)).transpose()
    }

    pub async fn get_membership(
        &self,
        external_id: &str,
    ) -> PipelineResult<Option<ClusterMember>> {
        let row = sqlx::query("SELECT * FROM cluster_members WHERE product_external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| member_from_row(&r)).transpose()
    }

    pub async fn list_members(&self, cluster_code: &str) -> PipelineResult<Vec<ClusterMember>> {
        let rows = sqlx::query(
            "SELECT * FROM cluster_members WHERE cluster_code = ? ORDER BY joined_at, id",
        )
        .bind(cluster_code)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(member_from_row).collect()
    }

    // --- Status report ---

    /// Per (stage, status) task counts for the status report.
    pub async fn task_counts(&self) -> PipelineResult<Vec<(Stage, crate::types::TaskStatus, i64)>> {
        let rows = sqlx::query(
            "SELECT stage, status, COUNT(*) AS n FROM stage_tasks GROUP BY stage, status",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let stage = parse_stage(&r.try_get::<String, _>("stage")?)
                    .map_err(crate::error::PipelineError::StorageCorruption)?;
                let status = parse_task_status(&r.try_get::<String, _>("status")?)
                    .map_err(crate::error::PipelineError::StorageCorruption)?;
                Ok((stage, status, r.try_get::<i64, _>("n")?))
            })
            .collect()
    }

    /// Per-status product counts for the status report.
    pub async fn product_counts(&self) -> PipelineResult<Vec<(ProductStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM products GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let status = parse_product_status(&r.try_get::<String, _>("status")?)
                    .map_err(crate::error::PipelineError::StorageCorruption)?;
                Ok((status, r.try_get::<i64, _>("n")?))
            })
            .collect()
    }

    /// (cluster count, member rows, summed sales) for the status report.
    pub async fn cluster_totals(&self) -> PipelineResult<(i64, i64, i64)> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM clusters) AS clusters,
                (SELECT COUNT(*) FROM cluster_members) AS members,
                (SELECT COALESCE(SUM(total_sales), 0) FROM clusters) AS sales",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.try_get::<i64, _>("clusters")?,
            row.try_get::<i64, _>("members")?,
            row.try_get::<i64, _>("sales")?,
        ))
    }
}

// --- Row mapping ---

pub(crate) fn product_from_row(row: &SqliteRow) -> PipelineResult<Product> {
    let stage = parse_stage(&row.try_get::<String, _>("stage")?)
        .map_err(crate::error::PipelineError::StorageCorruption)?;
    let status = parse_product_status(&row.try_get::<String, _>("status")?)
        .map_err(crate::error::PipelineError::StorageCorruption)?;
    let images: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("image_urls")?).unwrap_or_default();

    Ok(Product {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        marketplace: row.try_get("marketplace")?,
        category: row.try_get("category")?,
        price: row.try_get("price")?,
        image_urls: images,
        rep_image: row.try_get("rep_image")?,
        sales_count: row.try_get("sales_count")?,
        last_seen_at: row.try_get::<Option<DateTime<Utc>>, _>("last_seen_at")?,
        stage,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn task_from_row(row: &SqliteRow) -> PipelineResult<StageTask> {
    let stage = parse_stage(&row.try_get::<String, _>("stage")?)
        .map_err(crate::error::PipelineError::StorageCorruption)?;
    let status = parse_task_status(&row.try_get::<String, _>("status")?)
        .map_err(crate::error::PipelineError::StorageCorruption)?;

    Ok(StageTask {
        id: row.try_get("id")?,
        product_external_id: row.try_get("product_external_id")?,
        stage,
        run_id: row.try_get("run_id")?,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        status,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tag_record_from_row(row: &SqliteRow) -> PipelineResult<TagRecord> {
    let keywords: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("keywords")?).unwrap_or_default();
    Ok(TagRecord {
        product_external_id: row.try_get("product_external_id")?,
        category: row.try_get("category")?,
        brand: row.try_get("brand")?,
        model: row.try_get("model")?,
        audience: row.try_get("audience")?,
        season: row.try_get("season")?,
        keywords,
        confidence: row.try_get("confidence")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn cluster_from_row(row: &SqliteRow) -> PipelineResult<Cluster> {
    Ok(Cluster {
        id: row.try_get("id")?,
        cluster_code: row.try_get("cluster_code")?,
        founder_external_id: row.try_get("founder_external_id")?,
        founder_marketplace: row.try_get("founder_marketplace")?,
        member_count: row.try_get("member_count")?,
        total_sales: row.try_get("total_sales")?,
        created_at: row.try_get("created_at")?,
    })
}

fn member_from_row(row: &SqliteRow) -> PipelineResult<ClusterMember> {
    Ok(ClusterMember {
        id: row.try_get("id")?,
        cluster_code: row.try_get("cluster_code")?,
        product_external_id: row.try_get("product_external_id")?,
        joined_at: row.try_get("joined_at")?,
    })
}
