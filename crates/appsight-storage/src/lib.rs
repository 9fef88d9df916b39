//! Store traits, in-memory + Postgres implementations, and the shared HTTP
//! client used by live provider APIs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use appsight_core::{
    AdRevenueRecord, AppEntity, AppStoreRecord, CollectionLogEntry, CollectionStatus,
    CredentialRecord, GooglePlayRecord, Plan, SourceCredentials, SourceKind, StripeRecord,
    UserAccount,
};

pub const CRATE_NAME: &str = "appsight-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

pub type StoreResult<T> = Result<T, StorageError>;

/// Inclusive date-range filter with a caller-supplied page size.
#[derive(Debug, Clone, Copy)]
pub struct DateFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: usize,
}

impl Default for DateFilter {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            limit: 100,
        }
    }
}

impl DateFilter {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    fn matches(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

/// Audit log filter: by user, by creation time, newest-first page.
#[derive(Debug, Clone, Copy)]
pub struct LogFilter {
    pub user_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            since: None,
            limit: 50,
        }
    }
}

/// Per-day sums over ad revenue rows, for dashboard charting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdRevenueDailySummary {
    pub date: NaiveDate,
    pub total_revenue: f64,
    pub total_impressions: i64,
    pub total_clicks: i64,
}

/// Keyed upsert target for every adapter's normalized output. Each upsert
/// replaces the metric fields under the record's natural key.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn upsert_ad_revenue(&self, record: AdRevenueRecord) -> StoreResult<()>;
    async fn upsert_app_store(&self, record: AppStoreRecord) -> StoreResult<()>;
    async fn upsert_google_play(&self, record: GooglePlayRecord) -> StoreResult<()>;
    async fn upsert_stripe(&self, record: StripeRecord) -> StoreResult<()>;

    async fn ad_revenue(&self, user_id: Uuid, filter: DateFilter)
        -> StoreResult<Vec<AdRevenueRecord>>;
    async fn app_store(&self, user_id: Uuid, filter: DateFilter)
        -> StoreResult<Vec<AppStoreRecord>>;
    async fn google_play(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<GooglePlayRecord>>;
    async fn stripe(&self, user_id: Uuid, filter: DateFilter) -> StoreResult<Vec<StripeRecord>>;

    async fn ad_revenue_daily_summary(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<AdRevenueDailySummary>>;
}

/// Append-only collection audit trail.
#[async_trait]
pub trait CollectionLogStore: Send + Sync {
    async fn append(&self, entry: CollectionLogEntry) -> StoreResult<()>;
    async fn list(&self, filter: LogFilter) -> StoreResult<Vec<CollectionLogEntry>>;
}

/// Read model over the opaque credential store; the pipeline only reads
/// configured records and stamps connectivity-test results.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Configured credentials for a user, in load order.
    async fn configured_for_user(&self, user_id: Uuid) -> StoreResult<Vec<CredentialRecord>>;
    async fn mark_tested(
        &self,
        user_id: Uuid,
        source: SourceKind,
        status: &str,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn verified_users(&self) -> StoreResult<Vec<UserAccount>>;
    async fn set_last_collection(&self, user_id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Read-only directory of user-owned apps, for entity linking.
#[async_trait]
pub trait AppDirectory: Send + Sync {
    async fn apps_for_user(&self, user_id: Uuid) -> StoreResult<Vec<AppEntity>>;
}

/// Bundle of the five store handles threaded through the pipeline.
#[derive(Clone)]
pub struct Stores {
    pub metrics: Arc<dyn MetricsStore>,
    pub logs: Arc<dyn CollectionLogStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub users: Arc<dyn UserStore>,
    pub apps: Arc<dyn AppDirectory>,
}

impl Stores {
    pub fn in_memory() -> (Self, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::default());
        let stores = Self {
            metrics: memory.clone(),
            logs: memory.clone(),
            credentials: memory.clone(),
            users: memory.clone(),
            apps: memory.clone(),
        };
        (stores, memory)
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self::from_pg(Arc::new(PgStore::new(pool)))
    }

    pub fn from_pg(pg: Arc<PgStore>) -> Self {
        Self {
            metrics: pg.clone(),
            logs: pg.clone(),
            credentials: pg.clone(),
            users: pg.clone(),
            apps: pg,
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    ad_revenue: BTreeMap<(Uuid, NaiveDate, String, String), AdRevenueRecord>,
    app_store: BTreeMap<(Uuid, NaiveDate, String), AppStoreRecord>,
    google_play: BTreeMap<(Uuid, NaiveDate, String), GooglePlayRecord>,
    stripe: BTreeMap<(Uuid, NaiveDate), StripeRecord>,
    logs: Vec<CollectionLogEntry>,
    credentials: Vec<CredentialRecord>,
    users: Vec<UserAccount>,
    apps: Vec<AppEntity>,
}

/// Single-process store used by tests and local development. Every mutation
/// is either a key-scoped replace or an append, so concurrent writers from
/// parallel user runs never race on a read-modify-write.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub async fn add_user(&self, user: UserAccount) {
        self.inner.write().await.users.push(user);
    }

    pub async fn add_credential(&self, record: CredentialRecord) {
        self.inner.write().await.credentials.push(record);
    }

    pub async fn add_app(&self, app: AppEntity) {
        self.inner.write().await.apps.push(app);
    }

    pub async fn user(&self, user_id: Uuid) -> Option<UserAccount> {
        self.inner
            .read()
            .await
            .users
            .iter()
            .find(|u| u.id == user_id)
            .cloned()
    }

    pub async fn log_count(&self) -> usize {
        self.inner.read().await.logs.len()
    }

    pub async fn ad_revenue_row_count(&self) -> usize {
        self.inner.read().await.ad_revenue.len()
    }

    pub async fn google_play_row_count(&self) -> usize {
        self.inner.read().await.google_play.len()
    }
}

fn sorted_page<T, K: Ord>(mut rows: Vec<T>, key: impl Fn(&T) -> K, limit: usize) -> Vec<T> {
    rows.sort_by_key(|r| std::cmp::Reverse(key(r)));
    rows.truncate(limit);
    rows
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn upsert_ad_revenue(&self, record: AdRevenueRecord) -> StoreResult<()> {
        let key = (
            record.user_id,
            record.date,
            record.app_id.clone(),
            record.country.clone(),
        );
        self.inner.write().await.ad_revenue.insert(key, record);
        Ok(())
    }

    async fn upsert_app_store(&self, record: AppStoreRecord) -> StoreResult<()> {
        let key = (record.user_id, record.date, record.app_id.clone());
        self.inner.write().await.app_store.insert(key, record);
        Ok(())
    }

    async fn upsert_google_play(&self, record: GooglePlayRecord) -> StoreResult<()> {
        let key = (record.user_id, record.date, record.package_name.clone());
        self.inner.write().await.google_play.insert(key, record);
        Ok(())
    }

    async fn upsert_stripe(&self, record: StripeRecord) -> StoreResult<()> {
        let key = (record.user_id, record.date);
        self.inner.write().await.stripe.insert(key, record);
        Ok(())
    }

    async fn ad_revenue(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<AdRevenueRecord>> {
        let inner = self.inner.read().await;
        let rows = inner
            .ad_revenue
            .values()
            .filter(|r| r.user_id == user_id && filter.matches(r.date))
            .cloned()
            .collect();
        Ok(sorted_page(rows, |r: &AdRevenueRecord| r.date, filter.limit))
    }

    async fn app_store(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<AppStoreRecord>> {
        let inner = self.inner.read().await;
        let rows = inner
            .app_store
            .values()
            .filter(|r| r.user_id == user_id && filter.matches(r.date))
            .cloned()
            .collect();
        Ok(sorted_page(rows, |r: &AppStoreRecord| r.date, filter.limit))
    }

    async fn google_play(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<GooglePlayRecord>> {
        let inner = self.inner.read().await;
        let rows = inner
            .google_play
            .values()
            .filter(|r| r.user_id == user_id && filter.matches(r.date))
            .cloned()
            .collect();
        Ok(sorted_page(rows, |r: &GooglePlayRecord| r.date, filter.limit))
    }

    async fn stripe(&self, user_id: Uuid, filter: DateFilter) -> StoreResult<Vec<StripeRecord>> {
        let inner = self.inner.read().await;
        let rows = inner
            .stripe
            .values()
            .filter(|r| r.user_id == user_id && filter.matches(r.date))
            .cloned()
            .collect();
        Ok(sorted_page(rows, |r: &StripeRecord| r.date, filter.limit))
    }

    async fn ad_revenue_daily_summary(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<AdRevenueDailySummary>> {
        let inner = self.inner.read().await;
        let mut by_date: BTreeMap<NaiveDate, AdRevenueDailySummary> = BTreeMap::new();
        for record in inner
            .ad_revenue
            .values()
            .filter(|r| r.user_id == user_id && filter.matches(r.date))
        {
            let entry = by_date
                .entry(record.date)
                .or_insert_with(|| AdRevenueDailySummary {
                    date: record.date,
                    total_revenue: 0.0,
                    total_impressions: 0,
                    total_clicks: 0,
                });
            entry.total_revenue += record.estimated_revenue;
            entry.total_impressions += record.impressions;
            entry.total_clicks += record.clicks;
        }
        let rows = by_date.into_values().collect();
        Ok(sorted_page(
            rows,
            |r: &AdRevenueDailySummary| r.date,
            filter.limit,
        ))
    }
}

#[async_trait]
impl CollectionLogStore for MemoryStore {
    async fn append(&self, entry: CollectionLogEntry) -> StoreResult<()> {
        self.inner.write().await.logs.push(entry);
        Ok(())
    }

    async fn list(&self, filter: LogFilter) -> StoreResult<Vec<CollectionLogEntry>> {
        let inner = self.inner.read().await;
        let rows = inner
            .logs
            .iter()
            .filter(|e| {
                filter.user_id.map_or(true, |u| e.user_id == Some(u))
                    && filter.since.map_or(true, |s| e.created_at >= s)
            })
            .cloned()
            .collect();
        Ok(sorted_page(
            rows,
            |e: &CollectionLogEntry| e.created_at,
            filter.limit,
        ))
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn configured_for_user(&self, user_id: Uuid) -> StoreResult<Vec<CredentialRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .credentials
            .iter()
            .filter(|c| c.user_id == user_id && c.is_configured)
            .cloned()
            .collect())
    }

    async fn mark_tested(
        &self,
        user_id: Uuid,
        source: SourceKind,
        status: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for record in inner
            .credentials
            .iter_mut()
            .filter(|c| c.user_id == user_id && c.credentials.kind() == source)
        {
            record.last_tested_at = Some(Utc::now());
            record.test_status = Some(status.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn verified_users(&self) -> StoreResult<Vec<UserAccount>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .iter()
            .filter(|u| u.is_verified)
            .cloned()
            .collect())
    }

    async fn set_last_collection(&self, user_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for user in inner.users.iter_mut().filter(|u| u.id == user_id) {
            user.last_collection_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl AppDirectory for MemoryStore {
    async fn apps_for_user(&self, user_id: Uuid) -> StoreResult<Vec<AppEntity>> {
        let inner = self.inner.read().await;
        Ok(inner
            .apps
            .iter()
            .filter(|a| a.user_id == user_id && a.is_active)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

/// Postgres-backed store. All upserts are `INSERT .. ON CONFLICT .. DO
/// UPDATE` on the record's natural key, so re-collection replaces metric
/// fields instead of appending rows.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Create the pipeline's tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        tracing::debug!("schema ensured");
        Ok(())
    }
}

const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        is_verified BOOLEAN NOT NULL DEFAULT FALSE,
        plan TEXT NOT NULL DEFAULT 'free',
        last_collection_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS apps (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        name TEXT NOT NULL,
        ios_app_id TEXT,
        ios_bundle_id TEXT,
        android_package_name TEXT,
        admob_app_id TEXT,
        stripe_product_id TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_credentials (
        user_id UUID NOT NULL,
        source TEXT NOT NULL,
        credentials JSONB NOT NULL,
        is_configured BOOLEAN NOT NULL DEFAULT FALSE,
        last_tested_at TIMESTAMPTZ,
        test_status TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (user_id, source)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS admob_revenue (
        user_id UUID NOT NULL,
        date DATE NOT NULL,
        app_id TEXT NOT NULL,
        country TEXT NOT NULL,
        app_name TEXT NOT NULL,
        estimated_revenue DOUBLE PRECISION NOT NULL,
        impressions BIGINT NOT NULL,
        clicks BIGINT NOT NULL,
        ecpm DOUBLE PRECISION NOT NULL,
        currency TEXT NOT NULL,
        app_ref_id UUID,
        PRIMARY KEY (user_id, date, app_id, country)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS appstore_data (
        user_id UUID NOT NULL,
        date DATE NOT NULL,
        app_id TEXT NOT NULL,
        app_name TEXT NOT NULL,
        latest_version TEXT,
        latest_build TEXT,
        build_status TEXT,
        downloads BIGINT NOT NULL,
        updates BIGINT NOT NULL,
        proceeds DOUBLE PRECISION NOT NULL,
        average_rating DOUBLE PRECISION,
        total_ratings BIGINT NOT NULL,
        app_ref_id UUID,
        PRIMARY KEY (user_id, date, app_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS googleplay_data (
        user_id UUID NOT NULL,
        date DATE NOT NULL,
        package_name TEXT NOT NULL,
        app_name TEXT NOT NULL,
        latest_version_code BIGINT,
        latest_version_name TEXT,
        track TEXT NOT NULL,
        release_status TEXT,
        average_rating DOUBLE PRECISION,
        total_ratings BIGINT NOT NULL,
        app_ref_id UUID,
        PRIMARY KEY (user_id, date, package_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stripe_data (
        user_id UUID NOT NULL,
        date DATE NOT NULL,
        active_subscriptions BIGINT NOT NULL,
        new_subscriptions BIGINT NOT NULL,
        canceled_subscriptions BIGINT NOT NULL,
        mrr DOUBLE PRECISION NOT NULL,
        arr DOUBLE PRECISION NOT NULL,
        total_revenue DOUBLE PRECISION NOT NULL,
        successful_payments BIGINT NOT NULL,
        failed_payments BIGINT NOT NULL,
        refunds DOUBLE PRECISION NOT NULL,
        churn_rate DOUBLE PRECISION NOT NULL,
        currency TEXT NOT NULL,
        PRIMARY KEY (user_id, date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS collection_logs (
        id UUID PRIMARY KEY,
        user_id UUID,
        source TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT NOT NULL,
        records_collected BIGINT NOT NULL DEFAULT 0,
        duration_ms BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

fn status_from_str(status: &str) -> CollectionStatus {
    match status {
        "error" => CollectionStatus::Error,
        "skipped" => CollectionStatus::Skipped,
        _ => CollectionStatus::Success,
    }
}

#[async_trait]
impl MetricsStore for PgStore {
    async fn upsert_ad_revenue(&self, record: AdRevenueRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO admob_revenue
                (user_id, date, app_id, country, app_name, estimated_revenue,
                 impressions, clicks, ecpm, currency, app_ref_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id, date, app_id, country) DO UPDATE SET
                app_name = EXCLUDED.app_name,
                estimated_revenue = EXCLUDED.estimated_revenue,
                impressions = EXCLUDED.impressions,
                clicks = EXCLUDED.clicks,
                ecpm = EXCLUDED.ecpm,
                currency = EXCLUDED.currency,
                app_ref_id = EXCLUDED.app_ref_id
            "#,
        )
        .bind(record.user_id)
        .bind(record.date)
        .bind(&record.app_id)
        .bind(&record.country)
        .bind(&record.app_name)
        .bind(record.estimated_revenue)
        .bind(record.impressions)
        .bind(record.clicks)
        .bind(record.ecpm)
        .bind(&record.currency)
        .bind(record.app_ref_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_app_store(&self, record: AppStoreRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO appstore_data
                (user_id, date, app_id, app_name, latest_version, latest_build,
                 build_status, downloads, updates, proceeds, average_rating,
                 total_ratings, app_ref_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (user_id, date, app_id) DO UPDATE SET
                app_name = EXCLUDED.app_name,
                latest_version = EXCLUDED.latest_version,
                latest_build = EXCLUDED.latest_build,
                build_status = EXCLUDED.build_status,
                downloads = EXCLUDED.downloads,
                updates = EXCLUDED.updates,
                proceeds = EXCLUDED.proceeds,
                average_rating = EXCLUDED.average_rating,
                total_ratings = EXCLUDED.total_ratings,
                app_ref_id = EXCLUDED.app_ref_id
            "#,
        )
        .bind(record.user_id)
        .bind(record.date)
        .bind(&record.app_id)
        .bind(&record.app_name)
        .bind(&record.latest_version)
        .bind(&record.latest_build)
        .bind(&record.build_status)
        .bind(record.downloads)
        .bind(record.updates)
        .bind(record.proceeds)
        .bind(record.average_rating)
        .bind(record.total_ratings)
        .bind(record.app_ref_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_google_play(&self, record: GooglePlayRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO googleplay_data
                (user_id, date, package_name, app_name, latest_version_code,
                 latest_version_name, track, release_status, average_rating,
                 total_ratings, app_ref_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id, date, package_name) DO UPDATE SET
                app_name = EXCLUDED.app_name,
                latest_version_code = EXCLUDED.latest_version_code,
                latest_version_name = EXCLUDED.latest_version_name,
                track = EXCLUDED.track,
                release_status = EXCLUDED.release_status,
                average_rating = EXCLUDED.average_rating,
                total_ratings = EXCLUDED.total_ratings,
                app_ref_id = EXCLUDED.app_ref_id
            "#,
        )
        .bind(record.user_id)
        .bind(record.date)
        .bind(&record.package_name)
        .bind(&record.app_name)
        .bind(record.latest_version_code)
        .bind(&record.latest_version_name)
        .bind(&record.track)
        .bind(&record.release_status)
        .bind(record.average_rating)
        .bind(record.total_ratings)
        .bind(record.app_ref_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_stripe(&self, record: StripeRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_data
                (user_id, date, active_subscriptions, new_subscriptions,
                 canceled_subscriptions, mrr, arr, total_revenue,
                 successful_payments, failed_payments, refunds, churn_rate,
                 currency)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (user_id, date) DO UPDATE SET
                active_subscriptions = EXCLUDED.active_subscriptions,
                new_subscriptions = EXCLUDED.new_subscriptions,
                canceled_subscriptions = EXCLUDED.canceled_subscriptions,
                mrr = EXCLUDED.mrr,
                arr = EXCLUDED.arr,
                total_revenue = EXCLUDED.total_revenue,
                successful_payments = EXCLUDED.successful_payments,
                failed_payments = EXCLUDED.failed_payments,
                refunds = EXCLUDED.refunds,
                churn_rate = EXCLUDED.churn_rate,
                currency = EXCLUDED.currency
            "#,
        )
        .bind(record.user_id)
        .bind(record.date)
        .bind(record.active_subscriptions)
        .bind(record.new_subscriptions)
        .bind(record.canceled_subscriptions)
        .bind(record.mrr)
        .bind(record.arr)
        .bind(record.total_revenue)
        .bind(record.successful_payments)
        .bind(record.failed_payments)
        .bind(record.refunds)
        .bind(record.churn_rate)
        .bind(&record.currency)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ad_revenue(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<AdRevenueRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, date, app_id, country, app_name, estimated_revenue,
                   impressions, clicks, ecpm, currency, app_ref_id
              FROM admob_revenue
             WHERE user_id = $1
               AND ($2::date IS NULL OR date >= $2)
               AND ($3::date IS NULL OR date <= $3)
             ORDER BY date DESC
             LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AdRevenueRecord {
                user_id: row.try_get("user_id")?,
                date: row.try_get("date")?,
                app_id: row.try_get("app_id")?,
                country: row.try_get("country")?,
                app_name: row.try_get("app_name")?,
                estimated_revenue: row.try_get("estimated_revenue")?,
                impressions: row.try_get("impressions")?,
                clicks: row.try_get("clicks")?,
                ecpm: row.try_get("ecpm")?,
                currency: row.try_get("currency")?,
                app_ref_id: row.try_get("app_ref_id")?,
            });
        }
        Ok(out)
    }

    async fn app_store(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<AppStoreRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, date, app_id, app_name, latest_version, latest_build,
                   build_status, downloads, updates, proceeds, average_rating,
                   total_ratings, app_ref_id
              FROM appstore_data
             WHERE user_id = $1
               AND ($2::date IS NULL OR date >= $2)
               AND ($3::date IS NULL OR date <= $3)
             ORDER BY date DESC
             LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AppStoreRecord {
                user_id: row.try_get("user_id")?,
                date: row.try_get("date")?,
                app_id: row.try_get("app_id")?,
                app_name: row.try_get("app_name")?,
                latest_version: row.try_get("latest_version")?,
                latest_build: row.try_get("latest_build")?,
                build_status: row.try_get("build_status")?,
                downloads: row.try_get("downloads")?,
                updates: row.try_get("updates")?,
                proceeds: row.try_get("proceeds")?,
                average_rating: row.try_get("average_rating")?,
                total_ratings: row.try_get("total_ratings")?,
                app_ref_id: row.try_get("app_ref_id")?,
            });
        }
        Ok(out)
    }

    async fn google_play(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<GooglePlayRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, date, package_name, app_name, latest_version_code,
                   latest_version_name, track, release_status, average_rating,
                   total_ratings, app_ref_id
              FROM googleplay_data
             WHERE user_id = $1
               AND ($2::date IS NULL OR date >= $2)
               AND ($3::date IS NULL OR date <= $3)
             ORDER BY date DESC
             LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(GooglePlayRecord {
                user_id: row.try_get("user_id")?,
                date: row.try_get("date")?,
                package_name: row.try_get("package_name")?,
                app_name: row.try_get("app_name")?,
                latest_version_code: row.try_get("latest_version_code")?,
                latest_version_name: row.try_get("latest_version_name")?,
                track: row.try_get("track")?,
                release_status: row.try_get("release_status")?,
                average_rating: row.try_get("average_rating")?,
                total_ratings: row.try_get("total_ratings")?,
                app_ref_id: row.try_get("app_ref_id")?,
            });
        }
        Ok(out)
    }

    async fn stripe(&self, user_id: Uuid, filter: DateFilter) -> StoreResult<Vec<StripeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, date, active_subscriptions, new_subscriptions,
                   canceled_subscriptions, mrr, arr, total_revenue,
                   successful_payments, failed_payments, refunds, churn_rate,
                   currency
              FROM stripe_data
             WHERE user_id = $1
               AND ($2::date IS NULL OR date >= $2)
               AND ($3::date IS NULL OR date <= $3)
             ORDER BY date DESC
             LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StripeRecord {
                user_id: row.try_get("user_id")?,
                date: row.try_get("date")?,
                active_subscriptions: row.try_get("active_subscriptions")?,
                new_subscriptions: row.try_get("new_subscriptions")?,
                canceled_subscriptions: row.try_get("canceled_subscriptions")?,
                mrr: row.try_get("mrr")?,
                arr: row.try_get("arr")?,
                total_revenue: row.try_get("total_revenue")?,
                successful_payments: row.try_get("successful_payments")?,
                failed_payments: row.try_get("failed_payments")?,
                refunds: row.try_get("refunds")?,
                churn_rate: row.try_get("churn_rate")?,
                currency: row.try_get("currency")?,
            });
        }
        Ok(out)
    }

    async fn ad_revenue_daily_summary(
        &self,
        user_id: Uuid,
        filter: DateFilter,
    ) -> StoreResult<Vec<AdRevenueDailySummary>> {
        let rows = sqlx::query(
            r#"
            SELECT date,
                   SUM(estimated_revenue) AS total_revenue,
                   SUM(impressions) AS total_impressions,
                   SUM(clicks) AS total_clicks
              FROM admob_revenue
             WHERE user_id = $1
               AND ($2::date IS NULL OR date >= $2)
               AND ($3::date IS NULL OR date <= $3)
             GROUP BY date
             ORDER BY date DESC
             LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AdRevenueDailySummary {
                date: row.try_get("date")?,
                total_revenue: row.try_get("total_revenue")?,
                total_impressions: row.try_get("total_impressions")?,
                total_clicks: row.try_get("total_clicks")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl CollectionLogStore for PgStore {
    async fn append(&self, entry: CollectionLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO collection_logs
                (id, user_id, source, status, message, records_collected,
                 duration_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.source.as_str())
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .bind(entry.records_collected)
        .bind(entry.duration_ms)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, filter: LogFilter) -> StoreResult<Vec<CollectionLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, source, status, message, records_collected,
                   duration_ms, created_at
              FROM collection_logs
             WHERE ($1::uuid IS NULL OR user_id = $1)
               AND ($2::timestamptz IS NULL OR created_at >= $2)
             ORDER BY created_at DESC
             LIMIT $3
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.since)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row.try_get("source")?;
            let status: String = row.try_get("status")?;
            out.push(CollectionLogEntry {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                source: SourceKind::parse(&source).ok_or_else(|| {
                    StorageError::Message(format!("unknown source in log row: {source}"))
                })?,
                status: status_from_str(&status),
                message: row.try_get("message")?,
                records_collected: row.try_get("records_collected")?,
                duration_ms: row.try_get("duration_ms")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn configured_for_user(&self, user_id: Uuid) -> StoreResult<Vec<CredentialRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, credentials, is_configured, last_tested_at, test_status
              FROM user_credentials
             WHERE user_id = $1 AND is_configured
             ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let credentials: serde_json::Value = row.try_get("credentials")?;
            let credentials: SourceCredentials = serde_json::from_value(credentials)
                .map_err(|e| StorageError::Message(format!("bad credential payload: {e}")))?;
            out.push(CredentialRecord {
                user_id: row.try_get("user_id")?,
                credentials,
                is_configured: row.try_get("is_configured")?,
                last_tested_at: row.try_get("last_tested_at")?,
                test_status: row.try_get("test_status")?,
            });
        }
        Ok(out)
    }

    async fn mark_tested(
        &self,
        user_id: Uuid,
        source: SourceKind,
        status: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE user_credentials
               SET last_tested_at = NOW(), test_status = $3
             WHERE user_id = $1 AND source = $2
            "#,
        )
        .bind(user_id)
        .bind(source.as_str())
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn verified_users(&self) -> StoreResult<Vec<UserAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, is_verified, plan, last_collection_at
              FROM users
             WHERE is_verified
             ORDER BY email
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let plan: String = row.try_get("plan")?;
            out.push(UserAccount {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                is_verified: row.try_get("is_verified")?,
                plan: if plan == "pro" { Plan::Pro } else { Plan::Free },
                last_collection_at: row.try_get("last_collection_at")?,
            });
        }
        Ok(out)
    }

    async fn set_last_collection(&self, user_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE users SET last_collection_at = $2 WHERE id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AppDirectory for PgStore {
    async fn apps_for_user(&self, user_id: Uuid) -> StoreResult<Vec<AppEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, name, ios_app_id, ios_bundle_id,
                   android_package_name, admob_app_id, stripe_product_id, is_active
              FROM apps
             WHERE user_id = $1 AND is_active
             ORDER BY name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AppEntity {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                name: row.try_get("name")?,
                ios_app_id: row.try_get("ios_app_id")?,
                ios_bundle_id: row.try_get("ios_bundle_id")?,
                android_package_name: row.try_get("android_package_name")?,
                admob_app_id: row.try_get("admob_app_id")?,
                stripe_product_id: row.try_get("stripe_product_id")?,
                is_active: row.try_get("is_active")?,
            });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
}

/// Thin JSON-over-HTTPS client shared by the live provider APIs. A request
/// timeout bounds every call; there is no in-run retry — the next scheduling
/// tick is the implicit retry.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        bearer: Option<&str>,
    ) -> Result<serde_json::Value, HttpError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        Self::into_json(request.send().await?).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
    ) -> Result<serde_json::Value, HttpError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        Self::into_json(request.send().await?).await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<serde_json::Value, HttpError> {
        let request = self.client.post(url).form(form);
        Self::into_json(request.send().await?).await
    }

    pub async fn delete(&self, url: &str, bearer: Option<&str>) -> Result<(), HttpError> {
        let mut request = self.client.delete(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(())
    }

    async fn into_json(response: reqwest::Response) -> Result<serde_json::Value, HttpError> {
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn status_error(response: reqwest::Response) -> HttpError {
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let mut body = response.text().await.unwrap_or_default();
        // Provider error bodies can be long; keep enough to self-diagnose.
        body.truncate(512);
        HttpError::Status { status, url, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ad_row(user: Uuid, date: NaiveDate, app: &str, country: &str, rev: f64) -> AdRevenueRecord {
        AdRevenueRecord {
            user_id: user,
            date,
            app_id: app.to_string(),
            country: country.to_string(),
            app_name: "Test App".into(),
            estimated_revenue: rev,
            impressions: 1000,
            clicks: 10,
            ecpm: rev,
            currency: "USD".into(),
            app_ref_id: None,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_under_natural_key() {
        let (stores, memory) = Stores::in_memory();
        let user = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        stores
            .metrics
            .upsert_ad_revenue(ad_row(user, date, "app-1", "US", 1.0))
            .await
            .unwrap();
        stores
            .metrics
            .upsert_ad_revenue(ad_row(user, date, "app-1", "US", 2.5))
            .await
            .unwrap();

        assert_eq!(memory.ad_revenue_row_count().await, 1);
        let rows = stores
            .metrics
            .ad_revenue(user, DateFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].estimated_revenue, 2.5);
    }

    #[tokio::test]
    async fn lists_are_newest_first_and_limited() {
        let (stores, _memory) = Stores::in_memory();
        let user = Uuid::new_v4();
        for day in 1..=5 {
            let date = NaiveDate::from_ymd_opt(2026, 3, day).unwrap();
            stores
                .metrics
                .upsert_ad_revenue(ad_row(user, date, "app-1", "US", day as f64))
                .await
                .unwrap();
        }

        let rows = stores
            .metrics
            .ad_revenue(user, DateFilter::default().with_limit(3))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2026, 3, 5).unwrap());
        assert_eq!(rows[2].date, NaiveDate::from_ymd_opt(2026, 3, 3).unwrap());
    }

    #[tokio::test]
    async fn daily_summary_sums_across_entities() {
        let (stores, _memory) = Stores::in_memory();
        let user = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        stores
            .metrics
            .upsert_ad_revenue(ad_row(user, date, "app-1", "US", 1.5))
            .await
            .unwrap();
        stores
            .metrics
            .upsert_ad_revenue(ad_row(user, date, "app-1", "DE", 2.0))
            .await
            .unwrap();

        let summary = stores
            .metrics
            .ad_revenue_daily_summary(user, DateFilter::default())
            .await
            .unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].total_revenue, 3.5);
        assert_eq!(summary[0].total_impressions, 2000);
    }

    #[tokio::test]
    async fn log_listing_filters_by_user_newest_first() {
        let (stores, _memory) = Stores::in_memory();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        for (user, msg) in [(user_a, "first"), (user_b, "other"), (user_a, "second")] {
            stores
                .logs
                .append(CollectionLogEntry::new(
                    Some(user),
                    SourceKind::Stripe,
                    CollectionStatus::Success,
                    msg,
                ))
                .await
                .unwrap();
        }

        let rows = stores
            .logs
            .list(LogFilter {
                user_id: Some(user_a),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "second");
    }

    #[tokio::test]
    async fn configured_credentials_preserve_load_order() {
        let (stores, memory) = Stores::in_memory();
        let user = Uuid::new_v4();
        let sources = [
            SourceCredentials::Stripe(appsight_core::StripeCredentials {
                secret_key: "sk_test".into(),
            }),
            SourceCredentials::AdMob(appsight_core::AdMobCredentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
                refresh_token: "tok".into(),
                publisher_id: "pub-1".into(),
            }),
        ];
        for credentials in sources {
            memory
                .add_credential(CredentialRecord {
                    user_id: user,
                    credentials,
                    is_configured: true,
                    last_tested_at: None,
                    test_status: None,
                })
                .await;
        }

        let records = stores.credentials.configured_for_user(user).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].credentials.kind(), SourceKind::Stripe);
        assert_eq!(records[1].credentials.kind(), SourceKind::AdMob);
    }
}
