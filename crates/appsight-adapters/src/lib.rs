//! Per-source collection adapters: provider API seams, live HTTP
//! implementations and the normalization into daily records.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use appsight_core::{
    day_bounds_utc, round_cents, yesterday_utc, AdMobCredentials, AdRevenueRecord, AppEntity,
    AppStoreCredentials, AppStoreRecord, CollectionLogEntry, CollectionStatus, CredentialRecord,
    GooglePlayCredentials, GooglePlayRecord, SourceCredentials, SourceKind, StripeCredentials,
    StripeRecord,
};
use appsight_storage::{HttpClient, HttpError, Stores};

pub const CRATE_NAME: &str = "appsight-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<HttpError> for AdapterError {
    fn from(error: HttpError) -> Self {
        AdapterError::Message(error.to_string())
    }
}

/// Shared collection context: store handles plus the window being collected.
/// The window defaults to the prior full UTC day.
#[derive(Clone)]
pub struct CollectContext {
    pub stores: Stores,
    pub date: NaiveDate,
}

impl CollectContext {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            date: yesterday_utc(),
        }
    }

    pub fn with_date(stores: Stores, date: NaiveDate) -> Self {
        Self { stores, date }
    }

    /// Audit-trail append. A failure here is the one condition an adapter
    /// surfaces as `Err`: provider failures become entries, but losing the
    /// entry itself must be visible to the orchestrator.
    async fn audit(&self, entry: CollectionLogEntry) -> Result<(), AdapterError> {
        self.stores
            .logs
            .append(entry)
            .await
            .context("appending collection audit entry")?;
        Ok(())
    }
}

/// One adapter per source. `collect` resolves to `Ok` for every normal run,
/// including provider failures (those are recorded as error audit entries);
/// `Err` means the run could not even be accounted for.
#[async_trait]
pub trait SourceCollector: Send + Sync {
    fn source(&self) -> SourceKind;

    async fn collect(
        &self,
        ctx: &CollectContext,
        record: &CredentialRecord,
    ) -> Result<(), AdapterError>;
}

/// Explicit source-to-adapter table.
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: HashMap<SourceKind, Arc<dyn SourceCollector>>,
}

impl CollectorRegistry {
    pub fn register(&mut self, collector: Arc<dyn SourceCollector>) {
        self.collectors.insert(collector.source(), collector);
    }

    pub fn get(&self, source: SourceKind) -> Option<Arc<dyn SourceCollector>> {
        self.collectors.get(&source).cloned()
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// All four adapters wired to their live provider APIs.
    pub fn live(http: HttpClient) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(AdMobCollector::new(Arc::new(LiveAdMobApi::new(
            http.clone(),
        )))));
        registry.register(Arc::new(AppStoreCollector::new(Arc::new(
            LiveAppStoreApi::new(http.clone()),
        ))));
        registry.register(Arc::new(GooglePlayCollector::new(Arc::new(
            LiveGooglePlayApi::new(http.clone()),
        ))));
        registry.register(Arc::new(StripeCollector::new(Arc::new(LiveStripeApi::new(
            http,
        )))));
        registry
    }
}

// ---------------------------------------------------------------------------
// Cursor pagination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub has_more: bool,
}

pub trait PageItem {
    fn item_id(&self) -> &str;
}

/// Drain a cursor-paginated listing, folding every item into `init`. The
/// cursor for the next fetch is the id of the previous page's last item.
pub async fn fold_pages<T, A, F, Fut, R>(
    mut fetch: F,
    init: A,
    mut reduce: R,
) -> Result<A, AdapterError>
where
    T: PageItem,
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, AdapterError>>,
    R: FnMut(&mut A, &T),
{
    let mut acc = init;
    let mut cursor: Option<String> = None;
    loop {
        let page = fetch(cursor.clone()).await?;
        for item in &page.data {
            reduce(&mut acc, item);
        }
        if !page.has_more {
            break;
        }
        match page.data.last() {
            Some(last) => cursor = Some(last.item_id().to_string()),
            // has_more with an empty page would never terminate
            None => break,
        }
    }
    Ok(acc)
}

// ---------------------------------------------------------------------------
// AdMob
// ---------------------------------------------------------------------------

/// One network-report row, per (app, country).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdReportRow {
    pub app_id: Option<String>,
    pub app_name: Option<String>,
    pub country: Option<String>,
    pub earnings_micros: i64,
    pub impressions: i64,
    pub clicks: i64,
    pub currency: Option<String>,
}

#[async_trait]
pub trait AdMobApi: Send + Sync {
    async fn network_report(
        &self,
        creds: &AdMobCredentials,
        date: NaiveDate,
    ) -> Result<Vec<AdReportRow>, AdapterError>;
}

pub struct AdMobCollector {
    api: Arc<dyn AdMobApi>,
}

impl AdMobCollector {
    pub fn new(api: Arc<dyn AdMobApi>) -> Self {
        Self { api }
    }

    async fn run(
        &self,
        ctx: &CollectContext,
        user_id: Uuid,
        creds: &AdMobCredentials,
    ) -> Result<CollectionLogEntry, AdapterError> {
        let rows = self.api.network_report(creds, ctx.date).await?;
        let directory = ctx
            .stores
            .apps
            .apps_for_user(user_id)
            .await
            .context("loading app directory")?;

        for row in &rows {
            let app_id = row.app_id.clone().unwrap_or_else(|| "unknown".to_string());
            let country = row.country.clone().unwrap_or_else(|| "XX".to_string());
            let revenue = row.earnings_micros as f64 / 1_000_000.0;
            let ecpm = if row.impressions > 0 {
                (revenue / row.impressions as f64) * 1000.0
            } else {
                0.0
            };
            let matched = directory
                .iter()
                .find(|app| app.admob_app_id.as_deref() == Some(app_id.as_str()));

            ctx.stores
                .metrics
                .upsert_ad_revenue(AdRevenueRecord {
                    user_id,
                    date: ctx.date,
                    app_name: matched
                        .map(|app| app.name.clone())
                        .or_else(|| row.app_name.clone())
                        .unwrap_or_else(|| app_id.clone()),
                    app_id,
                    country,
                    estimated_revenue: revenue,
                    impressions: row.impressions,
                    clicks: row.clicks,
                    ecpm,
                    currency: row.currency.clone().unwrap_or_else(|| "USD".to_string()),
                    app_ref_id: matched.map(|app| app.id),
                })
                .await
                .context("storing ad revenue row")?;
        }

        Ok(CollectionLogEntry::new(
            Some(user_id),
            SourceKind::AdMob,
            CollectionStatus::Success,
            format!("Collected {} rows for {}", rows.len(), ctx.date),
        )
        .with_records(rows.len() as i64))
    }
}

#[async_trait]
impl SourceCollector for AdMobCollector {
    fn source(&self) -> SourceKind {
        SourceKind::AdMob
    }

    async fn collect(
        &self,
        ctx: &CollectContext,
        record: &CredentialRecord,
    ) -> Result<(), AdapterError> {
        let SourceCredentials::AdMob(creds) = &record.credentials else {
            return Err(AdapterError::Message("expected admob credentials".into()));
        };
        run_guarded(ctx, record, |user_id| self.run(ctx, user_id, creds)).await
    }
}

// ---------------------------------------------------------------------------
// App Store Connect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct AppStoreApp {
    pub id: String,
    pub name: String,
    pub bundle_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppVersionInfo {
    pub version: Option<String>,
    pub build: Option<String>,
    pub build_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppRatings {
    pub average_rating: Option<f64>,
    pub total_ratings: i64,
}

#[async_trait]
pub trait AppStoreApi: Send + Sync {
    /// Short-lived ES256 bearer token, minted once per run.
    fn mint_token(&self, creds: &AppStoreCredentials) -> Result<String, AdapterError>;
    async fn list_apps(&self, token: &str) -> Result<Vec<AppStoreApp>, AdapterError>;
    async fn latest_version(
        &self,
        token: &str,
        app_id: &str,
    ) -> Result<AppVersionInfo, AdapterError>;
    async fn ratings(&self, token: &str, app_id: &str) -> Result<AppRatings, AdapterError>;
}

pub struct AppStoreCollector {
    api: Arc<dyn AppStoreApi>,
}

impl AppStoreCollector {
    pub fn new(api: Arc<dyn AppStoreApi>) -> Self {
        Self { api }
    }

    async fn run(
        &self,
        ctx: &CollectContext,
        user_id: Uuid,
        creds: &AppStoreCredentials,
    ) -> Result<CollectionLogEntry, AdapterError> {
        let token = self.api.mint_token(creds)?;
        let apps = self.api.list_apps(&token).await?;
        let directory = ctx
            .stores
            .apps
            .apps_for_user(user_id)
            .await
            .context("loading app directory")?;

        for app in &apps {
            // Per-app detail failures degrade that row instead of failing
            // the whole run.
            let version = match self.api.latest_version(&token, &app.id).await {
                Ok(version) => version,
                Err(error) => {
                    warn!(app_id = %app.id, %error, "app store version lookup failed");
                    AppVersionInfo::default()
                }
            };
            let ratings = match self.api.ratings(&token, &app.id).await {
                Ok(ratings) => ratings,
                Err(error) => {
                    warn!(app_id = %app.id, %error, "app store ratings lookup failed");
                    AppRatings::default()
                }
            };
            let matched = directory.iter().find(|entry| {
                entry.ios_app_id.as_deref() == Some(app.id.as_str())
                    || (app.bundle_id.is_some() && entry.ios_bundle_id == app.bundle_id)
            });

            ctx.stores
                .metrics
                .upsert_app_store(AppStoreRecord {
                    user_id,
                    date: ctx.date,
                    app_id: app.id.clone(),
                    app_name: app.name.clone(),
                    latest_version: version.version,
                    latest_build: version.build,
                    build_status: version.build_status,
                    downloads: 0,
                    updates: 0,
                    proceeds: 0.0,
                    average_rating: ratings.average_rating,
                    total_ratings: ratings.total_ratings,
                    app_ref_id: matched.map(|entry| entry.id),
                })
                .await
                .context("storing app store row")?;
        }

        Ok(CollectionLogEntry::new(
            Some(user_id),
            SourceKind::AppStore,
            CollectionStatus::Success,
            format!("Collected {} apps for {}", apps.len(), ctx.date),
        )
        .with_records(apps.len() as i64))
    }
}

#[async_trait]
impl SourceCollector for AppStoreCollector {
    fn source(&self) -> SourceKind {
        SourceKind::AppStore
    }

    async fn collect(
        &self,
        ctx: &CollectContext,
        record: &CredentialRecord,
    ) -> Result<(), AdapterError> {
        let SourceCredentials::AppStore(creds) = &record.credentials else {
            return Err(AdapterError::Message(
                "expected app store credentials".into(),
            ));
        };
        run_guarded(ctx, record, |user_id| self.run(ctx, user_id, creds)).await
    }
}

// ---------------------------------------------------------------------------
// Google Play
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    pub version_code: Option<i64>,
    pub version_name: Option<String>,
    pub status: Option<String>,
}

#[async_trait]
pub trait GooglePlayApi: Send + Sync {
    async fn access_token(&self, creds: &GooglePlayCredentials) -> Result<String, AdapterError>;
    async fn insert_edit(&self, token: &str, package: &str) -> Result<String, AdapterError>;
    async fn production_track(
        &self,
        token: &str,
        package: &str,
        edit_id: &str,
    ) -> Result<TrackInfo, AdapterError>;
    async fn delete_edit(
        &self,
        token: &str,
        package: &str,
        edit_id: &str,
    ) -> Result<(), AdapterError>;
    /// Star ratings of recent reviews, one entry per review.
    async fn review_stars(&self, token: &str, package: &str) -> Result<Vec<i64>, AdapterError>;
}

fn is_permission_denied(message: &str) -> bool {
    message.contains("does not have permission") || message.contains("403")
}

pub struct GooglePlayCollector {
    api: Arc<dyn GooglePlayApi>,
}

impl GooglePlayCollector {
    pub fn new(api: Arc<dyn GooglePlayApi>) -> Self {
        Self { api }
    }

    async fn production_info(&self, token: &str, package: &str) -> Result<TrackInfo, AdapterError> {
        let edit_id = self.api.insert_edit(token, package).await?;
        let track = self.api.production_track(token, package, &edit_id).await;
        // Open edits block other API consumers, so tear down before looking
        // at the track result.
        if let Err(error) = self.api.delete_edit(token, package, &edit_id).await {
            warn!(package, %error, "failed to delete play console edit");
        }
        track
    }

    async fn store_package(
        &self,
        ctx: &CollectContext,
        user_id: Uuid,
        token: &str,
        app: &AppEntity,
        package: &str,
        track: TrackInfo,
    ) -> Result<(), AdapterError> {
        let (average_rating, total_ratings) = match self.api.review_stars(token, package).await {
            Ok(stars) if !stars.is_empty() => {
                let total = stars.len() as i64;
                let sum: i64 = stars.iter().sum();
                (Some(sum as f64 / total as f64), total)
            }
            Ok(_) => (None, 0),
            Err(error) => {
                warn!(package, %error, "google play reviews lookup failed");
                (None, 0)
            }
        };

        ctx.stores
            .metrics
            .upsert_google_play(GooglePlayRecord {
                user_id,
                date: ctx.date,
                package_name: package.to_string(),
                app_name: app.name.clone(),
                latest_version_code: track.version_code,
                latest_version_name: track.version_name,
                track: "production".to_string(),
                release_status: track.status,
                average_rating,
                total_ratings,
                app_ref_id: Some(app.id),
            })
            .await
            .context("storing google play row")?;
        Ok(())
    }

    async fn run(
        &self,
        ctx: &CollectContext,
        user_id: Uuid,
        creds: &GooglePlayCredentials,
    ) -> Result<CollectionLogEntry, AdapterError> {
        let apps = ctx
            .stores
            .apps
            .apps_for_user(user_id)
            .await
            .context("loading app directory")?;
        let packages: Vec<(&AppEntity, &str)> = apps
            .iter()
            .filter_map(|app| app.android_package_name.as_deref().map(|pkg| (app, pkg)))
            .collect();
        if packages.is_empty() {
            return Ok(CollectionLogEntry::new(
                Some(user_id),
                SourceKind::GooglePlay,
                CollectionStatus::Skipped,
                "No apps with Android package name configured",
            ));
        }

        let token = self.api.access_token(creds).await?;
        let mut denied: Vec<String> = Vec::new();
        let mut collected = 0i64;
        for (app, package) in packages {
            // A failed edit or track read degrades the row to null version
            // fields; the package still gets its daily row.
            let track = match self.production_info(&token, package).await {
                Ok(track) => track,
                Err(error) => {
                    let message = error.to_string();
                    if is_permission_denied(&message) {
                        denied.push(package.to_string());
                    } else {
                        warn!(package, error = %message, "google play track lookup failed");
                    }
                    TrackInfo::default()
                }
            };
            self.store_package(ctx, user_id, &token, app, package, track)
                .await?;
            collected += 1;
        }

        if !denied.is_empty() {
            return Ok(CollectionLogEntry::new(
                Some(user_id),
                SourceKind::GooglePlay,
                CollectionStatus::Error,
                format!(
                    "Permission denied for: {}. Grant access in Google Play Console → Settings → API access.",
                    denied.join(", ")
                ),
            )
            .with_records(collected));
        }

        Ok(CollectionLogEntry::new(
            Some(user_id),
            SourceKind::GooglePlay,
            CollectionStatus::Success,
            format!("Collected {} packages for {}", collected, ctx.date),
        )
        .with_records(collected))
    }
}

#[async_trait]
impl SourceCollector for GooglePlayCollector {
    fn source(&self) -> SourceKind {
        SourceKind::GooglePlay
    }

    async fn collect(
        &self,
        ctx: &CollectContext,
        record: &CredentialRecord,
    ) -> Result<(), AdapterError> {
        let SourceCredentials::GooglePlay(creds) = &record.credentials else {
            return Err(AdapterError::Message(
                "expected google play credentials".into(),
            ));
        };
        run_guarded(ctx, record, |user_id| self.run(ctx, user_id, creds)).await
    }
}

// ---------------------------------------------------------------------------
// Stripe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionQuery {
    Active,
    CreatedIn { start: i64, end: i64 },
    Canceled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripeSubscription {
    pub id: String,
    pub canceled_at: Option<i64>,
    pub items: Vec<StripePrice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripePrice {
    pub unit_amount_cents: i64,
    pub interval: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripeCharge {
    pub id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub paid: bool,
    pub refunded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StripeRefund {
    pub id: String,
    pub amount_cents: i64,
}

impl PageItem for StripeSubscription {
    fn item_id(&self) -> &str {
        &self.id
    }
}

impl PageItem for StripeCharge {
    fn item_id(&self) -> &str {
        &self.id
    }
}

impl PageItem for StripeRefund {
    fn item_id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
pub trait StripeApi: Send + Sync {
    async fn subscriptions(
        &self,
        key: &str,
        query: SubscriptionQuery,
        cursor: Option<String>,
    ) -> Result<Page<StripeSubscription>, AdapterError>;
    async fn charges(
        &self,
        key: &str,
        start: i64,
        end: i64,
        cursor: Option<String>,
    ) -> Result<Page<StripeCharge>, AdapterError>;
    async fn refunds(
        &self,
        key: &str,
        start: i64,
        end: i64,
        cursor: Option<String>,
    ) -> Result<Page<StripeRefund>, AdapterError>;
}

#[derive(Default)]
struct ChargeTotals {
    revenue: f64,
    successful: i64,
    failed: i64,
    currency: Option<String>,
}

fn monthly_amount(price: &StripePrice) -> f64 {
    let amount = price.unit_amount_cents as f64 / 100.0;
    let per_month = match price.interval.as_str() {
        "month" => amount,
        "year" => amount / 12.0,
        "week" => amount * 4.33,
        "day" => amount * 30.0,
        _ => 0.0,
    };
    per_month * price.quantity as f64
}

pub struct StripeCollector {
    api: Arc<dyn StripeApi>,
}

impl StripeCollector {
    pub fn new(api: Arc<dyn StripeApi>) -> Self {
        Self { api }
    }

    async fn run(
        &self,
        ctx: &CollectContext,
        user_id: Uuid,
        creds: &StripeCredentials,
    ) -> Result<CollectionLogEntry, AdapterError> {
        let key = creds.secret_key.as_str();
        let api = self.api.as_ref();
        let (start, end) = day_bounds_utc(ctx.date);

        let active: i64 = fold_pages(
            |cursor| api.subscriptions(key, SubscriptionQuery::Active, cursor),
            0,
            |count, _sub: &StripeSubscription| *count += 1,
        )
        .await?;
        let new_subs: i64 = fold_pages(
            |cursor| api.subscriptions(key, SubscriptionQuery::CreatedIn { start, end }, cursor),
            0,
            |count, _sub: &StripeSubscription| *count += 1,
        )
        .await?;
        // Cancellation time cannot be filtered server-side, so the whole
        // canceled listing is drained and windowed here. Filtering inside the
        // pager would corrupt the cursor.
        let canceled: i64 = fold_pages(
            |cursor| api.subscriptions(key, SubscriptionQuery::Canceled, cursor),
            0,
            |count, sub: &StripeSubscription| {
                if sub.canceled_at.map_or(false, |at| at >= start && at <= end) {
                    *count += 1;
                }
            },
        )
        .await?;

        let totals = fold_pages(
            |cursor| api.charges(key, start, end, cursor),
            ChargeTotals::default(),
            |totals: &mut ChargeTotals, charge: &StripeCharge| {
                if charge.paid && !charge.refunded {
                    totals.successful += 1;
                    totals.revenue += charge.amount_cents as f64 / 100.0;
                    totals.currency = Some(charge.currency.clone());
                } else if charge.status == "failed" {
                    totals.failed += 1;
                }
            },
        )
        .await?;

        let refunds: f64 = fold_pages(
            |cursor| api.refunds(key, start, end, cursor),
            0.0,
            |total, refund: &StripeRefund| *total += refund.amount_cents as f64 / 100.0,
        )
        .await?;

        let mrr: f64 = fold_pages(
            |cursor| api.subscriptions(key, SubscriptionQuery::Active, cursor),
            0.0,
            |total, sub: &StripeSubscription| {
                *total += sub.items.iter().map(monthly_amount).sum::<f64>()
            },
        )
        .await?;

        let churn_rate = if active + canceled > 0 {
            canceled as f64 / (active + canceled) as f64 * 100.0
        } else {
            0.0
        };

        ctx.stores
            .metrics
            .upsert_stripe(StripeRecord {
                user_id,
                date: ctx.date,
                active_subscriptions: active,
                new_subscriptions: new_subs,
                canceled_subscriptions: canceled,
                mrr: round_cents(mrr),
                arr: round_cents(mrr * 12.0),
                total_revenue: round_cents(totals.revenue),
                successful_payments: totals.successful,
                failed_payments: totals.failed,
                refunds: round_cents(refunds),
                churn_rate: round_cents(churn_rate),
                currency: totals.currency.unwrap_or_else(|| "usd".to_string()),
            })
            .await
            .context("storing stripe row")?;

        Ok(CollectionLogEntry::new(
            Some(user_id),
            SourceKind::Stripe,
            CollectionStatus::Success,
            format!("Collected Stripe data for {}", ctx.date),
        )
        .with_records(1))
    }
}

#[async_trait]
impl SourceCollector for StripeCollector {
    fn source(&self) -> SourceKind {
        SourceKind::Stripe
    }

    async fn collect(
        &self,
        ctx: &CollectContext,
        record: &CredentialRecord,
    ) -> Result<(), AdapterError> {
        let SourceCredentials::Stripe(creds) = &record.credentials else {
            return Err(AdapterError::Message("expected stripe credentials".into()));
        };
        run_guarded(ctx, record, |user_id| self.run(ctx, user_id, creds)).await
    }
}

// ---------------------------------------------------------------------------
// Shared collect plumbing
// ---------------------------------------------------------------------------

/// Config guard, timing and the provider-failure-to-audit-entry conversion
/// shared by all adapters.
async fn run_guarded<F, Fut>(
    ctx: &CollectContext,
    record: &CredentialRecord,
    run: F,
) -> Result<(), AdapterError>
where
    F: FnOnce(Uuid) -> Fut,
    Fut: Future<Output = Result<CollectionLogEntry, AdapterError>>,
{
    let source = record.credentials.kind();
    if !record.credentials.is_complete() {
        ctx.audit(CollectionLogEntry::new(
            Some(record.user_id),
            source,
            CollectionStatus::Skipped,
            "Not configured",
        ))
        .await?;
        return Ok(());
    }

    let started = Instant::now();
    let entry = match run(record.user_id).await {
        Ok(entry) => entry,
        Err(error) => {
            warn!(source = %source, user_id = %record.user_id, %error, "collection failed");
            CollectionLogEntry::new(
                Some(record.user_id),
                source,
                CollectionStatus::Error,
                error.to_string(),
            )
        }
    };
    ctx.audit(entry.with_duration_ms(started.elapsed().as_millis() as i64))
        .await
}

// ---------------------------------------------------------------------------
// Live provider APIs
// ---------------------------------------------------------------------------

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const ADMOB_BASE: &str = "https://admob.googleapis.com/v1";
const APPSTORE_BASE: &str = "https://api.appstoreconnect.apple.com/v1";
const PLAY_BASE: &str = "https://androidpublisher.googleapis.com/androidpublisher/v3";
const STRIPE_BASE: &str = "https://api.stripe.com/v1";

fn json_str(value: &JsonValue, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

/// Google report APIs serialize 64-bit metrics as JSON strings.
fn json_i64(value: &JsonValue, pointer: &str) -> i64 {
    match value.pointer(pointer) {
        Some(JsonValue::Number(n)) => n.as_i64().unwrap_or(0),
        Some(JsonValue::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

pub struct LiveAdMobApi {
    http: HttpClient,
}

impl LiveAdMobApi {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    async fn access_token(&self, creds: &AdMobCredentials) -> Result<String, AdapterError> {
        let body = self
            .http
            .post_form(
                GOOGLE_TOKEN_URL,
                &[
                    ("client_id", creds.client_id.as_str()),
                    ("client_secret", creds.client_secret.as_str()),
                    ("refresh_token", creds.refresh_token.as_str()),
                    ("grant_type", "refresh_token"),
                ],
            )
            .await?;
        json_str(&body, "/access_token").ok_or_else(|| {
            AdapterError::Message("admob token response missing access_token".into())
        })
    }
}

#[async_trait]
impl AdMobApi for LiveAdMobApi {
    async fn network_report(
        &self,
        creds: &AdMobCredentials,
        date: NaiveDate,
    ) -> Result<Vec<AdReportRow>, AdapterError> {
        let token = self.access_token(creds).await?;
        let day = json!({
            "year": date.year(),
            "month": date.month(),
            "day": date.day(),
        });
        let spec = json!({
            "reportSpec": {
                "dateRange": { "startDate": day, "endDate": day },
                "dimensions": ["APP", "COUNTRY"],
                "metrics": ["ESTIMATED_EARNINGS", "IMPRESSIONS", "CLICKS"],
            }
        });
        let url = format!(
            "{ADMOB_BASE}/accounts/{}/networkReport:generate",
            creds.publisher_id
        );
        let body = self.http.post_json(&url, &spec, Some(&token)).await?;

        // The report arrives as a stream array: header, rows, footer.
        let mut rows = Vec::new();
        for chunk in body.as_array().map(Vec::as_slice).unwrap_or_default() {
            let Some(row) = chunk.get("row") else { continue };
            rows.push(AdReportRow {
                app_id: json_str(row, "/dimensionValues/APP/value"),
                app_name: json_str(row, "/dimensionValues/APP/displayLabel"),
                country: json_str(row, "/dimensionValues/COUNTRY/value"),
                earnings_micros: json_i64(row, "/metricValues/ESTIMATED_EARNINGS/microsValue"),
                impressions: json_i64(row, "/metricValues/IMPRESSIONS/integerValue"),
                clicks: json_i64(row, "/metricValues/CLICKS/integerValue"),
                currency: json_str(row, "/metricValues/ESTIMATED_EARNINGS/currencyCode"),
            });
        }
        Ok(rows)
    }
}

pub struct LiveAppStoreApi {
    http: HttpClient,
}

impl LiveAppStoreApi {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[derive(Serialize)]
struct AppStoreClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    exp: i64,
}

/// The release state lives on the version resource; the build number comes
/// from the most recently uploaded build.
fn parse_version_info(versions: &JsonValue, builds: &JsonValue) -> AppVersionInfo {
    AppVersionInfo {
        version: json_str(versions, "/data/0/attributes/versionString"),
        build: json_str(builds, "/data/0/attributes/version"),
        build_status: json_str(versions, "/data/0/attributes/appStoreState"),
    }
}

#[async_trait]
impl AppStoreApi for LiveAppStoreApi {
    fn mint_token(&self, creds: &AppStoreCredentials) -> Result<String, AdapterError> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(creds.key_id.clone());
        let claims = AppStoreClaims {
            iss: &creds.issuer_id,
            aud: "appstoreconnect-v1",
            exp: (chrono::Utc::now() + chrono::Duration::minutes(20)).timestamp(),
        };
        let key = EncodingKey::from_ec_pem(creds.private_key.as_bytes())
            .map_err(|e| AdapterError::Message(format!("invalid app store private key: {e}")))?;
        encode(&header, &claims, &key)
            .map_err(|e| AdapterError::Message(format!("signing app store token: {e}")))
    }

    async fn list_apps(&self, token: &str) -> Result<Vec<AppStoreApp>, AdapterError> {
        let url = format!("{APPSTORE_BASE}/apps");
        let body = self
            .http
            .get_json(&url, &[("limit", "200")], Some(token))
            .await?;
        let mut apps = Vec::new();
        for item in body
            .pointer("/data")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let Some(id) = json_str(item, "/id") else { continue };
            apps.push(AppStoreApp {
                name: json_str(item, "/attributes/name").unwrap_or_else(|| id.clone()),
                bundle_id: json_str(item, "/attributes/bundleId"),
                id,
            });
        }
        Ok(apps)
    }

    async fn latest_version(
        &self,
        token: &str,
        app_id: &str,
    ) -> Result<AppVersionInfo, AdapterError> {
        let versions_url = format!("{APPSTORE_BASE}/apps/{app_id}/appStoreVersions");
        let versions = self
            .http
            .get_json(
                &versions_url,
                &[("limit", "1"), ("sort", "-versionString")],
                Some(token),
            )
            .await?;
        let builds_url = format!("{APPSTORE_BASE}/apps/{app_id}/builds");
        let builds = self
            .http
            .get_json(
                &builds_url,
                &[("limit", "1"), ("sort", "-uploadedDate")],
                Some(token),
            )
            .await?;
        Ok(parse_version_info(&versions, &builds))
    }

    async fn ratings(&self, token: &str, app_id: &str) -> Result<AppRatings, AdapterError> {
        let url = format!("{APPSTORE_BASE}/apps/{app_id}/customerReviews");
        let body = self
            .http
            .get_json(&url, &[("limit", "200")], Some(token))
            .await?;
        let stars: Vec<i64> = body
            .pointer("/data")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|review| json_i64(review, "/attributes/rating"))
            .filter(|rating| *rating > 0)
            .collect();
        if stars.is_empty() {
            return Ok(AppRatings::default());
        }
        Ok(AppRatings {
            average_rating: Some(stars.iter().sum::<i64>() as f64 / stars.len() as f64),
            total_ratings: stars.len() as i64,
        })
    }
}

pub struct LiveGooglePlayApi {
    http: HttpClient,
}

impl LiveGooglePlayApi {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

#[derive(Serialize)]
struct ServiceAccountClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[async_trait]
impl GooglePlayApi for LiveGooglePlayApi {
    async fn access_token(&self, creds: &GooglePlayCredentials) -> Result<String, AdapterError> {
        let account: ServiceAccountKey = serde_json::from_str(&creds.service_account_json)
            .map_err(|e| AdapterError::Message(format!("invalid service account json: {e}")))?;
        let now = chrono::Utc::now().timestamp();
        let claims = ServiceAccountClaims {
            iss: &account.client_email,
            scope: "https://www.googleapis.com/auth/androidpublisher",
            aud: &account.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| AdapterError::Message(format!("invalid service account key: {e}")))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| AdapterError::Message(format!("signing service account grant: {e}")))?;
        let body = self
            .http
            .post_form(
                &account.token_uri,
                &[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ],
            )
            .await?;
        json_str(&body, "/access_token").ok_or_else(|| {
            AdapterError::Message("google play token response missing access_token".into())
        })
    }

    async fn insert_edit(&self, token: &str, package: &str) -> Result<String, AdapterError> {
        let url = format!("{PLAY_BASE}/applications/{package}/edits");
        let body = self.http.post_json(&url, &json!({}), Some(token)).await?;
        json_str(&body, "/id")
            .ok_or_else(|| AdapterError::Message("edit insert response missing id".into()))
    }

    async fn production_track(
        &self,
        token: &str,
        package: &str,
        edit_id: &str,
    ) -> Result<TrackInfo, AdapterError> {
        let url = format!("{PLAY_BASE}/applications/{package}/edits/{edit_id}/tracks/production");
        let body = self.http.get_json(&url, &[], Some(token)).await?;
        let release = body.pointer("/releases/0");
        Ok(TrackInfo {
            version_code: release
                .map(|r| json_i64(r, "/versionCodes/0"))
                .filter(|code| *code > 0),
            version_name: release.and_then(|r| json_str(r, "/name")),
            status: release.and_then(|r| json_str(r, "/status")),
        })
    }

    async fn delete_edit(
        &self,
        token: &str,
        package: &str,
        edit_id: &str,
    ) -> Result<(), AdapterError> {
        let url = format!("{PLAY_BASE}/applications/{package}/edits/{edit_id}");
        self.http.delete(&url, Some(token)).await?;
        Ok(())
    }

    async fn review_stars(&self, token: &str, package: &str) -> Result<Vec<i64>, AdapterError> {
        let url = format!("{PLAY_BASE}/applications/{package}/reviews");
        let body = self.http.get_json(&url, &[], Some(token)).await?;
        Ok(body
            .pointer("/reviews")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|review| json_i64(review, "/comments/0/userComment/starRating"))
            .filter(|stars| *stars > 0)
            .collect())
    }
}

pub struct LiveStripeApi {
    http: HttpClient,
}

impl LiveStripeApi {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    async fn list(
        &self,
        key: &str,
        path: &str,
        params: Vec<(String, String)>,
        cursor: Option<String>,
    ) -> Result<JsonValue, AdapterError> {
        let mut params = params;
        params.push(("limit".to_string(), "100".to_string()));
        if let Some(cursor) = cursor {
            params.push(("starting_after".to_string(), cursor));
        }
        let borrowed: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = format!("{STRIPE_BASE}/{path}");
        Ok(self.http.get_json(&url, &borrowed, Some(key)).await?)
    }
}

#[async_trait]
impl StripeApi for LiveStripeApi {
    async fn subscriptions(
        &self,
        key: &str,
        query: SubscriptionQuery,
        cursor: Option<String>,
    ) -> Result<Page<StripeSubscription>, AdapterError> {
        let params = match query {
            SubscriptionQuery::Active => vec![("status".to_string(), "active".to_string())],
            SubscriptionQuery::CreatedIn { start, end } => vec![
                ("status".to_string(), "all".to_string()),
                ("created[gte]".to_string(), start.to_string()),
                ("created[lte]".to_string(), end.to_string()),
            ],
            SubscriptionQuery::Canceled => {
                vec![("status".to_string(), "canceled".to_string())]
            }
        };
        let body = self.list(key, "subscriptions", params, cursor).await?;
        let mut data = Vec::new();
        for item in body
            .pointer("/data")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let Some(id) = json_str(item, "/id") else { continue };
            let canceled_at = item
                .pointer("/canceled_at")
                .and_then(JsonValue::as_i64)
                .filter(|at| *at > 0);
            let items = item
                .pointer("/items/data")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|line| StripePrice {
                    unit_amount_cents: json_i64(line, "/price/unit_amount"),
                    interval: json_str(line, "/price/recurring/interval")
                        .unwrap_or_else(|| "month".to_string()),
                    quantity: json_i64(line, "/quantity").max(1),
                })
                .collect();
            data.push(StripeSubscription {
                id,
                canceled_at,
                items,
            });
        }
        Ok(Page {
            data,
            has_more: body.pointer("/has_more").and_then(JsonValue::as_bool) == Some(true),
        })
    }

    async fn charges(
        &self,
        key: &str,
        start: i64,
        end: i64,
        cursor: Option<String>,
    ) -> Result<Page<StripeCharge>, AdapterError> {
        let params = vec![
            ("created[gte]".to_string(), start.to_string()),
            ("created[lte]".to_string(), end.to_string()),
        ];
        let body = self.list(key, "charges", params, cursor).await?;
        let data = body
            .pointer("/data")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|item| {
                Some(StripeCharge {
                    id: json_str(item, "/id")?,
                    amount_cents: json_i64(item, "/amount"),
                    currency: json_str(item, "/currency").unwrap_or_else(|| "usd".to_string()),
                    status: json_str(item, "/status").unwrap_or_default(),
                    paid: item.pointer("/paid").and_then(JsonValue::as_bool) == Some(true),
                    refunded: item.pointer("/refunded").and_then(JsonValue::as_bool)
                        == Some(true),
                })
            })
            .collect();
        Ok(Page {
            data,
            has_more: body.pointer("/has_more").and_then(JsonValue::as_bool) == Some(true),
        })
    }

    async fn refunds(
        &self,
        key: &str,
        start: i64,
        end: i64,
        cursor: Option<String>,
    ) -> Result<Page<StripeRefund>, AdapterError> {
        let params = vec![
            ("created[gte]".to_string(), start.to_string()),
            ("created[lte]".to_string(), end.to_string()),
        ];
        let body = self.list(key, "refunds", params, cursor).await?;
        let data = body
            .pointer("/data")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|item| {
                Some(StripeRefund {
                    id: json_str(item, "/id")?,
                    amount_cents: json_i64(item, "/amount"),
                })
            })
            .collect();
        Ok(Page {
            data,
            has_more: body.pointer("/has_more").and_then(JsonValue::as_bool) == Some(true),
        })
    }
}
