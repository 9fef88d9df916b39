//! Core domain model for AppSight: sources, credentials, normalized daily
//! records and the collection audit trail.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "appsight-core";

/// Closed set of external data sources the pipeline collects from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    AdMob,
    AppStore,
    GooglePlay,
    Stripe,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::AdMob,
        SourceKind::AppStore,
        SourceKind::GooglePlay,
        SourceKind::Stripe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::AdMob => "admob",
            SourceKind::AppStore => "appstore",
            SourceKind::GooglePlay => "googleplay",
            SourceKind::Stripe => "stripe",
        }
    }

    pub fn parse(input: &str) -> Option<SourceKind> {
        match input {
            "admob" => Some(SourceKind::AdMob),
            "appstore" => Some(SourceKind::AppStore),
            "googleplay" => Some(SourceKind::GooglePlay),
            "stripe" => Some(SourceKind::Stripe),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdMobCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub publisher_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStoreCredentials {
    pub issuer_id: String,
    pub key_id: String,
    /// ES256 private key in PEM form.
    pub private_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GooglePlayCredentials {
    pub service_account_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeCredentials {
    pub secret_key: String,
}

/// Per-source credential material, validated at the settings-save boundary.
/// Adapters still run a cheap config guard so an incomplete variant turns
/// into a single `skipped` audit entry instead of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SourceCredentials {
    AdMob(AdMobCredentials),
    AppStore(AppStoreCredentials),
    GooglePlay(GooglePlayCredentials),
    Stripe(StripeCredentials),
}

impl SourceCredentials {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceCredentials::AdMob(_) => SourceKind::AdMob,
            SourceCredentials::AppStore(_) => SourceKind::AppStore,
            SourceCredentials::GooglePlay(_) => SourceKind::GooglePlay,
            SourceCredentials::Stripe(_) => SourceKind::Stripe,
        }
    }

    /// All required fields present and non-empty.
    pub fn is_complete(&self) -> bool {
        match self {
            SourceCredentials::AdMob(c) => !c.client_id.is_empty() && !c.publisher_id.is_empty(),
            SourceCredentials::AppStore(c) => {
                !c.issuer_id.is_empty() && !c.key_id.is_empty() && !c.private_key.is_empty()
            }
            SourceCredentials::GooglePlay(c) => !c.service_account_json.is_empty(),
            SourceCredentials::Stripe(c) => !c.secret_key.is_empty(),
        }
    }
}

/// One credential record per (user, source). Read-only to the pipeline
/// except for the connectivity-test fields maintained outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub user_id: Uuid,
    pub credentials: SourceCredentials,
    pub is_configured: bool,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub test_status: Option<String>,
}

/// Ad-network daily row, keyed (user, date, app id, country).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdRevenueRecord {
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub app_id: String,
    pub country: String,
    pub app_name: String,
    pub estimated_revenue: f64,
    pub impressions: i64,
    pub clicks: i64,
    pub ecpm: f64,
    pub currency: String,
    pub app_ref_id: Option<Uuid>,
}

/// App Store Connect daily row, keyed (user, date, app id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStoreRecord {
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub app_id: String,
    pub app_name: String,
    pub latest_version: Option<String>,
    pub latest_build: Option<String>,
    pub build_status: Option<String>,
    pub downloads: i64,
    pub updates: i64,
    pub proceeds: f64,
    pub average_rating: Option<f64>,
    pub total_ratings: i64,
    pub app_ref_id: Option<Uuid>,
}

/// Google Play daily row, keyed (user, date, package name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GooglePlayRecord {
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub package_name: String,
    pub app_name: String,
    pub latest_version_code: Option<i64>,
    pub latest_version_name: Option<String>,
    pub track: String,
    pub release_status: Option<String>,
    pub average_rating: Option<f64>,
    pub total_ratings: i64,
    pub app_ref_id: Option<Uuid>,
}

/// Stripe account-level daily row, keyed (user, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StripeRecord {
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub active_subscriptions: i64,
    pub new_subscriptions: i64,
    pub canceled_subscriptions: i64,
    pub mrr: f64,
    pub arr: f64,
    pub total_revenue: f64,
    pub successful_payments: i64,
    pub failed_payments: i64,
    pub refunds: f64,
    pub churn_rate: f64,
    pub currency: String,
}

/// User-owned logical app with optional per-platform identifiers. The
/// pipeline only reads these, to soft-link normalized rows to an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppEntity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub ios_app_id: Option<String>,
    pub ios_bundle_id: Option<String>,
    pub android_package_name: Option<String>,
    pub admob_app_id: Option<String>,
    pub stripe_product_id: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Success,
    Error,
    Skipped,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::Success => "success",
            CollectionStatus::Error => "error",
            CollectionStatus::Skipped => "skipped",
        }
    }
}

/// Append-only audit record, one per adapter invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionLogEntry {
    pub id: Uuid,
    /// None for system-level runs.
    pub user_id: Option<Uuid>,
    pub source: SourceKind,
    pub status: CollectionStatus,
    pub message: String,
    pub records_collected: i64,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl CollectionLogEntry {
    pub fn new(
        user_id: Option<Uuid>,
        source: SourceKind,
        status: CollectionStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            source,
            status,
            message: message.into(),
            records_collected: 0,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_records(mut self, records: i64) -> Self {
        self.records_collected = records;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
}

/// Subscription signal consumed by the scheduling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub email: String,
    pub is_verified: bool,
    pub plan: Plan,
    pub last_collection_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Fulfilled,
    Rejected,
}

/// Per-source row in the orchestrator's returned summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source: SourceKind,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn fulfilled(source: SourceKind) -> Self {
        Self {
            source,
            status: OutcomeStatus::Fulfilled,
            error: None,
        }
    }

    pub fn rejected(source: SourceKind, error: impl Into<String>) -> Self {
        Self {
            source,
            status: OutcomeStatus::Rejected,
            error: Some(error.into()),
        }
    }
}

/// The collection window is always the prior full UTC day; provider data
/// for the current day is typically incomplete.
pub fn yesterday_utc() -> NaiveDate {
    Utc::now().date_naive() - Duration::days(1)
}

/// Inclusive unix-second bounds for one UTC calendar day
/// (00:00:00 through 23:59:59).
pub fn day_bounds_utc(date: NaiveDate) -> (i64, i64) {
    let start = Utc
        .with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
        .single()
        .expect("valid UTC midnight");
    (start.timestamp(), start.timestamp() + 86_399)
}

/// Round a currency figure to 2 decimal places at the point of storage.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
