//! End-to-end adapter flow against the in-memory stores: registry dispatch,
//! normalization and the audit trail, without any network.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use appsight_adapters::{
    AdMobApi, AdMobCollector, AdReportRow, AdapterError, CollectContext, CollectorRegistry, Page,
    StripeApi, StripeCharge, StripeCollector, StripeRefund, StripeSubscription, SubscriptionQuery,
};
use appsight_core::{
    AdMobCredentials, CollectionStatus, CredentialRecord, SourceCredentials, SourceKind,
    StripeCredentials,
};
use appsight_storage::{DateFilter, LogFilter, Stores};

struct OneRowAdMob;

#[async_trait]
impl AdMobApi for OneRowAdMob {
    async fn network_report(
        &self,
        _creds: &AdMobCredentials,
        _date: NaiveDate,
    ) -> Result<Vec<AdReportRow>, AdapterError> {
        Ok(vec![AdReportRow {
            app_id: Some("ca-app-pub-9".into()),
            app_name: None,
            country: Some("GB".into()),
            earnings_micros: 5_000_000,
            impressions: 2000,
            clicks: 40,
            currency: Some("USD".into()),
        }])
    }
}

struct EmptyStripe;

#[async_trait]
impl StripeApi for EmptyStripe {
    async fn subscriptions(
        &self,
        _key: &str,
        _query: SubscriptionQuery,
        _cursor: Option<String>,
    ) -> Result<Page<StripeSubscription>, AdapterError> {
        Ok(Page {
            data: Vec::new(),
            has_more: false,
        })
    }

    async fn charges(
        &self,
        _key: &str,
        _start: i64,
        _end: i64,
        _cursor: Option<String>,
    ) -> Result<Page<StripeCharge>, AdapterError> {
        Ok(Page {
            data: Vec::new(),
            has_more: false,
        })
    }

    async fn refunds(
        &self,
        _key: &str,
        _start: i64,
        _end: i64,
        _cursor: Option<String>,
    ) -> Result<Page<StripeRefund>, AdapterError> {
        Ok(Page {
            data: Vec::new(),
            has_more: false,
        })
    }
}

fn credential(user_id: Uuid, credentials: SourceCredentials) -> CredentialRecord {
    CredentialRecord {
        user_id,
        credentials,
        is_configured: true,
        last_tested_at: None,
        test_status: None,
    }
}

#[tokio::test]
async fn registry_dispatch_collects_and_audits_per_source() {
    let (stores, _memory) = Stores::in_memory();
    let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
    let ctx = CollectContext::with_date(stores, date);
    let user = Uuid::new_v4();

    let mut registry = CollectorRegistry::default();
    registry.register(Arc::new(AdMobCollector::new(Arc::new(OneRowAdMob))));
    registry.register(Arc::new(StripeCollector::new(Arc::new(EmptyStripe))));
    assert_eq!(registry.len(), 2);
    assert!(registry.get(SourceKind::GooglePlay).is_none());

    let records = [
        credential(
            user,
            SourceCredentials::AdMob(AdMobCredentials {
                client_id: "client".into(),
                client_secret: "secret".into(),
                refresh_token: "refresh".into(),
                publisher_id: "pub-9".into(),
            }),
        ),
        credential(
            user,
            SourceCredentials::Stripe(StripeCredentials {
                secret_key: "sk_test".into(),
            }),
        ),
    ];
    for record in &records {
        let collector = registry.get(record.credentials.kind()).unwrap();
        collector.collect(&ctx, record).await.unwrap();
    }

    let ad_rows = ctx
        .stores
        .metrics
        .ad_revenue(user, DateFilter::default())
        .await
        .unwrap();
    assert_eq!(ad_rows.len(), 1);
    assert_eq!(ad_rows[0].estimated_revenue, 5.0);
    assert!((ad_rows[0].ecpm - 2.5).abs() < 1e-9);
    assert_eq!(ad_rows[0].country, "GB");

    let stripe_rows = ctx
        .stores
        .metrics
        .stripe(user, DateFilter::default())
        .await
        .unwrap();
    assert_eq!(stripe_rows.len(), 1);
    assert_eq!(stripe_rows[0].active_subscriptions, 0);
    assert_eq!(stripe_rows[0].churn_rate, 0.0);

    let logs = ctx
        .stores
        .logs
        .list(LogFilter {
            user_id: Some(user),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs
        .iter()
        .all(|entry| entry.status == CollectionStatus::Success));
}
