use chrono::{DateTime, Months, Utc};
use serde_json::Value;
use tracing::error;

use crate::error::Result;
use crate::gateway::{CrossTenantGateway, TenantGateway};
use crate::models::{BillingEvent, BillingEventType};
use crate::store::{Filter, FindOptions};

/// Append an audit record. A failed write is logged; the state change it
/// describes has already happened and is not rolled back.
pub async fn record(
    gateway: &TenantGateway,
    event_type: BillingEventType,
    subscription_id: Option<&str>,
    data: Value,
) {
    let event = BillingEvent::new(
        event_type,
        gateway.tenant_id().to_string(),
        subscription_id.map(str::to_string),
        data,
    );
    if let Err(e) = gateway.create(&event).await {
        error!(
            tenant_id = gateway.tenant_id(),
            event_type = ?event_type,
            error = %e,
            "Failed to record billing event"
        );
    }
}

pub async fn list_for_subscription(gateway: &TenantGateway, subscription_id: &str) -> Result<Vec<BillingEvent>> {
    gateway
        .find_many(
            &Filter::eq("subscription_id", subscription_id),
            &FindOptions::oldest_first("created_at"),
        )
        .await
}

/// Deletes events created before `now - months`
pub async fn purge_older_than(admin: &CrossTenantGateway, now: DateTime<Utc>, months: u32) -> Result<u64> {
    let cutoff = now.checked_sub_months(Months::new(months)).unwrap_or(now);
    admin
        .delete_many::<BillingEvent>(&Filter::lt("created_at", cutoff))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn events_are_listed_per_subscription() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let gateway = TenantGateway::new(store, "org-1");
        record(&gateway, BillingEventType::SubscriptionCreated, Some("s1"), json!({"tier": "TRIAL"})).await;
        record(&gateway, BillingEventType::TrialStarted, Some("s1"), json!({})).await;
        record(&gateway, BillingEventType::SubscriptionCreated, Some("s2"), json!({})).await;

        let events = list_for_subscription(&gateway, "s1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.event_type == BillingEventType::TrialStarted));
        assert!(events.iter().all(|e| e.organization_id == "org-1"));
    }

    #[tokio::test]
    async fn purge_removes_only_expired_events() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let admin = CrossTenantGateway::new(store.clone());
        let mut old = BillingEvent::new(BillingEventType::InvoicePaid, "org-1".into(), None, json!({}));
        old.created_at = Utc::now() - chrono::Duration::days(200);
        admin.create(&old).await.unwrap();
        admin
            .create(&BillingEvent::new(BillingEventType::InvoicePaid, "org-1".into(), None, json!({})))
            .await
            .unwrap();

        assert_eq!(purge_older_than(&admin, Utc::now(), 6).await.unwrap(), 1);
        assert_eq!(admin.count::<BillingEvent>(&Filter::All).await.unwrap(), 1);
    }
}
