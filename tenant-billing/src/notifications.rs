use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::gateway::{CrossTenantGateway, TenantGateway};
use crate::models::{Notification, NotificationType, User, UserRole};
use crate::store::{Filter, FindOptions, Store};

/// A message addressed to one user
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    pub data: Value,
}

/// Delivery seam for user-facing notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create(&self, tenant_id: &str, request: NotificationRequest) -> Result<()>;
}

/// Persists notifications as rows of the recipient's tenant
#[derive(Clone)]
pub struct StoreNotificationSink {
    store: Arc<dyn Store>,
}

impl StoreNotificationSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationSink for StoreNotificationSink {
    async fn create(&self, tenant_id: &str, request: NotificationRequest) -> Result<()> {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: request.user_id,
            title: request.title,
            message: request.message,
            notification_type: request.notification_type,
            data: request.data,
            is_read: false,
            created_at: Utc::now(),
        };
        TenantGateway::new(self.store.clone(), tenant_id)
            .create(&notification)
            .await
    }
}

/// Fans billing notifications out to tenant administrators.
///
/// Delivery failures are logged and swallowed; they never affect billing state.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub async fn notify_user(&self, tenant_id: &str, request: NotificationRequest) -> bool {
        let user_id = request.user_id.clone();
        match self.sink.create(tenant_id, request).await {
            Ok(()) => true,
            Err(e) => {
                warn!(tenant_id = tenant_id, user_id = %user_id, error = %e, "Notification delivery failed");
                false
            }
        }
    }

    /// Sends to every active `ADMIN` of the gateway's tenant, returning how many were delivered
    pub async fn notify_tenant_admins(
        &self,
        gateway: &TenantGateway,
        title: &str,
        message: &str,
        notification_type: NotificationType,
        data: Value,
    ) -> usize {
        let filter = Filter::eq("role", "ADMIN").and(Filter::eq("is_active", true));
        let admins: Vec<User> = match gateway.find_many(&filter, &FindOptions::default()).await {
            Ok(admins) => admins,
            Err(e) => {
                warn!(tenant_id = gateway.tenant_id(), error = %e, "Could not load tenant admins");
                return 0;
            }
        };

        let mut delivered = 0;
        for admin in admins.iter().filter(|u| u.role == UserRole::Admin) {
            let request = NotificationRequest {
                user_id: admin.id.clone(),
                title: title.to_string(),
                message: message.to_string(),
                notification_type,
                data: data.clone(),
            };
            if self.notify_user(gateway.tenant_id(), request).await {
                delivered += 1;
            }
        }
        debug!(
            tenant_id = gateway.tenant_id(),
            delivered = delivered,
            title = title,
            "Admin notification fan-out"
        );
        delivered
    }
}

/// Deletes read notifications created before `now - months`
pub async fn purge_read_notifications(admin: &CrossTenantGateway, now: DateTime<Utc>, months: u32) -> Result<u64> {
    let cutoff = now.checked_sub_months(Months::new(months)).unwrap_or(now);
    let filter = Filter::eq("is_read", true).and(Filter::lt("created_at", cutoff));
    admin.delete_many::<Notification>(&filter).await
}
