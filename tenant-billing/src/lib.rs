//! Multi-tenant isolation and subscription billing core.

pub mod api;
pub mod auth;
pub mod billing_events;
pub mod config;
pub mod error;
pub mod gateway;
pub mod invoice;
pub mod models;
pub mod notifications;
pub mod observability;
pub mod payment;
pub mod prefix;
pub mod pricing;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod tenant;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

pub use api::{AppState, ErrorResponse};
pub use auth::{AuthService, Principal, RequestScope, Session};
pub use config::Config;
pub use error::{CoreError, Result};
pub use gateway::{CrossTenantGateway, TenantGateway};
pub use invoice::InvoiceService;
pub use models::*;
pub use notifications::{Notifier, StoreNotificationSink};
pub use observability::{init_observability, shutdown_tracing, Metrics};
pub use payment::{HttpPaymentGateway, PaymentGateway, PaymentService};
pub use routes::create_router;
pub use scheduler::{BillingScheduler, SweepReport};
pub use store::{Database, MemoryStore, Store};
pub use subscription::SubscriptionService;
pub use tenant::{TenantRegistryCache, TenantService};
pub use usage::UsageMonitor;

/// Wires every service over one store and one payment gateway
pub fn build_state(
    config: &Config,
    store: Arc<dyn Store>,
    payment_gateway: Arc<dyn PaymentGateway>,
    metrics: Metrics,
) -> AppState {
    let admin = CrossTenantGateway::new(store.clone());
    let cache = Arc::new(TenantRegistryCache::new(
        admin.clone(),
        Duration::from_secs(config.tenancy.registry_ttl_secs),
    ));
    let tenants = TenantService::new(admin.clone(), cache, &config.tenancy);
    let auth = AuthService::new(admin.clone(), tenants.clone(), metrics.clone(), &config.auth);

    let notifier = Notifier::new(Arc::new(StoreNotificationSink::new(store)));
    let usage = UsageMonitor::new(metrics.clone());
    let invoices = InvoiceService::new(admin.clone(), &config.billing);
    let subscriptions = SubscriptionService::new(invoices, notifier.clone(), metrics.clone(), &config.billing);
    let payments = PaymentService::new(
        subscriptions.clone(),
        payment_gateway,
        admin.clone(),
        notifier.clone(),
        metrics.clone(),
        &config.gateway,
        &config.billing,
    );
    let scheduler = BillingScheduler::new(
        admin.clone(),
        subscriptions.clone(),
        payments.clone(),
        usage.clone(),
        notifier,
        metrics.clone(),
        config.billing.clone(),
    );

    AppState {
        admin,
        tenants,
        auth,
        subscriptions,
        payments,
        usage,
        scheduler,
        metrics,
        currency: config.billing.currency.clone(),
    }
}
