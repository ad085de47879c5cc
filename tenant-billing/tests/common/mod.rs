#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tenant_billing::auth::CreateUser;
use tenant_billing::config::{
    AuthConfig, BillingConfig, Config, DatabaseConfig, GatewayConfig, ObservabilityConfig,
    ServerConfig, TenancyConfig,
};
use tenant_billing::payment::{compute_signature, ChargeRequest, ChargeResponse, PaymentNotification};
use tenant_billing::store::{Document, EntityKind, Filter, FindOptions, Patch, StoreError};
use tenant_billing::tenant::OnboardTenant;
use tenant_billing::{
    build_state, AppState, CoreError, MemoryStore, Metrics, PaymentGateway, Store, Tenant,
    TenantGateway, User, UserRole,
};

pub const SERVER_KEY: &str = "test-server-key";

pub fn config() -> Config {
    Config {
        server: ServerConfig { host: "127.0.0.1".into(), port: 0 },
        database: DatabaseConfig { url: String::new(), max_connections: 1, min_connections: 0 },
        observability: ObservabilityConfig {
            tracing_endpoint: None,
            service_name: "tenant-billing-test".into(),
            log_level: "debug".into(),
        },
        tenancy: TenancyConfig {
            main_domains: vec!["sekolah.id".into(), "localhost".into()],
            ..TenancyConfig::default()
        },
        auth: AuthConfig {
            jwt_secret: "integration-secret".into(),
            session_hours: 1,
            issuer: "tenant-billing".into(),
        },
        billing: BillingConfig {
            scheduler_workers: 2,
            ..BillingConfig::default()
        },
        gateway: GatewayConfig {
            base_url: "http://127.0.0.1:9".into(),
            server_key: SERVER_KEY.into(),
            merchant_id: "M-TEST".into(),
            timeout_secs: 1,
        },
    }
}

/// Payment provider double that records every charge
#[derive(Default)]
pub struct FakeGateway {
    pub charges: Mutex<Vec<ChargeRequest>>,
    pub failing: bool,
}

impl FakeGateway {
    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_charge(&self, request: ChargeRequest) -> tenant_billing::Result<ChargeResponse> {
        if self.failing {
            return Err(CoreError::GatewayError("provider unavailable".into()));
        }
        let mut charges = self.charges.lock().unwrap();
        charges.push(request.clone());
        Ok(ChargeResponse {
            transaction_id: format!("gw-{}", charges.len()),
            redirect_url: Some(format!("https://pay.test/{}", request.order_id)),
            payment_type: None,
            raw: serde_json::json!({"token": request.order_id}),
        })
    }
}

/// In-memory store whose next subscription read or write can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_next_subscription_read: AtomicBool,
    fail_next_subscription_write: AtomicBool,
}

impl FlakyStore {
    pub fn fail_next_subscription_read(&self) {
        self.fail_next_subscription_read.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_subscription_write(&self) {
        self.fail_next_subscription_write.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn find_many(&self, kind: EntityKind, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, StoreError> {
        if kind == EntityKind::Subscription && self.fail_next_subscription_read.swap(false, Ordering::SeqCst) {
            return Err(StoreError::NotAnObject);
        }
        self.inner.find_many(kind, filter, options).await
    }

    async fn count(&self, kind: EntityKind, filter: &Filter) -> Result<u64, StoreError> {
        self.inner.count(kind, filter).await
    }

    async fn sum(&self, kind: EntityKind, field: &str, filter: &Filter) -> Result<f64, StoreError> {
        self.inner.sum(kind, field, filter).await
    }

    async fn insert(&self, kind: EntityKind, doc: Document) -> Result<(), StoreError> {
        self.inner.insert(kind, doc).await
    }

    async fn insert_many(&self, kind: EntityKind, docs: Vec<Document>) -> Result<u64, StoreError> {
        self.inner.insert_many(kind, docs).await
    }

    async fn update_many(&self, kind: EntityKind, filter: &Filter, patch: &Patch) -> Result<u64, StoreError> {
        if kind == EntityKind::Subscription && self.fail_next_subscription_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::NotAnObject);
        }
        self.inner.update_many(kind, filter, patch).await
    }

    async fn delete_many(&self, kind: EntityKind, filter: &Filter) -> Result<u64, StoreError> {
        self.inner.delete_many(kind, filter).await
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<dyn Store>,
    pub payments: Arc<FakeGateway>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gateway(FakeGateway::default())
    }

    pub fn failing() -> Self {
        Self::with_gateway(FakeGateway { failing: true, ..FakeGateway::default() })
    }

    /// Harness over a store whose subscription access can be made to fail
    pub fn flaky() -> (Self, Arc<FlakyStore>) {
        let flaky = Arc::new(FlakyStore::default());
        let harness = Self::with_store(flaky.clone(), FakeGateway::default());
        (harness, flaky)
    }

    fn with_gateway(fake: FakeGateway) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), fake)
    }

    fn with_store(store: Arc<dyn Store>, fake: FakeGateway) -> Self {
        let payments = Arc::new(fake);
        let state = build_state(&config(), store.clone(), payments.clone(), Metrics::new().unwrap());
        Self { state, store, payments }
    }

    pub async fn onboard(&self, name: &str) -> (Tenant, TenantGateway) {
        let tenant = self
            .state
            .tenants
            .onboard(OnboardTenant {
                name: name.into(),
                ..OnboardTenant::default()
            })
            .await
            .unwrap();
        let gateway = self.state.admin.for_tenant(tenant.id.clone());
        (tenant, gateway)
    }

    pub async fn add_admin(&self, tenant: &Tenant, gateway: &TenantGateway) -> User {
        self.state
            .auth
            .clone()
            .with_bcrypt_cost(4)
            .create_user(
                gateway,
                tenant,
                CreateUser {
                    username: "admin".into(),
                    email: "admin@example.id".into(),
                    password: "rahasia123".into(),
                    role: UserRole::Admin,
                },
            )
            .await
            .unwrap()
    }
}

pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 9, 0, 0).unwrap()
}

pub fn signed_notification(order_id: &str, transaction_id: &str, status: &str, gross_amount: &str) -> PaymentNotification {
    let status_code = if status == "deny" { "202" } else { "200" };
    PaymentNotification {
        transaction_time: None,
        transaction_status: status.into(),
        transaction_id: transaction_id.into(),
        status_message: None,
        status_code: status_code.into(),
        signature_key: compute_signature(order_id, status_code, gross_amount, SERVER_KEY),
        payment_type: Some("bank_transfer".into()),
        order_id: order_id.into(),
        merchant_id: Some("M-TEST".into()),
        gross_amount: gross_amount.into(),
        currency: Some("IDR".into()),
        fraud_status: None,
    }
}
