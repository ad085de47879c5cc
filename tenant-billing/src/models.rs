use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Entity, EntityKind};

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Tenant represents an isolated customer organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub prefix: String,
    pub domain: Option<String>,
    pub subdomain: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub settings: TenantSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Versioned per-tenant configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    pub version: u32,
    pub timezone: Option<String>,
    pub locale: Option<String>,
    pub billing_email: Option<String>,
    pub contact_phone: Option<String>,
    pub logo_url: Option<String>,
    /// Whether new usernames are stored as `PREFIX_username`
    pub prefixed_usernames: bool,
}

impl TenantSettings {
    pub const CURRENT_VERSION: u32 = 1;
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            timezone: Some("Asia/Jakarta".to_string()),
            locale: Some("id-ID".to_string()),
            billing_email: None,
            contact_phone: None,
            logo_url: None,
            prefixed_usernames: true,
        }
    }
}

impl Tenant {
    pub fn new(name: String, slug: String, prefix: String) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name,
            slug,
            prefix,
            domain: None,
            subdomain: None,
            is_active: true,
            settings: TenantSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    SuperAdmin,
    SystemAdmin,
    Admin,
    Teacher,
    Staff,
    Student,
    Parent,
}

impl UserRole {
    /// Platform roles are exempt from tenant scoping
    pub fn is_platform_role(&self) -> bool {
        matches!(self, UserRole::SuperAdmin | UserRole::SystemAdmin)
    }
}

/// User belonging to exactly one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub tenant_id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: UserRole,
    pub is_active: bool,
    pub two_factor_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(tenant_id: String, username: String, email: String, password_hash: String, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            tenant_id,
            username,
            email,
            password_hash,
            role,
            is_active: true,
            two_factor_enabled: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Enrolled student, counted against `maxStudents`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Student {
    pub fn new(tenant_id: String, name: String) -> Self {
        Self {
            id: new_id(),
            tenant_id,
            name,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// Teaching staff member, counted against `maxTeachers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Teacher {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Teacher {
    pub fn new(tenant_id: String, name: String) -> Self {
        Self {
            id: new_id(),
            tenant_id,
            name,
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// Uploaded file, used for the storage estimate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAsset {
    pub id: String,
    pub tenant_id: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}

impl FileAsset {
    pub fn new(tenant_id: String, file_name: String) -> Self {
        Self {
            id: new_id(),
            tenant_id,
            file_name,
            created_at: Utc::now(),
        }
    }
}

/// Tenant-defined custom field, counted against `maxCustomFields`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomField {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl CustomField {
    pub fn new(tenant_id: String, name: String) -> Self {
        Self {
            id: new_id(),
            tenant_id,
            name,
            created_at: Utc::now(),
        }
    }
}

/// Metered usage counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageType {
    ApiCall,
    Sms,
    Email,
    Report,
}

/// One increment of a metered counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: String,
    pub tenant_id: String,
    pub usage_type: UsageType,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

impl UsageLog {
    pub fn new(tenant_id: String, usage_type: UsageType, quantity: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            tenant_id,
            usage_type,
            quantity,
            created_at,
        }
    }
}

/// Plan level, ordered from cheapest to most capable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionTier {
    Trial,
    Basic,
    Standard,
    Premium,
    Enterprise,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 5] = [
        SubscriptionTier::Trial,
        SubscriptionTier::Basic,
        SubscriptionTier::Standard,
        SubscriptionTier::Premium,
        SubscriptionTier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Trial => "TRIAL",
            SubscriptionTier::Basic => "BASIC",
            SubscriptionTier::Standard => "STANDARD",
            SubscriptionTier::Premium => "PREMIUM",
            SubscriptionTier::Enterprise => "ENTERPRISE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        }
    }

    /// Adds one cycle, clamping to the last day of shorter months
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from.checked_add_months(chrono::Months::new(self.months()))
            .unwrap_or(from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    GracePeriod,
    Suspended,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Statuses counted by the one-live-subscription-per-tenant invariant
    pub const LIVE: [SubscriptionStatus; 3] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::Trial,
        SubscriptionStatus::GracePeriod,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "TRIAL",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::GracePeriod => "GRACE_PERIOD",
            SubscriptionStatus::Suspended => "SUSPENDED",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Suspended | SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }

    /// Edges of the lifecycle graph. SUSPENDED is only left through manual
    /// reactivation outside this core.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Trial, Active)
                | (Trial, Expired)
                | (Trial, Cancelled)
                | (Active, Active)
                | (Active, GracePeriod)
                | (Active, Suspended)
                | (Active, Expired)
                | (Active, Cancelled)
                | (GracePeriod, Active)
                | (GracePeriod, Suspended)
                | (GracePeriod, Cancelled)
        )
    }
}

/// Subscription of one tenant to a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub organization_id: String,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub price: Decimal,
    pub currency: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub grace_period_end_date: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub last_payment_date: Option<DateTime<Utc>>,
    pub last_payment_transaction_id: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    /// Optimistic-concurrency token, incremented on every write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Refunded,
}

impl InvoiceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvoiceStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceKind {
    Subscription,
    Renewal,
    Proration,
    Upgrade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub description: String,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

impl InvoiceItem {
    pub fn new(description: impl Into<String>, quantity: i64, unit_price: Decimal) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
            amount: unit_price * Decimal::from(quantity),
        }
    }
}

/// Invoice; amounts are fixed at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub invoice_number: String,
    pub subscription_id: String,
    pub organization_id: String,
    pub kind: InvoiceKind,
    pub items: Vec<InvoiceItem>,
    pub subtotal: Decimal,
    pub discount_percent: Decimal,
    pub discount: Decimal,
    pub tax_rate: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub status: InvoiceStatus,
    pub due_date: DateTime<Utc>,
    pub paid_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// What a settled payment should do to the subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentPurpose {
    Activation {
        tier: SubscriptionTier,
        billing_cycle: BillingCycle,
    },
    Renewal,
    Upgrade {
        tier: SubscriptionTier,
        billing_cycle: BillingCycle,
    },
}

impl PaymentPurpose {
    /// Order-id prefix; the only signal the gateway echoes back
    pub fn order_prefix(&self) -> &'static str {
        match self {
            PaymentPurpose::Activation { .. } => "SUB",
            PaymentPurpose::Renewal => "RENEW",
            PaymentPurpose::Upgrade { .. } => "UPGRADE",
        }
    }
}

/// One gateway charge attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: String,
    pub invoice_id: String,
    pub subscription_id: String,
    pub organization_id: String,
    pub order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub purpose: PaymentPurpose,
    pub payment_method: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub redirect_url: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingEventType {
    SubscriptionCreated,
    TrialStarted,
    SubscriptionChanged,
    SubscriptionCancelled,
    SubscriptionRenewed,
    SubscriptionActivated,
    GracePeriodStarted,
    SubscriptionSuspended,
    TrialExpired,
    InvoiceCreated,
    InvoicePaid,
    InvoiceFailed,
    PaymentInitiated,
    PaymentReconciled,
}

/// Append-only billing audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: String,
    pub event_type: BillingEventType,
    pub subscription_id: Option<String>,
    pub organization_id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl BillingEvent {
    pub fn new(
        event_type: BillingEventType,
        organization_id: String,
        subscription_id: Option<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: new_id(),
            event_type,
            subscription_id,
            organization_id,
            data,
            created_at: Utc::now(),
        }
    }
}

/// Notification vocabulary other systems filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    BillingAlert,
    BillingSuccess,
    BillingCritical,
    UsageWarning,
    UsageCritical,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    pub data: serde_json::Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

macro_rules! impl_entity {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(
            impl Entity for $ty {
                const KIND: EntityKind = $kind;

                fn id(&self) -> &str {
                    &self.id
                }
            }
        )*
    };
}

impl_entity! {
    Tenant => EntityKind::Tenant,
    User => EntityKind::User,
    Student => EntityKind::Student,
    Teacher => EntityKind::Teacher,
    FileAsset => EntityKind::FileAsset,
    CustomField => EntityKind::CustomField,
    UsageLog => EntityKind::UsageLog,
    Subscription => EntityKind::Subscription,
    Invoice => EntityKind::Invoice,
    PaymentTransaction => EntityKind::PaymentTransaction,
    BillingEvent => EntityKind::BillingEvent,
    Notification => EntityKind::Notification,
}
