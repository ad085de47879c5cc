//! Persistence seam.
//!
//! Entities are stored as JSON documents, one table (or map) per [`EntityKind`].
//! Queries are expressed with the [`Filter`] AST so that the tenant-scoped gateway
//! can inspect and rewrite them before they reach a concrete store.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::Database;

/// A stored record
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("Invalid field name: {0}")]
    InvalidField(String),
    #[error("Record is not a JSON object")]
    NotAnObject,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Every persisted entity type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Tenant,
    User,
    Student,
    Teacher,
    FileAsset,
    CustomField,
    UsageLog,
    Subscription,
    Invoice,
    PaymentTransaction,
    BillingEvent,
    Notification,
}

/// A uniqueness invariant enforced by the store
#[derive(Debug, Clone, Copy)]
pub struct UniqueKey {
    pub name: &'static str,
    pub fields: &'static [&'static str],
    /// Restricts the constraint to documents matching the predicate (partial index)
    pub when: Option<fn(&Document) -> bool>,
}

fn is_live_subscription(doc: &Document) -> bool {
    matches!(
        doc.get("status").and_then(|v| v.as_str()),
        Some("ACTIVE" | "TRIAL" | "GRACE_PERIOD")
    )
}

impl EntityKind {
    pub const ALL: [EntityKind; 12] = [
        EntityKind::Tenant,
        EntityKind::User,
        EntityKind::Student,
        EntityKind::Teacher,
        EntityKind::FileAsset,
        EntityKind::CustomField,
        EntityKind::UsageLog,
        EntityKind::Subscription,
        EntityKind::Invoice,
        EntityKind::PaymentTransaction,
        EntityKind::BillingEvent,
        EntityKind::Notification,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Tenant => "tenants",
            EntityKind::User => "users",
            EntityKind::Student => "students",
            EntityKind::Teacher => "teachers",
            EntityKind::FileAsset => "file_assets",
            EntityKind::CustomField => "custom_fields",
            EntityKind::UsageLog => "usage_logs",
            EntityKind::Subscription => "subscriptions",
            EntityKind::Invoice => "invoices",
            EntityKind::PaymentTransaction => "payment_transactions",
            EntityKind::BillingEvent => "billing_events",
            EntityKind::Notification => "notifications",
        }
    }

    /// Field carrying the owning tenant, `None` for platform-level entities.
    /// This is the allow-list the tenant-scoped gateway enforces.
    pub fn tenant_field(&self) -> Option<&'static str> {
        match self {
            EntityKind::Tenant => None,
            EntityKind::Subscription
            | EntityKind::Invoice
            | EntityKind::PaymentTransaction
            | EntityKind::BillingEvent => Some("organization_id"),
            _ => Some("tenant_id"),
        }
    }

    pub fn is_tenant_owned(&self) -> bool {
        self.tenant_field().is_some()
    }

    pub fn unique_keys(&self) -> &'static [UniqueKey] {
        const TENANT: &[UniqueKey] = &[
            UniqueKey { name: "tenants.prefix", fields: &["prefix"], when: None },
            UniqueKey { name: "tenants.slug", fields: &["slug"], when: None },
            UniqueKey { name: "tenants.subdomain", fields: &["subdomain"], when: None },
            UniqueKey { name: "tenants.domain", fields: &["domain"], when: None },
        ];
        const USER: &[UniqueKey] = &[UniqueKey {
            name: "users.tenant_username",
            fields: &["tenant_id", "username"],
            when: None,
        }];
        const SUBSCRIPTION: &[UniqueKey] = &[UniqueKey {
            name: "subscriptions.live_per_organization",
            fields: &["organization_id"],
            when: Some(is_live_subscription),
        }];
        const INVOICE: &[UniqueKey] = &[UniqueKey {
            name: "invoices.invoice_number",
            fields: &["invoice_number"],
            when: None,
        }];
        const PAYMENT: &[UniqueKey] = &[
            UniqueKey { name: "payment_transactions.order_id", fields: &["order_id"], when: None },
            UniqueKey {
                name: "payment_transactions.gateway_transaction_id",
                fields: &["gateway_transaction_id"],
                when: None,
            },
        ];

        match self {
            EntityKind::Tenant => TENANT,
            EntityKind::User => USER,
            EntityKind::Subscription => SUBSCRIPTION,
            EntityKind::Invoice => INVOICE,
            EntityKind::PaymentTransaction => PAYMENT,
            _ => &[],
        }
    }
}

/// A typed persisted record
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

/// Scalar operand of a filter comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    Null,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Str(v.clone())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
        }
    }
}

/// Query predicate over top-level document fields
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Compare { field: String, op: CmpOp, value: Value },
    In { field: String, values: Vec<Value> },
    IsNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn cmp(field: &str, op: CmpOp, value: impl Into<Value>) -> Self {
        Filter::Compare {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Eq, value)
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Ne, value)
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Lt, value)
    }

    pub fn lte(field: &str, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Lte, value)
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Gt, value)
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Gte, value)
    }

    pub fn one_of<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(field: &str) -> Self {
        Filter::IsNull(field.to_string())
    }

    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut parts), f) => {
                parts.push(f);
                Filter::And(parts)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut parts) => {
                parts.push(other);
                Filter::Or(parts)
            }
            a => Filter::Or(vec![a, other]),
        }
    }

    /// Whether any condition, at any nesting depth, references `field`
    pub fn references(&self, field: &str) -> bool {
        match self {
            Filter::All => false,
            Filter::Compare { field: f, .. } | Filter::In { field: f, .. } => f == field,
            Filter::IsNull(f) => f == field,
            Filter::And(parts) | Filter::Or(parts) => parts.iter().any(|p| p.references(field)),
            Filter::Not(inner) => inner.references(field),
        }
    }

    /// Values compared for equality against `field`, at any nesting depth
    pub fn equality_values(&self, field: &str) -> Vec<&Value> {
        match self {
            Filter::Compare {
                field: f,
                op: CmpOp::Eq,
                value,
            } if f == field => vec![value],
            Filter::In { field: f, values } if f == field => values.iter().collect(),
            Filter::And(parts) | Filter::Or(parts) => {
                parts.iter().flat_map(|p| p.equality_values(field)).collect()
            }
            Filter::Not(inner) => inner.equality_values(field),
            _ => Vec::new(),
        }
    }

    /// Every field name mentioned by the filter
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Filter::All => Vec::new(),
            Filter::Compare { field, .. } | Filter::In { field, .. } | Filter::IsNull(field) => {
                vec![field.as_str()]
            }
            Filter::And(parts) | Filter::Or(parts) => parts.iter().flat_map(|p| p.fields()).collect(),
            Filter::Not(inner) => inner.fields(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortAs {
    Text,
    Number,
    Time,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
    pub sort_as: SortAs,
}

/// Ordering and paging for `find_many`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub order_by: Option<OrderBy>,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn newest_first(field: &str) -> Self {
        Self {
            order_by: Some(OrderBy {
                field: field.to_string(),
                descending: true,
                sort_as: SortAs::Time,
            }),
            limit: None,
        }
    }

    pub fn oldest_first(field: &str) -> Self {
        Self {
            order_by: Some(OrderBy {
                field: field.to_string(),
                descending: false,
                sort_as: SortAs::Time,
            }),
            limit: None,
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Field updates applied by `update_many`; top-level keys replace existing ones
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(Document);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<V: Serialize>(mut self, field: &str, value: V) -> Result<Self, StoreError> {
        self.0.insert(field.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Whole-record replacement (minus the primary key)
    pub fn from_entity<T: Entity>(entity: &T) -> Result<Self, StoreError> {
        let mut doc = to_document(entity)?;
        doc.remove("id");
        Ok(Self(doc))
    }

    pub fn remove(&mut self, field: &str) -> Option<serde_json::Value> {
        self.0.remove(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn into_document(self) -> Document {
        self.0
    }
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(StoreError::NotAnObject),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::Object(doc))?)
}

/// Field names are interpolated into SQL, so only plain identifiers are accepted
pub fn validate_field(field: &str) -> Result<(), StoreError> {
    let mut chars = field.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidField(field.to_string()))
    }
}

/// Query interface of the relational store
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_many(
        &self,
        kind: EntityKind,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    async fn find_first(&self, kind: EntityKind, filter: &Filter) -> Result<Option<Document>, StoreError> {
        let options = FindOptions::default().limit(1);
        Ok(self.find_many(kind, filter, &options).await?.into_iter().next())
    }

    async fn count(&self, kind: EntityKind, filter: &Filter) -> Result<u64, StoreError>;

    /// Sum of a numeric field over matching records (0 when none match)
    async fn sum(&self, kind: EntityKind, field: &str, filter: &Filter) -> Result<f64, StoreError>;

    async fn insert(&self, kind: EntityKind, doc: Document) -> Result<(), StoreError>;

    /// All-or-nothing bulk insert
    async fn insert_many(&self, kind: EntityKind, docs: Vec<Document>) -> Result<u64, StoreError>;

    /// Atomically applies `patch` to every matching record, returning the affected count
    async fn update_many(&self, kind: EntityKind, filter: &Filter, patch: &Patch) -> Result<u64, StoreError>;

    async fn delete_many(&self, kind: EntityKind, filter: &Filter) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_nested_conditions() {
        let filter = Filter::eq("status", "ACTIVE")
            .and(Filter::Or(vec![Filter::eq("tenant_id", "t1"), Filter::is_null("domain")]));
        assert!(filter.references("tenant_id"));
        assert!(filter.references("domain"));
        assert!(!filter.references("organization_id"));
        assert_eq!(filter.equality_values("tenant_id"), vec![&Value::from("t1")]);
    }

    #[test]
    fn and_with_all_collapses() {
        let filter = Filter::All.and(Filter::eq("id", "x"));
        assert_eq!(filter, Filter::eq("id", "x"));
    }

    #[test]
    fn field_names_are_validated() {
        assert!(validate_field("organization_id").is_ok());
        assert!(validate_field("created_at2").is_ok());
        assert!(validate_field("data'; drop table").is_err());
        assert!(validate_field("Status").is_err());
        assert!(validate_field("").is_err());
    }

    #[test]
    fn tenant_allow_list() {
        assert!(!EntityKind::Tenant.is_tenant_owned());
        assert_eq!(EntityKind::Invoice.tenant_field(), Some("organization_id"));
        assert_eq!(EntityKind::Student.tenant_field(), Some("tenant_id"));
    }
}
