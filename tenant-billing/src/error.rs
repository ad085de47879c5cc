use serde::Serialize;
use thiserror::Error;

use crate::models::{SubscriptionStatus, SubscriptionTier};
use crate::pricing::LimitKey;
use crate::store::StoreError;

/// Result alias used throughout the core
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Operator-facing detail attached to a usage-limit rejection
#[derive(Debug, Clone, Serialize)]
pub struct LimitExceeded {
    pub limit: LimitKey,
    pub current: f64,
    pub limit_value: i64,
    pub requested: i64,
    pub recommended_tier: Option<SubscriptionTier>,
}

/// Core error taxonomy
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} is inactive: {id}")]
    Inactive { entity: &'static str, id: String },
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Organization {organization_id} already has an active subscription")]
    DuplicateActiveSubscription { organization_id: String },
    #[error("No unique prefix available for base {base}")]
    PrefixExhausted { base: String },
    #[error("Invalid notification signature")]
    InvalidSignature,
    #[error("Usage limit exceeded for {}", .0.limit)]
    UsageLimitExceeded(Box<LimitExceeded>),
    #[error("Payment gateway error: {0}")]
    GatewayError(String),
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Concurrent modification: {0}")]
    Conflict(String),
    #[error("Invalid subscription transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    #[error("No tenant context in scope")]
    MissingTenantContext,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::ValidationError(message.into())
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Inactive { .. } => "INACTIVE",
            CoreError::InvalidCredentials => "INVALID_CREDENTIALS",
            CoreError::DuplicateActiveSubscription { .. } => "DUPLICATE_ACTIVE_SUBSCRIPTION",
            CoreError::PrefixExhausted { .. } => "PREFIX_EXHAUSTED",
            CoreError::InvalidSignature => "INVALID_SIGNATURE",
            CoreError::UsageLimitExceeded(_) => "USAGE_LIMIT_EXCEEDED",
            CoreError::GatewayError(_) => "GATEWAY_ERROR",
            CoreError::ValidationError(_) => "VALIDATION_ERROR",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::MissingTenantContext => "MISSING_TENANT_CONTEXT",
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Store(_) => "STORAGE_ERROR",
        }
    }

    /// Usage-limit rejections are resolved by upgrading, not by retrying
    pub fn is_upgrade_required(&self) -> bool {
        matches!(self, CoreError::UsageLimitExceeded(_))
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation(key) => CoreError::Conflict(format!("unique key {key}")),
            other => CoreError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_maps_to_conflict() {
        let err: CoreError = StoreError::UniqueViolation("invoices.invoice_number".into()).into();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn usage_limit_is_upgrade_required() {
        let err = CoreError::UsageLimitExceeded(Box::new(LimitExceeded {
            limit: LimitKey::MaxStudents,
            current: 500.0,
            limit_value: 500,
            requested: 1,
            recommended_tier: Some(SubscriptionTier::Standard),
        }));
        assert!(err.is_upgrade_required());
        assert_eq!(err.to_string(), "Usage limit exceeded for maxStudents");
        assert!(!CoreError::InvalidCredentials.is_upgrade_required());
    }
}
