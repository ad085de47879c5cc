use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthService, CreateUser, LoginHints, Principal, RequestScope, Session};
use crate::error::CoreError;
use crate::gateway::{CrossTenantGateway, TenantGateway};
use crate::models::{BillingCycle, PaymentPurpose, Subscription, Tenant, User, UserRole};
use crate::observability::Metrics;
use crate::payment::{PaymentNotification, PaymentService, PaymentSession};
use crate::pricing::{self, PricingPlan};
use crate::scheduler::{BillingScheduler, SweepReport};
use crate::store::Filter;
use crate::subscription::{
    ChangeOutcome, ChangeSubscription, CreateSubscription, SubscriptionService, Transition,
};
use crate::tenant::{OnboardTenant, TenantResolution, TenantService, TENANT_ID_HEADER};
use crate::usage::{LimitCheck, UsageMonitor};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub admin: CrossTenantGateway,
    pub tenants: TenantService,
    pub auth: AuthService,
    pub subscriptions: SubscriptionService,
    pub payments: PaymentService,
    pub usage: UsageMonitor,
    pub scheduler: BillingScheduler,
    pub metrics: Metrics,
    pub currency: String,
}

/// Error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
    pub request_id: String,
}

impl ErrorResponse {
    pub fn new(code: &str, message: &str, details: Option<Value>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.to_string(),
                details,
                request_id: Uuid::new_v4().to_string(),
            },
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Inactive { .. } => StatusCode::FORBIDDEN,
        CoreError::InvalidCredentials | CoreError::InvalidSignature => StatusCode::UNAUTHORIZED,
        CoreError::DuplicateActiveSubscription { .. }
        | CoreError::Conflict(_)
        | CoreError::InvalidTransition { .. }
        | CoreError::PrefixExhausted { .. } => StatusCode::CONFLICT,
        CoreError::UsageLimitExceeded(_) => StatusCode::PAYMENT_REQUIRED,
        CoreError::GatewayError(_) => StatusCode::BAD_GATEWAY,
        CoreError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::MissingTenantContext => StatusCode::BAD_REQUEST,
        CoreError::Config(_) | CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Maps a core error onto the HTTP error envelope
pub fn api_error(err: CoreError) -> ApiError {
    let status = status_for(&err);
    let details = match &err {
        CoreError::UsageLimitExceeded(detail) => serde_json::to_value(detail.as_ref()).ok(),
        CoreError::InvalidTransition { from, to } => Some(json!({"from": from, "to": to})),
        _ => None,
    };
    let message = if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
        error!(error = %err, code = err.code(), "Request failed");
        "Internal error".to_string()
    } else {
        err.to_string()
    };
    (status, Json(ErrorResponse::new(err.code(), &message, details)))
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        api_error(self).into_response()
    }
}

fn forbidden(message: &str) -> ApiError {
    (StatusCode::FORBIDDEN, Json(ErrorResponse::new("FORBIDDEN", message, None)))
}

/// Billing is managed by tenant admins and platform operators
fn require_billing_admin(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_platform() || principal.role == UserRole::Admin {
        Ok(())
    } else {
        warn!(user_id = %principal.user_id, role = ?principal.role, "Billing action refused");
        Err(forbidden("billing actions require an administrator"))
    }
}

/// Platform callers pick the tenant with `?tenant_id=`
#[derive(Debug, Default, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: Option<String>,
}

fn scoped(scope: &RequestScope, query: &TenantQuery, metrics: &Metrics) -> Result<TenantGateway, ApiError> {
    scope.tenant_gateway(query.tenant_id.as_deref()).map_err(|e| {
        if matches!(e, CoreError::MissingTenantContext) {
            metrics.record_missing_tenant_context("http");
        }
        api_error(e)
    })
}

fn request_host(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    match state.admin.count::<Tenant>(&Filter::All).await {
        Ok(_) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339(),
            "services": { "database": "healthy" }
        }))),
        Err(e) => {
            error!(error = %e, "Health check failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new(
                    "SERVICE_UNHEALTHY",
                    "One or more services are unhealthy",
                    None,
                )),
            ))
        }
    }
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!(error = %e, "Metrics rendering failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub tenant_id: Option<String>,
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Session> {
    let hints = LoginHints {
        tenant_id: request.tenant_id,
        host: request_host(&headers),
        tenant_header: headers
            .get(TENANT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    let principal = state
        .auth
        .authenticate(&request.username, &request.password, &hints)
        .await
        .map_err(api_error)?;
    let session = state.auth.issue_session(&principal).map_err(api_error)?;
    Ok(Json(session))
}

/// GET /tenant/context
pub async fn tenant_context(Extension(resolution): Extension<TenantResolution>) -> Json<Value> {
    let tenant = resolution.tenant().map(|t| {
        json!({
            "id": t.id,
            "name": t.name,
            "slug": t.slug,
            "prefix": t.prefix,
            "subdomain": t.subdomain,
            "domain": t.domain,
        })
    });
    Json(json!({
        "tenant": tenant,
        "detection_method": resolution.detection_method,
        "is_tenant_required": resolution.is_tenant_required,
    }))
}

/// POST /billing/notifications - gateway callback
pub async fn payment_notification(
    State(state): State<AppState>,
    Json(notification): Json<PaymentNotification>,
) -> ApiResult<Value> {
    let outcome = state
        .payments
        .reconcile_notification(&notification, Utc::now())
        .await
        .map_err(api_error)?;
    info!(
        order_id = %notification.order_id,
        status = ?outcome.status,
        duplicate = outcome.duplicate,
        "Payment notification processed"
    );
    Ok(Json(json!({
        "order_id": outcome.transaction.order_id,
        "status": outcome.status,
        "duplicate": outcome.duplicate,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PlansQuery {
    pub billing_cycle: Option<BillingCycle>,
}

/// GET /billing/plans
pub async fn list_plans(State(state): State<AppState>, Query(query): Query<PlansQuery>) -> Json<Vec<PricingPlan>> {
    let cycle = query.billing_cycle.unwrap_or(BillingCycle::Monthly);
    Json(pricing::all_plans(cycle, &state.currency))
}

/// GET /billing/usage
pub async fn usage(
    State(state): State<AppState>,
    Extension(scope): Extension<RequestScope>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<LimitCheck> {
    let gateway = scoped(&scope, &query, &state.metrics)?;
    let check = state.usage.check_limits(&gateway, Utc::now()).await.map_err(api_error)?;
    Ok(Json(check))
}

/// POST /users
pub async fn create_user(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(scope): Extension<RequestScope>,
    Query(query): Query<TenantQuery>,
    Json(request): Json<CreateUser>,
) -> ApiResult<Value> {
    require_billing_admin(&principal)?;
    let gateway = scoped(&scope, &query, &state.metrics)?;
    let tenant = state
        .admin
        .find_by_id::<Tenant>(gateway.tenant_id())
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(CoreError::not_found("tenant", gateway.tenant_id())))?;
    let user: User = state
        .auth
        .create_user(&gateway, &tenant, request)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({
        "id": user.id,
        "username": user.username,
        "email": user.email,
        "role": user.role,
        "tenant_id": user.tenant_id,
    })))
}

/// POST /billing/subscriptions
pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(scope): Extension<RequestScope>,
    Query(query): Query<TenantQuery>,
    Json(request): Json<CreateSubscription>,
) -> ApiResult<Subscription> {
    require_billing_admin(&principal)?;
    let gateway = scoped(&scope, &query, &state.metrics)?;
    let subscription = state
        .subscriptions
        .create(&gateway, request, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(subscription))
}

/// POST /billing/subscriptions/:id/change
pub async fn change_subscription(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(scope): Extension<RequestScope>,
    Path(subscription_id): Path<String>,
    Query(query): Query<TenantQuery>,
    Json(request): Json<ChangeSubscription>,
) -> ApiResult<ChangeOutcome> {
    require_billing_admin(&principal)?;
    let gateway = scoped(&scope, &query, &state.metrics)?;
    let outcome = state
        .subscriptions
        .change(&gateway, &subscription_id, request, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
    pub effective_date: Option<chrono::DateTime<Utc>>,
}

/// POST /billing/subscriptions/:id/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(scope): Extension<RequestScope>,
    Path(subscription_id): Path<String>,
    Query(query): Query<TenantQuery>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Transition> {
    require_billing_admin(&principal)?;
    let gateway = scoped(&scope, &query, &state.metrics)?;
    let transition = state
        .subscriptions
        .cancel(&gateway, &subscription_id, request.reason, request.effective_date, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(transition))
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub subscription_id: String,
    pub purpose: PaymentPurpose,
    pub customer_email: Option<String>,
}

/// POST /billing/payments
pub async fn create_payment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(scope): Extension<RequestScope>,
    Query(query): Query<TenantQuery>,
    Json(request): Json<CreatePaymentRequest>,
) -> ApiResult<PaymentSession> {
    require_billing_admin(&principal)?;
    let gateway = scoped(&scope, &query, &state.metrics)?;
    let session = state
        .payments
        .create_subscription_payment(
            &gateway,
            &request.subscription_id,
            request.purpose,
            request.customer_email,
            Utc::now(),
        )
        .await
        .map_err(api_error)?;
    Ok(Json(session))
}

/// GET /billing/invoices/:id/document
pub async fn invoice_document(
    State(state): State<AppState>,
    Extension(scope): Extension<RequestScope>,
    Path(invoice_id): Path<String>,
    Query(query): Query<TenantQuery>,
) -> Result<Response, ApiError> {
    let gateway = scoped(&scope, &query, &state.metrics)?;
    let body = state
        .subscriptions
        .invoices()
        .render(&gateway, &invoice_id)
        .await
        .map_err(api_error)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// POST /admin/tenants
pub async fn create_tenant(
    State(state): State<AppState>,
    Json(request): Json<OnboardTenant>,
) -> ApiResult<Tenant> {
    let tenant = state.tenants.onboard(request).await.map_err(api_error)?;
    Ok(Json(tenant))
}

/// POST /admin/billing/run
pub async fn run_billing(State(state): State<AppState>) -> Json<SweepReport> {
    Json(state.scheduler.run(Utc::now()).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimitExceeded;
    use crate::models::SubscriptionTier;
    use crate::pricing::LimitKey;

    #[test]
    fn usage_limit_maps_to_payment_required_with_detail() {
        let (status, Json(body)) = api_error(CoreError::UsageLimitExceeded(Box::new(LimitExceeded {
            limit: LimitKey::MaxStudents,
            current: 600.0,
            limit_value: 500,
            requested: 1,
            recommended_tier: Some(SubscriptionTier::Standard),
        })));
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body.error.code, "USAGE_LIMIT_EXCEEDED");
        let details = body.error.details.unwrap();
        assert_eq!(details["limit"], "maxStudents");
        assert_eq!(details["recommended_tier"], "STANDARD");
    }

    #[test]
    fn credential_errors_carry_no_detail() {
        let (status, Json(body)) = api_error(CoreError::InvalidCredentials);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.error.details.is_none());
    }

    #[test]
    fn storage_errors_are_masked() {
        let (status, Json(body)) = api_error(CoreError::Config("db password wrong".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error.message, "Internal error");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(&CoreError::InvalidSignature), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&CoreError::GatewayError("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&CoreError::validation("x")), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            status_for(&CoreError::DuplicateActiveSubscription { organization_id: "o".into() }),
            StatusCode::CONFLICT
        );
    }
}
