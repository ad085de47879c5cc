use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::api::{
    cancel_subscription, change_subscription, create_payment, create_subscription, create_tenant,
    create_user, health_check, invoice_document, list_plans, login, metrics, payment_notification,
    run_billing, tenant_context, usage, AppState,
};
use crate::auth::{bearer_auth_middleware, require_platform_role};
use crate::tenant::{tenant_context_middleware, TenantContextState};

/// Create the main application router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let auth_service = state.auth.clone();
    let tenant_state = TenantContextState {
        tenants: state.tenants.clone(),
        metrics: state.metrics.clone(),
    };

    // Platform operators only
    let admin = Router::new()
        .route("/admin/tenants", post(create_tenant))
        .route("/admin/billing/run", post(run_billing))
        .route_layer(middleware::from_fn(require_platform_role));

    let authenticated = Router::new()
        .route("/users", post(create_user))
        .route("/billing/usage", get(usage))
        .route("/billing/subscriptions", post(create_subscription))
        .route("/billing/subscriptions/:id/change", post(change_subscription))
        .route("/billing/subscriptions/:id/cancel", post(cancel_subscription))
        .route("/billing/payments", post(create_payment))
        .route("/billing/invoices/:id/document", get(invoice_document))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(
            auth_service,
            bearer_auth_middleware,
        ));

    Router::new()
        // Public endpoints (no authentication required)
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/auth/login", post(login))
        .route("/tenant/context", get(tenant_context))
        .route("/billing/plans", get(list_plans))
        .route("/billing/notifications", post(payment_notification))
        .merge(authenticated)
        // Tenant resolution runs before authentication
        .layer(middleware::from_fn_with_state(
            tenant_state,
            tenant_context_middleware,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .layer(state.metrics.prometheus_layer())
        .with_state(state)
}
