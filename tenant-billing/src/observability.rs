use anyhow::Result;
use axum_prometheus::PrometheusMetricLayer;
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use prometheus::{Counter, Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Metrics collector for tenant isolation and billing
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub tenant_resolutions_total: Counter,
    pub tenant_resolution_misses_total: Counter,
    pub missing_tenant_context_total: Counter,
    pub auth_attempts_total: Counter,
    pub auth_failures_total: Counter,
    pub billing_operations_total: Counter,
    pub payment_notifications_total: Counter,
    pub payment_notifications_rejected_total: Counter,
    pub usage_blocks_total: Counter,
    pub scheduler_failures_total: Counter,
    pub errors_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let tenant_resolutions_total = Counter::new(
            "tenant_resolutions_total",
            "Total number of tenant resolutions",
        )?;

        let tenant_resolution_misses_total = Counter::new(
            "tenant_resolution_misses_total",
            "Tenant resolutions that matched no active tenant",
        )?;

        let missing_tenant_context_total = Counter::new(
            "missing_tenant_context_total",
            "Tenant-owned operations attempted without a tenant context",
        )?;

        let auth_attempts_total = Counter::new(
            "auth_attempts_total",
            "Total number of login attempts",
        )?;

        let auth_failures_total = Counter::new(
            "auth_failures_total",
            "Login attempts rejected",
        )?;

        let billing_operations_total = Counter::new(
            "billing_operations_total",
            "Total number of billing operations",
        )?;

        let payment_notifications_total = Counter::new(
            "payment_notifications_total",
            "Payment gateway notifications received",
        )?;

        let payment_notifications_rejected_total = Counter::new(
            "payment_notifications_rejected_total",
            "Payment gateway notifications rejected before any state change",
        )?;

        let usage_blocks_total = Counter::new(
            "usage_blocks_total",
            "Operations blocked by a plan limit",
        )?;

        let scheduler_failures_total = Counter::new(
            "scheduler_failures_total",
            "Billing sweep subtasks that failed",
        )?;

        let errors_total = Counter::new("errors_total", "Total number of errors by type")?;

        registry.register(Box::new(tenant_resolutions_total.clone()))?;
        registry.register(Box::new(tenant_resolution_misses_total.clone()))?;
        registry.register(Box::new(missing_tenant_context_total.clone()))?;
        registry.register(Box::new(auth_attempts_total.clone()))?;
        registry.register(Box::new(auth_failures_total.clone()))?;
        registry.register(Box::new(billing_operations_total.clone()))?;
        registry.register(Box::new(payment_notifications_total.clone()))?;
        registry.register(Box::new(payment_notifications_rejected_total.clone()))?;
        registry.register(Box::new(usage_blocks_total.clone()))?;
        registry.register(Box::new(scheduler_failures_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            tenant_resolutions_total,
            tenant_resolution_misses_total,
            missing_tenant_context_total,
            auth_attempts_total,
            auth_failures_total,
            billing_operations_total,
            payment_notifications_total,
            payment_notifications_rejected_total,
            usage_blocks_total,
            scheduler_failures_total,
            errors_total,
        })
    }

    /// Get the Prometheus metrics layer for Axum
    pub fn prometheus_layer(&self) -> PrometheusMetricLayer<'static> {
        PrometheusMetricLayer::new()
    }

    /// Text exposition of the domain counters
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn record_tenant_resolution(&self, method: &str, found: bool) {
        self.tenant_resolutions_total.inc();
        if !found {
            self.tenant_resolution_misses_total.inc();
        }
        tracing::debug!(method = method, found = found, "Tenant resolved");
    }

    pub fn record_missing_tenant_context(&self, operation: &str) {
        self.missing_tenant_context_total.inc();
        tracing::warn!(operation = operation, "Tenant context missing");
    }

    /// Record authentication attempt
    pub fn record_auth_attempt(&self, success: bool) {
        self.auth_attempts_total.inc();
        if !success {
            self.auth_failures_total.inc();
        }
        tracing::info!(success = success, "Authentication attempt");
    }

    /// Record billing operation
    pub fn record_billing_operation(&self, operation: &str, tenant_id: &str) {
        self.billing_operations_total.inc();
        tracing::info!(
            operation = operation,
            tenant_id = tenant_id,
            "Billing operation completed"
        );
    }

    pub fn record_payment_notification(&self, accepted: bool, status: &str) {
        self.payment_notifications_total.inc();
        if !accepted {
            self.payment_notifications_rejected_total.inc();
        }
        tracing::info!(accepted = accepted, status = status, "Payment notification handled");
    }

    pub fn record_usage_block(&self, limit: &str, tenant_id: &str) {
        self.usage_blocks_total.inc();
        tracing::warn!(limit = limit, tenant_id = tenant_id, "Operation blocked by plan limit");
    }

    pub fn record_scheduler_failure(&self, task: &str, tenant_id: &str) {
        self.scheduler_failures_total.inc();
        tracing::error!(task = task, tenant_id = tenant_id, "Billing sweep task failed");
    }

    /// Record error
    pub fn record_error(&self, error_type: &str, context: &str) {
        self.errors_total.inc();
        tracing::error!(
            error_type = error_type,
            context = context,
            "Error occurred"
        );
    }
}

/// Initialize tracing, metrics and structured logging
pub async fn init_observability(config: &Config) -> Result<Metrics> {
    let metrics = Metrics::new()?;

    // Create a resource that identifies this service
    let resource = Resource::new(vec![
        opentelemetry::KeyValue::new("service.name", config.observability.service_name.clone()),
        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_current_span(true)
            .with_span_list(true),
    );

    // Add OpenTelemetry tracing if endpoint is configured
    if let Some(endpoint) = &config.observability.tracing_endpoint {
        info!(
            "Initializing OpenTelemetry tracing with endpoint: {}",
            endpoint
        );

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource))
            .install_batch(runtime::Tokio)?;

        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        subscriber.with(telemetry_layer).try_init()?;
    } else {
        warn!("OpenTelemetry endpoint not configured, using local logging only");
        subscriber.try_init()?;
    }

    info!("Observability initialized");
    Ok(metrics)
}

/// Shutdown tracing gracefully
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exposed() {
        let metrics = Metrics::new().unwrap();
        metrics.record_auth_attempt(false);
        metrics.record_usage_block("maxStudents", "t1");
        let text = metrics.render().unwrap();
        assert!(text.contains("auth_attempts_total 1"));
        assert!(text.contains("auth_failures_total 1"));
        assert!(text.contains("usage_blocks_total 1"));
    }
}
