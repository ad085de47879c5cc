//! Daily billing sweep.
//!
//! One job per tenant goes onto a channel and a fixed pool of workers drains it.
//! Inside a job the tenant's sub-tasks run one after another; a failing sub-task
//! is recorded in the report and the next one still runs.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, instrument, warn};

use crate::billing_events;
use crate::config::BillingConfig;
use crate::error::Result;
use crate::gateway::{CrossTenantGateway, TenantGateway};
use crate::models::{
    NotificationType, PaymentPurpose, PaymentTransaction, Subscription, SubscriptionStatus,
};
use crate::notifications::{self, Notifier};
use crate::observability::Metrics;
use crate::payment::PaymentService;
use crate::store::{EntityKind, Filter, FindOptions};
use crate::subscription::SubscriptionService;
use crate::usage::{Severity, UsageMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepTask {
    RenewalReminders,
    AutoRenew,
    GracePeriod,
    TrialExpiry,
    UsageWarnings,
    OverdueInvoices,
    Retention,
    /// Finding the tenants to sweep
    ListTenants,
    /// A sweep worker that died before reporting
    Worker,
}

impl SweepTask {
    /// Per-tenant sub-tasks, in execution order
    pub const PER_TENANT: [SweepTask; 6] = [
        SweepTask::RenewalReminders,
        SweepTask::AutoRenew,
        SweepTask::GracePeriod,
        SweepTask::TrialExpiry,
        SweepTask::UsageWarnings,
        SweepTask::OverdueInvoices,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SweepTask::RenewalReminders => "renewal_reminders",
            SweepTask::AutoRenew => "auto_renew",
            SweepTask::GracePeriod => "grace_period",
            SweepTask::TrialExpiry => "trial_expiry",
            SweepTask::UsageWarnings => "usage_warnings",
            SweepTask::OverdueInvoices => "overdue_invoices",
            SweepTask::Retention => "retention",
            SweepTask::ListTenants => "list_tenants",
            SweepTask::Worker => "worker",
        }
    }
}

impl fmt::Display for SweepTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    /// `None` for platform-wide tasks
    pub tenant_id: Option<String>,
    pub task: SweepTask,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub tenants: usize,
    pub failures: Vec<TaskFailure>,
    pub purged_events: u64,
    pub purged_notifications: u64,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

fn day(at: DateTime<Utc>) -> NaiveDate {
    at.date_naive()
}

/// Threshold whose window `[t, t + width)` contains `percentage`
fn warning_threshold(thresholds: &[f64], width: f64, percentage: f64) -> Option<f64> {
    thresholds
        .iter()
        .copied()
        .find(|t| percentage >= *t && percentage < t + width)
}

#[derive(Clone)]
pub struct BillingScheduler {
    admin: CrossTenantGateway,
    subscriptions: SubscriptionService,
    payments: PaymentService,
    usage: UsageMonitor,
    notifier: Notifier,
    metrics: Metrics,
    config: BillingConfig,
}

impl BillingScheduler {
    pub fn new(
        admin: CrossTenantGateway,
        subscriptions: SubscriptionService,
        payments: PaymentService,
        usage: UsageMonitor,
        notifier: Notifier,
        metrics: Metrics,
        config: BillingConfig,
    ) -> Self {
        Self {
            admin,
            subscriptions,
            payments,
            usage,
            notifier,
            metrics,
            config,
        }
    }

    /// Tenants with anything for the sweep to look at
    async fn tenants(&self) -> Result<Vec<String>> {
        let mut statuses: Vec<&str> = SubscriptionStatus::LIVE.iter().map(|s| s.as_str()).collect();
        statuses.push(SubscriptionStatus::Suspended.as_str());
        self.admin
            .distinct_owners(EntityKind::Subscription, &Filter::one_of("status", statuses))
            .await
    }

    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            started_at: now,
            tenants: 0,
            failures: Vec::new(),
            purged_events: 0,
            purged_notifications: 0,
        };

        match self.tenants().await {
            Ok(tenants) => {
                report.tenants = tenants.len();
                report.failures.extend(self.fan_out(tenants, now).await);
            }
            Err(e) => {
                error!(error = %e, "Could not list tenants for billing sweep");
                self.metrics.record_scheduler_failure(SweepTask::ListTenants.as_str(), "-");
                report.failures.push(TaskFailure {
                    tenant_id: None,
                    task: SweepTask::ListTenants,
                    error: e.to_string(),
                });
            }
        }

        self.retention(now, &mut report).await;

        info!(
            tenants = report.tenants,
            failures = report.failures.len(),
            purged_events = report.purged_events,
            purged_notifications = report.purged_notifications,
            "Billing sweep finished"
        );
        report
    }

    async fn fan_out(&self, tenants: Vec<String>, now: DateTime<Utc>) -> Vec<TaskFailure> {
        let workers = self.config.scheduler_workers.max(1);
        let (tx, rx) = mpsc::channel::<String>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let rx = rx.clone();
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                let mut failures = Vec::new();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(tenant_id) = next else { break };
                    failures.extend(scheduler.process_tenant(&tenant_id, now).await);
                }
                tracing::debug!(worker = worker, "Sweep worker drained");
                failures
            }));
        }

        for tenant_id in tenants {
            if tx.send(tenant_id).await.is_err() {
                error!("All sweep workers stopped early");
                break;
            }
        }
        drop(tx);

        let mut failures = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(worker_failures) => failures.extend(worker_failures),
                Err(e) => {
                    error!(error = %e, "Sweep worker panicked");
                    self.metrics.record_scheduler_failure(SweepTask::Worker.as_str(), "-");
                    failures.push(TaskFailure {
                        tenant_id: None,
                        task: SweepTask::Worker,
                        error: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    /// Runs every per-tenant sub-task, collecting failures
    pub async fn process_tenant(&self, tenant_id: &str, now: DateTime<Utc>) -> Vec<TaskFailure> {
        let gateway = self.admin.for_tenant(tenant_id);
        let mut failures = Vec::new();
        for task in SweepTask::PER_TENANT {
            if let Err(e) = self.run_task(task, &gateway, now).await {
                self.metrics.record_scheduler_failure(task.as_str(), tenant_id);
                warn!(tenant_id = tenant_id, task = %task, error = %e, "Sweep sub-task failed");
                failures.push(TaskFailure {
                    tenant_id: Some(tenant_id.to_string()),
                    task,
                    error: e.to_string(),
                });
            }
        }
        failures
    }

    async fn run_task(&self, task: SweepTask, gateway: &TenantGateway, now: DateTime<Utc>) -> Result<()> {
        match task {
            SweepTask::RenewalReminders => self.renewal_reminders(gateway, now).await,
            SweepTask::AutoRenew => self.auto_renew(gateway, now).await,
            SweepTask::GracePeriod => self.grace_period(gateway, now).await,
            SweepTask::TrialExpiry => self.trial_expiry(gateway, now).await,
            SweepTask::UsageWarnings => self.usage_warnings(gateway, now).await,
            SweepTask::OverdueInvoices => self.payments.process_overdue_invoices(gateway, now).await.map(|_| ()),
            SweepTask::Retention | SweepTask::ListTenants | SweepTask::Worker => Ok(()),
        }
    }

    async fn with_status(&self, gateway: &TenantGateway, status: SubscriptionStatus) -> Result<Vec<Subscription>> {
        self.subscriptions.list_by_status(gateway, status).await
    }

    async fn renewal_reminders(&self, gateway: &TenantGateway, now: DateTime<Utc>) -> Result<()> {
        for sub in self.with_status(gateway, SubscriptionStatus::Active).await? {
            let Some(next_billing) = sub.next_billing_date else { continue };
            let Some(days) = self
                .config
                .reminder_days
                .iter()
                .copied()
                .find(|d| day(next_billing) == day(now + Duration::days(*d)))
            else {
                continue;
            };
            self.notifier
                .notify_tenant_admins(
                    gateway,
                    "Subscription renewal reminder",
                    &format!(
                        "Your {} subscription renews in {} day(s) on {} for {} {}.",
                        sub.tier.as_str(),
                        days,
                        next_billing.format("%Y-%m-%d"),
                        sub.currency,
                        sub.price
                    ),
                    NotificationType::BillingAlert,
                    json!({"subscription_id": sub.id, "days_until_renewal": days}),
                )
                .await;
        }
        Ok(())
    }

    async fn has_pending_renewal(&self, gateway: &TenantGateway, sub: &Subscription) -> Result<bool> {
        let filter = Filter::eq("subscription_id", sub.id.as_str())
            .and(Filter::eq("status", "PENDING"))
            .and(Filter::gte("created_at", sub.current_period_start));
        let pending: Vec<PaymentTransaction> = gateway.find_many(&filter, &FindOptions::default()).await?;
        Ok(pending.iter().any(|t| t.purpose == PaymentPurpose::Renewal))
    }

    /// Charges subscriptions due today; anything still ACTIVE past its end date
    /// afterwards is moved into the grace period
    async fn auto_renew(&self, gateway: &TenantGateway, now: DateTime<Utc>) -> Result<()> {
        for sub in self.with_status(gateway, SubscriptionStatus::Active).await? {
            let due = sub
                .next_billing_date
                .is_some_and(|next| day(next) <= day(now));
            if !due {
                continue;
            }

            if sub.auto_renew && !self.has_pending_renewal(gateway, &sub).await? {
                if sub.price.is_zero() {
                    self.subscriptions.renew(gateway, &sub.id, None, now).await?;
                    continue;
                }
                match self
                    .payments
                    .create_subscription_payment(gateway, &sub.id, PaymentPurpose::Renewal, None, now)
                    .await
                {
                    Ok(session) => {
                        info!(subscription_id = %sub.id, order_id = %session.transaction.order_id, "Renewal charge created");
                    }
                    Err(e) => {
                        warn!(subscription_id = %sub.id, error = %e, "Automatic renewal charge failed");
                    }
                }
            }

            if sub.end_date <= now {
                self.subscriptions.handle_expired(gateway, &sub.id, now).await?;
            }
        }
        Ok(())
    }

    async fn grace_period(&self, gateway: &TenantGateway, now: DateTime<Utc>) -> Result<()> {
        for sub in self.with_status(gateway, SubscriptionStatus::GracePeriod).await? {
            let Some(grace_end) = sub.grace_period_end_date else { continue };
            if grace_end <= now {
                self.subscriptions.suspend(gateway, &sub.id, now).await?;
                continue;
            }
            if let Some(days) = self
                .config
                .grace_warning_days
                .iter()
                .copied()
                .find(|d| day(grace_end) == day(now + Duration::days(*d)))
            {
                self.notifier
                    .notify_tenant_admins(
                        gateway,
                        "Subscription suspension warning",
                        &format!(
                            "Your subscription will be suspended in {} day(s) unless payment is received.",
                            days
                        ),
                        NotificationType::BillingCritical,
                        json!({"subscription_id": sub.id, "grace_period_end_date": grace_end}),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn trial_expiry(&self, gateway: &TenantGateway, now: DateTime<Utc>) -> Result<()> {
        for sub in self.with_status(gateway, SubscriptionStatus::Trial).await? {
            let trial_end = sub.trial_end_date.unwrap_or(sub.end_date);
            if trial_end <= now {
                self.subscriptions.handle_expired(gateway, &sub.id, now).await?;
            } else if day(trial_end) == day(now + Duration::days(self.config.trial_warning_days)) {
                self.notifier
                    .notify_tenant_admins(
                        gateway,
                        "Trial ending soon",
                        &format!("Your trial ends on {}. Choose a plan to continue.", trial_end.format("%Y-%m-%d")),
                        NotificationType::BillingAlert,
                        json!({"subscription_id": sub.id, "trial_end_date": trial_end}),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn usage_warnings(&self, gateway: &TenantGateway, now: DateTime<Utc>) -> Result<()> {
        let check = self.usage.check_limits(gateway, now).await?;
        for warning in &check.warnings {
            let Some(threshold) = warning_threshold(
                &self.config.usage_warning_thresholds,
                self.config.usage_warning_window,
                warning.percentage,
            ) else {
                continue;
            };
            let notification_type = if warning.severity == Severity::Critical {
                NotificationType::UsageCritical
            } else {
                NotificationType::UsageWarning
            };
            self.notifier
                .notify_tenant_admins(
                    gateway,
                    "Usage limit approaching",
                    &warning.message,
                    notification_type,
                    json!({
                        "limit": warning.limit,
                        "current": warning.current,
                        "limit_value": warning.limit_value,
                        "percentage": warning.percentage,
                        "threshold": threshold,
                    }),
                )
                .await;
        }
        Ok(())
    }

    async fn retention(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let months = self.config.retention_months;
        match billing_events::purge_older_than(&self.admin, now, months).await {
            Ok(n) => report.purged_events = n,
            Err(e) => {
                self.metrics.record_scheduler_failure(SweepTask::Retention.as_str(), "-");
                report.failures.push(TaskFailure {
                    tenant_id: None,
                    task: SweepTask::Retention,
                    error: e.to_string(),
                });
            }
        }
        match notifications::purge_read_notifications(&self.admin, now, months).await {
            Ok(n) => report.purged_notifications = n,
            Err(e) => {
                self.metrics.record_scheduler_failure(SweepTask::Retention.as_str(), "-");
                report.failures.push(TaskFailure {
                    tenant_id: None,
                    task: SweepTask::Retention,
                    error: e.to_string(),
                });
            }
        }
    }
}
