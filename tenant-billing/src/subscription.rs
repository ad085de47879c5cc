//! Subscription lifecycle.
//!
//! Every write is a compare-and-swap on `(id, version)`: two racing mutations of
//! the same subscription cannot both succeed, the loser gets `Conflict`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::billing_events;
use crate::config::BillingConfig;
use crate::error::{CoreError, Result};
use crate::gateway::TenantGateway;
use crate::invoice::{CreateInvoice, InvoiceService};
use crate::models::{
    BillingCycle, BillingEventType, Invoice, InvoiceItem, InvoiceKind, NotificationType,
    Subscription, SubscriptionStatus, SubscriptionTier,
};
use crate::notifications::Notifier;
use crate::observability::Metrics;
use crate::pricing;
use crate::store::{Filter, FindOptions, Patch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProrationOption {
    /// New period starts at the effective date; the difference is invoiced now
    Immediate,
    /// Only tier and price change; period bounds move at the next renewal
    EndOfCycle,
    /// Like `Immediate`, but the difference was already paid
    Prepaid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscription {
    pub tier: SubscriptionTier,
    pub billing_cycle: BillingCycle,
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
    pub start_date: Option<DateTime<Utc>>,
}

fn default_auto_renew() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeSubscription {
    pub tier: SubscriptionTier,
    pub billing_cycle: Option<BillingCycle>,
    pub effective_date: Option<DateTime<Utc>>,
    pub proration: ProrationOption,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeOutcome {
    pub subscription: Subscription,
    pub proration_amount: Decimal,
    pub invoice: Option<Invoice>,
}

/// Whether a lifecycle operation moved the subscription
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "subscription", rename_all = "snake_case")]
pub enum Transition {
    Applied(Subscription),
    Unchanged(Subscription),
}

impl Transition {
    pub fn subscription(&self) -> &Subscription {
        match self {
            Transition::Applied(s) | Transition::Unchanged(s) => s,
        }
    }

    pub fn into_subscription(self) -> Subscription {
        match self {
            Transition::Applied(s) | Transition::Unchanged(s) => s,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RenewOutcome {
    Renewed {
        subscription: Subscription,
        invoice: Option<Invoice>,
    },
    /// The target period was already paid for
    AlreadyRenewed { subscription: Subscription },
}

impl RenewOutcome {
    pub fn subscription(&self) -> &Subscription {
        match self {
            RenewOutcome::Renewed { subscription, .. } | RenewOutcome::AlreadyRenewed { subscription } => subscription,
        }
    }
}

fn plan_item(tier: SubscriptionTier, cycle: BillingCycle, price: Decimal, label: &str) -> InvoiceItem {
    let cycle_name = match cycle {
        BillingCycle::Monthly => "monthly",
        BillingCycle::Yearly => "yearly",
    };
    InvoiceItem::new(format!("{} {} plan ({label})", tier.as_str(), cycle_name), 1, price)
}

#[derive(Clone)]
pub struct SubscriptionService {
    invoices: InvoiceService,
    notifier: Notifier,
    metrics: Metrics,
    grace_period_days: i64,
    currency: String,
}

impl SubscriptionService {
    pub fn new(invoices: InvoiceService, notifier: Notifier, metrics: Metrics, config: &BillingConfig) -> Self {
        Self {
            invoices,
            notifier,
            metrics,
            grace_period_days: config.grace_period_days,
            currency: config.currency.clone(),
        }
    }

    pub fn invoices(&self) -> &InvoiceService {
        &self.invoices
    }

    pub async fn get(&self, gateway: &TenantGateway, subscription_id: &str) -> Result<Subscription> {
        gateway.get::<Subscription>(subscription_id).await
    }

    /// The tenant's ACTIVE, TRIAL or GRACE_PERIOD subscription
    pub async fn current(&self, gateway: &TenantGateway) -> Result<Option<Subscription>> {
        let live = Filter::one_of("status", SubscriptionStatus::LIVE.iter().map(|s| s.as_str()));
        let found = gateway
            .find_many::<Subscription>(&live, &FindOptions::newest_first("created_at").limit(1))
            .await?;
        Ok(found.into_iter().next())
    }

    /// Writes `next` if the stored version is still `next.version`, bumping it
    async fn commit(&self, gateway: &TenantGateway, mut next: Subscription, now: DateTime<Utc>) -> Result<Subscription> {
        let expected = next.version;
        next.version += 1;
        next.updated_at = now;
        let guard = Filter::eq("id", next.id.as_str()).and(Filter::eq("version", expected));
        let updated = gateway
            .update_many::<Subscription>(&guard, &Patch::from_entity(&next)?)
            .await
            .map_err(|e| match e {
                CoreError::Conflict(_) if next.status.is_live() => CoreError::DuplicateActiveSubscription {
                    organization_id: gateway.tenant_id().to_string(),
                },
                other => other,
            })?;
        if updated == 0 {
            warn!(
                tenant_id = gateway.tenant_id(),
                subscription_id = %next.id,
                expected_version = expected,
                "Subscription modified concurrently"
            );
            return Err(CoreError::Conflict(format!(
                "subscription {} was modified concurrently",
                next.id
            )));
        }
        Ok(next)
    }

    fn check_transition(current: &Subscription, to: SubscriptionStatus) -> Result<()> {
        if current.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: current.status,
                to,
            })
        }
    }

    #[instrument(skip(self, gateway, request), fields(tenant_id = gateway.tenant_id(), tier = request.tier.as_str()))]
    pub async fn create(&self, gateway: &TenantGateway, request: CreateSubscription, now: DateTime<Utc>) -> Result<Subscription> {
        let duplicate = || CoreError::DuplicateActiveSubscription {
            organization_id: gateway.tenant_id().to_string(),
        };
        if self.current(gateway).await?.is_some() {
            return Err(duplicate());
        }

        let plan = pricing::get_plan(request.tier, request.billing_cycle, &self.currency);
        let start = request.start_date.unwrap_or(now);
        let end = request.billing_cycle.advance(start);
        let is_trial = request.tier == SubscriptionTier::Trial;
        let trial_end_date = plan
            .trial_days
            .filter(|_| is_trial)
            .map(|days| start + Duration::days(i64::from(days)));

        let subscription = Subscription {
            id: Uuid::new_v4().to_string(),
            organization_id: gateway.tenant_id().to_string(),
            tier: request.tier,
            status: if is_trial {
                SubscriptionStatus::Trial
            } else {
                SubscriptionStatus::Active
            },
            billing_cycle: request.billing_cycle,
            price: plan.price,
            currency: self.currency.clone(),
            start_date: start,
            end_date: end,
            current_period_start: start,
            current_period_end: end,
            trial_end_date,
            grace_period_end_date: None,
            auto_renew: request.auto_renew && !is_trial,
            next_billing_date: Some(trial_end_date.unwrap_or(end)),
            last_payment_date: None,
            last_payment_transaction_id: None,
            cancelled_at: None,
            cancel_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        // the store's partial unique key closes the check-then-insert window
        gateway.create(&subscription).await.map_err(|e| match e {
            CoreError::Conflict(_) => duplicate(),
            other => other,
        })?;

        billing_events::record(
            gateway,
            BillingEventType::SubscriptionCreated,
            Some(&subscription.id),
            json!({
                "tier": subscription.tier,
                "billing_cycle": subscription.billing_cycle,
                "price": subscription.price,
            }),
        )
        .await;
        if is_trial {
            billing_events::record(
                gateway,
                BillingEventType::TrialStarted,
                Some(&subscription.id),
                json!({"trial_end_date": subscription.trial_end_date}),
            )
            .await;
        }
        self.metrics.record_billing_operation("subscription_created", gateway.tenant_id());
        info!(subscription_id = %subscription.id, status = subscription.status.as_str(), "Subscription created");
        Ok(subscription)
    }

    #[instrument(skip(self, gateway, request), fields(tenant_id = gateway.tenant_id(), subscription_id = subscription_id))]
    pub async fn change(
        &self,
        gateway: &TenantGateway,
        subscription_id: &str,
        request: ChangeSubscription,
        now: DateTime<Utc>,
    ) -> Result<ChangeOutcome> {
        let current = self.get(gateway, subscription_id).await?;
        self.apply_change(gateway, current, request, None, now).await
    }

    /// Applies an upgrade that was paid through the gateway. Keyed on the
    /// payment transaction, so a repeated settlement changes nothing.
    #[instrument(skip(self, gateway), fields(tenant_id = gateway.tenant_id()))]
    pub async fn settle_upgrade(
        &self,
        gateway: &TenantGateway,
        subscription_id: &str,
        tier: SubscriptionTier,
        billing_cycle: BillingCycle,
        payment_transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let current = self.get(gateway, subscription_id).await?;
        if current.last_payment_transaction_id.as_deref() == Some(payment_transaction_id) {
            return Ok(Transition::Unchanged(current));
        }
        if current.status == SubscriptionStatus::Active && current.tier == tier && current.billing_cycle == billing_cycle {
            info!(subscription_id = subscription_id, "Subscription already on the paid plan");
            return Ok(Transition::Unchanged(current));
        }
        let request = ChangeSubscription {
            tier,
            billing_cycle: Some(billing_cycle),
            effective_date: Some(now),
            proration: ProrationOption::Prepaid,
        };
        let outcome = self
            .apply_change(gateway, current, request, Some(payment_transaction_id), now)
            .await?;
        Ok(Transition::Applied(outcome.subscription))
    }

    async fn apply_change(
        &self,
        gateway: &TenantGateway,
        current: Subscription,
        request: ChangeSubscription,
        payment_transaction_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ChangeOutcome> {
        if !matches!(current.status, SubscriptionStatus::Active | SubscriptionStatus::Trial) {
            return Err(CoreError::InvalidTransition {
                from: current.status,
                to: SubscriptionStatus::Active,
            });
        }
        let new_cycle = request.billing_cycle.unwrap_or(current.billing_cycle);
        if request.tier == SubscriptionTier::Trial && current.tier != SubscriptionTier::Trial {
            return Err(CoreError::validation("cannot change a paid subscription back to TRIAL"));
        }

        let old_plan = pricing::get_plan(current.tier, current.billing_cycle, &self.currency);
        let new_plan = pricing::get_plan(request.tier, new_cycle, &self.currency);
        let effective = request.effective_date.unwrap_or(now);

        let mut next = current.clone();
        next.tier = request.tier;
        next.billing_cycle = new_cycle;
        next.price = new_plan.price;

        let proration_amount = match request.proration {
            ProrationOption::EndOfCycle => Decimal::ZERO,
            ProrationOption::Immediate | ProrationOption::Prepaid => {
                let total_days = (current.current_period_end - current.current_period_start).num_days().max(0);
                let days_remaining = (current.current_period_end - effective).num_days().clamp(0, total_days);
                let amount = pricing::proration(&old_plan, &new_plan, days_remaining as u32, total_days as u32);

                let end = new_cycle.advance(effective);
                next.current_period_start = effective;
                next.current_period_end = end;
                next.end_date = end;
                next.next_billing_date = Some(end);
                if next.tier != SubscriptionTier::Trial {
                    next.status = SubscriptionStatus::Active;
                    next.trial_end_date = None;
                    next.auto_renew = true;
                }
                amount
            }
        };
        if let Some(txn) = payment_transaction_id {
            next.last_payment_transaction_id = Some(txn.to_string());
            next.last_payment_date = Some(now);
        }

        let next = self.commit(gateway, next, now).await?;

        let invoice = if request.proration == ProrationOption::Immediate && proration_amount > Decimal::ZERO {
            let invoice = self
                .invoices
                .create(
                    gateway,
                    CreateInvoice {
                        subscription_id: next.id.clone(),
                        kind: InvoiceKind::Proration,
                        items: vec![plan_item(
                            next.tier,
                            next.billing_cycle,
                            proration_amount,
                            &format!("prorated from {}", current.tier.as_str()),
                        )],
                        discount_percent: Decimal::ZERO,
                        due_date: None,
                        notes: None,
                    },
                    now,
                )
                .await?;
            Some(invoice)
        } else {
            None
        };

        billing_events::record(
            gateway,
            BillingEventType::SubscriptionChanged,
            Some(&next.id),
            json!({
                "old_tier": current.tier,
                "new_tier": next.tier,
                "old_price": current.price,
                "new_price": next.price,
                "old_billing_cycle": current.billing_cycle,
                "new_billing_cycle": next.billing_cycle,
                "proration": request.proration,
                "proration_amount": proration_amount,
            }),
        )
        .await;
        self.metrics.record_billing_operation("subscription_changed", gateway.tenant_id());
        info!(
            old_tier = current.tier.as_str(),
            new_tier = next.tier.as_str(),
            proration_amount = %proration_amount,
            "Subscription changed"
        );

        Ok(ChangeOutcome {
            subscription: next,
            proration_amount,
            invoice,
        })
    }

    /// Access until `end_date` is left to callers
    #[instrument(skip(self, gateway, reason), fields(tenant_id = gateway.tenant_id(), subscription_id = subscription_id))]
    pub async fn cancel(
        &self,
        gateway: &TenantGateway,
        subscription_id: &str,
        reason: Option<String>,
        effective_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let current = self.get(gateway, subscription_id).await?;
        if current.status == SubscriptionStatus::Cancelled {
            return Ok(Transition::Unchanged(current));
        }
        Self::check_transition(&current, SubscriptionStatus::Cancelled)?;

        let mut next = current.clone();
        next.status = SubscriptionStatus::Cancelled;
        next.auto_renew = false;
        next.next_billing_date = None;
        next.cancelled_at = Some(effective_date.unwrap_or(now));
        next.cancel_reason = reason;
        let next = self.commit(gateway, next, now).await?;

        billing_events::record(
            gateway,
            BillingEventType::SubscriptionCancelled,
            Some(&next.id),
            json!({
                "previous_status": current.status,
                "reason": next.cancel_reason,
                "cancelled_at": next.cancelled_at,
            }),
        )
        .await;
        self.metrics.record_billing_operation("subscription_cancelled", gateway.tenant_id());
        info!("Subscription cancelled");
        Ok(Transition::Applied(next))
    }

    /// Advances one billing cycle from the old `end_date`.
    ///
    /// Safe to call repeatedly: a repeated transaction id, or a period that is
    /// already paid beyond one cycle from `now`, is reported as `AlreadyRenewed`.
    #[instrument(skip(self, gateway), fields(tenant_id = gateway.tenant_id()))]
    pub async fn renew(
        &self,
        gateway: &TenantGateway,
        subscription_id: &str,
        payment_transaction_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RenewOutcome> {
        let current = self.get(gateway, subscription_id).await?;

        let same_payment = payment_transaction_id.is_some()
            && current.last_payment_transaction_id.as_deref() == payment_transaction_id;
        let already_ahead = current.end_date > current.billing_cycle.advance(now);
        if same_payment || already_ahead {
            info!(subscription_id = subscription_id, "Renewal already applied for this period");
            return Ok(RenewOutcome::AlreadyRenewed { subscription: current });
        }
        Self::check_transition(&current, SubscriptionStatus::Active)?;
        if current.tier == SubscriptionTier::Trial {
            return Err(CoreError::validation("a TRIAL subscription is activated, not renewed"));
        }

        let new_start = current.end_date;
        let new_end = current.billing_cycle.advance(new_start);
        let mut next = current.clone();
        next.status = SubscriptionStatus::Active;
        next.current_period_start = new_start;
        next.current_period_end = new_end;
        next.end_date = new_end;
        next.next_billing_date = Some(new_end);
        next.grace_period_end_date = None;
        next.price = pricing::price(current.tier, current.billing_cycle);
        if let Some(txn) = payment_transaction_id {
            next.last_payment_transaction_id = Some(txn.to_string());
            next.last_payment_date = Some(now);
        }
        let next = self.commit(gateway, next, now).await?;

        // a renewal paid through the gateway already has its invoice
        let invoice = if payment_transaction_id.is_none() && next.price > Decimal::ZERO {
            Some(
                self.invoices
                    .create(
                        gateway,
                        CreateInvoice {
                            subscription_id: next.id.clone(),
                            kind: InvoiceKind::Renewal,
                            items: vec![plan_item(next.tier, next.billing_cycle, next.price, "renewal")],
                            discount_percent: Decimal::ZERO,
                            due_date: None,
                            notes: None,
                        },
                        now,
                    )
                    .await?,
            )
        } else {
            None
        };

        billing_events::record(
            gateway,
            BillingEventType::SubscriptionRenewed,
            Some(&next.id),
            json!({
                "previous_end_date": current.end_date,
                "current_period_start": next.current_period_start,
                "current_period_end": next.current_period_end,
                "payment_transaction_id": payment_transaction_id,
            }),
        )
        .await;
        self.metrics.record_billing_operation("subscription_renewed", gateway.tenant_id());
        info!(subscription_id = subscription_id, period_end = %next.current_period_end, "Subscription renewed");
        Ok(RenewOutcome::Renewed {
            subscription: next,
            invoice,
        })
    }

    /// First paid activation: TRIAL or GRACE_PERIOD becomes ACTIVE on the paid plan
    #[instrument(skip(self, gateway), fields(tenant_id = gateway.tenant_id()))]
    pub async fn activate(
        &self,
        gateway: &TenantGateway,
        subscription_id: &str,
        tier: SubscriptionTier,
        billing_cycle: BillingCycle,
        payment_transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let current = self.get(gateway, subscription_id).await?;
        if current.last_payment_transaction_id.as_deref() == Some(payment_transaction_id) {
            return Ok(Transition::Unchanged(current));
        }
        if current.status == SubscriptionStatus::Active && current.tier == tier {
            return Ok(Transition::Unchanged(current));
        }
        Self::check_transition(&current, SubscriptionStatus::Active)?;

        let end = billing_cycle.advance(now);
        let mut next = current.clone();
        next.status = SubscriptionStatus::Active;
        next.tier = tier;
        next.billing_cycle = billing_cycle;
        next.price = pricing::price(tier, billing_cycle);
        next.current_period_start = now;
        next.current_period_end = end;
        next.end_date = end;
        next.next_billing_date = Some(end);
        next.trial_end_date = None;
        next.grace_period_end_date = None;
        next.auto_renew = true;
        next.last_payment_transaction_id = Some(payment_transaction_id.to_string());
        next.last_payment_date = Some(now);
        let next = self.commit(gateway, next, now).await?;

        billing_events::record(
            gateway,
            BillingEventType::SubscriptionActivated,
            Some(&next.id),
            json!({
                "previous_status": current.status,
                "tier": next.tier,
                "billing_cycle": next.billing_cycle,
                "payment_transaction_id": payment_transaction_id,
            }),
        )
        .await;
        self.notifier
            .notify_tenant_admins(
                gateway,
                "Subscription active",
                &format!("Your {} subscription is now active.", next.tier.as_str()),
                NotificationType::BillingSuccess,
                json!({"subscription_id": next.id}),
            )
            .await;
        self.metrics.record_billing_operation("subscription_activated", gateway.tenant_id());
        Ok(Transition::Applied(next))
    }

    /// Missed renewal: ACTIVE enters the grace period, an ended TRIAL expires.
    /// Anything else is left alone, so repeated sweeps are harmless.
    #[instrument(skip(self, gateway), fields(tenant_id = gateway.tenant_id()))]
    pub async fn handle_expired(&self, gateway: &TenantGateway, subscription_id: &str, now: DateTime<Utc>) -> Result<Transition> {
        let current = self.get(gateway, subscription_id).await?;
        match current.status {
            SubscriptionStatus::Active if current.end_date <= now => {
                let grace_end = current.end_date + Duration::days(self.grace_period_days);
                let mut next = current.clone();
                next.status = SubscriptionStatus::GracePeriod;
                next.grace_period_end_date = Some(grace_end);
                let next = self.commit(gateway, next, now).await?;

                billing_events::record(
                    gateway,
                    BillingEventType::GracePeriodStarted,
                    Some(&next.id),
                    json!({"end_date": next.end_date, "grace_period_end_date": grace_end}),
                )
                .await;
                self.notifier
                    .notify_tenant_admins(
                        gateway,
                        "Subscription payment overdue",
                        &format!(
                            "Your subscription has expired. Service continues until {} while payment is pending.",
                            grace_end.format("%Y-%m-%d")
                        ),
                        NotificationType::BillingCritical,
                        json!({"subscription_id": next.id, "grace_period_end_date": grace_end}),
                    )
                    .await;
                warn!(subscription_id = subscription_id, grace_end = %grace_end, "Subscription entered grace period");
                Ok(Transition::Applied(next))
            }
            SubscriptionStatus::Trial if current.trial_end_date.map_or(current.end_date <= now, |t| t <= now) => {
                let mut next = current.clone();
                next.status = SubscriptionStatus::Expired;
                next.next_billing_date = None;
                next.auto_renew = false;
                let next = self.commit(gateway, next, now).await?;

                billing_events::record(
                    gateway,
                    BillingEventType::TrialExpired,
                    Some(&next.id),
                    json!({"trial_end_date": next.trial_end_date}),
                )
                .await;
                self.notifier
                    .notify_tenant_admins(
                        gateway,
                        "Trial ended",
                        "Your trial has ended. Choose a plan to keep using the service.",
                        NotificationType::BillingCritical,
                        json!({"subscription_id": next.id}),
                    )
                    .await;
                info!(subscription_id = subscription_id, "Trial expired");
                Ok(Transition::Applied(next))
            }
            _ => Ok(Transition::Unchanged(current)),
        }
    }

    async fn suspend_inner(
        &self,
        gateway: &TenantGateway,
        current: Subscription,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut next = current.clone();
        next.status = SubscriptionStatus::Suspended;
        next.auto_renew = false;
        next.next_billing_date = None;
        let next = self.commit(gateway, next, now).await?;

        billing_events::record(
            gateway,
            BillingEventType::SubscriptionSuspended,
            Some(&next.id),
            json!({"previous_status": current.status, "reason": reason}),
        )
        .await;
        self.notifier
            .notify_tenant_admins(
                gateway,
                "Subscription suspended",
                "Your subscription has been suspended because payment was not received.",
                NotificationType::BillingCritical,
                json!({"subscription_id": next.id, "reason": reason}),
            )
            .await;
        self.metrics.record_billing_operation("subscription_suspended", gateway.tenant_id());
        warn!(tenant_id = gateway.tenant_id(), subscription_id = %next.id, reason = reason, "Subscription suspended");
        Ok(Transition::Applied(next))
    }

    /// GRACE_PERIOD to SUSPENDED once the grace period has passed
    pub async fn suspend(&self, gateway: &TenantGateway, subscription_id: &str, now: DateTime<Utc>) -> Result<Transition> {
        let current = self.get(gateway, subscription_id).await?;
        match current.status {
            SubscriptionStatus::Suspended => Ok(Transition::Unchanged(current)),
            SubscriptionStatus::GracePeriod => {
                if current.grace_period_end_date.is_some_and(|end| end <= now) {
                    self.suspend_inner(gateway, current, "grace_period_ended", now).await
                } else {
                    Ok(Transition::Unchanged(current))
                }
            }
            from => Err(CoreError::InvalidTransition {
                from,
                to: SubscriptionStatus::Suspended,
            }),
        }
    }

    /// Suspends regardless of grace-period phase (long-overdue invoices)
    pub async fn force_suspend(
        &self,
        gateway: &TenantGateway,
        subscription_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let current = self.get(gateway, subscription_id).await?;
        if current.status == SubscriptionStatus::Suspended {
            return Ok(Transition::Unchanged(current));
        }
        Self::check_transition(&current, SubscriptionStatus::Suspended)?;
        self.suspend_inner(gateway, current, reason, now).await
    }

    /// Subscriptions of this tenant in `status`
    pub async fn list_by_status(&self, gateway: &TenantGateway, status: SubscriptionStatus) -> Result<Vec<Subscription>> {
        gateway
            .find_many(&Filter::eq("status", status.as_str()), &FindOptions::default())
            .await
    }
}
