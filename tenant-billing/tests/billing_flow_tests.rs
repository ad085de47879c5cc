//! End-to-end billing scenarios over the in-memory store.

mod common;

use chrono::{Duration, TimeZone, Utc};

use common::{at, signed_notification, Harness};
use tenant_billing::pricing::LimitKey;
use tenant_billing::scheduler::SweepTask;
use tenant_billing::store::Filter;
use tenant_billing::subscription::{ChangeSubscription, CreateSubscription, ProrationOption};
use tenant_billing::usage::Severity;
use tenant_billing::{
    BillingCycle, CoreError, InvoiceStatus, Notification, PaymentPurpose, PaymentStatus, Student,
    Subscription, SubscriptionStatus, SubscriptionTier,
};

fn monthly(tier: SubscriptionTier) -> CreateSubscription {
    CreateSubscription {
        tier,
        billing_cycle: BillingCycle::Monthly,
        auto_renew: true,
        start_date: None,
    }
}

fn students(tenant_id: &str, from: usize, to: usize) -> Vec<Student> {
    (from..to)
        .map(|i| Student::new(tenant_id.to_string(), format!("santri-{i}")))
        .collect()
}

#[tokio::test]
async fn pondok_maju_usage_climbs_past_its_plan() {
    let h = Harness::new();
    let (tenant, gw) = h.onboard("Pondok Maju").await;
    assert_eq!(tenant.prefix, "PONDMAJU");
    h.state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 3, 1))
        .await
        .unwrap();
    let now = at(2026, 3, 10);

    gw.create_many(&students(&tenant.id, 0, 40)).await.unwrap();
    let check = h.state.usage.check_limits(&gw, now).await.unwrap();
    assert!(check.is_within_limits);
    assert!(check.warnings.is_empty());

    gw.create_many(&students(&tenant.id, 40, 475)).await.unwrap();
    let check = h.state.usage.check_limits(&gw, now).await.unwrap();
    assert!(check.is_within_limits);
    assert_eq!(check.warnings.len(), 1);
    assert_eq!(check.warnings[0].limit, LimitKey::MaxStudents);
    assert_eq!(check.warnings[0].severity, Severity::Critical);
    assert!((check.warnings[0].percentage - 95.0).abs() < 1e-9);

    gw.create_many(&students(&tenant.id, 475, 600)).await.unwrap();
    let check = h.state.usage.check_limits(&gw, now).await.unwrap();
    assert!(!check.is_within_limits);
    assert_eq!(check.exceeded_limits, vec![LimitKey::MaxStudents]);
    assert!(check.blocked_operations.iter().any(|op| op == "CREATE_STUDENT"));
    assert_eq!(check.recommended_tier, Some(SubscriptionTier::Standard));

    let err = h
        .state
        .usage
        .require(&gw, LimitKey::MaxStudents, 1, now)
        .await
        .unwrap_err();
    let CoreError::UsageLimitExceeded(detail) = err else {
        panic!("expected a usage limit rejection");
    };
    assert_eq!(detail.limit_value, 500);
    assert_eq!(detail.current, 600.0);
    assert_eq!(detail.recommended_tier, Some(SubscriptionTier::Standard));
}

#[tokio::test]
async fn renewal_settles_once_even_when_replayed() {
    let h = Harness::new();
    let (tenant, gw) = h.onboard("Pondok Maju").await;
    h.add_admin(&tenant, &gw).await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();

    let session = h
        .state
        .payments
        .create_subscription_payment(&gw, &sub.id, PaymentPurpose::Renewal, None, at(2026, 1, 29))
        .await
        .unwrap();
    assert!(session.transaction.order_id.starts_with("RENEW-"));
    assert_eq!(session.transaction.status, PaymentStatus::Pending);
    assert_eq!(h.payments.charge_count(), 1);

    let gross = session.invoice.total.to_string();
    let notification = signed_notification(&session.transaction.order_id, "gw-1", "settlement", &gross);

    let outcome = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 29))
        .await
        .unwrap();
    assert_eq!(outcome.status, PaymentStatus::Success);
    assert!(!outcome.duplicate);
    let renewed = outcome.subscription.unwrap();
    assert_eq!(renewed.current_period_start, sub.end_date);
    assert_eq!(renewed.end_date, at(2026, 3, 1));

    let invoice = h.state.subscriptions.invoices().get(&gw, &session.invoice.id).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Success);
    assert!(invoice.paid_date.is_some());

    let replay = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 30))
        .await
        .unwrap();
    assert!(replay.duplicate);
    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.end_date, at(2026, 3, 1));
    assert_eq!(stored.version, renewed.version);
}

#[tokio::test]
async fn settlement_redelivered_after_failed_write_still_renews() {
    let (h, store) = Harness::flaky();
    let (_, gw) = h.onboard("Pondok Maju").await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();
    let session = h
        .state
        .payments
        .create_subscription_payment(&gw, &sub.id, PaymentPurpose::Renewal, None, at(2026, 1, 29))
        .await
        .unwrap();
    let gross = session.invoice.total.to_string();
    let notification = signed_notification(&session.transaction.order_id, "gw-1", "settlement", &gross);

    store.fail_next_subscription_write();
    let err = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 29))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Store(_)));
    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.end_date, sub.end_date);

    // the gateway redelivers; the payment is already recorded, the renewal is not
    let retry = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 29))
        .await
        .unwrap();
    assert!(retry.duplicate);
    assert_eq!(retry.status, PaymentStatus::Success);
    let renewed = retry.subscription.unwrap();
    assert_eq!(renewed.end_date, at(2026, 3, 1));

    let invoice = h.state.subscriptions.invoices().get(&gw, &session.invoice.id).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Success);

    let again = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 30))
        .await
        .unwrap();
    assert!(again.duplicate);
    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.end_date, at(2026, 3, 1));
    assert_eq!(stored.version, renewed.version);
}

async fn upgrade_session(
    h: &Harness,
    gw: &tenant_billing::TenantGateway,
    subscription_id: &str,
) -> (tenant_billing::payment::PaymentSession, tenant_billing::payment::PaymentNotification) {
    let purpose = PaymentPurpose::Upgrade {
        tier: SubscriptionTier::Premium,
        billing_cycle: BillingCycle::Monthly,
    };
    let session = h
        .state
        .payments
        .create_subscription_payment(gw, subscription_id, purpose, None, at(2026, 1, 10))
        .await
        .unwrap();
    assert!(session.transaction.order_id.starts_with("UPGRADE-"));
    let gross = session.invoice.total.to_string();
    let notification = signed_notification(&session.transaction.order_id, "gw-1", "settlement", &gross);
    (session, notification)
}

#[tokio::test]
async fn upgrade_settlement_applies_once() {
    let h = Harness::new();
    let (_, gw) = h.onboard("Pondok Maju").await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();
    let (_, notification) = upgrade_session(&h, &gw, &sub.id).await;

    let outcome = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 10))
        .await
        .unwrap();
    assert!(!outcome.duplicate);
    let upgraded = outcome.subscription.unwrap();
    assert_eq!(upgraded.tier, SubscriptionTier::Premium);
    assert_eq!(upgraded.end_date, at(2026, 2, 10));

    let replay = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 20))
        .await
        .unwrap();
    assert!(replay.duplicate);
    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.version, upgraded.version);
    assert_eq!(stored.end_date, at(2026, 2, 10));
}

#[tokio::test]
async fn upgrade_settlement_after_plan_already_changed_keeps_it() {
    let h = Harness::new();
    let (_, gw) = h.onboard("Pondok Maju").await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();
    let (session, notification) = upgrade_session(&h, &gw, &sub.id).await;

    let changed = h
        .state
        .subscriptions
        .change(
            &gw,
            &sub.id,
            ChangeSubscription {
                tier: SubscriptionTier::Premium,
                billing_cycle: Some(BillingCycle::Monthly),
                effective_date: None,
                proration: ProrationOption::EndOfCycle,
            },
            at(2026, 1, 11),
        )
        .await
        .unwrap()
        .subscription;

    let outcome = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 12))
        .await
        .unwrap();
    assert_eq!(outcome.status, PaymentStatus::Success);
    let kept = outcome.subscription.unwrap();
    assert_eq!(kept.tier, SubscriptionTier::Premium);
    assert_eq!(kept.version, changed.version);
    assert_eq!(kept.end_date, sub.end_date);

    let invoice = h.state.subscriptions.invoices().get(&gw, &session.invoice.id).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Success);
}

#[tokio::test]
async fn upgrade_settlement_on_cancelled_subscription_is_recorded_only() {
    let h = Harness::new();
    let (_, gw) = h.onboard("Pondok Maju").await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();
    let (session, notification) = upgrade_session(&h, &gw, &sub.id).await;
    h.state
        .subscriptions
        .cancel(&gw, &sub.id, Some("closing".into()), None, at(2026, 1, 11))
        .await
        .unwrap();

    let outcome = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 12))
        .await
        .unwrap();
    assert_eq!(outcome.status, PaymentStatus::Success);
    assert!(outcome.subscription.is_none());

    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);
    assert_eq!(stored.tier, SubscriptionTier::Basic);
    let invoice = h.state.subscriptions.invoices().get(&gw, &session.invoice.id).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Success);
}

#[tokio::test]
async fn tampered_notification_changes_nothing() {
    let h = Harness::new();
    let (_, gw) = h.onboard("Pondok Maju").await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();
    let session = h
        .state
        .payments
        .create_subscription_payment(&gw, &sub.id, PaymentPurpose::Renewal, None, at(2026, 1, 29))
        .await
        .unwrap();

    let mut notification = signed_notification(&session.transaction.order_id, "gw-1", "settlement", "555000.00");
    notification.gross_amount = "1.00".into();
    let err = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 29))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidSignature));

    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.end_date, sub.end_date);
    let invoice = h.state.subscriptions.invoices().get(&gw, &session.invoice.id).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn denied_payment_fails_the_invoice_and_alerts_admins() {
    let h = Harness::new();
    let (tenant, gw) = h.onboard("Pondok Maju").await;
    h.add_admin(&tenant, &gw).await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Standard), at(2026, 1, 1))
        .await
        .unwrap();
    let session = h
        .state
        .payments
        .create_subscription_payment(&gw, &sub.id, PaymentPurpose::Renewal, None, at(2026, 1, 30))
        .await
        .unwrap();

    let notification = signed_notification(&session.transaction.order_id, "gw-1", "deny", "1665000.00");
    let outcome = h
        .state
        .payments
        .reconcile_notification(&notification, at(2026, 1, 30))
        .await
        .unwrap();
    assert_eq!(outcome.status, PaymentStatus::Failed);
    assert!(outcome.subscription.is_none());

    let invoice = h.state.subscriptions.invoices().get(&gw, &session.invoice.id).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Failed);
    assert_eq!(gw.count::<Notification>(&Filter::All).await.unwrap(), 1);
}

#[tokio::test]
async fn long_overdue_invoice_suspends_the_subscription() {
    let h = Harness::new();
    let (tenant, gw) = h.onboard("Pondok Maju").await;
    h.add_admin(&tenant, &gw).await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();
    let session = h
        .state
        .payments
        .create_subscription_payment(&gw, &sub.id, PaymentPurpose::Renewal, None, at(2026, 1, 29))
        .await
        .unwrap();
    let due = session.invoice.due_date;

    let early = h
        .state
        .payments
        .process_overdue_invoices(&gw, due + Duration::days(3))
        .await
        .unwrap();
    assert_eq!(early.reminded, 1);
    assert_eq!(early.suspended, 0);

    let late = h
        .state
        .payments
        .process_overdue_invoices(&gw, due + Duration::days(30))
        .await
        .unwrap();
    assert_eq!(late.suspended, 1);
    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Suspended);

    // already suspended, nothing more to do
    let again = h
        .state
        .payments
        .process_overdue_invoices(&gw, due + Duration::days(31))
        .await
        .unwrap();
    assert_eq!(again.suspended, 0);
}

#[tokio::test]
async fn sweep_expires_trials_after_warning() {
    let h = Harness::new();
    let (tenant, gw) = h.onboard("Pondok Maju").await;
    h.add_admin(&tenant, &gw).await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Trial), at(2026, 1, 1))
        .await
        .unwrap();

    let report = h.state.scheduler.run(at(2026, 1, 14)).await;
    assert!(report.is_clean());
    assert_eq!(report.tenants, 1);
    let warnings: Vec<Notification> = gw
        .find_many(&Filter::eq("title", "Trial ending soon"), &Default::default())
        .await
        .unwrap();
    assert_eq!(warnings.len(), 1);

    h.state.scheduler.run(at(2026, 1, 16)).await;
    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Expired);
}

#[tokio::test]
async fn sweep_charges_due_renewal_once() {
    let h = Harness::new();
    let (_, gw) = h.onboard("Pondok Maju").await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();

    let morning = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
    let report = h.state.scheduler.run(morning).await;
    assert!(report.is_clean());
    assert_eq!(h.payments.charge_count(), 1);

    // the pending renewal charge is not duplicated by a second sweep
    h.state.scheduler.run(morning + Duration::minutes(30)).await;
    assert_eq!(h.payments.charge_count(), 1);
    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn sweep_with_failing_gateway_moves_into_grace_period() {
    let h = Harness::failing();
    let (_, gw) = h.onboard("Pondok Maju").await;
    let (_, other_gw) = h.onboard("SMA Negeri 1").await;
    let sub = h
        .state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();
    let other = h
        .state
        .subscriptions
        .create(&other_gw, monthly(SubscriptionTier::Standard), at(2026, 1, 20))
        .await
        .unwrap();

    let report = h.state.scheduler.run(at(2026, 2, 2)).await;
    assert_eq!(report.tenants, 2);
    assert!(report.is_clean());

    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.status, SubscriptionStatus::GracePeriod);
    assert_eq!(stored.grace_period_end_date, Some(sub.end_date + Duration::days(7)));

    // the other tenant was not due and is untouched
    let untouched: Subscription = other_gw.get(&other.id).await.unwrap();
    assert_eq!(untouched.status, SubscriptionStatus::Active);
    assert_eq!(untouched.version, other.version);
    assert!(gw.find_by_id::<Subscription>(&other.id).await.unwrap().is_none());

    // grace period runs out
    h.state.scheduler.run(at(2026, 2, 9)).await;
    let stored: Subscription = gw.get(&sub.id).await.unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Suspended);
}

#[tokio::test]
async fn sweep_reports_tenant_listing_failure_as_its_own_task() {
    let (h, store) = Harness::flaky();
    let (_, gw) = h.onboard("Pondok Maju").await;
    h.state
        .subscriptions
        .create(&gw, monthly(SubscriptionTier::Basic), at(2026, 1, 1))
        .await
        .unwrap();

    store.fail_next_subscription_read();
    let report = h.state.scheduler.run(at(2026, 1, 10)).await;
    assert_eq!(report.tenants, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].task, SweepTask::ListTenants);
    assert!(report.failures[0].tenant_id.is_none());

    let report = h.state.scheduler.run(at(2026, 1, 10)).await;
    assert!(report.is_clean());
    assert_eq!(report.tenants, 1);
}
