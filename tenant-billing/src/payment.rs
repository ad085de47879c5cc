//! Payment gateway client and the orchestrator that turns charges and their
//! asynchronous notifications into invoice and subscription state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha512};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::billing_events;
use crate::config::{BillingConfig, GatewayConfig};
use crate::error::{CoreError, Result};
use crate::gateway::{CrossTenantGateway, TenantGateway};
use crate::invoice::{CreateInvoice, InvoiceService};
use crate::models::{
    BillingEventType, Invoice, InvoiceItem, InvoiceKind, NotificationType, PaymentPurpose, PaymentStatus,
    PaymentTransaction, Subscription,
};
use crate::notifications::Notifier;
use crate::observability::Metrics;
use crate::pricing;
use crate::store::{Filter, Patch};
use crate::subscription::SubscriptionService;

/// Charge sent to the gateway
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub order_id: String,
    pub gross_amount: Decimal,
    pub currency: String,
    pub items: Vec<ChargeItem>,
    pub customer_email: Option<String>,
    /// Subscription id, echoed back on notification
    pub custom_field1: String,
    /// Organization id
    pub custom_field2: String,
    /// Invoice id
    pub custom_field3: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeItem {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    pub quantity: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeResponse {
    pub transaction_id: String,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub payment_type: Option<String>,
    #[serde(default)]
    pub raw: JsonValue,
}

/// Outbound seam to the payment provider
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, request: ChargeRequest) -> Result<ChargeResponse>;
}

#[derive(Serialize)]
struct WireTransactionDetails<'a> {
    order_id: &'a str,
    gross_amount: String,
}

#[derive(Serialize)]
struct WireItem<'a> {
    id: &'a str,
    name: &'a str,
    price: String,
    quantity: i64,
}

#[derive(Serialize)]
struct WireCustomer<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct WireCharge<'a> {
    transaction_details: WireTransactionDetails<'a>,
    item_details: Vec<WireItem<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_details: Option<WireCustomer<'a>>,
    custom_field1: &'a str,
    custom_field2: &'a str,
    custom_field3: &'a str,
}

#[derive(Deserialize)]
struct WireChargeResponse {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    redirect_url: Option<String>,
    #[serde(default)]
    payment_type: Option<String>,
}

/// JSON-over-HTTP gateway client, authenticated with the server key
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    server_key: String,
}

impl HttpPaymentGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CoreError::GatewayError(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            server_key: config.server_key.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.server_key.is_empty() && !self.base_url.is_empty()
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_charge(&self, request: ChargeRequest) -> Result<ChargeResponse> {
        if !self.is_configured() {
            return Err(CoreError::GatewayError("payment gateway credentials not configured".into()));
        }

        let body = WireCharge {
            transaction_details: WireTransactionDetails {
                order_id: &request.order_id,
                gross_amount: request.gross_amount.round_dp(2).to_string(),
            },
            item_details: request
                .items
                .iter()
                .map(|item| WireItem {
                    id: &item.id,
                    name: &item.name,
                    price: item.price.round_dp(2).to_string(),
                    quantity: item.quantity,
                })
                .collect(),
            customer_details: request.customer_email.as_deref().map(|email| WireCustomer { email }),
            custom_field1: &request.custom_field1,
            custom_field2: &request.custom_field2,
            custom_field3: &request.custom_field3,
        };

        let url = format!("{}/transactions", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.server_key, Some(""))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::GatewayError(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::GatewayError(e.to_string()))?;
        debug!(status = %status, order_id = %request.order_id, "Gateway charge response");

        if !status.is_success() {
            error!(status = %status, order_id = %request.order_id, body = %text, "Gateway rejected charge");
            return Err(CoreError::GatewayError(format!("gateway returned {status}")));
        }

        let raw: JsonValue = serde_json::from_str(&text).map_err(|e| CoreError::GatewayError(e.to_string()))?;
        let parsed: WireChargeResponse =
            serde_json::from_value(raw.clone()).map_err(|e| CoreError::GatewayError(e.to_string()))?;
        let transaction_id = parsed
            .transaction_id
            .or(parsed.token)
            .ok_or_else(|| CoreError::GatewayError("gateway response carried no transaction id".into()))?;

        info!(order_id = %request.order_id, transaction_id = %transaction_id, "Gateway charge created");
        Ok(ChargeResponse {
            transaction_id,
            redirect_url: parsed.redirect_url,
            payment_type: parsed.payment_type,
            raw,
        })
    }
}

/// Asynchronous status callback from the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentNotification {
    #[serde(default)]
    pub transaction_time: Option<String>,
    pub transaction_status: String,
    pub transaction_id: String,
    #[serde(default)]
    pub status_message: Option<String>,
    pub status_code: String,
    pub signature_key: String,
    #[serde(default)]
    pub payment_type: Option<String>,
    pub order_id: String,
    #[serde(default)]
    pub merchant_id: Option<String>,
    pub gross_amount: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub fraud_status: Option<String>,
}

/// Lower-case hex SHA-512 of `order_id + status_code + gross_amount + server_key`
pub fn compute_signature(order_id: &str, status_code: &str, gross_amount: &str, server_key: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_signature(notification: &PaymentNotification, server_key: &str) -> bool {
    let expected = compute_signature(
        &notification.order_id,
        &notification.status_code,
        &notification.gross_amount,
        server_key,
    );
    let provided = notification.signature_key.to_ascii_lowercase();
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Gateway status vocabulary to the internal tri-state
pub fn map_status(transaction_status: &str, fraud_status: Option<&str>) -> PaymentStatus {
    match transaction_status.to_ascii_lowercase().as_str() {
        "capture" if fraud_status.is_some_and(|f| f.eq_ignore_ascii_case("challenge")) => PaymentStatus::Pending,
        "capture" | "settlement" => PaymentStatus::Success,
        "deny" | "cancel" | "expire" | "failure" => PaymentStatus::Failed,
        "pending" => PaymentStatus::Pending,
        other => {
            warn!(transaction_status = other, "Unknown gateway status, treating as pending");
            PaymentStatus::Pending
        }
    }
}

/// Which reconciliation path an order id selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Activation,
    Renewal,
    Upgrade,
}

impl OrderKind {
    pub fn from_order_id(order_id: &str) -> Self {
        if order_id.starts_with("RENEW-") {
            OrderKind::Renewal
        } else if order_id.starts_with("UPGRADE-") {
            OrderKind::Upgrade
        } else {
            OrderKind::Activation
        }
    }
}

pub fn order_id(purpose: &PaymentPurpose, subscription_id: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}-{}", purpose.order_prefix(), subscription_id, at.timestamp())
}

/// A charge waiting for the customer to pay
#[derive(Debug, Clone, Serialize)]
pub struct PaymentSession {
    pub transaction: PaymentTransaction,
    pub invoice: Invoice,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub transaction: PaymentTransaction,
    pub status: PaymentStatus,
    /// The same terminal status had already been applied
    pub duplicate: bool,
    pub subscription: Option<Subscription>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OverdueReport {
    pub reminded: usize,
    pub suspended: usize,
}

#[derive(Clone)]
pub struct PaymentService {
    invoices: InvoiceService,
    subscriptions: SubscriptionService,
    gateway: Arc<dyn PaymentGateway>,
    admin: CrossTenantGateway,
    notifier: Notifier,
    metrics: Metrics,
    server_key: String,
    currency: String,
    overdue_suspension_days: i64,
}

impl PaymentService {
    pub fn new(
        subscriptions: SubscriptionService,
        gateway: Arc<dyn PaymentGateway>,
        admin: CrossTenantGateway,
        notifier: Notifier,
        metrics: Metrics,
        gateway_config: &GatewayConfig,
        billing: &BillingConfig,
    ) -> Self {
        Self {
            invoices: subscriptions.invoices().clone(),
            subscriptions,
            gateway,
            admin,
            notifier,
            metrics,
            server_key: gateway_config.server_key.clone(),
            currency: billing.currency.clone(),
            overdue_suspension_days: billing.overdue_suspension_days,
        }
    }

    fn charge_lines(&self, subscription: &Subscription, purpose: &PaymentPurpose, now: DateTime<Utc>) -> Result<(InvoiceKind, InvoiceItem)> {
        let (kind, item) = match *purpose {
            PaymentPurpose::Activation { tier, billing_cycle } => (
                InvoiceKind::Subscription,
                InvoiceItem::new(format!("{} subscription", tier.as_str()), 1, pricing::price(tier, billing_cycle)),
            ),
            PaymentPurpose::Renewal => (
                InvoiceKind::Renewal,
                InvoiceItem::new(
                    format!("{} renewal", subscription.tier.as_str()),
                    1,
                    pricing::price(subscription.tier, subscription.billing_cycle),
                ),
            ),
            PaymentPurpose::Upgrade { tier, billing_cycle } => {
                if tier <= subscription.tier {
                    return Err(CoreError::validation("an upgrade must move to a higher tier"));
                }
                let current = pricing::get_plan(subscription.tier, subscription.billing_cycle, &self.currency);
                let target = pricing::get_plan(tier, billing_cycle, &self.currency);
                let total_days = (subscription.current_period_end - subscription.current_period_start)
                    .num_days()
                    .max(0);
                let remaining = (subscription.current_period_end - now).num_days().clamp(0, total_days);
                (
                    InvoiceKind::Upgrade,
                    InvoiceItem::new(
                        format!("Upgrade {} to {}", subscription.tier.as_str(), tier.as_str()),
                        1,
                        pricing::proration(&current, &target, remaining as u32, total_days as u32),
                    ),
                )
            }
        };
        if item.amount <= Decimal::ZERO {
            return Err(CoreError::validation("nothing to charge for this plan"));
        }
        Ok((kind, item))
    }

    /// Creates the invoice, the gateway charge and a PENDING transaction
    #[instrument(skip(self, gateway), fields(tenant_id = gateway.tenant_id()))]
    pub async fn create_subscription_payment(
        &self,
        gateway: &TenantGateway,
        subscription_id: &str,
        purpose: PaymentPurpose,
        customer_email: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PaymentSession> {
        let subscription = self.subscriptions.get(gateway, subscription_id).await?;
        let (kind, item) = self.charge_lines(&subscription, &purpose, now)?;

        let invoice = self
            .invoices
            .create(
                gateway,
                CreateInvoice {
                    subscription_id: subscription.id.clone(),
                    kind,
                    items: vec![item.clone()],
                    discount_percent: Decimal::ZERO,
                    due_date: None,
                    notes: None,
                },
                now,
            )
            .await?;

        let order_id = order_id(&purpose, &subscription.id, now);
        let mut items = vec![ChargeItem {
            id: subscription.tier.as_str().to_string(),
            name: item.description.clone(),
            price: item.amount,
            quantity: item.quantity,
        }];
        if invoice.tax > Decimal::ZERO {
            items.push(ChargeItem {
                id: "TAX".into(),
                name: "VAT".into(),
                price: invoice.tax,
                quantity: 1,
            });
        }
        if invoice.discount > Decimal::ZERO {
            items.push(ChargeItem {
                id: "DISCOUNT".into(),
                name: "Discount".into(),
                price: -invoice.discount,
                quantity: 1,
            });
        }

        let charge = ChargeRequest {
            order_id: order_id.clone(),
            gross_amount: invoice.total,
            currency: invoice.currency.clone(),
            items,
            customer_email,
            custom_field1: subscription.id.clone(),
            custom_field2: subscription.organization_id.clone(),
            custom_field3: invoice.id.clone(),
        };

        let response = match self.gateway.create_charge(charge).await {
            Ok(response) => response,
            Err(e) => {
                error!(order_id = %order_id, error = %e, "Charge creation failed");
                if let Err(mark) = self.invoices.mark_failed(gateway, &invoice.id, now).await {
                    warn!(invoice_id = %invoice.id, error = %mark, "Could not mark invoice failed");
                }
                return Err(match e {
                    CoreError::GatewayError(_) => e,
                    other => CoreError::GatewayError(other.to_string()),
                });
            }
        };

        let transaction = PaymentTransaction {
            id: Uuid::new_v4().to_string(),
            invoice_id: invoice.id.clone(),
            subscription_id: subscription.id.clone(),
            organization_id: subscription.organization_id.clone(),
            order_id,
            amount: invoice.total,
            currency: invoice.currency.clone(),
            status: PaymentStatus::Pending,
            purpose,
            payment_method: response.payment_type.clone(),
            gateway_transaction_id: Some(response.transaction_id.clone()),
            gateway_response: Some(response.raw.clone()),
            redirect_url: response.redirect_url.clone(),
            paid_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        gateway.create(&transaction).await?;

        billing_events::record(
            gateway,
            BillingEventType::PaymentInitiated,
            Some(&subscription.id),
            json!({
                "order_id": transaction.order_id,
                "invoice_id": invoice.id,
                "amount": transaction.amount,
            }),
        )
        .await;
        self.metrics.record_billing_operation("payment_initiated", gateway.tenant_id());

        Ok(PaymentSession {
            redirect_url: transaction.redirect_url.clone(),
            transaction,
            invoice,
        })
    }

    async fn find_transaction(&self, notification: &PaymentNotification) -> Result<PaymentTransaction> {
        let by_gateway_id = Filter::eq("gateway_transaction_id", notification.transaction_id.as_str());
        if let Some(txn) = self.admin.find_first::<PaymentTransaction>(&by_gateway_id).await? {
            return Ok(txn);
        }
        self.admin
            .find_first::<PaymentTransaction>(&Filter::eq("order_id", notification.order_id.as_str()))
            .await?
            .ok_or_else(|| CoreError::not_found("payment_transaction", notification.order_id.clone()))
    }

    /// Applies a gateway notification. The signature is checked before anything
    /// is read or written; replays of an applied status are no-ops.
    #[instrument(skip(self, notification), fields(order_id = %notification.order_id, status = %notification.transaction_status))]
    pub async fn reconcile_notification(&self, notification: &PaymentNotification, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        if !verify_signature(notification, &self.server_key) {
            warn!("Payment notification signature mismatch");
            self.metrics.record_payment_notification(false, &notification.transaction_status);
            return Err(CoreError::InvalidSignature);
        }

        let status = map_status(&notification.transaction_status, notification.fraud_status.as_deref());
        let txn = self.find_transaction(notification).await?;
        let gateway = self.admin.for_tenant(txn.organization_id.clone());

        if txn.status == PaymentStatus::Success {
            // a settled payment may have been recorded before its subscription
            // write went through; finishing it here is a no-op once both landed
            info!(transaction_id = %txn.id, "Duplicate settlement notification");
            self.invoices.mark_paid(&gateway, &txn.invoice_id, now).await?;
            let subscription = self.advance_subscription(&gateway, &txn, now).await?;
            self.metrics.record_payment_notification(true, &notification.transaction_status);
            return Ok(ReconcileOutcome {
                transaction: txn,
                status: PaymentStatus::Success,
                duplicate: true,
                subscription,
            });
        }
        if txn.status == status && status.is_terminal() {
            info!(transaction_id = %txn.id, "Duplicate payment notification ignored");
            self.metrics.record_payment_notification(true, &notification.transaction_status);
            return Ok(ReconcileOutcome {
                transaction: txn,
                status,
                duplicate: true,
                subscription: None,
            });
        }

        let txn = self.update_transaction(&gateway, txn, status, notification, now).await?;

        match status {
            PaymentStatus::Success => {
                self.invoices.mark_paid(&gateway, &txn.invoice_id, now).await?;
            }
            PaymentStatus::Failed => {
                self.invoices.mark_failed(&gateway, &txn.invoice_id, now).await?;
                self.notifier
                    .notify_tenant_admins(
                        &gateway,
                        "Payment failed",
                        &format!("Payment for order {} was not completed.", txn.order_id),
                        NotificationType::BillingAlert,
                        json!({"order_id": txn.order_id, "invoice_id": txn.invoice_id}),
                    )
                    .await;
            }
            PaymentStatus::Pending => {}
        }

        let subscription = if status == PaymentStatus::Success {
            let subscription = self.advance_subscription(&gateway, &txn, now).await?;
            if subscription.is_some() {
                self.metrics.record_billing_operation("payment_settled", gateway.tenant_id());
            }
            subscription
        } else {
            None
        };

        billing_events::record(
            &gateway,
            BillingEventType::PaymentReconciled,
            Some(&txn.subscription_id),
            json!({
                "order_id": txn.order_id,
                "transaction_status": notification.transaction_status,
                "status": status,
            }),
        )
        .await;
        self.metrics.record_payment_notification(true, &notification.transaction_status);

        Ok(ReconcileOutcome {
            transaction: txn,
            status,
            duplicate: false,
            subscription,
        })
    }

    async fn update_transaction(
        &self,
        gateway: &TenantGateway,
        txn: PaymentTransaction,
        status: PaymentStatus,
        notification: &PaymentNotification,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        let mut next = txn.clone();
        next.status = status;
        next.gateway_transaction_id = Some(notification.transaction_id.clone());
        next.payment_method = notification.payment_type.clone().or(txn.payment_method.clone());
        next.gateway_response = Some(serde_json::to_value(notification).map_err(|e| CoreError::validation(e.to_string()))?);
        next.updated_at = now;
        match status {
            PaymentStatus::Success => next.paid_at = Some(now),
            PaymentStatus::Failed => {
                next.failure_reason = notification
                    .status_message
                    .clone()
                    .or_else(|| Some(notification.transaction_status.clone()))
            }
            PaymentStatus::Pending => {}
        }

        // conditional on the status we read, so concurrent deliveries apply once
        let guard = Filter::eq("id", txn.id.as_str()).and(Filter::eq("status", payment_status_name(txn.status)));
        let updated = gateway
            .update_many::<PaymentTransaction>(&guard, &Patch::from_entity(&next)?)
            .await?;
        if updated == 0 {
            return Err(CoreError::Conflict(format!(
                "payment transaction {} changed concurrently",
                txn.id
            )));
        }
        Ok(next)
    }

    /// Applies a settled payment to its subscription. A subscription that can no
    /// longer take the payment yields `None`; the paid transaction stays on record.
    async fn advance_subscription(
        &self,
        gateway: &TenantGateway,
        txn: &PaymentTransaction,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let applied = match (OrderKind::from_order_id(&txn.order_id), txn.purpose) {
            (OrderKind::Renewal, _) => self
                .subscriptions
                .renew(gateway, &txn.subscription_id, Some(&txn.id), now)
                .await
                .map(|outcome| outcome.subscription().clone()),
            (OrderKind::Upgrade, PaymentPurpose::Upgrade { tier, billing_cycle }) => self
                .subscriptions
                .settle_upgrade(gateway, &txn.subscription_id, tier, billing_cycle, &txn.id, now)
                .await
                .map(|t| t.into_subscription()),
            (OrderKind::Activation, PaymentPurpose::Activation { tier, billing_cycle }) => self
                .subscriptions
                .activate(gateway, &txn.subscription_id, tier, billing_cycle, &txn.id, now)
                .await
                .map(|t| t.into_subscription()),
            (kind, purpose) => {
                error!(order_id = %txn.order_id, ?kind, ?purpose, "Order id and payment purpose disagree");
                return Err(CoreError::validation(format!(
                    "order {} does not match its payment purpose",
                    txn.order_id
                )));
            }
        };
        match applied {
            Ok(subscription) => Ok(Some(subscription)),
            Err(CoreError::InvalidTransition { from, to }) => {
                error!(
                    order_id = %txn.order_id,
                    subscription_id = %txn.subscription_id,
                    ?from,
                    ?to,
                    "Settled payment cannot be applied to its subscription"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Reminds admins about overdue invoices and suspends subscriptions whose
    /// invoice has been overdue for the configured number of days
    #[instrument(skip(self, gateway), fields(tenant_id = gateway.tenant_id()))]
    pub async fn process_overdue_invoices(&self, gateway: &TenantGateway, now: DateTime<Utc>) -> Result<OverdueReport> {
        let overdue = self.invoices.list_overdue(gateway, now).await?;
        let mut report = OverdueReport::default();
        let mut suspended: HashSet<String> = HashSet::new();

        for invoice in overdue {
            let days_overdue = (now - invoice.due_date).num_days();
            if days_overdue >= self.overdue_suspension_days {
                if !suspended.insert(invoice.subscription_id.clone()) {
                    continue;
                }
                match self
                    .subscriptions
                    .force_suspend(gateway, &invoice.subscription_id, "invoice_overdue", now)
                    .await
                {
                    Ok(t) if t.applied() => report.suspended += 1,
                    Ok(_) => {}
                    Err(CoreError::InvalidTransition { from, .. }) => {
                        debug!(subscription_id = %invoice.subscription_id, ?from, "Overdue invoice on a closed subscription");
                    }
                    Err(e) => return Err(e),
                }
            } else {
                let sent = self
                    .notifier
                    .notify_tenant_admins(
                        gateway,
                        "Invoice overdue",
                        &format!(
                            "Invoice {} for {} {} is {} day(s) overdue.",
                            invoice.invoice_number, invoice.currency, invoice.total, days_overdue
                        ),
                        NotificationType::BillingAlert,
                        json!({"invoice_id": invoice.id, "days_overdue": days_overdue}),
                    )
                    .await;
                if sent > 0 {
                    report.reminded += 1;
                }
            }
        }
        Ok(report)
    }
}

fn payment_status_name(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Pending => "PENDING",
        PaymentStatus::Success => "SUCCESS",
        PaymentStatus::Failed => "FAILED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(order_id: &str, status_code: &str, gross: &str, key: &str) -> PaymentNotification {
        PaymentNotification {
            transaction_time: None,
            transaction_status: "settlement".into(),
            transaction_id: "gw-1".into(),
            status_message: None,
            status_code: status_code.into(),
            signature_key: compute_signature(order_id, status_code, gross, key),
            payment_type: Some("bank_transfer".into()),
            order_id: order_id.into(),
            merchant_id: None,
            gross_amount: gross.into(),
            currency: None,
            fraud_status: None,
        }
    }

    #[test]
    fn signature_is_sha512_hex() {
        let sig = compute_signature("RENEW-1", "200", "555000.00", "secret");
        assert_eq!(sig.len(), 128);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn signature_matches_known_digest() {
        // SHA-512("abc")
        assert_eq!(
            compute_signature("a", "b", "c", ""),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn signature_verification_rejects_tampering() {
        let mut n = notification("RENEW-1", "200", "555000.00", "secret");
        assert!(verify_signature(&n, "secret"));
        assert!(!verify_signature(&n, "other-key"));
        n.gross_amount = "1.00".into();
        assert!(!verify_signature(&n, "secret"));
    }

    #[test]
    fn status_vocabulary() {
        assert_eq!(map_status("settlement", None), PaymentStatus::Success);
        assert_eq!(map_status("capture", Some("accept")), PaymentStatus::Success);
        assert_eq!(map_status("capture", Some("challenge")), PaymentStatus::Pending);
        assert_eq!(map_status("pending", None), PaymentStatus::Pending);
        for failed in ["deny", "cancel", "expire", "failure"] {
            assert_eq!(map_status(failed, None), PaymentStatus::Failed);
        }
    }

    #[test]
    fn order_prefix_selects_path() {
        assert_eq!(OrderKind::from_order_id("RENEW-123"), OrderKind::Renewal);
        assert_eq!(OrderKind::from_order_id("UPGRADE-abc-1"), OrderKind::Upgrade);
        assert_eq!(OrderKind::from_order_id("SUB-abc-1"), OrderKind::Activation);
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(order_id(&PaymentPurpose::Renewal, "s1", at), "RENEW-s1-1700000000");
    }
}
