//! Invoice creation, numbering, settlement and rendering.

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::json;
use std::fmt::Write as _;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::billing_events;
use crate::config::BillingConfig;
use crate::error::{CoreError, Result};
use crate::gateway::{CrossTenantGateway, TenantGateway};
use crate::models::{BillingEventType, Invoice, InvoiceItem, InvoiceKind, InvoiceStatus};
use crate::store::{Filter, FindOptions, Patch};

const NUMBER_ATTEMPTS: usize = 5;
const HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Input for [`InvoiceService::create`]
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub subscription_id: String,
    pub kind: InvoiceKind,
    pub items: Vec<InvoiceItem>,
    pub discount_percent: Decimal,
    pub due_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Subtotal, discount, tax and total for a set of items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceAmounts {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

pub fn compute_amounts(items: &[InvoiceItem], discount_percent: Decimal, tax_rate: Decimal) -> InvoiceAmounts {
    let subtotal: Decimal = items.iter().map(|i| i.amount).sum();
    let discount = (subtotal * discount_percent / HUNDRED).round_dp(2);
    let tax = ((subtotal - discount) * tax_rate).round_dp(2);
    InvoiceAmounts {
        subtotal,
        discount,
        tax,
        total: subtotal - discount + tax,
    }
}

/// `INV-YYYYMM-NNNNNN`
pub fn format_invoice_number(at: DateTime<Utc>, sequence: u32) -> String {
    format!("INV-{:04}{:02}-{:06}", at.year(), at.month(), sequence % 1_000_000)
}

fn month_bounds(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(at);
    let end = start.checked_add_months(Months::new(1)).unwrap_or(at);
    (start, end)
}

/// Whether a status write was applied or was already in place
#[derive(Debug, Clone)]
pub enum InvoiceUpdate {
    Applied(Invoice),
    Unchanged(Invoice),
}

impl InvoiceUpdate {
    pub fn invoice(&self) -> &Invoice {
        match self {
            InvoiceUpdate::Applied(i) | InvoiceUpdate::Unchanged(i) => i,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, InvoiceUpdate::Applied(_))
    }
}

#[derive(Clone)]
pub struct InvoiceService {
    /// Invoice numbers are unique across tenants, so numbering reads all invoices
    numbering: CrossTenantGateway,
    tax_rate: Decimal,
    due_days: i64,
    currency: String,
}

impl InvoiceService {
    pub fn new(numbering: CrossTenantGateway, config: &BillingConfig) -> Self {
        Self {
            numbering,
            tax_rate: config.tax_rate,
            due_days: config.invoice_due_days,
            currency: config.currency.clone(),
        }
    }

    async fn next_sequence(&self, now: DateTime<Utc>) -> Result<u32> {
        let (start, end) = month_bounds(now);
        let filter = Filter::gte("created_at", start).and(Filter::lt("created_at", end));
        let issued = self.numbering.count::<Invoice>(&filter).await?;
        Ok(issued as u32 + 1)
    }

    #[instrument(skip(self, gateway, request), fields(tenant_id = gateway.tenant_id(), subscription_id = %request.subscription_id))]
    pub async fn create(&self, gateway: &TenantGateway, request: CreateInvoice, now: DateTime<Utc>) -> Result<Invoice> {
        if request.items.is_empty() {
            return Err(CoreError::validation("invoice needs at least one item"));
        }
        if request.items.iter().any(|i| i.amount < Decimal::ZERO || i.quantity <= 0) {
            return Err(CoreError::validation("invoice items must have positive quantity and non-negative amount"));
        }
        if request.discount_percent < Decimal::ZERO || request.discount_percent > HUNDRED {
            return Err(CoreError::validation("discount percent must be between 0 and 100"));
        }

        let amounts = compute_amounts(&request.items, request.discount_percent, self.tax_rate);
        let mut invoice = Invoice {
            id: Uuid::new_v4().to_string(),
            invoice_number: String::new(),
            subscription_id: request.subscription_id,
            organization_id: gateway.tenant_id().to_string(),
            kind: request.kind,
            items: request.items,
            subtotal: amounts.subtotal,
            discount_percent: request.discount_percent,
            discount: amounts.discount,
            tax_rate: self.tax_rate,
            tax: amounts.tax,
            total: amounts.total,
            currency: self.currency.clone(),
            status: InvoiceStatus::Pending,
            due_date: request.due_date.unwrap_or(now + Duration::days(self.due_days)),
            paid_date: None,
            notes: request.notes,
            created_at: now,
            updated_at: now,
        };

        let mut sequence = self.next_sequence(now).await?;
        for attempt in 1..=NUMBER_ATTEMPTS {
            invoice.invoice_number = format_invoice_number(now, sequence);
            match gateway.create(&invoice).await {
                Ok(()) => {
                    info!(
                        invoice_id = %invoice.id,
                        invoice_number = %invoice.invoice_number,
                        total = %invoice.total,
                        "Invoice created"
                    );
                    billing_events::record(
                        gateway,
                        BillingEventType::InvoiceCreated,
                        Some(&invoice.subscription_id),
                        json!({
                            "invoice_id": invoice.id,
                            "invoice_number": invoice.invoice_number,
                            "kind": invoice.kind,
                            "total": invoice.total,
                        }),
                    )
                    .await;
                    return Ok(invoice);
                }
                Err(CoreError::Conflict(key)) if attempt < NUMBER_ATTEMPTS => {
                    warn!(attempt = attempt, key = %key, "Invoice number taken, retrying");
                    sequence = rand::thread_rng().gen_range(1..1_000_000);
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Conflict("invoice number allocation".to_string()))
    }

    pub async fn get(&self, gateway: &TenantGateway, invoice_id: &str) -> Result<Invoice> {
        gateway.get::<Invoice>(invoice_id).await
    }

    async fn transition(
        &self,
        gateway: &TenantGateway,
        invoice_id: &str,
        target: InvoiceStatus,
        allowed_from: &[InvoiceStatus],
        paid_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<InvoiceUpdate> {
        let invoice = self.get(gateway, invoice_id).await?;
        if invoice.status == target {
            return Ok(InvoiceUpdate::Unchanged(invoice));
        }
        if !allowed_from.contains(&invoice.status) {
            return Err(CoreError::Conflict(format!(
                "invoice {} is {:?}, cannot become {:?}",
                invoice.invoice_number, invoice.status, target
            )));
        }

        let patch = Patch::new()
            .set("status", target)?
            .set("paid_date", paid_date)?
            .set("updated_at", now)?;
        let guard = Filter::eq("id", invoice_id).and(Filter::eq("status", status_name(invoice.status)));
        let updated = gateway.update_many::<Invoice>(&guard, &patch).await?;
        if updated == 0 {
            // lost a race; re-read to decide whether the winner wrote the same thing
            let current = self.get(gateway, invoice_id).await?;
            return if current.status == target {
                Ok(InvoiceUpdate::Unchanged(current))
            } else {
                Err(CoreError::Conflict(format!("invoice {invoice_id} changed concurrently")))
            };
        }

        let mut invoice = invoice;
        invoice.status = target;
        invoice.paid_date = paid_date;
        invoice.updated_at = now;
        Ok(InvoiceUpdate::Applied(invoice))
    }

    /// Idempotent; a second call on a paid invoice is a no-op
    pub async fn mark_paid(&self, gateway: &TenantGateway, invoice_id: &str, paid_at: DateTime<Utc>) -> Result<InvoiceUpdate> {
        let update = self
            .transition(
                gateway,
                invoice_id,
                InvoiceStatus::Success,
                &[InvoiceStatus::Pending, InvoiceStatus::Failed],
                Some(paid_at),
                paid_at,
            )
            .await?;
        if update.applied() {
            let invoice = update.invoice();
            info!(invoice_id = invoice_id, invoice_number = %invoice.invoice_number, "Invoice paid");
            billing_events::record(
                gateway,
                BillingEventType::InvoicePaid,
                Some(&invoice.subscription_id),
                json!({"invoice_id": invoice.id, "total": invoice.total}),
            )
            .await;
        }
        Ok(update)
    }

    /// Idempotent; fails only if the invoice already reached a different terminal state
    pub async fn mark_failed(&self, gateway: &TenantGateway, invoice_id: &str, now: DateTime<Utc>) -> Result<InvoiceUpdate> {
        let update = self
            .transition(gateway, invoice_id, InvoiceStatus::Failed, &[InvoiceStatus::Pending], None, now)
            .await?;
        if update.applied() {
            let invoice = update.invoice();
            warn!(invoice_id = invoice_id, invoice_number = %invoice.invoice_number, "Invoice payment failed");
            billing_events::record(
                gateway,
                BillingEventType::InvoiceFailed,
                Some(&invoice.subscription_id),
                json!({"invoice_id": invoice.id}),
            )
            .await;
        }
        Ok(update)
    }

    /// PENDING invoices whose due date has passed, oldest first
    pub async fn list_overdue(&self, gateway: &TenantGateway, now: DateTime<Utc>) -> Result<Vec<Invoice>> {
        let filter = Filter::eq("status", "PENDING").and(Filter::lt("due_date", now));
        gateway.find_many(&filter, &FindOptions::oldest_first("due_date")).await
    }

    /// Plain-text invoice document
    pub async fn render(&self, gateway: &TenantGateway, invoice_id: &str) -> Result<Vec<u8>> {
        let invoice = self.get(gateway, invoice_id).await?;
        Ok(render_text(&invoice).into_bytes())
    }
}

fn status_name(status: InvoiceStatus) -> &'static str {
    match status {
        InvoiceStatus::Pending => "PENDING",
        InvoiceStatus::Success => "SUCCESS",
        InvoiceStatus::Failed => "FAILED",
        InvoiceStatus::Cancelled => "CANCELLED",
        InvoiceStatus::Refunded => "REFUNDED",
    }
}

pub fn render_text(invoice: &Invoice) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "INVOICE {}", invoice.invoice_number);
    let _ = writeln!(out, "Organization: {}", invoice.organization_id);
    let _ = writeln!(out, "Issued: {}", invoice.created_at.format("%Y-%m-%d"));
    let _ = writeln!(out, "Due: {}", invoice.due_date.format("%Y-%m-%d"));
    let _ = writeln!(out, "Status: {}", status_name(invoice.status));
    if let Some(paid) = invoice.paid_date {
        let _ = writeln!(out, "Paid: {}", paid.format("%Y-%m-%d"));
    }
    let _ = writeln!(out);
    for item in &invoice.items {
        let _ = writeln!(
            out,
            "{:<40} {:>4} x {:>14} = {:>14}",
            item.description, item.quantity, item.unit_price, item.amount
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Subtotal: {} {}", invoice.currency, invoice.subtotal);
    let _ = writeln!(out, "Discount ({}%): {} {}", invoice.discount_percent, invoice.currency, invoice.discount);
    let _ = writeln!(out, "Tax ({}%): {} {}", invoice.tax_rate * HUNDRED, invoice.currency, invoice.tax);
    let _ = writeln!(out, "Total: {} {}", invoice.currency, invoice.total);
    if let Some(notes) = &invoice.notes {
        let _ = writeln!(out);
        let _ = writeln!(out, "{notes}");
    }
    out
}
