//! Static plan catalog and pricing math.
//!
//! Plans are versioned by deployment only. Every function here is pure.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{BillingCycle, SubscriptionTier};

/// Yearly plans are billed at 85% of twelve monthly payments
const YEARLY_FACTOR: Decimal = Decimal::from_parts(85, 0, 0, false, 2);

pub const TRIAL_DAYS: u32 = 14;

/// Sentinel for "no limit"
pub const UNLIMITED: i64 = -1;

/// Measurable resources a plan puts a ceiling on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitKey {
    MaxStudents,
    MaxTeachers,
    #[serde(rename = "maxStorageGB")]
    MaxStorageGb,
    MaxApiCallsPerMonth,
    MaxSmsPerMonth,
    MaxEmailsPerMonth,
    MaxReportsPerMonth,
    MaxCustomFields,
}

impl LimitKey {
    pub const ALL: [LimitKey; 8] = [
        LimitKey::MaxStudents,
        LimitKey::MaxTeachers,
        LimitKey::MaxStorageGb,
        LimitKey::MaxApiCallsPerMonth,
        LimitKey::MaxSmsPerMonth,
        LimitKey::MaxEmailsPerMonth,
        LimitKey::MaxReportsPerMonth,
        LimitKey::MaxCustomFields,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKey::MaxStudents => "maxStudents",
            LimitKey::MaxTeachers => "maxTeachers",
            LimitKey::MaxStorageGb => "maxStorageGB",
            LimitKey::MaxApiCallsPerMonth => "maxApiCallsPerMonth",
            LimitKey::MaxSmsPerMonth => "maxSmsPerMonth",
            LimitKey::MaxEmailsPerMonth => "maxEmailsPerMonth",
            LimitKey::MaxReportsPerMonth => "maxReportsPerMonth",
            LimitKey::MaxCustomFields => "maxCustomFields",
        }
    }

    /// Operations refused while this limit is exceeded
    pub fn blocked_operations(&self) -> &'static [&'static str] {
        match self {
            LimitKey::MaxStudents => &["CREATE_STUDENT", "IMPORT_STUDENTS"],
            LimitKey::MaxTeachers => &["CREATE_TEACHER", "IMPORT_TEACHERS"],
            LimitKey::MaxStorageGb => &["UPLOAD_FILE", "UPLOAD_DOCUMENT"],
            LimitKey::MaxApiCallsPerMonth => &["API_ACCESS"],
            LimitKey::MaxSmsPerMonth => &["SEND_SMS"],
            LimitKey::MaxEmailsPerMonth => &["SEND_EMAIL", "SEND_BULK_EMAIL"],
            LimitKey::MaxReportsPerMonth => &["GENERATE_REPORT", "EXPORT_REPORT"],
            LimitKey::MaxCustomFields => &["CREATE_CUSTOM_FIELD"],
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric ceilings of a plan; `-1` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub max_students: i64,
    pub max_teachers: i64,
    #[serde(rename = "maxStorageGB")]
    pub max_storage_gb: i64,
    pub max_api_calls_per_month: i64,
    pub max_sms_per_month: i64,
    pub max_emails_per_month: i64,
    pub max_reports_per_month: i64,
    pub max_custom_fields: i64,
}

impl PlanLimits {
    pub fn get(&self, key: LimitKey) -> i64 {
        match key {
            LimitKey::MaxStudents => self.max_students,
            LimitKey::MaxTeachers => self.max_teachers,
            LimitKey::MaxStorageGb => self.max_storage_gb,
            LimitKey::MaxApiCallsPerMonth => self.max_api_calls_per_month,
            LimitKey::MaxSmsPerMonth => self.max_sms_per_month,
            LimitKey::MaxEmailsPerMonth => self.max_emails_per_month,
            LimitKey::MaxReportsPerMonth => self.max_reports_per_month,
            LimitKey::MaxCustomFields => self.max_custom_fields,
        }
    }

    /// Whether `used` fits under the ceiling for `key`
    pub fn allows(&self, key: LimitKey, used: f64) -> bool {
        let limit = self.get(key);
        limit == UNLIMITED || used <= limit as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeatures {
    pub student_management: bool,
    pub attendance: bool,
    pub gradebook: bool,
    pub parent_portal: bool,
    pub sms_notifications: bool,
    pub custom_reports: bool,
    pub api_access: bool,
    pub priority_support: bool,
    pub white_label: bool,
    pub dedicated_account_manager: bool,
}

/// Catalog entry for one tier and billing cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingPlan {
    pub tier: SubscriptionTier,
    pub billing_cycle: BillingCycle,
    pub price: Decimal,
    pub monthly_price: Decimal,
    pub currency: String,
    pub trial_days: Option<u32>,
    /// Negotiated per contract; `price` is zero in the catalog
    pub custom_pricing: bool,
    pub features: PlanFeatures,
    pub limits: PlanLimits,
}

pub fn monthly_price(tier: SubscriptionTier) -> Decimal {
    match tier {
        SubscriptionTier::Trial | SubscriptionTier::Enterprise => Decimal::ZERO,
        SubscriptionTier::Basic => Decimal::from(500_000),
        SubscriptionTier::Standard => Decimal::from(1_500_000),
        SubscriptionTier::Premium => Decimal::from(3_500_000),
    }
}

pub fn yearly_price(tier: SubscriptionTier) -> Decimal {
    (monthly_price(tier) * Decimal::from(12) * YEARLY_FACTOR).floor()
}

pub fn price(tier: SubscriptionTier, cycle: BillingCycle) -> Decimal {
    match cycle {
        BillingCycle::Monthly => monthly_price(tier),
        BillingCycle::Yearly => yearly_price(tier),
    }
}

pub fn limits(tier: SubscriptionTier) -> PlanLimits {
    match tier {
        // trial runs with the entry-level ceilings
        SubscriptionTier::Trial | SubscriptionTier::Basic => PlanLimits {
            max_students: 500,
            max_teachers: 50,
            max_storage_gb: 10,
            max_api_calls_per_month: 10_000,
            max_sms_per_month: 500,
            max_emails_per_month: 2_000,
            max_reports_per_month: 100,
            max_custom_fields: 10,
        },
        SubscriptionTier::Standard => PlanLimits {
            max_students: 1_500,
            max_teachers: 150,
            max_storage_gb: 50,
            max_api_calls_per_month: 50_000,
            max_sms_per_month: 2_000,
            max_emails_per_month: 10_000,
            max_reports_per_month: 500,
            max_custom_fields: 30,
        },
        SubscriptionTier::Premium => PlanLimits {
            max_students: 5_000,
            max_teachers: 500,
            max_storage_gb: 200,
            max_api_calls_per_month: 200_000,
            max_sms_per_month: 10_000,
            max_emails_per_month: 50_000,
            max_reports_per_month: 2_000,
            max_custom_fields: 100,
        },
        SubscriptionTier::Enterprise => PlanLimits {
            max_students: UNLIMITED,
            max_teachers: UNLIMITED,
            max_storage_gb: UNLIMITED,
            max_api_calls_per_month: UNLIMITED,
            max_sms_per_month: UNLIMITED,
            max_emails_per_month: UNLIMITED,
            max_reports_per_month: UNLIMITED,
            max_custom_fields: UNLIMITED,
        },
    }
}

pub fn features(tier: SubscriptionTier) -> PlanFeatures {
    let at_least = |floor: SubscriptionTier| tier >= floor;
    PlanFeatures {
        student_management: true,
        attendance: true,
        gradebook: true,
        parent_portal: at_least(SubscriptionTier::Standard) || tier == SubscriptionTier::Trial,
        sms_notifications: at_least(SubscriptionTier::Standard),
        custom_reports: at_least(SubscriptionTier::Standard),
        api_access: at_least(SubscriptionTier::Premium),
        priority_support: at_least(SubscriptionTier::Premium),
        white_label: tier == SubscriptionTier::Enterprise,
        dedicated_account_manager: tier == SubscriptionTier::Enterprise,
    }
}

pub fn get_plan(tier: SubscriptionTier, cycle: BillingCycle, currency: &str) -> PricingPlan {
    PricingPlan {
        tier,
        billing_cycle: cycle,
        price: price(tier, cycle),
        monthly_price: monthly_price(tier),
        currency: currency.to_string(),
        trial_days: (tier == SubscriptionTier::Trial).then_some(TRIAL_DAYS),
        custom_pricing: tier == SubscriptionTier::Enterprise,
        features: features(tier),
        limits: limits(tier),
    }
}

pub fn all_plans(cycle: BillingCycle, currency: &str) -> Vec<PricingPlan> {
    SubscriptionTier::ALL
        .iter()
        .map(|tier| get_plan(*tier, cycle, currency))
        .collect()
}

/// Every tier strictly above `tier`, ascending
pub fn upgrade_paths(tier: SubscriptionTier) -> Vec<SubscriptionTier> {
    SubscriptionTier::ALL
        .iter()
        .copied()
        .filter(|t| *t > tier)
        .collect()
}

/// Amount owed for switching plans with `days_remaining` of `total_days` left.
/// Never negative; downgrades are not refunded.
pub fn proration(current: &PricingPlan, new: &PricingPlan, days_remaining: u32, total_days: u32) -> Decimal {
    if total_days == 0 {
        return Decimal::ZERO;
    }
    let total = Decimal::from(total_days);
    let remaining = Decimal::from(days_remaining.min(total_days));
    let current_daily = current.price / total;
    let new_daily = new.price / total;
    let owed = new_daily * remaining - current_daily * remaining;
    owed.max(Decimal::ZERO).round_dp(2)
}

/// Share of the limit consumed, clamped to `[0, 100]`; 0 for unlimited plans
pub fn usage_percentage(tier: SubscriptionTier, key: LimitKey, used: f64) -> f64 {
    let limit = limits(tier).get(key);
    if limit == UNLIMITED {
        return 0.0;
    }
    if limit == 0 {
        return if used > 0.0 { 100.0 } else { 0.0 };
    }
    (used / limit as f64 * 100.0).clamp(0.0, 100.0)
}

/// Cheapest paid tier under which every supplied usage value fits
pub fn recommended_tier<I>(usage: I) -> SubscriptionTier
where
    I: IntoIterator<Item = (LimitKey, f64)>,
{
    let usage: Vec<(LimitKey, f64)> = usage.into_iter().collect();
    SubscriptionTier::ALL
        .iter()
        .copied()
        .filter(|tier| *tier != SubscriptionTier::Trial)
        .find(|tier| {
            let plan_limits = limits(*tier);
            usage.iter().all(|(key, used)| plan_limits.allows(*key, *used))
        })
        .unwrap_or(SubscriptionTier::Enterprise)
}
