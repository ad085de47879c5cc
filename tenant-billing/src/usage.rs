//! Per-tenant usage measurement and limit enforcement.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CoreError, LimitExceeded, Result};
use crate::gateway::TenantGateway;
use crate::models::{
    CustomField, FileAsset, Student, Subscription, SubscriptionStatus, SubscriptionTier, Teacher,
    UsageLog, UsageType,
};
use crate::observability::Metrics;
use crate::pricing::{self, LimitKey, UNLIMITED};
use crate::store::{Filter, FindOptions};

/// Storage is estimated from the file count at this average size
pub const AVERAGE_FILE_SIZE_MB: f64 = 2.0;

/// Point-in-time usage of one tenant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub students: f64,
    pub teachers: f64,
    pub storage_used_gb: f64,
    pub api_calls_this_month: f64,
    pub sms_used_this_month: f64,
    pub emails_used_this_month: f64,
    pub reports_generated_this_month: f64,
    pub custom_fields_used: f64,
    pub last_updated: DateTime<Utc>,
}

impl UsageSnapshot {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            students: 0.0,
            teachers: 0.0,
            storage_used_gb: 0.0,
            api_calls_this_month: 0.0,
            sms_used_this_month: 0.0,
            emails_used_this_month: 0.0,
            reports_generated_this_month: 0.0,
            custom_fields_used: 0.0,
            last_updated: now,
        }
    }

    pub fn get(&self, key: LimitKey) -> f64 {
        match key {
            LimitKey::MaxStudents => self.students,
            LimitKey::MaxTeachers => self.teachers,
            LimitKey::MaxStorageGb => self.storage_used_gb,
            LimitKey::MaxApiCallsPerMonth => self.api_calls_this_month,
            LimitKey::MaxSmsPerMonth => self.sms_used_this_month,
            LimitKey::MaxEmailsPerMonth => self.emails_used_this_month,
            LimitKey::MaxReportsPerMonth => self.reports_generated_this_month,
            LimitKey::MaxCustomFields => self.custom_fields_used,
        }
    }

    pub fn set(&mut self, key: LimitKey, value: f64) {
        let slot = match key {
            LimitKey::MaxStudents => &mut self.students,
            LimitKey::MaxTeachers => &mut self.teachers,
            LimitKey::MaxStorageGb => &mut self.storage_used_gb,
            LimitKey::MaxApiCallsPerMonth => &mut self.api_calls_this_month,
            LimitKey::MaxSmsPerMonth => &mut self.sms_used_this_month,
            LimitKey::MaxEmailsPerMonth => &mut self.emails_used_this_month,
            LimitKey::MaxReportsPerMonth => &mut self.reports_generated_this_month,
            LimitKey::MaxCustomFields => &mut self.custom_fields_used,
        };
        *slot = value;
    }

    pub fn pairs(&self) -> Vec<(LimitKey, f64)> {
        LimitKey::ALL.iter().map(|k| (*k, self.get(*k))).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// LOW [50,70), MEDIUM [70,80), HIGH [80,90), CRITICAL from 90
    pub fn classify(percentage: f64) -> Option<Severity> {
        match percentage {
            p if p >= 90.0 => Some(Severity::Critical),
            p if p >= 80.0 => Some(Severity::High),
            p if p >= 70.0 => Some(Severity::Medium),
            p if p >= 50.0 => Some(Severity::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageWarning {
    pub limit: LimitKey,
    pub current: f64,
    pub limit_value: i64,
    pub percentage: f64,
    pub severity: Severity,
    pub message: String,
}

/// Result of comparing a snapshot to the tenant's plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitCheck {
    pub tier: SubscriptionTier,
    pub is_within_limits: bool,
    pub exceeded_limits: Vec<LimitKey>,
    pub warnings: Vec<UsageWarning>,
    pub blocked_operations: Vec<String>,
    pub recommended_tier: Option<SubscriptionTier>,
    pub usage: UsageSnapshot,
}

/// Pure limit evaluation
pub fn evaluate(tier: SubscriptionTier, usage: &UsageSnapshot) -> LimitCheck {
    let limits = pricing::limits(tier);
    let mut exceeded_limits = Vec::new();
    let mut warnings = Vec::new();
    let mut blocked_operations: Vec<String> = Vec::new();

    for key in LimitKey::ALL {
        let limit = limits.get(key);
        if limit == UNLIMITED {
            continue;
        }
        let current = usage.get(key);
        if current > limit as f64 {
            exceeded_limits.push(key);
            blocked_operations.extend(key.blocked_operations().iter().map(|op| op.to_string()));
            continue;
        }
        let percentage = pricing::usage_percentage(tier, key, current);
        if let Some(severity) = Severity::classify(percentage) {
            warnings.push(UsageWarning {
                limit: key,
                current,
                limit_value: limit,
                percentage,
                severity,
                message: format!("{key} at {percentage:.0}% of plan limit ({current}/{limit})"),
            });
        }
    }

    let recommended_tier = if exceeded_limits.is_empty() {
        None
    } else {
        Some(pricing::recommended_tier(usage.pairs())).filter(|t| *t > tier)
    };

    LimitCheck {
        tier,
        is_within_limits: exceeded_limits.is_empty(),
        exceeded_limits,
        warnings,
        blocked_operations,
        recommended_tier,
        usage: usage.clone(),
    }
}

pub fn limit_key_for(usage_type: UsageType) -> LimitKey {
    match usage_type {
        UsageType::ApiCall => LimitKey::MaxApiCallsPerMonth,
        UsageType::Sms => LimitKey::MaxSmsPerMonth,
        UsageType::Email => LimitKey::MaxEmailsPerMonth,
        UsageType::Report => LimitKey::MaxReportsPerMonth,
    }
}

fn usage_type_for(key: LimitKey) -> Option<UsageType> {
    match key {
        LimitKey::MaxApiCallsPerMonth => Some(UsageType::ApiCall),
        LimitKey::MaxSmsPerMonth => Some(UsageType::Sms),
        LimitKey::MaxEmailsPerMonth => Some(UsageType::Email),
        LimitKey::MaxReportsPerMonth => Some(UsageType::Report),
        _ => None,
    }
}

pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn usage_type_name(usage_type: UsageType) -> &'static str {
    match usage_type {
        UsageType::ApiCall => "API_CALL",
        UsageType::Sms => "SMS",
        UsageType::Email => "EMAIL",
        UsageType::Report => "REPORT",
    }
}

/// Measures usage through a tenant gateway and gates limited operations
#[derive(Clone)]
pub struct UsageMonitor {
    metrics: Metrics,
}

impl UsageMonitor {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }

    /// Tier of the tenant's live subscription; tenants without one run on TRIAL limits
    pub async fn current_tier(&self, gateway: &TenantGateway) -> Result<SubscriptionTier> {
        let live = Filter::one_of(
            "status",
            SubscriptionStatus::LIVE.iter().map(|s| s.as_str()),
        );
        let subscription: Option<Subscription> = gateway
            .find_many(&live, &FindOptions::newest_first("created_at").limit(1))
            .await?
            .into_iter()
            .next();
        Ok(subscription
            .map(|s| s.tier)
            .unwrap_or(SubscriptionTier::Trial))
    }

    async fn measure(&self, gateway: &TenantGateway, key: LimitKey, now: DateTime<Utc>) -> Result<f64> {
        let active = Filter::eq("is_active", true);
        let value = match key {
            LimitKey::MaxStudents => gateway.count::<Student>(&active).await? as f64,
            LimitKey::MaxTeachers => gateway.count::<Teacher>(&active).await? as f64,
            LimitKey::MaxStorageGb => {
                let files = gateway.count::<FileAsset>(&Filter::All).await? as f64;
                files * AVERAGE_FILE_SIZE_MB / 1024.0
            }
            LimitKey::MaxCustomFields => gateway.count::<CustomField>(&Filter::All).await? as f64,
            metered => {
                let Some(usage_type) = usage_type_for(metered) else {
                    return Ok(0.0);
                };
                let filter = Filter::eq("usage_type", usage_type_name(usage_type))
                    .and(Filter::gte("created_at", month_start(now)));
                gateway.sum::<UsageLog>("quantity", &filter).await?
            }
        };
        Ok(value)
    }

    /// One counter; an unavailable source counts as zero
    async fn measure_or_zero(&self, gateway: &TenantGateway, key: LimitKey, now: DateTime<Utc>) -> f64 {
        match self.measure(gateway, key, now).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    tenant_id = gateway.tenant_id(),
                    limit = %key,
                    error = %e,
                    "Usage counter unavailable, treating as zero"
                );
                0.0
            }
        }
    }

    /// Recomputed snapshot; never fails
    pub async fn current_usage(&self, gateway: &TenantGateway, now: DateTime<Utc>) -> UsageSnapshot {
        let mut snapshot = UsageSnapshot::empty(now);
        for key in LimitKey::ALL {
            let value = self.measure_or_zero(gateway, key, now).await;
            snapshot.set(key, value);
        }
        snapshot
    }

    pub async fn check_limits(&self, gateway: &TenantGateway, now: DateTime<Utc>) -> Result<LimitCheck> {
        let tier = self.current_tier(gateway).await?;
        let usage = self.current_usage(gateway, now).await;
        Ok(evaluate(tier, &usage))
    }

    /// Cheap gate: measures only the one counter. Allowed while below the limit.
    pub async fn enforce(&self, gateway: &TenantGateway, key: LimitKey, now: DateTime<Utc>) -> Result<bool> {
        let limit = pricing::limits(self.current_tier(gateway).await?).get(key);
        if limit == UNLIMITED {
            return Ok(true);
        }
        let current = self.measure_or_zero(gateway, key, now).await;
        Ok(current < limit as f64)
    }

    /// Fails with `UsageLimitExceeded` when adding `requested` would pass the limit
    pub async fn require(
        &self,
        gateway: &TenantGateway,
        key: LimitKey,
        requested: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tier = self.current_tier(gateway).await?;
        let limit = pricing::limits(tier).get(key);
        if limit == UNLIMITED {
            return Ok(());
        }
        let current = self.measure_or_zero(gateway, key, now).await;
        if current + requested as f64 <= limit as f64 {
            return Ok(());
        }

        self.metrics.record_usage_block(key.as_str(), gateway.tenant_id());
        let mut projected = UsageSnapshot::empty(now);
        projected.set(key, current + requested as f64);
        let recommended_tier = Some(pricing::recommended_tier([(key, projected.get(key))])).filter(|t| *t > tier);
        warn!(
            tenant_id = gateway.tenant_id(),
            limit = %key,
            current = current,
            limit_value = limit,
            requested = requested,
            "Usage limit reached"
        );
        Err(CoreError::UsageLimitExceeded(Box::new(LimitExceeded {
            limit: key,
            current,
            limit_value: limit,
            requested,
            recommended_tier,
        })))
    }

    /// Records metered usage after re-checking the limit
    pub async fn track(
        &self,
        gateway: &TenantGateway,
        usage_type: UsageType,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if delta <= 0 {
            return Err(CoreError::validation("usage delta must be positive"));
        }
        self.require(gateway, limit_key_for(usage_type), delta, now).await?;
        let log = UsageLog::new(gateway.tenant_id().to_string(), usage_type, delta, now);
        gateway.create(&log).await?;
        info!(
            tenant_id = gateway.tenant_id(),
            usage_type = usage_type_name(usage_type),
            delta = delta,
            "Usage tracked"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(key: LimitKey, value: f64) -> UsageSnapshot {
        let mut s = UsageSnapshot::empty(Utc::now());
        s.set(key, value);
        s
    }

    #[test]
    fn severity_bands() {
        assert_eq!(Severity::classify(49.9), None);
        assert_eq!(Severity::classify(50.0), Some(Severity::Low));
        assert_eq!(Severity::classify(75.0), Some(Severity::Medium));
        assert_eq!(Severity::classify(85.0), Some(Severity::High));
        assert_eq!(Severity::classify(95.0), Some(Severity::Critical));
    }

    #[test]
    fn low_usage_has_no_warnings() {
        let check = evaluate(SubscriptionTier::Trial, &snapshot_with(LimitKey::MaxStudents, 40.0));
        assert!(check.is_within_limits);
        assert!(check.warnings.is_empty());
        assert!(check.recommended_tier.is_none());
    }

    #[test]
    fn exceeded_limit_blocks_operations() {
        let check = evaluate(SubscriptionTier::Basic, &snapshot_with(LimitKey::MaxStudents, 600.0));
        assert!(!check.is_within_limits);
        assert_eq!(check.exceeded_limits, vec![LimitKey::MaxStudents]);
        assert!(check.blocked_operations.contains(&"CREATE_STUDENT".to_string()));
        assert!(check.blocked_operations.contains(&"IMPORT_STUDENTS".to_string()));
        assert_eq!(check.recommended_tier, Some(SubscriptionTier::Standard));
    }

    #[test]
    fn at_limit_is_warning_not_exceeded() {
        let check = evaluate(SubscriptionTier::Basic, &snapshot_with(LimitKey::MaxTeachers, 50.0));
        assert!(check.is_within_limits);
        assert_eq!(check.warnings[0].severity, Severity::Critical);
    }

    #[test]
    fn enterprise_never_warns() {
        let check = evaluate(SubscriptionTier::Enterprise, &snapshot_with(LimitKey::MaxStudents, 1e9));
        assert!(check.is_within_limits);
        assert!(check.warnings.is_empty());
    }

    #[test]
    fn month_start_is_first_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 17, 13, 5, 0).unwrap();
        assert_eq!(month_start(now), Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
    }
}
