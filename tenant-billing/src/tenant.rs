//! Tenant identification, registry snapshots and onboarding.

use axum::{
    extract::{Request, State},
    http::{header::HOST, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::config::TenancyConfig;
use crate::error::{CoreError, Result};
use crate::gateway::CrossTenantGateway;
use crate::models::{Tenant, TenantSettings};
use crate::observability::Metrics;
use crate::prefix::ensure_unique_prefix;
use crate::store::{Filter, FindOptions, Patch};

pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Immutable, indexed view of every tenant
#[derive(Debug, Default)]
pub struct TenantRegistry {
    tenants: Vec<Tenant>,
    by_id: HashMap<String, usize>,
    by_slug: HashMap<String, usize>,
    by_prefix: HashMap<String, usize>,
    by_subdomain: HashMap<String, usize>,
    by_domain: HashMap<String, usize>,
}

impl TenantRegistry {
    pub fn new(tenants: Vec<Tenant>) -> Self {
        let mut registry = Self::default();
        for (i, tenant) in tenants.iter().enumerate() {
            registry.by_id.insert(tenant.id.clone(), i);
            registry.by_slug.insert(tenant.slug.to_ascii_lowercase(), i);
            registry.by_prefix.insert(tenant.prefix.to_ascii_uppercase(), i);
            if let Some(sub) = &tenant.subdomain {
                registry.by_subdomain.insert(sub.to_ascii_lowercase(), i);
            }
            if let Some(domain) = &tenant.domain {
                registry.by_domain.insert(domain.to_ascii_lowercase(), i);
            }
        }
        registry.tenants = tenants;
        registry
    }

    fn pick(&self, index: Option<&usize>) -> Option<&Tenant> {
        index.and_then(|i| self.tenants.get(*i))
    }

    pub fn by_id(&self, id: &str) -> Option<&Tenant> {
        self.pick(self.by_id.get(id))
    }

    pub fn by_slug(&self, slug: &str) -> Option<&Tenant> {
        self.pick(self.by_slug.get(&slug.to_ascii_lowercase()))
    }

    pub fn by_prefix(&self, prefix: &str) -> Option<&Tenant> {
        self.pick(self.by_prefix.get(&prefix.to_ascii_uppercase()))
    }

    pub fn by_subdomain(&self, subdomain: &str) -> Option<&Tenant> {
        self.pick(self.by_subdomain.get(&subdomain.to_ascii_lowercase()))
    }

    pub fn by_domain(&self, domain: &str) -> Option<&Tenant> {
        self.pick(self.by_domain.get(&domain.to_ascii_lowercase()))
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

/// Per-process registry snapshot, refreshed after a TTL or explicit invalidation
pub struct TenantRegistryCache {
    admin: CrossTenantGateway,
    ttl: Duration,
    current: RwLock<Option<(Instant, Arc<TenantRegistry>)>>,
}

impl TenantRegistryCache {
    pub fn new(admin: CrossTenantGateway, ttl: Duration) -> Self {
        Self {
            admin,
            ttl,
            current: RwLock::new(None),
        }
    }

    pub async fn snapshot(&self) -> Result<Arc<TenantRegistry>> {
        if let Some((loaded_at, registry)) = self.current.read().await.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(registry.clone());
            }
        }

        let mut current = self.current.write().await;
        // another task may have refreshed while we waited for the lock
        if let Some((loaded_at, registry)) = current.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(registry.clone());
            }
        }
        let tenants: Vec<Tenant> = self
            .admin
            .find_many(&Filter::All, &FindOptions::default())
            .await?;
        let registry = Arc::new(TenantRegistry::new(tenants));
        *current = Some((Instant::now(), registry.clone()));
        Ok(registry)
    }

    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Header,
    Subdomain,
    CustomDomain,
    None,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Header => "header",
            DetectionMethod::Subdomain => "subdomain",
            DetectionMethod::CustomDomain => "custom_domain",
            DetectionMethod::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TenantLookup {
    Found(Tenant),
    /// Matched a tenant whose `is_active` is false
    Inactive(Tenant),
    NotFound,
}

/// Outcome of identifying the tenant behind a request
#[derive(Debug, Clone, PartialEq)]
pub struct TenantResolution {
    pub lookup: TenantLookup,
    pub detection_method: DetectionMethod,
    /// The request addressed a tenant, so failing to find one is an error
    pub is_tenant_required: bool,
}

impl TenantResolution {
    pub fn platform() -> Self {
        Self {
            lookup: TenantLookup::NotFound,
            detection_method: DetectionMethod::None,
            is_tenant_required: false,
        }
    }

    /// The active tenant, if any
    pub fn tenant(&self) -> Option<&Tenant> {
        match &self.lookup {
            TenantLookup::Found(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self.lookup, TenantLookup::Inactive(_))
    }

    /// Inactive and unmatched tenant addresses become typed errors
    pub fn require(&self) -> Result<&Tenant> {
        match &self.lookup {
            TenantLookup::Found(t) => Ok(t),
            TenantLookup::Inactive(t) => Err(CoreError::Inactive {
                entity: "tenant",
                id: t.id.clone(),
            }),
            TenantLookup::NotFound => Err(CoreError::MissingTenantContext),
        }
    }
}

fn classify(tenant: Option<&Tenant>) -> TenantLookup {
    match tenant {
        Some(t) if t.is_active => TenantLookup::Found(t.clone()),
        Some(t) => TenantLookup::Inactive(t.clone()),
        None => TenantLookup::NotFound,
    }
}

/// Removes a `:port` suffix, keeping bare and bracketed IPv6 literals intact
pub fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn is_private_or_loopback(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || ip.is_unspecified() || (ip.segments()[0] & 0xfe00) == 0xfc00,
        Err(_) => false,
    }
}

/// Maps request host and headers to a tenant. Pure given the same registry snapshot.
#[derive(Debug, Clone)]
pub struct TenantResolver {
    main_domains: Vec<String>,
    reserved_subdomains: Vec<String>,
}

impl TenantResolver {
    pub fn new(config: &TenancyConfig) -> Self {
        Self {
            main_domains: config.main_domains.iter().map(|d| d.to_ascii_lowercase()).collect(),
            reserved_subdomains: config
                .reserved_subdomains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Whether `host` is a platform domain or one of its subdomains
    fn is_main_domain(&self, host: &str) -> bool {
        self.main_domains
            .iter()
            .any(|main| host == main || host.ends_with(&format!(".{main}")))
    }

    fn is_reserved(&self, label: &str) -> bool {
        self.reserved_subdomains.iter().any(|r| r == label)
    }

    /// Explicit identifier, tried as id, slug, prefix, subdomain then domain
    pub fn resolve_header(&self, registry: &TenantRegistry, value: &str) -> TenantLookup {
        let value = value.trim();
        let hit = registry
            .by_id(value)
            .or_else(|| registry.by_slug(value))
            .or_else(|| registry.by_prefix(value))
            .or_else(|| registry.by_subdomain(value))
            .or_else(|| registry.by_domain(value));
        classify(hit)
    }

    pub fn resolve(&self, registry: &TenantRegistry, host: Option<&str>, tenant_header: Option<&str>) -> TenantResolution {
        if let Some(value) = tenant_header.filter(|v| !v.trim().is_empty()) {
            return TenantResolution {
                lookup: self.resolve_header(registry, value),
                detection_method: DetectionMethod::Header,
                is_tenant_required: true,
            };
        }

        let Some(raw_host) = host else {
            return TenantResolution::platform();
        };
        let host = strip_port(raw_host).trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return TenantResolution::platform();
        }
        let is_ip = host.parse::<IpAddr>().is_ok();

        let labels: Vec<&str> = host.split('.').collect();
        if !is_ip && labels.len() >= 3 && !self.is_reserved(labels[0]) {
            let base = labels[1..].join(".");
            let lookup = classify(registry.by_subdomain(labels[0]));
            if lookup != TenantLookup::NotFound || self.is_main_domain(&base) {
                return TenantResolution {
                    lookup,
                    detection_method: DetectionMethod::Subdomain,
                    is_tenant_required: true,
                };
            }
            return TenantResolution {
                lookup: classify(registry.by_domain(&host)),
                detection_method: DetectionMethod::CustomDomain,
                is_tenant_required: true,
            };
        }

        let bare = host.strip_prefix("www.").unwrap_or(&host);
        if !self.is_main_domain(bare) && !is_private_or_loopback(bare) {
            let hit = registry.by_domain(&host).or_else(|| registry.by_domain(bare));
            return TenantResolution {
                lookup: classify(hit),
                detection_method: DetectionMethod::CustomDomain,
                is_tenant_required: true,
            };
        }

        TenantResolution::platform()
    }
}

/// Request for a new tenant
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OnboardTenant {
    pub name: String,
    pub subdomain: Option<String>,
    pub domain: Option<String>,
    pub settings: Option<TenantSettings>,
}

/// Lower-case, with runs of other characters collapsed to `-`
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Tenant lifecycle: onboarding, soft deactivation and settings
#[derive(Clone)]
pub struct TenantService {
    admin: CrossTenantGateway,
    cache: Arc<TenantRegistryCache>,
    resolver: Arc<TenantResolver>,
    reserved_subdomains: Vec<String>,
}

impl TenantService {
    pub fn new(admin: CrossTenantGateway, cache: Arc<TenantRegistryCache>, config: &TenancyConfig) -> Self {
        Self {
            admin,
            cache,
            resolver: Arc::new(TenantResolver::new(config)),
            reserved_subdomains: config.reserved_subdomains.clone(),
        }
    }

    pub fn resolver(&self) -> &TenantResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &Arc<TenantRegistryCache> {
        &self.cache
    }

    async fn taken(&self, field: &str, value: &str) -> Result<bool> {
        Ok(self.admin.count::<Tenant>(&Filter::eq(field, value)).await? > 0)
    }

    async fn unique_slug(&self, name: &str) -> Result<String> {
        let base = match slugify(name) {
            s if s.is_empty() => "tenant".to_string(),
            s => s,
        };
        if !self.taken("slug", &base).await? {
            return Ok(base);
        }
        for n in 2..=999 {
            let candidate = format!("{base}-{n}");
            if !self.taken("slug", &candidate).await? {
                return Ok(candidate);
            }
        }
        Err(CoreError::validation(format!("no free slug for '{name}'")))
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn onboard(&self, request: OnboardTenant) -> Result<Tenant> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("tenant name is required"));
        }

        let subdomain = request.subdomain.map(|s| s.trim().to_ascii_lowercase());
        if let Some(sub) = &subdomain {
            if !is_valid_label(sub) || self.reserved_subdomains.iter().any(|r| r == sub) {
                return Err(CoreError::validation(format!("subdomain '{sub}' is not allowed")));
            }
            if self.taken("subdomain", sub).await? {
                return Err(CoreError::validation(format!("subdomain '{sub}' is already in use")));
            }
        }

        let domain = request.domain.map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase());
        if let Some(domain) = &domain {
            let labels: Vec<&str> = domain.split('.').collect();
            if labels.len() < 2 || !labels.iter().all(|l| is_valid_label(l)) {
                return Err(CoreError::validation(format!("domain '{domain}' is malformed")));
            }
            if self.taken("domain", domain).await? {
                return Err(CoreError::validation(format!("domain '{domain}' is already in use")));
            }
        }

        let slug = self.unique_slug(name).await?;
        let prefix = ensure_unique_prefix(name, |candidate| async move {
            self.taken("prefix", &candidate).await
        })
        .await?;

        let mut tenant = Tenant::new(name.to_string(), slug, prefix);
        tenant.subdomain = subdomain;
        tenant.domain = domain;
        if let Some(settings) = request.settings {
            tenant.settings = settings;
        }

        self.admin.create(&tenant).await?;
        self.cache.invalidate().await;

        info!(
            tenant_id = %tenant.id,
            prefix = %tenant.prefix,
            slug = %tenant.slug,
            "Tenant onboarded"
        );
        Ok(tenant)
    }

    async fn load(&self, tenant_id: &str) -> Result<Tenant> {
        self.admin
            .find_by_id::<Tenant>(tenant_id)
            .await?
            .ok_or_else(|| CoreError::not_found("tenant", tenant_id))
    }

    async fn set_active(&self, tenant_id: &str, active: bool) -> Result<Tenant> {
        let mut tenant = self.load(tenant_id).await?;
        tenant.is_active = active;
        tenant.updated_at = Utc::now();
        let patch = Patch::new()
            .set("is_active", active)?
            .set("updated_at", tenant.updated_at)?;
        self.admin
            .update_many::<Tenant>(&Filter::eq("id", tenant_id), &patch)
            .await?;
        self.cache.invalidate().await;
        info!(tenant_id = tenant_id, active = active, "Tenant activation changed");
        Ok(tenant)
    }

    /// Soft delete; tenants are never removed
    pub async fn deactivate(&self, tenant_id: &str) -> Result<Tenant> {
        self.set_active(tenant_id, false).await
    }

    pub async fn reactivate(&self, tenant_id: &str) -> Result<Tenant> {
        self.set_active(tenant_id, true).await
    }

    pub async fn update_settings(&self, tenant_id: &str, mut settings: TenantSettings) -> Result<Tenant> {
        let mut tenant = self.load(tenant_id).await?;
        settings.version = TenantSettings::CURRENT_VERSION;
        tenant.settings = settings;
        tenant.updated_at = Utc::now();
        let patch = Patch::new()
            .set("settings", &tenant.settings)?
            .set("updated_at", tenant.updated_at)?;
        self.admin
            .update_many::<Tenant>(&Filter::eq("id", tenant_id), &patch)
            .await?;
        self.cache.invalidate().await;
        Ok(tenant)
    }

    /// Resolves against the cached registry. Registry failures degrade to a
    /// platform-level resolution with a warning.
    pub async fn resolve(&self, host: Option<&str>, tenant_header: Option<&str>) -> TenantResolution {
        match self.cache.snapshot().await {
            Ok(registry) => self.resolver.resolve(&registry, host, tenant_header),
            Err(e) => {
                warn!(error = %e, "Tenant registry unavailable, continuing without tenant context");
                TenantResolution::platform()
            }
        }
    }

    pub async fn find_by_prefix(&self, prefix: &str) -> Result<TenantLookup> {
        let registry = self.cache.snapshot().await?;
        Ok(classify(registry.by_prefix(prefix)))
    }

    pub async fn find_by_id(&self, tenant_id: &str) -> Result<TenantLookup> {
        let registry = self.cache.snapshot().await?;
        Ok(classify(registry.by_id(tenant_id)))
    }
}

/// State for [`tenant_context_middleware`]
#[derive(Clone)]
pub struct TenantContextState {
    pub tenants: TenantService,
    pub metrics: Metrics,
}

fn request_host(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(HOST))
        .and_then(|v| v.to_str().ok())
}

fn tenant_headers(resolution: &TenantResolution) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::new();
    let mut push = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.push((HeaderName::from_static(name), value));
        }
    };
    if let Some(tenant) = resolution.tenant() {
        push("x-tenant-id", &tenant.id);
        push("x-tenant-slug", &tenant.slug);
        push("x-tenant-name", &tenant.name);
        push("x-tenant-prefix", &tenant.prefix);
    }
    push("x-detection-method", resolution.detection_method.as_str());
    headers
}

/// Resolves the tenant for every request, stores the [`TenantResolution`] in
/// request extensions and echoes the tenant context in response headers.
pub async fn tenant_context_middleware(
    State(state): State<TenantContextState>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let host = request_host(headers).map(str::to_string);
    let explicit = headers
        .get(TENANT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let resolution = state.tenants.resolve(host.as_deref(), explicit.as_deref()).await;
    state
        .metrics
        .record_tenant_resolution(resolution.detection_method.as_str(), resolution.tenant().is_some());

    match &resolution.lookup {
        TenantLookup::Inactive(tenant) => {
            warn!(tenant_id = %tenant.id, "Request for inactive tenant");
            return CoreError::Inactive {
                entity: "tenant",
                id: tenant.id.clone(),
            }
            .into_response();
        }
        TenantLookup::NotFound if resolution.is_tenant_required => {
            warn!(host = ?host, method = resolution.detection_method.as_str(), "No tenant matches request");
            return CoreError::not_found("tenant", host.or(explicit).unwrap_or_default()).into_response();
        }
        _ => {}
    }

    let echoed = tenant_headers(&resolution);
    request.extensions_mut().insert(resolution);
    let mut response = next.run(request).await;
    response.headers_mut().extend(echoed);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str, prefix: &str, sub: Option<&str>, domain: Option<&str>, active: bool) -> Tenant {
        let mut t = Tenant::new(name.into(), slugify(name), prefix.into());
        t.subdomain = sub.map(str::to_string);
        t.domain = domain.map(str::to_string);
        t.is_active = active;
        t
    }

    fn fixture() -> (TenantResolver, TenantRegistry) {
        let config = TenancyConfig {
            main_domains: vec!["sekolah.id".into(), "localhost".into()],
            ..TenancyConfig::default()
        };
        let registry = TenantRegistry::new(vec![
            tenant("Pondok Maju", "PONDMAJU", Some("pondok"), Some("pondokmaju.sch.id"), true),
            tenant("Closed School", "CLOSED", Some("closed"), None, false),
        ]);
        (TenantResolver::new(&config), registry)
    }

    #[test]
    fn strips_ports_and_ipv6_brackets() {
        assert_eq!(strip_port("pondok.sekolah.id:8080"), "pondok.sekolah.id");
        assert_eq!(strip_port("[::1]:3000"), "::1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("localhost"), "localhost");
    }

    #[test]
    fn subdomain_detection() {
        let (resolver, registry) = fixture();
        let r = resolver.resolve(&registry, Some("pondok.sekolah.id:443"), None);
        assert_eq!(r.detection_method, DetectionMethod::Subdomain);
        assert_eq!(r.tenant().map(|t| t.prefix.as_str()), Some("PONDMAJU"));

        let missing = resolver.resolve(&registry, Some("nobody.sekolah.id"), None);
        assert_eq!(missing.lookup, TenantLookup::NotFound);
        assert!(missing.is_tenant_required);
    }

    #[test]
    fn reserved_subdomains_are_platform_requests() {
        let (resolver, registry) = fixture();
        let r = resolver.resolve(&registry, Some("api.sekolah.id"), None);
        assert_eq!(r, TenantResolution::platform());
        let r = resolver.resolve(&registry, Some("www.sekolah.id"), None);
        assert_eq!(r, TenantResolution::platform());
    }

    #[test]
    fn inactive_tenant_is_distinct_from_missing() {
        let (resolver, registry) = fixture();
        let r = resolver.resolve(&registry, Some("closed.sekolah.id"), None);
        assert!(r.is_inactive());
        assert!(matches!(r.require(), Err(CoreError::Inactive { .. })));
    }

    #[test]
    fn custom_domains_and_private_hosts() {
        let (resolver, registry) = fixture();
        let r = resolver.resolve(&registry, Some("www.pondokmaju.sch.id"), None);
        assert_eq!(r.detection_method, DetectionMethod::CustomDomain);
        assert!(r.tenant().is_some());

        assert_eq!(resolver.resolve(&registry, Some("192.168.1.10:3000"), None), TenantResolution::platform());
        assert_eq!(resolver.resolve(&registry, Some("localhost:3000"), None), TenantResolution::platform());
        assert_eq!(resolver.resolve(&registry, None, None), TenantResolution::platform());
    }

    #[test]
    fn header_takes_precedence_over_host() {
        let (resolver, registry) = fixture();
        let r = resolver.resolve(&registry, Some("closed.sekolah.id"), Some("pondmaju"));
        assert_eq!(r.detection_method, DetectionMethod::Header);
        assert_eq!(r.tenant().map(|t| t.slug.as_str()), Some("pondok-maju"));
    }

    #[test]
    fn slugs_collapse_punctuation() {
        assert_eq!(slugify("Al-Azhar  Islamic School!"), "al-azhar-islamic-school");
        assert_eq!(slugify("  SMA 1 "), "sma-1");
    }
}
