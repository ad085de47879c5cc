use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::AuthConfig;
use crate::error::{CoreError, Result};
use crate::gateway::{CrossTenantGateway, TenantGateway};
use crate::models::{Tenant, User, UserRole};
use crate::observability::Metrics;
use crate::prefix;
use crate::store::{Filter, FindOptions};
use crate::tenant::{TenantLookup, TenantResolution, TenantService};

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // Subject (user ID)
    pub username: String,
    pub role: UserRole,
    pub tenant_id: Option<String>,
    pub tenant_prefix: Option<String>,
    pub tenant_name: Option<String>,
    pub requires_2fa: bool,
    pub exp: i64, // Expiration time
    pub iat: i64, // Issued at
    pub iss: String,
}

/// Authenticated identity carried through a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
    pub role: UserRole,
    pub tenant_id: Option<String>,
    pub tenant_prefix: Option<String>,
    pub tenant_name: Option<String>,
    /// A second factor is required; enforcing it happens elsewhere
    pub requires_2fa: bool,
}

impl Principal {
    pub fn is_platform(&self) -> bool {
        self.role.is_platform_role()
    }
}

/// Where the login came from, used to pick the tenant
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginHints {
    pub tenant_id: Option<String>,
    pub host: Option<String>,
    pub tenant_header: Option<String>,
}

/// Data access granted to the authenticated caller
#[derive(Debug, Clone)]
pub enum RequestScope {
    Tenant(TenantGateway),
    Platform(CrossTenantGateway),
}

impl RequestScope {
    /// Tenant gateway for tenant-owned operations. Platform callers must name the tenant.
    pub fn tenant_gateway(&self, explicit_tenant: Option<&str>) -> Result<TenantGateway> {
        match (self, explicit_tenant) {
            (RequestScope::Tenant(gateway), None) => Ok(gateway.clone()),
            (RequestScope::Tenant(gateway), Some(id)) if id == gateway.tenant_id() => Ok(gateway.clone()),
            (RequestScope::Tenant(gateway), Some(id)) => {
                warn!(bound = gateway.tenant_id(), requested = id, "Cross-tenant access refused");
                Err(CoreError::not_found("tenant", id))
            }
            (RequestScope::Platform(admin), Some(id)) => Ok(admin.for_tenant(id)),
            (RequestScope::Platform(_), None) => Err(CoreError::MissingTenantContext),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub token: String,
    pub expires_at: i64,
    pub principal: Principal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,
}

/// Salt and digest of a hash no password maps to; checked against when there is
/// no usable user so every failed login pays for one bcrypt verification
const UNMATCHABLE_HASH: &str = "abcdefghijklmnopqrstuu0123456789abcdefghijklmnopqrst.";

fn unmatchable_hash(cost: u32) -> String {
    format!("$2b${cost:02}${UNMATCHABLE_HASH}")
}

/// Authentication service
#[derive(Clone)]
pub struct AuthService {
    admin: CrossTenantGateway,
    tenants: TenantService,
    metrics: Metrics,
    jwt_secret: String,
    session_hours: i64,
    issuer: String,
    bcrypt_cost: u32,
    unmatchable_hash: String,
}

impl AuthService {
    pub fn new(admin: CrossTenantGateway, tenants: TenantService, metrics: Metrics, config: &AuthConfig) -> Self {
        Self {
            admin,
            tenants,
            metrics,
            jwt_secret: config.jwt_secret.clone(),
            session_hours: config.session_hours,
            issuer: config.issuer.clone(),
            bcrypt_cost: DEFAULT_COST,
            unmatchable_hash: unmatchable_hash(DEFAULT_COST),
        }
    }

    /// Overrides the bcrypt work factor
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self.unmatchable_hash = unmatchable_hash(cost);
        self
    }

    pub fn admin(&self) -> &CrossTenantGateway {
        &self.admin
    }

    pub fn tenants(&self) -> &TenantService {
        &self.tenants
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Creates a user in `tenant`, storing the username tenant-prefixed when
    /// the tenant's settings ask for it
    #[instrument(skip(self, gateway, tenant, request), fields(tenant_id = %tenant.id, username = %request.username))]
    pub async fn create_user(&self, gateway: &TenantGateway, tenant: &Tenant, request: CreateUser) -> Result<User> {
        if gateway.tenant_id() != tenant.id {
            return Err(CoreError::validation("gateway and tenant disagree"));
        }
        if !prefix::is_valid_username(&request.username) {
            return Err(CoreError::validation(format!("invalid username '{}'", request.username)));
        }
        if !request.email.contains('@') {
            return Err(CoreError::validation("invalid email"));
        }
        if request.password.len() < 8 {
            return Err(CoreError::validation("password must be at least 8 characters"));
        }
        if request.role.is_platform_role() {
            return Err(CoreError::validation("platform roles are not created through a tenant"));
        }

        let parsed = prefix::parse(&request.username);
        let own_prefix = parsed.prefix.as_deref() == Some(tenant.prefix.as_str());
        if let Some(candidate) = parsed.prefix.as_deref().filter(|_| !own_prefix) {
            // a plain name that reads as another tenant's prefix would log in there
            if !matches!(self.tenants.find_by_prefix(candidate).await?, TenantLookup::NotFound) {
                return Err(CoreError::validation(format!(
                    "username '{}' starts with another organization's prefix",
                    request.username
                )));
            }
        }

        let username = if tenant.settings.prefixed_usernames && !own_prefix {
            prefix::encode(&tenant.prefix, &request.username)?
        } else {
            request.username.clone()
        };

        let password_hash = hash(&request.password, self.bcrypt_cost)
            .map_err(|e| CoreError::validation(format!("password could not be hashed: {e}")))?;
        let user = User::new(tenant.id.clone(), username, request.email, password_hash, request.role);
        gateway.create(&user).await?;

        info!(user_id = %user.id, stored_username = %user.username, "User created");
        Ok(user)
    }

    /// Tenant the login request points at, before looking at the username
    async fn detect_tenant(&self, hints: &LoginHints) -> Result<Option<Tenant>> {
        let lookup = match &hints.tenant_id {
            Some(id) => self.tenants.find_by_id(id).await?,
            None => {
                self.tenants
                    .resolve(hints.host.as_deref(), hints.tenant_header.as_deref())
                    .await
                    .lookup
            }
        };
        match lookup {
            TenantLookup::Found(t) => Ok(Some(t)),
            TenantLookup::Inactive(t) => Err(CoreError::Inactive {
                entity: "tenant",
                id: t.id,
            }),
            TenantLookup::NotFound => Ok(None),
        }
    }

    async fn find_user(&self, username: &str, detected: Option<&Tenant>) -> Result<Option<(User, Option<Tenant>)>> {
        let parsed = prefix::parse(username);
        let by_login = |name: &str| Filter::eq("username", name).or(Filter::eq("email", name));

        if let Some(code) = parsed.prefix.as_deref() {
            match self.tenants.find_by_prefix(code).await? {
                TenantLookup::Found(tenant) => {
                    let filter = by_login(username).or(Filter::eq("username", parsed.rest.as_str()));
                    let user = self.admin.for_tenant(tenant.id.clone()).find_first::<User>(&filter).await?;
                    return Ok(user.map(|u| (u, Some(tenant))));
                }
                TenantLookup::Inactive(tenant) => {
                    return Err(CoreError::Inactive {
                        entity: "tenant",
                        id: tenant.id,
                    })
                }
                // not a known prefix: an ordinary username containing '_'
                TenantLookup::NotFound => {}
            }
        }

        if let Some(tenant) = detected {
            let user = self
                .admin
                .for_tenant(tenant.id.clone())
                .find_first::<User>(&by_login(username))
                .await?;
            return Ok(user.map(|u| (u, Some(tenant.clone()))));
        }

        // platform-level login: no tenant narrows the search
        let mut candidates = self
            .admin
            .find_many::<User>(&by_login(username), &FindOptions::default().limit(10))
            .await?;
        let user = if candidates.len() == 1 {
            candidates.pop()
        } else {
            let platform: Vec<User> = candidates.into_iter().filter(|u| u.role.is_platform_role()).collect();
            if platform.len() == 1 {
                platform.into_iter().next()
            } else {
                debug!(username = username, "Ambiguous platform-level login");
                None
            }
        };
        let Some(user) = user else { return Ok(None) };
        let tenant = match self.tenants.find_by_id(&user.tenant_id).await? {
            TenantLookup::Found(t) => Some(t),
            TenantLookup::Inactive(t) if !user.role.is_platform_role() => {
                return Err(CoreError::Inactive {
                    entity: "tenant",
                    id: t.id,
                })
            }
            _ => None,
        };
        Ok(Some((user, tenant)))
    }

    /// Verifies credentials. Every credential failure is the same `InvalidCredentials`.
    #[instrument(skip(self, password, hints), fields(username = username))]
    pub async fn authenticate(&self, username: &str, password: &str, hints: &LoginHints) -> Result<Principal> {
        let outcome = self.authenticate_inner(username, password, hints).await;
        self.metrics.record_auth_attempt(outcome.is_ok());
        outcome
    }

    async fn authenticate_inner(&self, username: &str, password: &str, hints: &LoginHints) -> Result<Principal> {
        let detected = self.detect_tenant(hints).await?;
        let Some((user, tenant)) = self.find_user(username, detected.as_ref()).await? else {
            let _ = verify(password, &self.unmatchable_hash);
            warn!("Login failed");
            return Err(CoreError::InvalidCredentials);
        };
        if !user.is_active {
            let _ = verify(password, &self.unmatchable_hash);
            warn!(user_id = %user.id, "Login failed");
            return Err(CoreError::InvalidCredentials);
        }
        if !verify(password, &user.password_hash).unwrap_or(false) {
            warn!(user_id = %user.id, "Login failed");
            return Err(CoreError::InvalidCredentials);
        }

        info!(user_id = %user.id, tenant_id = %user.tenant_id, "Login succeeded");
        Ok(Principal {
            user_id: user.id,
            username: user.username,
            role: user.role,
            tenant_id: Some(user.tenant_id),
            tenant_prefix: tenant.as_ref().map(|t| t.prefix.clone()),
            tenant_name: tenant.map(|t| t.name),
            requires_2fa: user.two_factor_enabled,
        })
    }

    /// Signs a session token for `principal`
    pub fn issue_session(&self, principal: &Principal) -> Result<Session> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.session_hours);

        let claims = Claims {
            sub: principal.user_id.clone(),
            username: principal.username.clone(),
            role: principal.role,
            tenant_id: principal.tenant_id.clone(),
            tenant_prefix: principal.tenant_prefix.clone(),
            tenant_name: principal.tenant_name.clone(),
            requires_2fa: principal.requires_2fa,
            exp: exp.timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_ref()),
        )
        .map_err(|e| CoreError::Config(format!("session signing failed: {e}")))?;

        Ok(Session {
            token,
            expires_at: claims.exp,
            principal: principal.clone(),
        })
    }

    /// Rebuilds the principal from a session token
    pub async fn validate_session(&self, token: &str) -> Result<Principal> {
        let mut validation = Validation::default();
        validation.set_issuer(&[self.issuer.as_str()]);
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_ref()),
            &validation,
        )
        .map_err(|e| {
            debug!(error = %e, "Session token rejected");
            CoreError::InvalidCredentials
        })?
        .claims;

        if let Some(tenant_id) = &claims.tenant_id {
            if let TenantLookup::Inactive(t) = self.tenants.find_by_id(tenant_id).await? {
                if !claims.role.is_platform_role() {
                    return Err(CoreError::Inactive {
                        entity: "tenant",
                        id: t.id,
                    });
                }
            }
        }

        Ok(Principal {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role,
            tenant_id: claims.tenant_id,
            tenant_prefix: claims.tenant_prefix,
            tenant_name: claims.tenant_name,
            requires_2fa: claims.requires_2fa,
        })
    }

    /// Platform roles get the cross-tenant gateway, everyone else their own tenant
    pub fn scope_for(&self, principal: &Principal) -> Result<RequestScope> {
        if principal.is_platform() {
            return Ok(RequestScope::Platform(self.admin.clone()));
        }
        match principal.tenant_id.as_deref() {
            Some(tenant_id) => Ok(RequestScope::Tenant(self.admin.for_tenant(tenant_id))),
            None => {
                self.metrics.record_missing_tenant_context("request_scope");
                Err(CoreError::MissingTenantContext)
            }
        }
    }
}

/// Extract the bearer token from request headers
pub fn extract_auth_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Middleware for bearer-token authentication
pub async fn bearer_auth_middleware(
    State(auth_service): State<AuthService>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(token) = extract_auth_header(request.headers()).map(str::to_string) else {
        debug!("Missing or invalid authorization header");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let principal = match auth_service.validate_session(&token).await {
        Ok(principal) => principal,
        Err(CoreError::Inactive { .. }) => {
            warn!("Session for inactive tenant");
            return Err(StatusCode::FORBIDDEN);
        }
        Err(e) => {
            debug!(error = %e, "Authentication failed");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    // a tenant user may only act on the tenant the request was addressed to
    if let Some(resolved) = request.extensions().get::<TenantResolution>().and_then(|r| r.tenant()) {
        if !principal.is_platform() && principal.tenant_id.as_deref() != Some(resolved.id.as_str()) {
            warn!(
                user_id = %principal.user_id,
                resolved_tenant = %resolved.id,
                "Session used against another tenant"
            );
            return Err(StatusCode::FORBIDDEN);
        }
    }

    let scope = auth_service.scope_for(&principal).map_err(|_| StatusCode::FORBIDDEN)?;
    request.extensions_mut().insert(principal);
    request.extensions_mut().insert(scope);
    Ok(next.run(request).await)
}

/// Middleware admitting only `SUPER_ADMIN` and `SYSTEM_ADMIN`
pub async fn require_platform_role(request: Request, next: Next) -> Result<Response, StatusCode> {
    match request.extensions().get::<Principal>() {
        Some(principal) if principal.is_platform() => Ok(next.run(request).await),
        Some(principal) => {
            warn!(user_id = %principal.user_id, role = ?principal.role, "Platform route refused");
            Err(StatusCode::FORBIDDEN)
        }
        None => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenancyConfig;
    use crate::store::{MemoryStore, Store};
    use crate::tenant::{OnboardTenant, TenantRegistryCache};
    use std::sync::Arc;

    async fn fixture() -> (AuthService, Tenant) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let admin = CrossTenantGateway::new(store);
        let config = TenancyConfig::default();
        let cache = Arc::new(TenantRegistryCache::new(admin.clone(), std::time::Duration::from_secs(60)));
        let tenants = TenantService::new(admin.clone(), cache, &config);
        let tenant = tenants
            .onboard(OnboardTenant {
                name: "Pondok Maju".into(),
                subdomain: Some("pondok".into()),
                domain: None,
                settings: None,
            })
            .await
            .unwrap();
        let auth = AuthService::new(
            admin,
            tenants,
            Metrics::new().unwrap(),
            &AuthConfig {
                jwt_secret: "test-secret".into(),
                session_hours: 1,
                issuer: "tenant-billing".into(),
            },
        )
        .with_bcrypt_cost(4);
        (auth, tenant)
    }

    fn new_user(username: &str) -> CreateUser {
        CreateUser {
            username: username.into(),
            email: format!("{username}@pondok.id"),
            password: "rahasia123".into(),
            role: UserRole::Teacher,
        }
    }

    #[tokio::test]
    async fn prefixed_login_finds_the_tenant() {
        let (auth, tenant) = fixture().await;
        let gateway = auth.admin().for_tenant(tenant.id.clone());
        let user = auth.create_user(&gateway, &tenant, new_user("budi")).await.unwrap();
        assert_eq!(user.username, format!("{}_budi", tenant.prefix));

        let principal = auth
            .authenticate(&user.username, "rahasia123", &LoginHints::default())
            .await
            .unwrap();
        assert_eq!(principal.tenant_id.as_deref(), Some(tenant.id.as_str()));
        assert_eq!(principal.tenant_prefix.as_deref(), Some(tenant.prefix.as_str()));
    }

    #[tokio::test]
    async fn credential_failures_are_indistinguishable() {
        let (auth, tenant) = fixture().await;
        let gateway = auth.admin().for_tenant(tenant.id.clone());
        let user = auth.create_user(&gateway, &tenant, new_user("siti")).await.unwrap();

        let wrong_password = auth
            .authenticate(&user.username, "nope-nope", &LoginHints::default())
            .await
            .unwrap_err();
        let unknown_user = auth
            .authenticate("ghost", "rahasia123", &LoginHints::default())
            .await
            .unwrap_err();
        assert_eq!(wrong_password.to_string(), unknown_user.to_string());
        assert!(matches!(wrong_password, CoreError::InvalidCredentials));
    }

    #[tokio::test]
    async fn session_round_trip() {
        let (auth, tenant) = fixture().await;
        let gateway = auth.admin().for_tenant(tenant.id.clone());
        let user = auth.create_user(&gateway, &tenant, new_user("ani")).await.unwrap();
        let principal = auth
            .authenticate(&user.username, "rahasia123", &LoginHints::default())
            .await
            .unwrap();

        let session = auth.issue_session(&principal).unwrap();
        let restored = auth.validate_session(&session.token).await.unwrap();
        assert_eq!(restored, principal);
        assert!(auth.validate_session("not-a-token").await.is_err());
    }

    #[tokio::test]
    async fn failed_lookups_still_run_a_full_cost_verify() {
        let (auth, tenant) = fixture().await;
        let gateway = auth.admin().for_tenant(tenant.id.clone());
        let user = auth.create_user(&gateway, &tenant, new_user("dewi")).await.unwrap();

        // same algorithm and work factor as a stored hash, and never a match
        assert_eq!(&auth.unmatchable_hash[..7], &user.password_hash[..7]);
        assert!(!verify("rahasia123", &auth.unmatchable_hash).unwrap());
        assert!(!verify("", &unmatchable_hash(DEFAULT_COST)).unwrap());
    }

    #[tokio::test]
    async fn foreign_prefix_usernames_are_rejected() {
        let (auth, tenant) = fixture().await;
        let other = auth
            .tenants()
            .onboard(OnboardTenant {
                name: "Sekolah Lain".into(),
                subdomain: None,
                domain: None,
                settings: None,
            })
            .await
            .unwrap();
        let gateway = auth.admin().for_tenant(tenant.id.clone());
        let err = auth
            .create_user(&gateway, &tenant, new_user(&format!("{}_joko", other.prefix)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }

    #[test]
    fn bearer_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(extract_auth_header(&headers), Some("abc"));
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_auth_header(&headers), None);
    }
}
