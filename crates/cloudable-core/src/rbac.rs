//! Identity & RBAC resolver.
//!
//! Maps an opaque caller token to a [`Principal`] (tenant, optional customer scope, role) and
//! checks operations against a static `role -> permitted operations` table. Tenant and customer
//! identifiers found in a request body are never used to authorize; they are only cross-checked
//! against the resolved principal, and a mismatch is a `CrossTenantViolation`.
//!
//! | Role | Upload | Sync | Query | Chat | StatusRead | StatusWrite | StatusAdminWrite |
//! |------|:------:|:----:|:-----:|:----:|:----------:|:-----------:|:----------------:|
//! | TenantAdmin | x | x | x | x | x | x | x |
//! | CustomerUser | x | | x | x | x | x | |
//! | ServiceAccount | x | x | x | | x | x | |

use crate::config::IdentityEntry;
use crate::error::{ApiError, ApiResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Header carrying `Bearer <token>`.
pub const AUTHORIZATION_HEADER: &str = "authorization";
/// Alternative header carrying the raw token.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Optional tenant claim; must agree with the resolved principal.
pub const TENANT_CLAIM_HEADER: &str = "x-tenant-id";

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,20}$").expect("static identifier pattern"));

/// Validates tenant and customer identifiers (`[A-Za-z0-9_-]{1,20}`).
pub fn validate_identifier(label: &str, value: &str) -> ApiResult<()> {
    if IDENTIFIER_RE.is_match(value) {
        Ok(())
    } else {
        Err(ApiError::InvalidRequest(format!("invalid {} format", label)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    TenantAdmin,
    CustomerUser,
    ServiceAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Upload,
    Sync,
    Query,
    Chat,
    StatusRead,
    StatusWrite,
    StatusAdminWrite,
    UsageRead,
}

const TENANT_ADMIN_OPS: &[Operation] = &[
    Operation::Upload,
    Operation::Sync,
    Operation::Query,
    Operation::Chat,
    Operation::StatusRead,
    Operation::StatusWrite,
    Operation::StatusAdminWrite,
    Operation::UsageRead,
];

const CUSTOMER_USER_OPS: &[Operation] = &[
    Operation::Upload,
    Operation::Query,
    Operation::Chat,
    Operation::StatusRead,
    Operation::StatusWrite,
];

const SERVICE_ACCOUNT_OPS: &[Operation] = &[
    Operation::Upload,
    Operation::Sync,
    Operation::Query,
    Operation::StatusRead,
    Operation::StatusWrite,
];

impl Role {
    /// The static permission set for this role.
    pub fn permissions(&self) -> &'static [Operation] {
        match self {
            Role::TenantAdmin => TENANT_ADMIN_OPS,
            Role::CustomerUser => CUSTOMER_USER_OPS,
            Role::ServiceAccount => SERVICE_ACCOUNT_OPS,
        }
    }

    pub fn permits(&self, op: Operation) -> bool {
        self.permissions().contains(&op)
    }

    /// Roles allowed to override journey stages.
    pub fn is_admin_capable(&self) -> bool {
        self.permits(Operation::StatusAdminWrite)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::TenantAdmin => "tenant_admin",
            Role::CustomerUser => "customer_user",
            Role::ServiceAccount => "service_account",
        }
    }
}

/// Tenant predicate carried into every data-gateway statement.
///
/// Built from a resolved [`Principal`], or explicitly for provisioning workflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    tenant_id: String,
}

impl TenantScope {
    /// Scope used by provisioning and admin tooling that runs outside a request.
    pub fn provisioning(tenant_id: &str) -> ApiResult<Self> {
        validate_identifier("tenant ID", tenant_id)?;
        Ok(Self {
            tenant_id: tenant_id.to_string(),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

/// Resolved caller identity attached to an authorized request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub tenant_id: String,
    pub customer_id: Option<String>,
    pub role: Role,
}

impl Principal {
    pub fn scope(&self) -> TenantScope {
        TenantScope {
            tenant_id: self.tenant_id.clone(),
        }
    }

    /// Customer a request acts on: the principal's own scope, or (for unscoped roles) the
    /// customer named in the request.
    pub fn target_customer(&self, requested: Option<&str>) -> ApiResult<String> {
        match (&self.customer_id, requested) {
            (Some(own), Some(req)) if own != req => Err(ApiError::CrossTenantViolation(
                "customer_id does not match caller scope".into(),
            )),
            (Some(own), _) => Ok(own.clone()),
            (None, Some(req)) => {
                validate_identifier("customer ID", req)?;
                Ok(req.to_string())
            }
            (None, None) => Err(ApiError::InvalidRequest(
                "missing required parameter: customer_id".into(),
            )),
        }
    }
}

/// Source of identity records, keyed by token digest.
pub trait IdentityDirectory: Send + Sync {
    fn lookup(&self, token_sha256: &str) -> Option<IdentityEntry>;
}

/// In-memory directory built from configuration.
#[derive(Debug, Default)]
pub struct StaticIdentityDirectory {
    by_digest: HashMap<String, IdentityEntry>,
}

impl StaticIdentityDirectory {
    pub fn new(entries: impl IntoIterator<Item = IdentityEntry>) -> Self {
        let mut by_digest = HashMap::new();
        for entry in entries {
            if validate_identifier("tenant ID", &entry.tenant_id).is_err() {
                tracing::warn!(target: "cloudable::rbac", subject = %entry.subject, "skipping identity with invalid tenant_id");
                continue;
            }
            if entry.role == Role::CustomerUser && entry.customer_id.is_none() {
                tracing::warn!(target: "cloudable::rbac", subject = %entry.subject, "skipping customer_user identity without customer_id");
                continue;
            }
            by_digest.insert(entry.token_sha256.trim().to_lowercase(), entry);
        }
        Self { by_digest }
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

impl IdentityDirectory for StaticIdentityDirectory {
    fn lookup(&self, token_sha256: &str) -> Option<IdentityEntry> {
        self.by_digest.get(token_sha256).cloned()
    }
}

/// Lowercase hex SHA-256 of a token, the form stored in the identity directory.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Resolves principals and enforces the permission table and scope cross-checks.
pub struct RbacResolver {
    directory: Box<dyn IdentityDirectory>,
}

impl RbacResolver {
    pub fn new(directory: Box<dyn IdentityDirectory>) -> Self {
        Self { directory }
    }

    /// Resolve the caller from (lowercased) request headers.
    pub fn resolve(&self, headers: &HashMap<String, String>) -> ApiResult<Principal> {
        let token = extract_token(headers)
            .ok_or_else(|| ApiError::Unauthenticated("missing identity token".into()))?;
        let entry = self
            .directory
            .lookup(&token_digest(token))
            .ok_or_else(|| ApiError::Unauthenticated("unknown identity".into()))?;

        let principal = Principal {
            subject: entry.subject,
            tenant_id: entry.tenant_id,
            customer_id: entry.customer_id,
            role: entry.role,
        };

        if let Some(claimed) = headers.get(TENANT_CLAIM_HEADER).map(|s| s.trim()) {
            if !claimed.is_empty() && claimed != principal.tenant_id {
                tracing::warn!(
                    target: "cloudable::rbac",
                    subject = %principal.subject,
                    tenant_id = %principal.tenant_id,
                    claimed = %claimed,
                    "tenant claim does not match identity"
                );
                return Err(ApiError::CrossTenantViolation(
                    "claimed tenant does not match caller identity".into(),
                ));
            }
        }
        Ok(principal)
    }

    /// Single set-membership test against the static table.
    pub fn authorize(&self, principal: &Principal, op: Operation) -> ApiResult<()> {
        if principal.role.permits(op) {
            Ok(())
        } else {
            tracing::warn!(
                target: "cloudable::rbac",
                subject = %principal.subject,
                tenant_id = %principal.tenant_id,
                role = principal.role.as_str(),
                operation = ?op,
                "permission denied"
            );
            Err(ApiError::Unauthorized(format!(
                "role {} lacks permission {:?}",
                principal.role.as_str(),
                op
            )))
        }
    }

    /// Cross-check tenant/customer identifiers named in a JSON body against the principal.
    pub fn check_body_scope(&self, principal: &Principal, body: &serde_json::Value) -> ApiResult<()> {
        for field in ["tenant", "tenant_id"] {
            if let Some(value) = body.get(field) {
                let named = value.as_str().ok_or_else(|| {
                    ApiError::InvalidRequest(format!("{} must be a string", field))
                })?;
                if named != principal.tenant_id {
                    tracing::warn!(
                        target: "cloudable::rbac",
                        subject = %principal.subject,
                        tenant_id = %principal.tenant_id,
                        named = %named,
                        "request body names another tenant"
                    );
                    return Err(ApiError::CrossTenantViolation(
                        "request names a tenant outside the caller scope".into(),
                    ));
                }
            }
        }
        if let (Some(own), Some(value)) = (&principal.customer_id, body.get("customer_id")) {
            if value.as_str() != Some(own.as_str()) {
                return Err(ApiError::CrossTenantViolation(
                    "request names a customer outside the caller scope".into(),
                ));
            }
        }
        Ok(())
    }
}

fn extract_token(headers: &HashMap<String, String>) -> Option<&str> {
    if let Some(auth) = headers.get(AUTHORIZATION_HEADER) {
        let auth = auth.trim();
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        if token.is_some() {
            return token;
        }
    }
    headers
        .get(API_KEY_HEADER)
        .map(|s| s.trim())
        .filter(|t| !t.is_empty())
}
