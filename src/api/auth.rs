//! Bearer-token auth with ops scopes. Tokens are stored hashed; the bearer
//! value itself never lands in the database.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::chain::sha256_hex;

use super::error::ApiError;
use super::state::AppState;

pub const SCOPE_OPS_READ: &str = "ops_read";
pub const SCOPE_OPS_WRITE: &str = "ops_write";
pub const SCOPE_FINANCE_READ: &str = "finance_read";
pub const SCOPE_FINANCE_WRITE: &str = "finance_write";
pub const SCOPE_AUDIT_READ: &str = "audit_read";
pub const SCOPE_GOV_TENANT_READ: &str = "governance_tenant_read";
pub const SCOPE_GOV_TENANT_WRITE: &str = "governance_tenant_write";
pub const SCOPE_GOV_GLOBAL_READ: &str = "governance_global_read";
pub const SCOPE_GOV_GLOBAL_WRITE: &str = "governance_global_write";

pub fn token_hash(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

pub struct OpsAuth {
    pub tenant_id: String,
    pub scopes: Vec<String>,
    pub label: String,
}

impl OpsAuth {
    pub fn require(&self, scope: &str) -> Result<(), ApiError> {
        if self.scopes.iter().any(|s| s == scope) {
            return Ok(());
        }
        Err(ApiError::forbidden(
            "SCOPE_REQUIRED",
            format!("scope {scope} required"),
        ))
    }
}

impl FromRequestParts<AppState> for OpsAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("invalid authorization format"))?;

        let conn = state.store.db.lock().await;
        let Some((tenant_id, scopes)) = crate::store::get_auth_scopes(&conn, &token_hash(token))?
        else {
            return Err(ApiError::unauthorized("unknown token"));
        };
        Ok(OpsAuth {
            tenant_id,
            scopes,
            label: "ops".to_string(),
        })
    }
}
