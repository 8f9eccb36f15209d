//! Verified claims to request headers.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};

use super::oidc::Claims;
use crate::directory::GroupResolver;

/// Tenant identifier, hyphens replaced by underscores
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
/// Comma-joined resolved group names
pub const USER_GROUPS_HEADER: &str = "x-auth-user-groups";
/// Comma-joined role claims
pub const USER_ROLES_HEADER: &str = "x-auth-user-roles";
/// User identification
pub const FROM_HEADER: &str = "from";

/// Claims consulted, in order, for the `from` header
const USER_ID_CLAIMS: [&str; 4] = ["email", "verified_primary_email", "preferred_username", "oid"];

/// Adds identity headers derived from verified claims.
#[derive(Clone, Default)]
pub struct ClaimsEnricher {
    groups: Option<Arc<GroupResolver>>,
}

impl ClaimsEnricher {
    /// `groups` is `None` when group transformation is disabled.
    #[must_use]
    pub fn new(groups: Option<Arc<GroupResolver>>) -> Self {
        Self { groups }
    }

    /// Set the identity headers from `claims`. Does nothing when the claims
    /// carry no `tid`.
    pub async fn enrich(&self, claims: &Claims, headers: &mut HeaderMap) {
        let Some(tenant) = claims.get("tid").and_then(Value::as_str) else {
            debug!("Claims carry no tenant, skipping header enrichment");
            return;
        };

        let roles = string_list(claims, "roles").join(",");

        let groups = match &self.groups {
            Some(resolver) => {
                let ids = string_list(claims, "groups");
                let names = resolver.resolve(tenant, &ids).await;
                if names.is_empty() && !ids.is_empty() && !resolver.is_fresh(tenant).await {
                    warn!(
                        tenant = %tenant,
                        group_ids = ids.len(),
                        "Tenant groups unavailable, omitting group header"
                    );
                }
                names.join(",")
            }
            None => String::new(),
        };

        set_header(headers, TENANT_ID_HEADER, &tenant.replace('-', "_"));
        if !groups.is_empty() {
            set_header(headers, USER_GROUPS_HEADER, &groups);
        }
        if !roles.is_empty() {
            set_header(headers, USER_ROLES_HEADER, &roles);
        }
        set_header(headers, FROM_HEADER, user_identification(claims));
    }
}

/// Remove client-supplied copies of the identity headers.
pub fn strip_identity_headers(headers: &mut HeaderMap) {
    for name in [
        TENANT_ID_HEADER,
        USER_GROUPS_HEADER,
        USER_ROLES_HEADER,
        FROM_HEADER,
    ] {
        headers.remove(name);
    }
}

/// First present of `email`, `verified_primary_email`, `preferred_username`,
/// `oid`; `"unknown"` otherwise.
fn user_identification(claims: &Claims) -> &str {
    USER_ID_CLAIMS
        .iter()
        .find_map(|key| claims.get(*key).and_then(Value::as_str))
        .unwrap_or("unknown")
}

/// String elements of an array claim; anything else is ignored.
fn string_list(claims: &Claims, key: &str) -> Vec<String> {
    match claims.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_bytes(value.as_bytes()) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(e) => warn!(header = %name, error = %e, "Claim value is not a valid header value"),
    }
}
