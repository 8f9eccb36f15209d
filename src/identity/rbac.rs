//! Role-based access check over the enriched identity headers.

use axum::http::HeaderMap;

use super::claims::{USER_GROUPS_HEADER, USER_ROLES_HEADER};

/// Result of evaluating a request against a route's allowed roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// At least one role or group matches.
    Allow,
    /// Nothing matches.
    Deny,
}

/// Allowed roles for one route, case-folded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbacGate {
    allowed: Vec<String>,
}

impl RbacGate {
    /// Compile a comma-separated role list. Whitespace is removed and case is
    /// folded. Returns `None` when the list names no role, meaning the gate
    /// is not installed.
    #[must_use]
    pub fn new(roles: &str) -> Option<Self> {
        let allowed: Vec<String> = roles
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase()
            .split(',')
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();

        if allowed.is_empty() {
            None
        } else {
            Some(Self { allowed })
        }
    }

    /// Allowed roles, as compiled
    #[must_use]
    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    /// Compare against `x-auth-user-groups` when present, otherwise against
    /// `x-auth-user-roles`. The two are never combined.
    #[must_use]
    pub fn check(&self, headers: &HeaderMap) -> AccessDecision {
        let source = if headers.contains_key(USER_GROUPS_HEADER) {
            USER_GROUPS_HEADER
        } else {
            USER_ROLES_HEADER
        };

        let granted = request_roles(headers, source);
        if self
            .allowed
            .iter()
            .any(|role| granted.iter().any(|g| g == role))
        {
            AccessDecision::Allow
        } else {
            AccessDecision::Deny
        }
    }
}

/// All values of `name` joined with a space, case-folded and split on `,`.
///
/// Values are read as UTF-8 (lossily): resolved group names are not limited
/// to visible ASCII.
fn request_roles(headers: &HeaderMap, name: &str) -> Vec<String> {
    let joined = headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    joined
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}
