//! Caller identity: token validation, header enrichment and RBAC.

pub mod claims;
pub mod oidc;
pub mod rbac;

pub use claims::{ClaimsEnricher, strip_identity_headers};
pub use oidc::{Claims, KeySetCache, OidcError, TokenValidator};
pub use rbac::{AccessDecision, RbacGate};
