//! Bearer token validation against an OpenID Connect issuer.
//!
//! # Verification flow
//!
//! 1. Join the `Authorization` header values and check the configured prefix.
//! 2. Decode the JWT header and payload without verification, to learn `kid`,
//!    `alg` and (when the route has no configured audience) `aud`.
//! 3. Resolve the issuer's discovery document and key set (cached for one
//!    hour per discovery URL; refreshed on unknown `kid`, at most once a
//!    minute per URL).
//! 4. Verify signature, expiry, issuer and audience.
//!
//! Clock leeway is 60 seconds.

use std::time::{Duration, Instant};

use axum::http::{HeaderMap, header};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::reject::RejectReason;

/// Verified token claims
pub type Claims = Map<String, Value>;

const WELL_KNOWN_CONFIGURATION: &str = "/.well-known/openid-configuration";

/// How long discovery documents and key sets stay cached
const KEY_SET_TTL: Duration = Duration::from_secs(3600);

/// Minimum spacing of forced key set refreshes for one discovery URL
const MIN_FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Error variants for token validation failures.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// No `Authorization` header at all.
    #[error("Missing authorization header")]
    MissingAuthorization,

    /// The header does not start with `<prefix> `.
    #[error("Bad token prefix")]
    BadTokenPrefix,

    /// The token is not a well-formed JWT.
    #[error("Malformed token")]
    MalformedToken,

    /// No audience configured and none found in the token.
    #[error("Token carries no audience")]
    MissingAudience,

    /// JWT decode / signature verification failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The token is signed with an algorithm this validator does not accept.
    #[error("Unsupported JWT algorithm: {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    /// No key in the issuer's key set matches the token.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// Network or HTTP error during discovery or key set fetch.
    #[error("Discovery fetch error: {0}")]
    Http(#[from] reqwest::Error),

    /// The discovery document names a different issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Issuer derived from the discovery URL.
        expected: String,
        /// Issuer named by the discovery document.
        actual: String,
    },
}

impl OidcError {
    /// Client-facing rejection for this failure
    #[must_use]
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            Self::MissingAuthorization => RejectReason::MissingAuthorization,
            Self::BadTokenPrefix => RejectReason::BadTokenPrefix,
            _ => RejectReason::TokenValidation,
        }
    }
}

/// The subset of the discovery document this validator reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier, matched against the token's `iss`
    pub issuer: String,
    /// Key set location
    pub jwks_uri: String,
}

struct CachedKeySet {
    metadata: ProviderMetadata,
    keys: JwkSet,
    fetched_at: Instant,
}

/// Discovery + key set cache, one entry per discovery URL.
pub struct KeySetCache {
    inner: DashMap<String, CachedKeySet>,
    /// Discovery URL to last forced refresh
    forced_at: DashMap<String, Instant>,
    http: reqwest::Client,
    ttl: Duration,
}

impl KeySetCache {
    /// Create with the default one-hour TTL.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            forced_at: DashMap::new(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            ttl: KEY_SET_TTL,
        }
    }

    /// Cached metadata and keys for `discovery_url`, fetched when missing,
    /// stale, or when `force_refresh` is set. Forced refreshes of a cached
    /// URL are throttled to one per minute; throttled calls get the cache.
    pub async fn get_or_fetch(
        &self,
        discovery_url: &str,
        force_refresh: bool,
    ) -> Result<(ProviderMetadata, JwkSet), OidcError> {
        if let Some(cached) = self.inner.get(discovery_url) {
            let fresh = cached.fetched_at.elapsed() < self.ttl;
            if fresh && (!force_refresh || !self.claim_forced_refresh(discovery_url)) {
                if force_refresh {
                    debug!(url = %discovery_url, "Forced key set refresh throttled");
                }
                return Ok((cached.metadata.clone(), cached.keys.clone()));
            }
        }

        let document_url = discovery_document_url(discovery_url);
        debug!(url = %document_url, "Fetching OpenID configuration");
        let metadata: ProviderMetadata = self
            .http
            .get(&document_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(expected) = expected_issuer(discovery_url) {
            if metadata.issuer.trim_end_matches('/') != expected {
                return Err(OidcError::IssuerMismatch {
                    expected: expected.to_string(),
                    actual: metadata.issuer,
                });
            }
        }

        debug!(issuer = %metadata.issuer, "Fetching JWKS from {}", metadata.jwks_uri);
        let keys: JwkSet = self
            .http
            .get(&metadata.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.inner.insert(
            discovery_url.to_string(),
            CachedKeySet {
                metadata: metadata.clone(),
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok((metadata, keys))
    }

    /// Record a forced refresh of `discovery_url`; `false` when the previous
    /// one is less than [`MIN_FORCED_REFRESH_INTERVAL`] old.
    fn claim_forced_refresh(&self, discovery_url: &str) -> bool {
        let now = Instant::now();
        let mut allowed = true;
        self.forced_at
            .entry(discovery_url.to_string())
            .and_modify(|last| {
                if last.elapsed() < MIN_FORCED_REFRESH_INTERVAL {
                    allowed = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        allowed
    }
}

impl Default for KeySetCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates bearer tokens for one route.
pub struct TokenValidator {
    discovery_url: String,
    audience: Option<String>,
    prefix: String,
    keys: std::sync::Arc<KeySetCache>,
}

impl TokenValidator {
    /// Create a validator. `keys` is usually shared by every route.
    #[must_use]
    pub fn new(
        discovery_url: impl Into<String>,
        audience: Option<String>,
        prefix: impl Into<String>,
        keys: std::sync::Arc<KeySetCache>,
    ) -> Self {
        let discovery_url = discovery_url.into();
        if !discovery_url.starts_with("https://") {
            warn!(url = %discovery_url, "Token issuer discovery URL is not HTTPS");
        }
        if audience.is_none() {
            warn!(
                url = %discovery_url,
                "No audience configured; the audience will be taken from each token"
            );
        }
        Self {
            discovery_url,
            audience,
            prefix: prefix.into(),
            keys,
        }
    }

    /// Validate the request's bearer token and return its verified claims.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError`]; [`OidcError::reject_reason`] maps it to the
    /// response sent to the client.
    pub async fn validate(&self, headers: &HeaderMap) -> Result<Claims, OidcError> {
        let token = extract_token(headers, &self.prefix)?;

        let jwt_header = jsonwebtoken::decode_header(&token)?;
        let unverified = extract_unverified_claims(&token)?;

        let audience = match &self.audience {
            Some(aud) => aud.clone(),
            None => audience_from_claims(&unverified).ok_or(OidcError::MissingAudience)?,
        };

        let (metadata, keys) = self.find_keys(jwt_header.kid.as_deref()).await?;

        let mut validation = build_validation(jwt_header.alg)?;
        validation.set_audience(&[audience]);
        validation.set_issuer(&[metadata.issuer.as_str()]);

        let mut last_err = None;
        for key in &keys {
            match jsonwebtoken::decode::<Claims>(&token, key, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.map_or_else(
            || OidcError::UnknownKeyId(jwt_header.kid.unwrap_or_default()),
            OidcError::Jwt,
        ))
    }

    /// Decoding keys for `kid`, refreshing the key set once when it is unknown.
    async fn find_keys(
        &self,
        kid: Option<&str>,
    ) -> Result<(ProviderMetadata, Vec<DecodingKey>), OidcError> {
        let (metadata, jwks) = self.keys.get_or_fetch(&self.discovery_url, false).await?;
        let keys = find_keys_in_jwks(&jwks, kid);
        if !keys.is_empty() {
            return Ok((metadata, keys));
        }

        debug!(kid = ?kid, "Key not found in cached JWKS, refreshing");
        let (metadata, jwks) = self.keys.get_or_fetch(&self.discovery_url, true).await?;
        let keys = find_keys_in_jwks(&jwks, kid);
        if keys.is_empty() {
            return Err(OidcError::UnknownKeyId(kid.unwrap_or_default().to_string()));
        }
        Ok((metadata, keys))
    }
}

/// Isolate the token from the `Authorization` header(s).
///
/// All values are joined with a space. The joined value must start with
/// `prefix` followed by a space; then every space is removed and the prefix
/// (counted in characters) is cut off.
pub fn extract_token(headers: &HeaderMap, prefix: &str) -> Result<String, OidcError> {
    let values: Vec<&str> = headers
        .get_all(header::AUTHORIZATION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        return Err(OidcError::MissingAuthorization);
    }

    let joined = values.join(" ");
    if !joined.starts_with(&format!("{prefix} ")) {
        return Err(OidcError::BadTokenPrefix);
    }

    Ok(joined
        .chars()
        .filter(|c| *c != ' ')
        .skip(prefix.chars().count())
        .collect())
}

/// Discovery document location for a configured discovery URL.
fn discovery_document_url(url: &str) -> String {
    if url.ends_with(WELL_KNOWN_CONFIGURATION) {
        url.to_string()
    } else {
        format!("{}{WELL_KNOWN_CONFIGURATION}", url.trim_end_matches('/'))
    }
}

/// The issuer a discovery document must name, when the URL is an issuer URL.
fn expected_issuer(url: &str) -> Option<&str> {
    if url.ends_with(WELL_KNOWN_CONFIGURATION) {
        None
    } else {
        Some(url.trim_end_matches('/'))
    }
}

/// Decode the payload without verifying the signature.
///
/// Used only to read `aud` before verification.
fn extract_unverified_claims(token: &str) -> Result<Claims, OidcError> {
    let payload = token.split('.').nth(1).ok_or(OidcError::MalformedToken)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| OidcError::MalformedToken)?;
    serde_json::from_slice(&bytes).map_err(|_| OidcError::MalformedToken)
}

/// `aud` as a single string, or the first string of an `aud` array.
fn audience_from_claims(claims: &Claims) -> Option<String> {
    match claims.get("aud")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(arr) => arr.iter().find_map(|v| v.as_str().map(str::to_string)),
        _ => None,
    }
}

/// Decoding keys matching `kid`; every usable key when the token has no `kid`.
fn find_keys_in_jwks(jwks: &JwkSet, kid: Option<&str>) -> Vec<DecodingKey> {
    jwks.keys
        .iter()
        .filter(|jwk| kid.is_none_or(|kid| jwk.common.key_id.as_deref() == Some(kid)))
        .filter_map(|jwk| match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        })
        .collect()
}

/// Validation for an asymmetric signing algorithm.
fn build_validation(alg: Algorithm) -> Result<Validation, OidcError> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => {
            let mut v = Validation::new(alg);
            v.leeway = 60; // 60-second clock skew tolerance
            Ok(v)
        }
        other => Err(OidcError::UnsupportedAlgorithm(other)),
    }
}
