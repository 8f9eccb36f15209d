//! Configuration management
//!
//! The file layer is YAML (via `figment`) with a `WS_RELAY_` environment
//! overlay. Endpoint descriptors are read as an untyped tree first and then
//! validated field by field into [`EndpointConfig`], so a bad file reports
//! every malformed field at once.

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigIssues;
use crate::relay::BackendAddress;
use crate::{Error, Result};

/// Default token prefix expected in the `Authorization` header
pub const DEFAULT_TOKEN_PREFIX: &str = "Bearer";

/// Default group refresh interval (minutes)
pub const DEFAULT_GROUP_REFRESH_MINUTES: f64 = 120.0;

/// Environment variable names read by [`GroupTransform::from_env`]
pub mod env_keys {
    /// `"true"` disables group ID to name transformation
    pub const GROUP_TRANSFORM_DISABLE: &str = "WS_RELAY_GROUP_TRANSFORM_DISABLE";
    /// Directory application (client) ID
    pub const DIRECTORY_CLIENT_ID: &str = "WS_RELAY_DIRECTORY_CLIENT_ID";
    /// Directory application secret
    pub const DIRECTORY_CLIENT_SECRET: &str = "WS_RELAY_DIRECTORY_CLIENT_SECRET";
    /// Group cache refresh interval in minutes
    pub const GROUP_REFRESH_MINUTES: &str = "WS_RELAY_GROUP_REFRESH_MINUTES";
    /// Token authority base URL
    pub const DIRECTORY_AUTHORITY_URL: &str = "WS_RELAY_DIRECTORY_AUTHORITY_URL";
    /// Directory API base URL
    pub const DIRECTORY_GRAPH_URL: &str = "WS_RELAY_DIRECTORY_GRAPH_URL";
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before the directory settings are read.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Liveness path answered with `200 OK`
    pub health_path: String,
    /// Endpoint descriptors, untyped until [`Config::endpoints`] validates them
    pub websockets: Vec<Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            server: ServerConfig::default(),
            health_path: "/health".to_string(),
            websockets: Vec::new(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// A validated endpoint descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Inbound path, unique across endpoints
    pub api: String,
    /// Backend address (`ws://host:port/path` or `wss://host:port/path`)
    pub address: String,
    /// Issuer discovery URL; `None` disables token validation
    pub jwk_url: Option<String>,
    /// Expected audience; `None` means "take it from the token"
    pub audience: Option<String>,
    /// Prefix expected before the token in the `Authorization` header
    pub token_prefix: String,
    /// Comma-separated allowed roles; `None` disables the RBAC gate
    pub rbac_roles: Option<String>,
    /// Verify the backend certificate for `wss://` addresses
    pub tls_verify: bool,
    /// Reject configuration that leaves `audience` empty on a validated route
    pub require_audience: bool,
}

const ENDPOINT_FIELDS: &[&str] = &[
    "api",
    "address",
    "jwk_url",
    "audience",
    "token_prefix",
    "rbac_roles",
    "tls_verify",
    "require_audience",
];

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // WS_RELAY_SERVER__PORT=9000 etc.
        figment = figment.merge(Env::prefixed("WS_RELAY_").split("__").ignore(&[
            "group_transform_disable",
            "directory_client_id",
            "directory_client_secret",
            "group_refresh_minutes",
            "directory_authority_url",
            "directory_graph_url",
        ]));

        Self::extract(figment)
    }

    /// Parse configuration from a YAML document (no environment overlay).
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Yaml::string(yaml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Validate every endpoint descriptor.
    ///
    /// All problems are collected before returning, including duplicated
    /// `api` paths, so nothing is registered from a partially valid file.
    pub fn endpoints(&self) -> Result<Vec<EndpointConfig>> {
        let mut issues = ConfigIssues::default();
        let mut endpoints = Vec::with_capacity(self.websockets.len());
        let mut seen: HashMap<String, usize> = HashMap::new();

        if let Err(message) = check_route_path(&self.health_path) {
            issues.push("health_path", message);
        }

        for (index, raw) in self.websockets.iter().enumerate() {
            let Some(endpoint) = decode_endpoint(index, raw, &mut issues) else {
                continue;
            };

            if endpoint.api == self.health_path {
                issues.push(
                    format!("websockets[{index}].api"),
                    format!("'{}' is already used by health_path", endpoint.api),
                );
                continue;
            }

            if let Some(first) = seen.get(&endpoint.api) {
                issues.push(
                    format!("websockets[{index}].api"),
                    format!(
                        "duplicated api '{}' (already used by websockets[{first}])",
                        endpoint.api
                    ),
                );
                continue;
            }
            seen.insert(endpoint.api.clone(), index);
            endpoints.push(endpoint);
        }

        issues.into_result()?;
        Ok(endpoints)
    }
}

/// Decode one endpoint. Returns `None` when any field was malformed; the
/// problems are recorded in `issues`.
fn decode_endpoint(index: usize, raw: &Value, issues: &mut ConfigIssues) -> Option<EndpointConfig> {
    let prefix = format!("websockets[{index}]");
    let Some(map) = raw.as_object() else {
        issues.push(&prefix, "expected a mapping");
        return None;
    };

    let before = issues.len();

    for key in map.keys() {
        if !ENDPOINT_FIELDS.contains(&key.as_str()) {
            issues.push(format!("{prefix}.{key}"), "unknown field");
        }
    }

    let api = required_string(map, &prefix, "api", issues);
    let address = required_string(map, &prefix, "address", issues);
    let jwk_url = optional_string(map, &prefix, "jwk_url", issues);
    let audience = optional_string(map, &prefix, "audience", issues);
    let token_prefix = optional_string(map, &prefix, "token_prefix", issues);
    let rbac_roles = optional_string(map, &prefix, "rbac_roles", issues);
    let tls_verify = optional_bool(map, &prefix, "tls_verify", issues);
    let require_audience = optional_bool(map, &prefix, "require_audience", issues);

    if let Some(api) = &api {
        if let Err(message) = check_route_path(api) {
            issues.push(format!("{prefix}.api"), message);
        }
    }

    if let Some(address) = &address {
        if let Err(e) = BackendAddress::parse(address) {
            issues.push(format!("{prefix}.address"), e.to_string());
        }
    }

    if require_audience && jwk_url.is_some() && audience.is_none() {
        issues.push(
            format!("{prefix}.audience"),
            "required when require_audience is set",
        );
    }

    if issues.len() != before {
        return None;
    }

    Some(EndpointConfig {
        api: api?,
        address: address?,
        jwk_url,
        audience,
        token_prefix: token_prefix.unwrap_or_else(|| DEFAULT_TOKEN_PREFIX.to_string()),
        rbac_roles,
        tls_verify,
        require_audience,
    })
}

/// Inbound paths are registered literally: no captures or wildcards.
fn check_route_path(path: &str) -> std::result::Result<(), &'static str> {
    if !path.starts_with('/') {
        return Err("must start with '/'");
    }
    if path.contains(['{', '}'])
        || path
            .split('/')
            .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
    {
        return Err("must be a literal path (no captures or wildcards)");
    }
    Ok(())
}

fn required_string(
    map: &Map<String, Value>,
    prefix: &str,
    key: &str,
    issues: &mut ConfigIssues,
) -> Option<String> {
    match map.get(key) {
        None | Some(Value::Null) => {
            issues.push(format!("{prefix}.{key}"), "missing required field");
            None
        }
        Some(Value::String(s)) if s.is_empty() => {
            issues.push(format!("{prefix}.{key}"), "must not be empty");
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            issues.push(format!("{prefix}.{key}"), "expected a string");
            None
        }
    }
}

/// Empty strings count as absent.
fn optional_string(
    map: &Map<String, Value>,
    prefix: &str,
    key: &str,
    issues: &mut ConfigIssues,
) -> Option<String> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            issues.push(format!("{prefix}.{key}"), "expected a string");
            None
        }
    }
}

fn optional_bool(
    map: &Map<String, Value>,
    prefix: &str,
    key: &str,
    issues: &mut ConfigIssues,
) -> bool {
    match map.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            issues.push(format!("{prefix}.{key}"), "expected a boolean");
            false
        }
    }
}

/// Group ID to name transformation settings, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupTransform {
    /// Groups are not resolved; no directory calls are made
    Disabled,
    /// Groups are resolved through the directory service
    Enabled(DirectorySettings),
}

/// Credentials and endpoints for the directory service.
#[derive(Clone, PartialEq)]
pub struct DirectorySettings {
    /// Application (client) ID
    pub client_id: String,
    /// Application secret
    pub client_secret: String,
    /// Maximum age of a tenant's cached groups
    pub refresh_interval: Duration,
    /// Token authority base URL
    pub authority_url: String,
    /// Directory API base URL
    pub graph_url: String,
}

impl std::fmt::Debug for DirectorySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorySettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_interval", &self.refresh_interval)
            .field("authority_url", &self.authority_url)
            .field("graph_url", &self.graph_url)
            .finish()
    }
}

impl GroupTransform {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Fails when transformation is enabled but the client ID or secret is
    /// missing.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if lookup(env_keys::GROUP_TRANSFORM_DISABLE).as_deref() == Some("true") {
            tracing::info!("Group transformation is disabled");
            return Ok(Self::Disabled);
        }

        let client_id = lookup(env_keys::DIRECTORY_CLIENT_ID).unwrap_or_default();
        let client_secret = lookup(env_keys::DIRECTORY_CLIENT_SECRET).unwrap_or_default();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(Error::Config(format!(
                "Unable to retrieve directory credentials: {} or {} missing",
                env_keys::DIRECTORY_CLIENT_ID,
                env_keys::DIRECTORY_CLIENT_SECRET
            )));
        }

        let refresh_interval = parse_refresh_minutes(lookup(env_keys::GROUP_REFRESH_MINUTES));

        Ok(Self::Enabled(DirectorySettings {
            client_id,
            client_secret,
            refresh_interval,
            authority_url: lookup(env_keys::DIRECTORY_AUTHORITY_URL)
                .unwrap_or_else(|| "https://login.microsoftonline.com".to_string()),
            graph_url: lookup(env_keys::DIRECTORY_GRAPH_URL)
                .unwrap_or_else(|| "https://graph.microsoft.com/v1.0".to_string()),
        }))
    }
}

fn parse_refresh_minutes(raw: Option<String>) -> Duration {
    let default = Duration::from_secs_f64(DEFAULT_GROUP_REFRESH_MINUTES * 60.0);
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return default;
    };

    let parsed = raw
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|minutes| *minutes > 0.0)
        .and_then(|minutes| Duration::try_from_secs_f64(minutes * 60.0).ok());

    match parsed {
        Some(interval) => interval,
        None => {
            tracing::warn!(
                value = %raw,
                "Unable to convert group refresh interval, using default: {DEFAULT_GROUP_REFRESH_MINUTES} minutes"
            );
            default
        }
    }
}
