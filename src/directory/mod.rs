//! Directory service access
//!
//! The relay consumes two directory operations: "connect for a tenant" and
//! "list groups". [`GroupResolver`] caches the resulting ID to name mapping;
//! [`GraphConnector`] is the shipped HTTP implementation.

mod cache;
mod graph;

pub use cache::GroupResolver;
pub use graph::GraphConnector;

use async_trait::async_trait;
use serde::Deserialize;

use crate::Result;

/// A group as returned by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirectoryGroup {
    /// Opaque group identifier, as found in token `groups` claims
    pub id: String,
    /// Human-readable name; groups without one are not cached
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
}

/// Creates tenant-scoped directory clients.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Authenticate against `tenant` and return a client for it.
    async fn connect(&self, tenant: &str) -> Result<Box<dyn DirectoryClient>>;
}

/// A directory client bound to one tenant.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Every group in the tenant.
    async fn list_groups(&self) -> Result<Vec<DirectoryGroup>>;
}
