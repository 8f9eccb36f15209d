//! Tenant group cache.
//!
//! One `RwLock` guards both the global group ID to name mapping and the
//! per-tenant refresh timestamps. A tenant without a timestamp is refreshed
//! synchronously under the write lock, so concurrent first lookups for the
//! same tenant produce a single directory listing. An expired timestamp is
//! only evicted; the listing happens on the tenant's next lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{DirectoryConnector, DirectoryGroup};
use crate::Result;

#[derive(Default)]
struct GroupCache {
    /// Group ID to display name, shared by every tenant
    names: HashMap<String, String>,
    /// Tenant ID to last successful refresh
    refreshed: HashMap<String, Instant>,
}

/// Resolves token group IDs to display names.
pub struct GroupResolver {
    connector: Arc<dyn DirectoryConnector>,
    ttl: Duration,
    state: RwLock<GroupCache>,
}

impl GroupResolver {
    /// Create an empty resolver; entries older than `ttl` are refreshed.
    #[must_use]
    pub fn new(connector: Arc<dyn DirectoryConnector>, ttl: Duration) -> Self {
        Self {
            connector,
            ttl,
            state: RwLock::new(GroupCache::default()),
        }
    }

    /// Names for `group_ids` in `tenant`. IDs without a known name are
    /// skipped. Directory failures are logged and yield whatever is cached.
    pub async fn resolve(&self, tenant: &str, group_ids: &[String]) -> Vec<String> {
        {
            let mut state = self.state.write().await;
            let refreshed_at = state.refreshed.get(tenant).copied();
            match refreshed_at {
                None => self.refresh(tenant, &mut state).await,
                Some(at) if at.elapsed() > self.ttl => {
                    debug!(tenant = %tenant, "Tenant groups expired, refreshing on next lookup");
                    state.refreshed.remove(tenant);
                }
                Some(_) => {}
            }
        }

        let state = self.state.read().await;
        group_ids
            .iter()
            .filter_map(|id| state.names.get(id).cloned())
            .collect()
    }

    /// `true` when `tenant` has a refresh timestamp within the TTL. Stale
    /// tenants are answered from whatever names earlier refreshes left.
    pub async fn is_fresh(&self, tenant: &str) -> bool {
        self.state
            .read()
            .await
            .refreshed
            .get(tenant)
            .is_some_and(|at| at.elapsed() <= self.ttl)
    }

    /// Repopulate `tenant`'s groups, then record the timestamp.
    async fn refresh(&self, tenant: &str, state: &mut GroupCache) {
        let groups = match self.list_groups(tenant).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Failed to refresh tenant groups");
                return;
            }
        };

        let total = groups.len();
        let mut named = 0usize;
        for group in groups {
            if let Some(name) = group.display_name {
                state.names.insert(group.id, name);
                named += 1;
            }
        }
        state.refreshed.insert(tenant.to_string(), Instant::now());
        info!(tenant = %tenant, groups = total, named, "Refreshed tenant groups");
    }

    async fn list_groups(&self, tenant: &str) -> Result<Vec<DirectoryGroup>> {
        let client = self.connector.connect(tenant).await?;
        client.list_groups().await
    }
}
