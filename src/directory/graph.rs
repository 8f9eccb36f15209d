//! Microsoft Graph directory client.
//!
//! Authenticates with the OAuth2 client-credentials grant against
//! `<authority>/<tenant>/oauth2/v2.0/token` and pages through
//! `<graph>/groups?$select=id,displayName`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{DirectoryClient, DirectoryConnector, DirectoryGroup};
use crate::config::DirectorySettings;
use crate::{Error, Result};

/// Scope requested for application-level Graph access
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Upper bound on followed `@odata.nextLink` pages
const MAX_PAGES: usize = 1000;

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// One page of `GET /groups`
#[derive(Debug, Deserialize)]
struct GroupsPage {
    #[serde(default)]
    value: Vec<DirectoryGroup>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Connects to Microsoft Graph with application credentials.
pub struct GraphConnector {
    http_client: Client,
    client_id: String,
    client_secret: String,
    authority_url: String,
    graph_url: String,
}

impl std::fmt::Debug for GraphConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphConnector")
            .field("client_id", &self.client_id)
            .field("authority_url", &self.authority_url)
            .field("graph_url", &self.graph_url)
            .finish_non_exhaustive()
    }
}

impl GraphConnector {
    /// Create a connector from directory settings.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(settings: &DirectorySettings) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            authority_url: settings.authority_url.trim_end_matches('/').to_string(),
            graph_url: settings.graph_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_token(&self, tenant: &str) -> Result<String> {
        let token_endpoint = format!("{}/{tenant}/oauth2/v2.0/token", self.authority_url);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", GRAPH_SCOPE),
        ];

        let response = self
            .http_client
            .post(&token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Directory(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Directory(format!(
                "Token request failed: HTTP {status} - {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Directory(format!("Failed to parse token response: {e}")))?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl DirectoryConnector for GraphConnector {
    async fn connect(&self, tenant: &str) -> Result<Box<dyn DirectoryClient>> {
        let access_token = self.fetch_token(tenant).await?;
        debug!(tenant = %tenant, "Obtained directory access token");
        Ok(Box::new(GraphClient {
            http_client: self.http_client.clone(),
            graph_url: self.graph_url.clone(),
            access_token,
        }))
    }
}

/// Graph client holding a tenant-scoped access token.
struct GraphClient {
    http_client: Client,
    graph_url: String,
    access_token: String,
}

#[async_trait]
impl DirectoryClient for GraphClient {
    async fn list_groups(&self) -> Result<Vec<DirectoryGroup>> {
        let mut groups = Vec::new();
        let mut next = Some(format!("{}/groups?$select=id,displayName", self.graph_url));
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(Error::Directory(format!(
                    "Group listing exceeded {MAX_PAGES} pages"
                )));
            }

            let response = self
                .http_client
                .get(&url)
                .bearer_auth(&self.access_token)
                .send()
                .await
                .map_err(|e| Error::Directory(format!("Group listing failed: {e}")))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Directory(format!(
                    "Group listing failed: HTTP {status} - {body}"
                )));
            }

            let page: GroupsPage = response
                .json()
                .await
                .map_err(|e| Error::Directory(format!("Failed to parse group listing: {e}")))?;
            groups.extend(page.value);
            next = page.next_link;
        }

        debug!(groups = groups.len(), pages, "Listed directory groups");
        Ok(groups)
    }
}
