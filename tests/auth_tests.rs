//! End-to-end authentication tests
//!
//! Tests the full gate chain against a mock token issuer:
//! - Bearer token validation (signature, audience, expiry, key rotation)
//! - Identity header enrichment and anti-spoofing
//! - Group name resolution through the directory cache
//! - RBAC on roles and groups

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{
    MockIssuer, claims_for, now, read_body, sign_token, sign_token_with_kid,
    spawn_accepting_backend, spawn_gateway, spawn_issuer, upgrade,
};
use ws_auth_relay::Result;
use ws_auth_relay::directory::{
    DirectoryClient, DirectoryConnector, DirectoryGroup, GroupResolver,
};

const AUDIENCE: &str = "relay-api";

fn validated_route(
    issuer: &MockIssuer,
    backend: std::net::SocketAddr,
    extra: &str,
) -> String {
    format!(
        r"
websockets:
  - api: /secure
    address: ws://{backend}/ws
    jwk_url: {issuer}
{extra}
",
        issuer = issuer.url
    )
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[tokio::test]
async fn valid_token_enriches_the_backend_request() {
    // GIVEN: a validated route and a caller trying to spoof a groups header
    let issuer = spawn_issuer().await;
    let (backend, mut heads) = spawn_accepting_backend().await;
    let yaml = validated_route(&issuer, backend, &format!("    audience: {AUDIENCE}"));
    let gateway = spawn_gateway(&yaml, None).await;
    let token = sign_token(&claims_for(&issuer.url, AUDIENCE));

    // WHEN
    let auth = bearer(&token);
    let (_client, head) = upgrade(
        gateway,
        "/secure",
        &[
            ("Authorization", auth.as_str()),
            ("X-Auth-User-Groups", "domain-admins"),
            ("X-Tenant-Id", "someone_else"),
        ],
    )
    .await;

    // THEN: the handshake completes and the backend sees verified identity
    assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
    let request = heads.recv().await.unwrap().to_ascii_lowercase();
    assert!(request.contains("x-tenant-id: aaaa_bbbb_cccc\r\n"), "{request}");
    assert!(request.contains("x-auth-user-roles: admin,viewer\r\n"));
    assert!(request.contains("from: alice@example.com\r\n"));
    assert!(!request.contains("someone_else"));
    // Transformation is disabled: no groups header, and the spoofed one is gone.
    assert!(!request.contains("x-auth-user-groups"));
}

#[tokio::test]
async fn missing_authorization_is_401() {
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let gateway = spawn_gateway(&validated_route(&issuer, backend, ""), None).await;

    let (mut client, head) = upgrade(gateway, "/secure", &[]).await;

    assert_eq!(head.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        read_body(&mut client, &head).await,
        "Missing authorization header"
    );
}

#[tokio::test]
async fn basic_credentials_are_a_bad_prefix() {
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let gateway = spawn_gateway(&validated_route(&issuer, backend, ""), None).await;

    let (mut client, head) =
        upgrade(gateway, "/secure", &[("Authorization", "Basic dXNlcjpwYXNz")]).await;

    assert_eq!(head.status, StatusCode::UNAUTHORIZED);
    assert_eq!(read_body(&mut client, &head).await, "Bad token prefix");
}

#[tokio::test]
async fn wrong_audience_is_401() {
    // GIVEN: a token minted for another API
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let yaml = validated_route(&issuer, backend, &format!("    audience: {AUDIENCE}"));
    let gateway = spawn_gateway(&yaml, None).await;
    let token = sign_token(&claims_for(&issuer.url, "some-other-api"));

    // WHEN
    let auth = bearer(&token);
    let (mut client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;

    // THEN
    assert_eq!(head.status, StatusCode::UNAUTHORIZED);
    assert_eq!(read_body(&mut client, &head).await, "Bad token validator url");
}

#[tokio::test]
async fn expired_token_is_401() {
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let yaml = validated_route(&issuer, backend, &format!("    audience: {AUDIENCE}"));
    let gateway = spawn_gateway(&yaml, None).await;

    let mut claims = claims_for(&issuer.url, AUDIENCE);
    claims["iat"] = json!(now() - 7200);
    claims["exp"] = json!(now() - 3600);
    let auth = bearer(&sign_token(&claims));

    let (_client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;

    assert_eq!(head.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn foreign_issuer_is_401() {
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let yaml = validated_route(&issuer, backend, &format!("    audience: {AUDIENCE}"));
    let gateway = spawn_gateway(&yaml, None).await;

    let auth = bearer(&sign_token(&claims_for("https://evil.example", AUDIENCE)));
    let (_client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;

    assert_eq!(head.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn audience_is_taken_from_the_token_when_unconfigured() {
    // GIVEN: no audience on the route
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let gateway = spawn_gateway(&validated_route(&issuer, backend, ""), None).await;

    // WHEN: any audience is presented
    let auth = bearer(&sign_token(&claims_for(&issuer.url, "whatever-client")));
    let (_client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;

    // THEN
    assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
}

#[tokio::test]
async fn unknown_key_id_refreshes_once_then_fails() {
    // GIVEN
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let yaml = validated_route(&issuer, backend, &format!("    audience: {AUDIENCE}"));
    let gateway = spawn_gateway(&yaml, None).await;

    // WHEN: the token names a key the issuer does not publish
    let auth = bearer(&sign_token_with_kid(
        &claims_for(&issuer.url, AUDIENCE),
        "rotated-away",
    ));
    let (_client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;

    // THEN: one initial fetch plus one forced refresh
    assert_eq!(head.status, StatusCode::UNAUTHORIZED);
    assert_eq!(issuer.key_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn repeated_unknown_key_ids_do_not_refetch_the_key_set() {
    // GIVEN
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let yaml = validated_route(&issuer, backend, &format!("    audience: {AUDIENCE}"));
    let gateway = spawn_gateway(&yaml, None).await;

    // WHEN: every request names a different unpublished key
    for kid in ["random-1", "random-2", "random-3"] {
        let auth = bearer(&sign_token_with_kid(&claims_for(&issuer.url, AUDIENCE), kid));
        let (_client, head) =
            upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;
        assert_eq!(head.status, StatusCode::UNAUTHORIZED);
    }

    // THEN: only the first miss forces a refresh within the minute
    assert_eq!(issuer.key_fetches.load(Ordering::SeqCst), 2);

    // AND: the published key still validates from the cache
    let auth = bearer(&sign_token(&claims_for(&issuer.url, AUDIENCE)));
    let (_client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;
    assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(issuer.key_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn key_set_is_fetched_once_for_repeated_requests() {
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let yaml = validated_route(&issuer, backend, &format!("    audience: {AUDIENCE}"));
    let gateway = spawn_gateway(&yaml, None).await;
    let auth = bearer(&sign_token(&claims_for(&issuer.url, AUDIENCE)));

    for _ in 0..3 {
        let (_client, head) =
            upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
    }

    assert_eq!(issuer.key_fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rbac_denies_callers_without_a_listed_role() {
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let yaml = validated_route(
        &issuer,
        backend,
        &format!("    audience: {AUDIENCE}\n    rbac_roles: finance, auditors"),
    );
    let gateway = spawn_gateway(&yaml, None).await;
    let auth = bearer(&sign_token(&claims_for(&issuer.url, AUDIENCE)));

    let (mut client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;

    assert_eq!(head.status, StatusCode::FORBIDDEN);
    assert_eq!(
        read_body(&mut client, &head).await,
        "User has no permissions for that operation"
    );
}

#[tokio::test]
async fn rbac_matches_roles_case_insensitively() {
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let yaml = validated_route(
        &issuer,
        backend,
        &format!("    audience: {AUDIENCE}\n    rbac_roles: Finance,ADMIN"),
    );
    let gateway = spawn_gateway(&yaml, None).await;
    let auth = bearer(&sign_token(&claims_for(&issuer.url, AUDIENCE)));

    let (_client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;

    assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
}

/// Directory with a single tenant-independent group listing.
struct StaticDirectory {
    connects: AtomicUsize,
}

struct StaticClient;

#[async_trait]
impl DirectoryConnector for StaticDirectory {
    async fn connect(&self, _tenant: &str) -> Result<Box<dyn DirectoryClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticClient))
    }
}

#[async_trait]
impl DirectoryClient for StaticClient {
    async fn list_groups(&self) -> Result<Vec<DirectoryGroup>> {
        Ok(vec![
            DirectoryGroup {
                id: "g-ops".to_string(),
                display_name: Some("Operators".to_string()),
            },
            DirectoryGroup {
                id: "g-fin".to_string(),
                display_name: Some("Finance".to_string()),
            },
            DirectoryGroup {
                id: "g-eq".to_string(),
                display_name: Some("Équipe Réseau".to_string()),
            },
        ])
    }
}

#[tokio::test]
async fn resolved_group_names_feed_headers_and_rbac() {
    // GIVEN: group transformation on and a route restricted to "operators"
    let issuer = spawn_issuer().await;
    let (backend, mut heads) = spawn_accepting_backend().await;
    let directory = Arc::new(StaticDirectory {
        connects: AtomicUsize::new(0),
    });
    let resolver = Arc::new(GroupResolver::new(
        Arc::clone(&directory) as Arc<dyn DirectoryConnector>,
        Duration::from_secs(3600),
    ));
    let yaml = validated_route(
        &issuer,
        backend,
        &format!("    audience: {AUDIENCE}\n    rbac_roles: operators"),
    );
    let gateway = spawn_gateway(&yaml, Some(Arc::clone(&resolver))).await;

    // WHEN: a token whose only group is g-ops connects twice
    let mut claims = claims_for(&issuer.url, AUDIENCE);
    claims["roles"] = json!(["viewer"]);
    let auth = bearer(&sign_token(&claims));
    for _ in 0..2 {
        let (_client, head) =
            upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;
        // THEN: the group name (not the role) grants access
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
    }

    let request = heads.recv().await.unwrap().to_ascii_lowercase();
    assert!(request.contains("x-auth-user-groups: operators\r\n"), "{request}");
    assert!(request.contains("x-auth-user-roles: viewer\r\n"));

    // AND: the tenant was listed once
    assert_eq!(directory.connects.load(Ordering::SeqCst), 1);
    assert!(resolver.is_fresh("aaaa-bbbb-cccc").await);
}

#[tokio::test]
async fn groups_take_priority_over_roles_for_rbac() {
    // GIVEN: the caller's role matches but their resolved groups do not
    let issuer = spawn_issuer().await;
    let (backend, _heads) = spawn_accepting_backend().await;
    let resolver = Arc::new(GroupResolver::new(
        Arc::new(StaticDirectory {
            connects: AtomicUsize::new(0),
        }),
        Duration::from_secs(3600),
    ));
    let yaml = validated_route(
        &issuer,
        backend,
        &format!("    audience: {AUDIENCE}\n    rbac_roles: admin"),
    );
    let gateway = spawn_gateway(&yaml, Some(resolver)).await;
    let auth = bearer(&sign_token(&claims_for(&issuer.url, AUDIENCE)));

    // WHEN
    let (_client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;

    // THEN
    assert_eq!(head.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn accented_group_names_still_allow_matching_groups() {
    // GIVEN: the caller belongs to an accented group and to g-ops
    let issuer = spawn_issuer().await;
    let (backend, mut heads) = spawn_accepting_backend().await;
    let resolver = Arc::new(GroupResolver::new(
        Arc::new(StaticDirectory {
            connects: AtomicUsize::new(0),
        }),
        Duration::from_secs(3600),
    ));
    let yaml = validated_route(
        &issuer,
        backend,
        &format!("    audience: {AUDIENCE}\n    rbac_roles: operators"),
    );
    let gateway = spawn_gateway(&yaml, Some(resolver)).await;

    let mut claims = claims_for(&issuer.url, AUDIENCE);
    claims["groups"] = json!(["g-eq", "g-ops"]);
    let auth = bearer(&sign_token(&claims));

    // WHEN
    let (_client, head) = upgrade(gateway, "/secure", &[("Authorization", auth.as_str())]).await;

    // THEN: the ASCII group grants access and both names reach the backend
    assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
    let request = heads.recv().await.unwrap();
    assert!(
        request.contains("x-auth-user-groups: Équipe Réseau,Operators\r\n"),
        "{request}"
    );
}
