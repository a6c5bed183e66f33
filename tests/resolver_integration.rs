#![cfg(unix)]

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use stashproxy::identity::{IdentityError, IdentityResolver};
use stashproxy::proxy::request::ProxyRequest;
use stashproxy::store::CacheKey;

use support::harness::disk_settings;
use support::*;

fn get_with(path: &str, extra: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: stash.test\r\n{extra}Connection: close\r\n\r\n")
        .into_bytes()
}

fn with_hasher(upstream: &MockUpstream, command: &str) -> stashproxy::settings::Settings {
    let mut settings = test_settings(&upstream.url());
    settings.hasher_command = Some(command.to_string());
    settings.hasher_timeout = 5;
    settings
}

#[tokio::test]
async fn constant_key_collapses_different_requests() -> Result<()> {
    let upstream = MockUpstream::start().await?;
    let proxy = ProxyHarness::start(with_hasher(&upstream, "cat > /dev/null; echo k")).await?;

    let first = send_request(proxy.addr, &get_with("/a", "")).await?;
    assert_eq!(first.header("x-stash-cache"), Some("MISS"));
    let second = send_request(proxy.addr, &get_with("/b?other=1", "")).await?;
    assert_eq!(second.header("x-stash-cache"), Some("HIT"));
    assert_eq!(second.body, first.body);

    assert_eq!(upstream.hits(), 1);
    assert_eq!(upstream.requests()[0].request_line(), "GET /a HTTP/1.1");
    Ok(())
}

#[tokio::test]
async fn hasher_sees_request_headers() -> Result<()> {
    let upstream = MockUpstream::start().await?;
    let proxy = ProxyHarness::start(with_hasher(
        &upstream,
        "grep -i '^x-tenant:' | tr -d '\\r'",
    ))
    .await?;

    let alpha = send_request(proxy.addr, &get_with("/data", "X-Tenant: alpha\r\n")).await?;
    let beta = send_request(proxy.addr, &get_with("/data", "X-Tenant: beta\r\n")).await?;
    let alpha_again = send_request(proxy.addr, &get_with("/data", "X-Tenant: alpha\r\n")).await?;

    assert_eq!(alpha.header("x-stash-cache"), Some("MISS"));
    assert_eq!(beta.header("x-stash-cache"), Some("MISS"));
    assert_eq!(alpha_again.header("x-stash-cache"), Some("HIT"));
    assert_eq!(alpha_again.body, alpha.body);
    assert_ne!(alpha.body, beta.body);
    assert_eq!(upstream.hits(), 2);
    Ok(())
}

#[tokio::test]
async fn failing_hasher_returns_server_error_without_fetching() -> Result<()> {
    let data = TempDir::new()?;
    let upstream = MockUpstream::start().await?;

    let mut broken = disk_settings(&upstream.url(), data.path());
    broken.hasher_command = Some("exit 3".to_string());
    let proxy = ProxyHarness::start(broken).await?;
    let response = send_request(proxy.addr, &get_with("/a", "")).await?;
    assert_eq!(response.status, 500);
    assert!(response.header("x-stash-cache").is_none());
    assert_eq!(upstream.hits(), 0);
    assert!(proxy.app.pipeline.store().is_empty());
    drop(proxy);

    let mut fixed = disk_settings(&upstream.url(), data.path());
    fixed.hasher_command = Some("cat > /dev/null; echo k".to_string());
    let proxy = ProxyHarness::start(fixed).await?;
    assert!(proxy.app.pipeline.store().is_empty());
    let retried = send_request(proxy.addr, &get_with("/a", "")).await?;
    assert_eq!(retried.status, 200);
    assert_eq!(retried.header("x-stash-cache"), Some("MISS"));
    assert_eq!(upstream.hits(), 1);
    let replay = send_request(proxy.addr, &get_with("/a", "")).await?;
    assert_eq!(replay.header("x-stash-cache"), Some("HIT"));
    assert_eq!(upstream.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn multi_line_key_is_rejected() -> Result<()> {
    let upstream = MockUpstream::start().await?;
    let proxy =
        ProxyHarness::start(with_hasher(&upstream, "cat > /dev/null; printf 'a\\nb\\n'")).await?;

    let response = send_request(proxy.addr, &get_with("/a", "")).await?;
    assert_eq!(response.status, 500);
    assert_eq!(upstream.hits(), 0);
    Ok(())
}

struct PathOnly {
    calls: AtomicUsize,
}

#[async_trait]
impl IdentityResolver for PathOnly {
    fn name(&self) -> &'static str {
        "path-only"
    }

    async fn resolve(&self, request: &ProxyRequest) -> Result<CacheKey, IdentityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = request.target.split('?').next().unwrap_or_default();
        Ok(CacheKey::new(path))
    }
}

#[tokio::test]
async fn injected_resolver_decides_identity() -> Result<()> {
    let upstream = MockUpstream::start().await?;
    let resolver = Arc::new(PathOnly {
        calls: AtomicUsize::new(0),
    });
    let proxy =
        ProxyHarness::start_with_resolver(test_settings(&upstream.url()), resolver.clone())
            .await?;

    send_request(proxy.addr, &get_with("/list?page=1", "")).await?;
    let second = send_request(proxy.addr, &get_with("/list?page=2", "")).await?;
    assert_eq!(second.header("x-stash-cache"), Some("HIT"));
    assert_eq!(upstream.hits(), 1);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    Ok(())
}
