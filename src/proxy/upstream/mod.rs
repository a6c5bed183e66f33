mod connect;
mod target;

use std::time::Duration;

use anyhow::{Result, bail};
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::io_util::{flush_with_timeout, write_all_with_timeout};
use crate::metrics;
use crate::proxy::headers::{HeaderDisposition, classify_request_header, strip_hop_by_hop};
use crate::proxy::http::body::{BodyPlan, BodyTooLarge, read_body};
use crate::proxy::http::codec::{ResponseHead, read_response_head};
use crate::proxy::request::ProxyRequest;
use crate::settings::Settings;
use crate::store::CacheEntry;

pub use connect::build_tls_client_config;
pub use target::{Scheme, UpstreamTarget};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to upstream {authority}: {reason:#}")]
    Connect {
        authority: String,
        reason: anyhow::Error,
    },
    #[error("upstream {authority} exchange failed: {reason:#}")]
    Exchange {
        authority: String,
        reason: anyhow::Error,
    },
    #[error("upstream response body exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },
}

impl UpstreamError {
    fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Connect { .. } => "connect",
            UpstreamError::Exchange { .. } => "exchange",
            UpstreamError::ResponseTooLarge { .. } => "too_large",
        }
    }
}

/// Fetches full responses from the configured origin, one connection per fetch.
pub struct UpstreamClient {
    target: UpstreamTarget,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
    idle_timeout: Duration,
    max_header_size: usize,
    max_body_size: usize,
}

impl UpstreamClient {
    pub fn new(target: UpstreamTarget) -> Result<Self> {
        let tls = match target.scheme() {
            Scheme::Https => Some(TlsConnector::from(build_tls_client_config()?)),
            Scheme::Http => None,
        };
        Ok(Self {
            target,
            tls,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            max_header_size: 32 * 1024,
            max_body_size: 256 * 1024 * 1024,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let target = UpstreamTarget::parse(&settings.upstream_url)?;
        Ok(Self::new(target)?
            .with_timeouts(settings.upstream_connect_timeout(), settings.upstream_timeout())
            .with_limits(settings.max_header_size, settings.max_response_body_size))
    }

    pub fn with_timeouts(mut self, connect: Duration, idle: Duration) -> Self {
        self.connect_timeout = connect;
        self.idle_timeout = idle;
        self
    }

    pub fn with_limits(mut self, max_header_size: usize, max_body_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self.max_body_size = max_body_size;
        self
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Forwards `request` and reads the complete response. Any status the origin returns is a
    /// successful fetch; only transport failures are errors.
    pub async fn fetch(&self, request: &ProxyRequest) -> Result<CacheEntry, UpstreamError> {
        let result = self.fetch_inner(request).await;
        match &result {
            Ok(entry) => {
                metrics::record_upstream_fetch("ok");
                debug!(
                    upstream = %self.target,
                    method = %request.method,
                    target = %request.target,
                    status = entry.status.as_u16(),
                    bytes = entry.body.len(),
                    "fetched response from upstream"
                );
            }
            Err(err) => metrics::record_upstream_fetch(err.kind()),
        }
        result
    }

    async fn fetch_inner(&self, request: &ProxyRequest) -> Result<CacheEntry, UpstreamError> {
        let authority = self.target.authority();
        let (stream, peer) =
            connect::open_connection(&self.target, self.tls.as_ref(), self.connect_timeout)
                .await
                .map_err(|reason| UpstreamError::Connect {
                    authority: authority.clone(),
                    reason,
                })?;

        let mut reader = BufReader::new(stream);
        let head = build_upstream_request(request, &self.target);
        let exchange = async {
            write_all_with_timeout(
                reader.get_mut(),
                &head,
                self.idle_timeout,
                "writing upstream request head",
            )
            .await?;
            if !request.body.is_empty() {
                write_all_with_timeout(
                    reader.get_mut(),
                    &request.body,
                    self.idle_timeout,
                    "writing upstream request body",
                )
                .await?;
            }
            flush_with_timeout(reader.get_mut(), self.idle_timeout).await?;

            let response = loop {
                let head =
                    read_response_head(&mut reader, self.idle_timeout, peer, self.max_header_size)
                        .await?;
                if head.status == StatusCode::SWITCHING_PROTOCOLS {
                    bail!("upstream attempted a protocol upgrade");
                }
                if head.status.is_informational() {
                    continue;
                }
                break head;
            };
            let plan = response_body_plan(&request.method, &response);
            let body = read_body(
                &mut reader,
                plan,
                self.idle_timeout,
                peer,
                self.max_body_size,
            )
            .await?;
            let _ = reader.get_mut().shutdown().await;
            Ok::<_, anyhow::Error>((response, body))
        };

        let (response, body) = exchange.await.map_err(|reason| {
            if let Some(too_large) = reason.downcast_ref::<BodyTooLarge>() {
                UpstreamError::ResponseTooLarge {
                    limit: too_large.limit,
                }
            } else {
                UpstreamError::Exchange {
                    authority: authority.clone(),
                    reason,
                }
            }
        })?;

        let mut headers = response.headers;
        strip_hop_by_hop(&mut headers);
        Ok(CacheEntry::new(response.status, headers, body))
    }
}

fn response_body_plan(method: &Method, head: &ResponseHead) -> BodyPlan {
    if *method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return BodyPlan::Empty;
    }
    if head.chunked {
        return BodyPlan::Chunked;
    }
    match head.content_length {
        Some(length) => match usize::try_from(length) {
            Ok(length) => BodyPlan::Fixed(length),
            // Larger than addressable memory; read_body rejects it against the limit.
            Err(_) => BodyPlan::Fixed(usize::MAX),
        },
        None => BodyPlan::UntilClose,
    }
}

fn needs_content_length(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

/// Serializes the outbound request head. Only end-to-end headers travel; `Host` names the
/// upstream and the body is always sent with an explicit length.
pub(crate) fn build_upstream_request(request: &ProxyRequest, target: &UpstreamTarget) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.request_target(&request.target).as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    push_header(&mut out, "Host", target.authority().as_bytes());
    forward_headers(&mut out, &request.headers);
    if !request.body.is_empty() || needs_content_length(&request.method) {
        push_header(
            &mut out,
            "Content-Length",
            request.body.len().to_string().as_bytes(),
        );
    }
    push_header(&mut out, "Connection", b"close");
    out.extend_from_slice(b"\r\n");
    out
}

fn forward_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        if classify_request_header(name.as_str()) == HeaderDisposition::Forward {
            push_header(out, name.as_str(), value.as_bytes());
        }
    }
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("target", &self.target.to_string())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
