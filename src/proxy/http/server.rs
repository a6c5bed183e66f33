use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::io_util::{flush_with_timeout, shutdown_stream, write_all_with_timeout};
use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::pipeline::Served;
use crate::proxy::preseed;
use crate::proxy::request::{ProxyRequest, origin_form_target, path_without_query};

use super::body::{BodyPlan, BodyTooLarge, read_body};
use super::codec::{RequestHead, ResponseFraming, encode_response_head, read_request_head};

pub(crate) const CACHE_STATUS_HEADER: &str = "X-Stash-Cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientDisposition {
    Continue,
    Close,
}

/// Serves requests on one inbound connection until the client closes it, asks to close, or a
/// request cannot be framed.
pub(crate) async fn serve_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_timeout = app.settings.client_timeout();
    let max_header_size = app.settings.max_header_size;
    let mut reader = BufReader::new(stream);

    loop {
        let start = Instant::now();
        let head = match read_request_head(
            &mut reader,
            peer,
            client_timeout,
            client_timeout,
            max_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                debug!(peer = %peer, error = %format!("{err:#}"), "rejecting unreadable request head");
                let _ = send_text(
                    reader.get_mut(),
                    StatusCode::BAD_REQUEST,
                    "malformed request\n",
                    true,
                    client_timeout,
                )
                .await;
                break;
            }
        };

        match handle_request(&mut reader, peer, &app, head, start).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }

    let _ = shutdown_stream(reader.get_mut(), client_timeout).await;
    Ok(())
}

async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    head: RequestHead,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let settings = &app.settings;
    let client_timeout = settings.client_timeout();
    let log = AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .path(path_without_query(&head.target));

    let target = match origin_form_target(&head.target) {
        Ok(target) => target,
        Err(err) => {
            return reject(
                reader,
                log.error_detail(format!("{err:#}")),
                StatusCode::BAD_REQUEST,
                "invalid_target",
                head.head_bytes(),
                client_timeout,
                start,
            )
            .await;
        }
    };
    let keep_alive = head.keep_alive();

    let plan = if head.headers.is_chunked() {
        BodyPlan::Chunked
    } else {
        match head.headers.content_length() {
            Some(0) | None => BodyPlan::Empty,
            Some(length) => BodyPlan::Fixed(length),
        }
    };
    if head.headers.expect_continue() && plan != BodyPlan::Empty {
        if let BodyPlan::Fixed(length) = plan
            && length > settings.max_request_body_size
        {
            return reject(
                reader,
                log,
                StatusCode::PAYLOAD_TOO_LARGE,
                "request_too_large",
                head.head_bytes(),
                client_timeout,
                start,
            )
            .await;
        }
        write_all_with_timeout(
            reader.get_mut(),
            b"HTTP/1.1 100 Continue\r\n\r\n",
            client_timeout,
            "writing 100 Continue",
        )
        .await?;
        flush_with_timeout(reader.get_mut(), client_timeout).await?;
    }

    let body = match read_body(
        reader,
        plan,
        client_timeout,
        peer,
        settings.max_request_body_size,
    )
    .await
    {
        Ok(body) => body,
        Err(err) => {
            let (status, reason) = if err.downcast_ref::<BodyTooLarge>().is_some() {
                (StatusCode::PAYLOAD_TOO_LARGE, "request_too_large")
            } else {
                (StatusCode::BAD_REQUEST, "invalid_body")
            };
            return reject(
                reader,
                log.error_detail(format!("{err:#}")),
                status,
                reason,
                head.head_bytes(),
                client_timeout,
                start,
            )
            .await;
        }
    };

    let bytes_in = (head.head_bytes() + body.len()) as u64;
    let is_seed = path_without_query(&target) == settings.seed_path;
    let request = ProxyRequest::new(head.method, target)
        .with_headers(head.headers.forward_header_map())
        .with_body(body);

    let exchange = Exchange {
        peer,
        keep_alive,
        bytes_in,
        start,
        timeout: client_timeout,
    };
    if is_seed {
        handle_preseed(reader.get_mut(), app, request, exchange, log).await
    } else {
        handle_proxy(reader.get_mut(), app, request, exchange, log).await
    }
}

struct Exchange {
    peer: SocketAddr,
    keep_alive: bool,
    bytes_in: u64,
    start: Instant,
    timeout: Duration,
}

impl Exchange {
    fn disposition(&self) -> ClientDisposition {
        if self.keep_alive {
            ClientDisposition::Continue
        } else {
            ClientDisposition::Close
        }
    }
}

async fn handle_proxy<S>(
    stream: &mut S,
    app: &AppContext,
    request: ProxyRequest,
    exchange: Exchange,
    log: AccessLogBuilder,
) -> Result<ClientDisposition>
where
    S: AsyncWrite + Unpin,
{
    let method = request.method.clone();
    match app.pipeline.execute(request).await {
        Ok(served) => {
            let bytes_out = send_entry(stream, &method, &served, !exchange.keep_alive, exchange.timeout)
                .await?;
            let mut log = log
                .key(served.key.as_str())
                .cache_lookup(served.lookup.as_str())
                .status(served.entry.status);
            if let Some(store) = served.store {
                log = log.cache_store(store.as_str());
            }
            log.bytes(exchange.bytes_in, bytes_out as u64)
                .elapsed(exchange.start.elapsed())
                .log();
            Ok(exchange.disposition())
        }
        Err(err) => {
            let status = err.status();
            debug!(peer = %exchange.peer, error = %err, "request failed");
            let body = format!("{}\n", status.canonical_reason().unwrap_or("error"));
            let bytes_out =
                send_text(stream, status, &body, !exchange.keep_alive, exchange.timeout).await?;
            log.status(status)
                .error_reason(err.reason())
                .error_detail(err.to_string())
                .bytes(exchange.bytes_in, bytes_out as u64)
                .elapsed(exchange.start.elapsed())
                .log();
            Ok(exchange.disposition())
        }
    }
}

async fn handle_preseed<S>(
    stream: &mut S,
    app: &AppContext,
    request: ProxyRequest,
    exchange: Exchange,
    log: AccessLogBuilder,
) -> Result<ClientDisposition>
where
    S: AsyncWrite + Unpin,
{
    let log = log.cache_lookup("seed");
    if request.method != Method::POST {
        let body = b"preseed accepts POST only\n";
        let head = encode_response_head(
            StatusCode::METHOD_NOT_ALLOWED,
            &text_headers(),
            ResponseFraming::Fixed(body.len()),
            !exchange.keep_alive,
            &[("Allow", "POST")],
        );
        let bytes_out = write_response(stream, &head, body, exchange.timeout).await?;
        log.status(StatusCode::METHOD_NOT_ALLOWED)
            .error_reason("method_not_allowed")
            .bytes(exchange.bytes_in, bytes_out as u64)
            .elapsed(exchange.start.elapsed())
            .log();
        return Ok(exchange.disposition());
    }

    let requests = match preseed::parse_batch(&request.body) {
        Ok(requests) => requests,
        Err(err) => {
            let body = format!("{err}\n");
            let bytes_out = send_text(
                stream,
                StatusCode::BAD_REQUEST,
                &body,
                !exchange.keep_alive,
                exchange.timeout,
            )
            .await?;
            log.status(StatusCode::BAD_REQUEST)
                .error_reason("bad_preseed_batch")
                .error_detail(err.to_string())
                .bytes(exchange.bytes_in, bytes_out as u64)
                .elapsed(exchange.start.elapsed())
                .log();
            return Ok(exchange.disposition());
        }
    };

    let summary = preseed::run_batch(&app.pipeline, requests).await;
    let body = Bytes::from(serde_json::to_vec(&summary)?);
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let head = encode_response_head(
        StatusCode::OK,
        &headers,
        ResponseFraming::Fixed(body.len()),
        !exchange.keep_alive,
        &[],
    );
    let bytes_out = write_response(stream, &head, &body, exchange.timeout).await?;
    log.status(StatusCode::OK)
        .bytes(exchange.bytes_in, bytes_out as u64)
        .elapsed(exchange.start.elapsed())
        .log();
    Ok(exchange.disposition())
}

/// Replays a captured entry. The stored body length always wins over any stored framing.
async fn send_entry<S>(
    stream: &mut S,
    method: &Method,
    served: &Served,
    connection_close: bool,
    timeout: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let entry = &served.entry;
    let no_body = *method == Method::HEAD
        || entry.status.is_informational()
        || entry.status == StatusCode::NO_CONTENT
        || entry.status == StatusCode::NOT_MODIFIED;
    let framing = if no_body {
        ResponseFraming::NoBody
    } else {
        ResponseFraming::Fixed(entry.body.len())
    };
    let cache_status = if served.lookup.served_from_cache() {
        "HIT"
    } else {
        "MISS"
    };
    let head = encode_response_head(
        entry.status,
        &entry.headers,
        framing,
        connection_close,
        &[(CACHE_STATUS_HEADER, cache_status)],
    );
    let body: &[u8] = if no_body { &[] } else { &entry.body };
    write_response(stream, &head, body, timeout).await
}

fn text_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers
}

async fn send_text<S>(
    stream: &mut S,
    status: StatusCode,
    body: &str,
    connection_close: bool,
    timeout: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let head = encode_response_head(
        status,
        &text_headers(),
        ResponseFraming::Fixed(body.len()),
        connection_close,
        &[],
    );
    write_response(stream, &head, body.as_bytes(), timeout).await
}

async fn write_response<S>(stream: &mut S, head: &[u8], body: &[u8], timeout: Duration) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    write_all_with_timeout(stream, head, timeout, "writing response head").await?;
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout, "writing response body").await?;
    }
    flush_with_timeout(stream, timeout).await?;
    Ok(head.len() + body.len())
}

/// Answers a request that cannot be served and closes the connection, since the rest of its
/// body may still be unread.
async fn reject<S>(
    reader: &mut BufReader<S>,
    log: AccessLogBuilder,
    status: StatusCode,
    reason: &str,
    bytes_in: usize,
    timeout: Duration,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = format!("{}\n", status.canonical_reason().unwrap_or("error"));
    let bytes_out = send_text(reader.get_mut(), status, &body, true, timeout).await?;
    log.status(status)
        .error_reason(reason)
        .bytes(bytes_in as u64, bytes_out as u64)
        .elapsed(start.elapsed())
        .log();
    Ok(ClientDisposition::Close)
}
