use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::proxy::http::codec::read_request_head;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Total proxied requests by cache outcome");
    let vec = IntCounterVec::new(opts, &["cache"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "request_duration_seconds",
        "Time from request head to response written",
    )
    .buckets(latency_buckets());
    let histogram = Histogram::with_opts(opts).expect("create histogram");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register request_duration_seconds");
    histogram
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_store_total", "Cache writes by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_store_total");
    vec
});

static UPSTREAM_FETCH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("upstream_fetch_total", "Upstream fetches by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_fetch_total");
    vec
});

static COALESCED_WAITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "coalesced_waits_total",
        "Requests that waited on another request's upstream fetch",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register coalesced_waits_total");
    counter
});

static IDENTITY_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "identity_failures_total",
        "Requests whose cache key could not be resolved",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register identity_failures_total");
    counter
});

static PRESEED_ITEMS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("preseed_items_total", "Preseed items by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register preseed_items_total");
    vec
});

static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge =
        IntGauge::new("cache_entries", "Entries currently indexed").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_entries");
    gauge
});

fn latency_buckets() -> Vec<f64> {
    // Hits are sub-millisecond; misses follow the upstream.
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_PATH: &str = "/metrics";

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_request(cache: Option<&str>, status: StatusCode, elapsed: Duration) {
    REQUESTS_TOTAL
        .with_label_values(&[cache.unwrap_or("none")])
        .inc();
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status.as_u16())])
        .inc();
    REQUEST_DURATION_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store(result: &str) {
    CACHE_STORE_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_upstream_fetch(result: &str) {
    UPSTREAM_FETCH_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_coalesced_wait() {
    COALESCED_WAITS_TOTAL.inc();
}

pub fn record_identity_failure() {
    IDENTITY_FAILURES_TOTAL.inc();
}

pub fn record_preseed_item(outcome: &str) {
    PRESEED_ITEMS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_cache_entries(count: usize) {
    CACHE_ENTRIES.set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(listen = %addr, "metrics endpoint listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, peer, METRICS_READ_TIMEOUT).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(stream: S, peer: SocketAddr, read_timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let Some(head) = read_request_head(
        &mut reader,
        peer,
        read_timeout,
        read_timeout,
        METRICS_MAX_REQUEST_BYTES,
    )
    .await?
    else {
        return Ok(());
    };

    let response = if head.method == Method::GET && head.target == METRICS_PATH {
        build_response(200, TextEncoder::new().format_type(), gather())
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}
