use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use crate::proxy::headers::is_hop_by_hop;

use super::line::read_line_with_timeout;

/// Status line and headers of an upstream response.
pub(crate) struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

/// How the body following an encoded head is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseFraming {
    /// `Content-Length` equal to the body that follows.
    Fixed(usize),
    /// No body follows; a stored `Content-Length` is echoed as-is (HEAD, 304).
    NoBody,
}

pub(crate) fn encode_response_head(
    status: StatusCode,
    headers: &HeaderMap,
    framing: ResponseFraming,
    connection_close: bool,
    extra: &[(&str, &str)],
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buffer.extend_from_slice(b"\r\n");

    let connection_tokens: HashSet<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut stored_length = None;
    for (name, value) in headers.iter() {
        let name = name.as_str();
        if name == "content-length" {
            stored_length.get_or_insert(value);
            continue;
        }
        if is_hop_by_hop(name)
            || connection_tokens.contains(name)
            || extra.iter().any(|(extra_name, _)| extra_name.eq_ignore_ascii_case(name))
        {
            continue;
        }
        push_header(&mut buffer, name.as_bytes(), value.as_bytes());
    }

    match framing {
        ResponseFraming::Fixed(length) => {
            push_header(&mut buffer, b"Content-Length", length.to_string().as_bytes());
        }
        ResponseFraming::NoBody => {
            if let Some(value) = stored_length {
                push_header(&mut buffer, b"Content-Length", value.as_bytes());
            }
        }
    }
    for (name, value) in extra {
        push_header(&mut buffer, name.as_bytes(), value.as_bytes());
    }
    if connection_close {
        push_header(&mut buffer, b"Connection", b"close");
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

fn push_header(buffer: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    buffer.extend_from_slice(name);
    buffer.extend_from_slice(b": ");
    buffer.extend_from_slice(value);
    buffer.extend_from_slice(b"\r\n");
}

pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let mut budget = max_header_bytes;
    let mut line = String::new();

    let bytes = read_line_with_timeout(reader, &mut line, timeout_dur, peer, budget).await?;
    if bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    budget -= bytes;
    let (version, status) = parse_status_line(line.trim_end_matches(['\r', '\n']))?;

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;
    let mut connection_close = version == Version::HTTP_10;

    loop {
        ensure!(budget > 0, "upstream response headers exceed configured limit");
        let read = read_line_with_timeout(reader, &mut line, timeout_dur, peer, budget)
            .await
            .context("reading upstream response headers")?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        budget -= read;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream"))?;
        let value = value.trim();
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}' from upstream"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid value for header '{name}' from upstream"))?;

        match name.as_str() {
            "content-length" => {
                let parsed: u64 = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                if content_length.is_some_and(|previous| previous != parsed) {
                    bail!("conflicting Content-Length headers from upstream");
                }
                content_length = Some(parsed);
            }
            "transfer-encoding" => {
                transfer_encoding_present = true;
                let last = value.rsplit(',').next().unwrap_or("").trim();
                chunked = last.eq_ignore_ascii_case("chunked");
            }
            "connection" => {
                for token in value.split(',').map(str::trim) {
                    if token.eq_ignore_ascii_case("close") {
                        connection_close = true;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        connection_close = false;
                    }
                }
            }
            _ => {}
        }
        headers.append(name, header_value);
    }

    if transfer_encoding_present && content_length.is_some() {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(ResponseHead {
        version,
        status,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

pub(crate) fn parse_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };
    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;
    Ok((version, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
        haystack
            .windows(needle.len())
            .any(|window| window == needle)
    }

    async fn read_head(raw: &'static [u8]) -> Result<ResponseHead> {
        let mut reader = BufReader::new(raw);
        read_response_head(
            &mut reader,
            Duration::from_secs(1),
            "127.0.0.1:80".parse().unwrap(),
            1024,
        )
        .await
    }

    #[test]
    fn encode_strips_hop_by_hop_and_sets_length() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Foo, Upgrade"));
        headers.insert("foo", HeaderValue::from_static("bar"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("123"));
        headers.insert("x-test", HeaderValue::from_static("1"));
        headers.insert(
            "x-binary",
            HeaderValue::from_bytes(b"foo\xffbar").unwrap(),
        );

        let encoded = encode_response_head(
            StatusCode::OK,
            &headers,
            ResponseFraming::Fixed(5),
            true,
            &[("X-Stash-Cache", "HIT")],
        );

        assert!(encoded.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(!contains_bytes(&encoded, b"Foo"));
        assert!(!contains_bytes(&encoded, b"foo: bar\r\n"));
        assert!(!contains_bytes(&encoded, b"upgrade:"));
        assert!(!contains_bytes(&encoded, b"transfer-encoding"));
        assert!(!contains_bytes(&encoded, b"123"));
        assert!(contains_bytes(&encoded, b"Content-Length: 5\r\n"));
        assert!(contains_bytes(&encoded, b"x-test: 1\r\n"));
        assert!(contains_bytes(&encoded, b"x-binary: foo\xffbar\r\n"));
        assert!(contains_bytes(&encoded, b"X-Stash-Cache: HIT\r\n"));
        assert!(contains_bytes(&encoded, b"Connection: close\r\n"));
        assert!(encoded.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn encode_echoes_stored_length_without_body() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("42"));
        let encoded =
            encode_response_head(StatusCode::OK, &headers, ResponseFraming::NoBody, false, &[]);
        assert!(contains_bytes(&encoded, b"Content-Length: 42\r\n"));
        assert!(!contains_bytes(&encoded, b"Connection:"));
    }

    #[test]
    fn encode_replaces_stale_marker_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-stash-cache", HeaderValue::from_static("MISS"));
        let encoded = encode_response_head(
            StatusCode::OK,
            &headers,
            ResponseFraming::Fixed(0),
            false,
            &[("X-Stash-Cache", "HIT")],
        );
        assert!(!contains_bytes(&encoded, b"MISS"));
        assert!(contains_bytes(&encoded, b"X-Stash-Cache: HIT\r\n"));
    }

    #[test]
    fn parse_status_line_accepts_valid_lines() -> Result<()> {
        let (version, status) = parse_status_line("HTTP/1.1 404 Not Found")?;
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (version, status) = parse_status_line("HTTP/1.0 200")?;
        assert_eq!(version, Version::HTTP_10);
        assert_eq!(status, StatusCode::OK);
        Ok(())
    }

    #[test]
    fn parse_status_line_rejects_bad_input() {
        for (line, needle) in [
            ("BAD 200 OK", "unsupported upstream HTTP version"),
            ("HTTP/1.1", "missing status code"),
            ("HTTP/1.1 twohundred OK", "invalid upstream status code"),
        ] {
            let err = parse_status_line(line).unwrap_err();
            assert!(err.to_string().contains(needle), "{line}: {err:?}");
        }
    }

    #[tokio::test]
    async fn read_response_head_collects_framing() -> Result<()> {
        let head = read_head(
            b"HTTP/1.1 201 Created\r\nContent-Length: 10\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n",
        )
        .await?;
        assert_eq!(head.status, StatusCode::CREATED);
        assert_eq!(head.content_length, Some(10));
        assert!(!head.chunked);
        assert!(!head.connection_close);
        assert_eq!(head.headers.get_all("set-cookie").iter().count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn read_response_head_detects_chunked_and_close() -> Result<()> {
        let head =
            read_head(b"HTTP/1.0 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n").await?;
        assert!(head.chunked);
        assert!(head.connection_close);
        Ok(())
    }

    #[tokio::test]
    async fn read_response_head_rejects_conflicting_content_length() {
        let err = read_head(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nContent-Length: 11\r\n\r\n")
            .await
            .err()
            .expect("conflicting Content-Length should be rejected");
        assert!(err.to_string().contains("conflicting Content-Length"), "{err}");
    }

    #[tokio::test]
    async fn read_response_head_rejects_transfer_encoding_with_content_length() {
        let err =
            read_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n")
                .await
                .err()
                .expect("Transfer-Encoding with Content-Length should be rejected");
        assert!(
            err.to_string()
                .contains("must not include both Transfer-Encoding and Content-Length"),
            "unexpected error: {err}"
        );
    }
}
