use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::headers::HeaderAccumulator;
use super::line::read_line_with_deadline;

pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderAccumulator,
    pub request_line_bytes: usize,
}

impl RequestHead {
    /// HTTP/1.1 connections persist unless the client says `close`; HTTP/1.0 only when it
    /// asks for `keep-alive`.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::HTTP_10 => self.headers.wants_keep_alive(),
            _ => !self.headers.wants_connection_close(),
        }
    }

    pub fn head_bytes(&self) -> usize {
        self.request_line_bytes + self.headers.total_bytes()
    }
}

/// Waits up to `idle_timeout` for the next request, then allows `header_timeout` for the whole
/// head. Returns `None` when the connection closes or idles out between requests.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + header_timeout;
    let mut request_line = String::new();
    let request_line_bytes =
        read_line_with_deadline(reader, &mut request_line, deadline, peer, max_header_bytes)
            .await
            .context("reading request line")?;
    if request_line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }
    let line = request_line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let mut parts = line.split(' ');
    let method_str = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;

    let remaining = max_header_bytes.saturating_sub(request_line_bytes);
    ensure!(remaining > 0, "request headers exceed configured limit");
    let mut headers = HeaderAccumulator::new(remaining);
    let mut header_line = String::new();
    loop {
        let read =
            read_line_with_deadline(reader, &mut header_line, deadline, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed during request headers from {peer}");
        }
        if !headers
            .push_line(&header_line)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }

    Ok(Some(RequestHead {
        method,
        target: target.to_string(),
        version,
        headers,
        request_line_bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    fn peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    async fn parse(raw: &[u8], max_header_bytes: usize) -> Result<Option<RequestHead>> {
        let (mut client, server) = duplex(8192);
        client.write_all(raw).await?;
        drop(client);
        let mut reader = BufReader::new(server);
        read_request_head(
            &mut reader,
            peer(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            max_header_bytes,
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn read_request_head_times_out_on_partial_line() {
        let (mut client, server) = duplex(64);

        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            read_request_head(
                &mut reader,
                peer(),
                Duration::from_millis(50),
                Duration::from_millis(50),
                1024,
            )
            .await
        });

        tokio::task::yield_now().await;
        client
            .write_all(b"GET / HTTP/1.1")
            .await
            .expect("write partial line");
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(100)).await;

        let result = handle.await.expect("request head join");
        match result {
            Ok(_) => panic!("expected timeout on partial line"),
            Err(err) => {
                assert!(
                    format!("{err:#}").contains("timed out"),
                    "unexpected error: {err}"
                );
            }
        }
    }

    #[tokio::test]
    async fn parses_basic_request() -> Result<()> {
        let head = parse(
            b"POST /items?id=3 HTTP/1.1\r\nHost: proxy.local\r\nContent-Length: 4\r\nAccept: */*\r\n\r\nbody",
            1024,
        )
        .await?
        .expect("expected request head");
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.target, "/items?id=3");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.host(), Some("proxy.local"));
        assert_eq!(head.headers.content_length(), Some(4));
        assert!(head.keep_alive());
        assert!(head.headers.forward_header_map().contains_key("accept"));
        Ok(())
    }

    #[tokio::test]
    async fn http10_closes_unless_keep_alive_requested() -> Result<()> {
        let head = parse(b"GET / HTTP/1.0\r\n\r\n", 1024).await?.expect("head");
        assert_eq!(head.version, Version::HTTP_10);
        assert!(!head.keep_alive());

        let head = parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", 1024)
            .await?
            .expect("head");
        assert!(head.keep_alive());
        Ok(())
    }

    #[tokio::test]
    async fn connection_close_ends_http11_session() -> Result<()> {
        let head = parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", 1024)
            .await?
            .expect("head");
        assert!(!head.keep_alive());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_extra_tokens() {
        let err = parse(b"GET / HTTP/1.1 extra\r\nHost: example.com\r\n\r\n", 1024)
            .await
            .err()
            .expect("request line with extra tokens should be rejected");
        assert!(
            err.to_string().contains("unexpected data"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        let err = parse(b"GET / HTTP/2.0\r\n\r\n", 1024)
            .await
            .err()
            .expect("HTTP/2.0 request line should be rejected");
        assert!(err.to_string().contains("invalid HTTP version"), "{err}");
    }

    #[tokio::test]
    async fn rejects_long_request_line() {
        let long_path = "a".repeat(2048);
        let request = format!("GET /{long_path} HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let err = parse(request.as_bytes(), 512)
            .await
            .err()
            .expect("request line should exceed limit");
        assert!(
            format!("{err:#}").contains("exceeds configured limit"),
            "unexpected error message: {err}"
        );
    }

    #[tokio::test]
    async fn returns_none_on_closed_connection() -> Result<()> {
        assert!(parse(b"", 1024).await?.is_none());
        Ok(())
    }
}
