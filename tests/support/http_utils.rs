use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Writes one raw request and reads until the proxy closes the connection. Callers send
/// `Connection: close` so the response ends at EOF.
pub async fn send_request(addr: SocketAddr, raw: &[u8]) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(raw).await?;
    stream.flush().await?;
    let mut buf = Vec::new();
    timeout(StdDuration::from_secs(10), stream.read_to_end(&mut buf))
        .await
        .context("timed out waiting for proxy response")??;
    parse_response(&buf)
}

pub fn parse_response(buf: &[u8]) -> Result<HttpResponse> {
    let split = buf
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no header terminator"))?;
    let head = std::str::from_utf8(&buf[..split]).context("response head is not UTF-8")?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in {status_line:?}"))?
        .parse::<u16>()
        .map_err(|err| anyhow!("invalid status code: {err}"))?;
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();
    Ok(HttpResponse {
        status,
        headers,
        body: buf[split + 4..].to_vec(),
    })
}

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = stream.read(&mut byte).await?;
        if bytes == 0 {
            break;
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(buffer)
}
