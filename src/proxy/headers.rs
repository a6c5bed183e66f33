use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::HeaderMap;

/// Headers that describe a single connection and never travel past it.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Removes hop-by-hop headers, including any named by `Connection`, from a header map.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let tokens: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for token in tokens {
        headers.remove(token.as_str());
    }
    let hop_by_hop: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDisposition {
    Connection,
    Host,
    ContentLength,
    TransferEncoding,
    Expect,
    Skip,
    Forward,
}

pub fn classify_request_header(name: &str) -> HeaderDisposition {
    match name {
        "connection" => HeaderDisposition::Connection,
        "host" => HeaderDisposition::Host,
        "content-length" => HeaderDisposition::ContentLength,
        "transfer-encoding" => HeaderDisposition::TransferEncoding,
        "expect" => HeaderDisposition::Expect,
        other if is_hop_by_hop(other) || other.starts_with("proxy-") => HeaderDisposition::Skip,
        _ => HeaderDisposition::Forward,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    Forward,
    Skip,
}

/// Tracks the framing-relevant request headers while enforcing the header size budget.
#[derive(Debug, Clone)]
pub struct RequestHeaderSanitizer {
    max_bytes: usize,
    consumed: usize,
    host: Option<String>,
    content_length: Option<usize>,
    chunked: bool,
    expect_continue: bool,
    connection_tokens: HashSet<String>,
    transfer_encoding_seen: bool,
}

impl RequestHeaderSanitizer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            host: None,
            content_length: None,
            chunked: false,
            expect_continue: false,
            connection_tokens: HashSet::new(),
            transfer_encoding_seen: false,
        }
    }

    pub fn reserve(&mut self, byte_len: usize) -> Result<()> {
        self.consumed = self
            .consumed
            .checked_add(byte_len)
            .ok_or_else(|| anyhow!("header section exceeds configured limit"))?;
        ensure!(
            self.consumed <= self.max_bytes,
            "header section exceeds configured limit"
        );
        Ok(())
    }

    pub fn record(&mut self, name: &str, value: &str, byte_len: usize) -> Result<HeaderAction> {
        self.reserve(byte_len)?;

        let name_lower = name.to_ascii_lowercase();
        match classify_request_header(&name_lower) {
            HeaderDisposition::Connection => {
                for token in value.split(',') {
                    let token = token.trim();
                    if !token.is_empty() {
                        self.connection_tokens.insert(token.to_ascii_lowercase());
                    }
                }
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::Host => {
                if self.host.is_some() {
                    bail!("duplicate Host header");
                }
                self.host = Some(value.to_string());
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::ContentLength => {
                if self.chunked {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                let length: usize = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                if let Some(previous) = self.content_length
                    && previous != length
                {
                    bail!("conflicting Content-Length headers");
                }
                self.content_length = Some(length);
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::TransferEncoding => {
                if self.transfer_encoding_seen {
                    bail!("duplicate Transfer-Encoding header");
                }
                self.transfer_encoding_seen = true;
                let encodings: Vec<String> = value
                    .split(',')
                    .map(|item| item.trim().to_ascii_lowercase())
                    .filter(|item| !item.is_empty())
                    .collect();
                if encodings.len() != 1 || encodings[0] != "chunked" {
                    bail!("unsupported Transfer-Encoding '{value}'");
                }
                if self.content_length.is_some() {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                self.chunked = true;
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::Expect => {
                if !value.eq_ignore_ascii_case("100-continue") {
                    bail!("unsupported Expect header value '{value}'");
                }
                self.expect_continue = true;
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::Skip => Ok(HeaderAction::Skip),
            HeaderDisposition::Forward => Ok(HeaderAction::Forward),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    pub fn total_bytes(&self) -> usize {
        self.consumed
    }

    pub fn connection_tokens(&self) -> &HashSet<String> {
        &self.connection_tokens
    }
}
