use anyhow::{Result, anyhow, bail};
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

use crate::proxy::headers::{HeaderAction, RequestHeaderSanitizer};

#[derive(Clone)]
struct HeaderLine {
    name: HeaderName,
    value: HeaderValue,
}

/// Collects inbound request header lines, keeping only those that travel to the upstream.
pub(crate) struct HeaderAccumulator {
    sanitizer: RequestHeaderSanitizer,
    headers: Vec<HeaderLine>,
}

impl HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            sanitizer: RequestHeaderSanitizer::new(max_bytes),
            headers: Vec::new(),
        }
    }

    /// Returns `false` once the blank line ending the header section is seen.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        let line_len = line.len();
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            self.sanitizer.reserve(line_len)?;
            return Ok(false);
        }
        if trimmed.starts_with([' ', '\t']) {
            bail!("obsolete header line folding is not supported");
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        if name.is_empty() || name.ends_with([' ', '\t']) {
            bail!("invalid header name '{name}'");
        }
        let value = value.trim();
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid value for header '{name}'"))?;
        if let HeaderAction::Forward = self.sanitizer.record(name, value, line_len)? {
            self.headers.push(HeaderLine {
                name: header_name,
                value: header_value,
            });
        }
        Ok(true)
    }

    pub fn host(&self) -> Option<&str> {
        self.sanitizer.host()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.sanitizer.content_length()
    }

    pub fn is_chunked(&self) -> bool {
        self.sanitizer.is_chunked()
    }

    pub fn expect_continue(&self) -> bool {
        self.sanitizer.expect_continue()
    }

    pub fn total_bytes(&self) -> usize {
        self.sanitizer.total_bytes()
    }

    pub fn has_connection_token(&self, token: &str) -> bool {
        self.sanitizer.connection_tokens().contains(token)
    }

    pub fn wants_connection_close(&self) -> bool {
        self.has_connection_token("close")
    }

    pub fn wants_keep_alive(&self) -> bool {
        self.has_connection_token("keep-alive")
    }

    /// End-to-end headers in arrival order, minus any named by `Connection`.
    pub fn forward_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for header in &self.headers {
            if !self.has_connection_token(header.name.as_str()) {
                map.append(header.name.clone(), header.value.clone());
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::HeaderAccumulator;

    #[test]
    fn forward_headers_skip_connection_tokens() {
        let mut accumulator = HeaderAccumulator::new(256);
        assert!(matches!(
            accumulator.push_line("Connection: Foo\r\n"),
            Ok(true)
        ));
        assert!(matches!(accumulator.push_line("Foo: bar\r\n"), Ok(true)));
        assert!(matches!(accumulator.push_line("Bar: baz\r\n"), Ok(true)));
        assert!(matches!(accumulator.push_line("\r\n"), Ok(false)));
        let headers = accumulator.forward_header_map();
        assert_eq!(headers.get("bar").map(|v| v.as_bytes()), Some(&b"baz"[..]));
        assert!(
            !headers.contains_key("foo"),
            "Foo header should be skipped due to Connection token"
        );
        assert!(!headers.contains_key("connection"));
    }

    #[test]
    fn repeated_headers_keep_order() {
        let mut accumulator = HeaderAccumulator::new(256);
        accumulator.push_line("Accept: text/html\r\n").unwrap();
        accumulator.push_line("Accept: application/json\r\n").unwrap();
        let headers = accumulator.forward_header_map();
        let values: Vec<_> = headers.get_all("accept").iter().collect();
        assert_eq!(values, vec!["text/html", "application/json"]);
    }

    #[test]
    fn tracks_framing_headers_without_forwarding_them() {
        let mut accumulator = HeaderAccumulator::new(256);
        accumulator.push_line("Host: localhost:6005\r\n").unwrap();
        accumulator.push_line("Content-Length: 3\r\n").unwrap();
        accumulator.push_line("Expect: 100-continue\r\n").unwrap();
        assert!(matches!(accumulator.push_line("\r\n"), Ok(false)));
        assert_eq!(accumulator.host(), Some("localhost:6005"));
        assert_eq!(accumulator.content_length(), Some(3));
        assert!(accumulator.expect_continue());
        assert!(accumulator.forward_header_map().is_empty());
    }

    #[test]
    fn reject_invalid_header_name() {
        let mut accumulator = HeaderAccumulator::new(256);
        let err = accumulator
            .push_line("Bad Name: value\r\n")
            .expect_err("invalid header name should error");
        assert!(
            err.to_string().contains("invalid header name"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn reject_folded_header() {
        let mut accumulator = HeaderAccumulator::new(256);
        accumulator.push_line("X-Long: part one\r\n").unwrap();
        let err = accumulator.push_line("  part two\r\n").unwrap_err();
        assert!(err.to_string().contains("folding"), "unexpected error: {err}");
    }
}
