use anyhow::{Context, Result, bail};
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

/// A fully buffered inbound request: what identity resolution and the upstream fetch see.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Origin-form target (`/path?query`) as received.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn path(&self) -> &str {
        path_without_query(&self.target)
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }
}

/// Normalizes an HTTP/1.1 request target to origin-form. Absolute-form targets keep only their
/// path and query; authority-form and asterisk-form are rejected.
pub fn origin_form_target(target: &str) -> Result<String> {
    if target.starts_with('/') {
        let uri: Uri = target
            .parse()
            .with_context(|| format!("invalid request target '{target}'"))?;
        return Ok(uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()));
    }
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;
    if uri.scheme().is_none() {
        bail!("request target must be origin-form (start with '/')");
    }
    Ok(uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .filter(|pq| pq.starts_with('/'))
        .unwrap_or_else(|| "/".to_string()))
}

pub fn path_without_query(target: &str) -> &str {
    target.split('?').next().unwrap_or("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_is_kept() -> Result<()> {
        assert_eq!(origin_form_target("/a/b?x=1&y=2")?, "/a/b?x=1&y=2");
        Ok(())
    }

    #[test]
    fn absolute_form_is_reduced_to_path_and_query() -> Result<()> {
        assert_eq!(
            origin_form_target("http://example.com:8080/items?id=4")?,
            "/items?id=4"
        );
        assert_eq!(origin_form_target("http://example.com")?, "/");
        Ok(())
    }

    #[test]
    fn authority_and_asterisk_forms_are_rejected() {
        let err = origin_form_target("example.com:443").unwrap_err();
        assert!(
            err.to_string().contains("origin-form") || err.to_string().contains("invalid"),
            "unexpected error: {err:?}"
        );
        assert!(origin_form_target("*").is_err());
    }

    #[test]
    fn path_and_query_accessors() {
        let request = ProxyRequest::new(Method::GET, "/search?q=rust");
        assert_eq!(request.path(), "/search");
        assert_eq!(request.query(), Some("q=rust"));
        assert_eq!(ProxyRequest::new(Method::GET, "/").query(), None);
    }
}
