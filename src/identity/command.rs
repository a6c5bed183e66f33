use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{IdentityError, IdentityResolver};
use crate::process::ProcessRunner;
use crate::proxy::request::ProxyRequest;
use crate::store::CacheKey;

/// Delegates key computation to an operator-supplied program. The program reads the request in
/// HTTP/1.1 wire form on stdin and prints the key on a single line.
pub struct CommandResolver {
    command: String,
    runner: Arc<dyn ProcessRunner>,
}

impl CommandResolver {
    pub fn new(command: impl Into<String>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            command: command.into(),
            runner,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Renders `METHOD target HTTP/1.1`, one `name: value` line per header, a blank line, and the
/// body. Lines end in CRLF.
pub fn render_request(request: &ProxyRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + request.body.len());
    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in request.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

fn parse_key(stdout: Vec<u8>) -> Result<CacheKey, IdentityError> {
    let text = String::from_utf8(stdout).map_err(|_| IdentityError::InvalidUtf8)?;
    let key = text.trim();
    if key.is_empty() {
        return Err(IdentityError::EmptyKey);
    }
    if key.contains(['\n', '\r']) {
        return Err(IdentityError::MultiLineKey);
    }
    Ok(CacheKey::new(key))
}

#[async_trait]
impl IdentityResolver for CommandResolver {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn resolve(&self, request: &ProxyRequest) -> Result<CacheKey, IdentityError> {
        let stdin = render_request(request);
        let stdout = self.runner.run(&self.command, &stdin).await?;
        let key = parse_key(stdout)?;
        debug!(command = %self.command, key = %key, "resolved key with external program");
        Ok(key)
    }
}
