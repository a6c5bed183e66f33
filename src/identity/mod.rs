//! Maps a request to the cache key that names its stored response.

mod command;
mod digest;

use async_trait::async_trait;
use thiserror::Error;

use crate::process::ProcessError;
use crate::proxy::request::ProxyRequest;
use crate::store::CacheKey;

pub use command::CommandResolver;
pub use digest::DigestResolver;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity program failed: {0}")]
    Process(#[from] ProcessError),
    #[error("identity program printed no key")]
    EmptyKey,
    #[error("identity program printed more than one line")]
    MultiLineKey,
    #[error("identity program printed a key that is not valid UTF-8")]
    InvalidUtf8,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    async fn resolve(&self, request: &ProxyRequest) -> Result<CacheKey, IdentityError>;
}
