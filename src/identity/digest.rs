use async_trait::async_trait;

use super::{IdentityError, IdentityResolver};
use crate::proxy::request::ProxyRequest;
use crate::store::CacheKey;

/// Built-in resolver: a BLAKE3 digest over method, target and body. Headers do not take part.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestResolver;

impl DigestResolver {
    pub fn key_for(request: &ProxyRequest) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        // Length prefixes keep field boundaries unambiguous.
        for field in [
            request.method.as_str().as_bytes(),
            request.target.as_bytes(),
            &request.body[..],
        ] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        CacheKey::new(hasher.finalize().to_hex().to_string())
    }
}

#[async_trait]
impl IdentityResolver for DigestResolver {
    fn name(&self) -> &'static str {
        "digest"
    }

    async fn resolve(&self, request: &ProxyRequest) -> Result<CacheKey, IdentityError> {
        Ok(Self::key_for(request))
    }
}
