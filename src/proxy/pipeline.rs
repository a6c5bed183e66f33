//! Resolve, look up, coalesce, fetch and store: the path every proxied and preseeded request
//! takes through the cache.

use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::identity::{IdentityError, IdentityResolver};
use crate::metrics;
use crate::proxy::inflight::{FlightGuard, InFlightSet, Reservation};
use crate::proxy::request::ProxyRequest;
use crate::proxy::upstream::{UpstreamClient, UpstreamError};
use crate::store::{CacheEntry, CacheKey, CacheStore, PutOutcome};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("identity resolution failed: {0}")]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("fetch task failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Identity(_) | PipelineError::TaskFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            PipelineError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::Identity(_) => "identity_failed",
            PipelineError::Upstream(_) => "upstream_unavailable",
            PipelineError::TaskFailed(_) => "fetch_task_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Found in the store on first look.
    Hit,
    /// Fetched from upstream by this request.
    Miss,
    /// Found in the store after waiting on another request's fetch.
    Coalesced,
}

impl Lookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lookup::Hit => "hit",
            Lookup::Miss => "miss",
            Lookup::Coalesced => "coalesced",
        }
    }

    pub fn served_from_cache(&self) -> bool {
        !matches!(self, Lookup::Miss)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Stored,
    Exists,
    PersistFailed,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Stored => "stored",
            StoreStatus::Exists => "exists",
            StoreStatus::PersistFailed => "persist_failed",
        }
    }
}

impl From<PutOutcome> for StoreStatus {
    fn from(outcome: PutOutcome) -> Self {
        match outcome {
            PutOutcome::Stored => StoreStatus::Stored,
            PutOutcome::AlreadyPresent => StoreStatus::Exists,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Served {
    pub key: CacheKey,
    pub entry: Arc<CacheEntry>,
    pub lookup: Lookup,
    /// Set only when this request performed the upstream fetch.
    pub store: Option<StoreStatus>,
}

pub struct CachePipeline {
    resolver: Arc<dyn IdentityResolver>,
    store: Arc<CacheStore>,
    inflight: Arc<InFlightSet>,
    upstream: Arc<UpstreamClient>,
}

impl CachePipeline {
    pub fn new(
        resolver: Arc<dyn IdentityResolver>,
        store: Arc<CacheStore>,
        upstream: Arc<UpstreamClient>,
    ) -> Self {
        Self {
            resolver,
            store,
            inflight: Arc::new(InFlightSet::new()),
            upstream,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<dyn IdentityResolver> {
        &self.resolver
    }

    pub async fn resolve(&self, request: &ProxyRequest) -> Result<CacheKey, PipelineError> {
        self.resolver.resolve(request).await.map_err(|err| {
            metrics::record_identity_failure();
            warn!(
                resolver = self.resolver.name(),
                method = %request.method,
                target = %request.target,
                error = %err,
                "failed to resolve cache key"
            );
            PipelineError::Identity(err)
        })
    }

    /// Serves `request` from the store, fetching and storing it first on a miss.
    pub async fn execute(&self, request: ProxyRequest) -> Result<Served, PipelineError> {
        let key = self.resolve(&request).await?;
        self.serve_key(key, request).await
    }

    pub async fn serve_key(
        &self,
        key: CacheKey,
        request: ProxyRequest,
    ) -> Result<Served, PipelineError> {
        let request = Arc::new(request);
        let mut waited = false;
        loop {
            if let Some(served) = self.lookup(&key, waited).await {
                return Ok(served);
            }
            match self.inflight.reserve(key.as_str()) {
                Reservation::Follower(waiter) => {
                    metrics::record_coalesced_wait();
                    debug!(key = %key, "waiting on in-flight fetch");
                    waited = true;
                    waiter.wait().await;
                }
                Reservation::Leader(guard) => {
                    // The previous leader may have stored the entry between our lookup and the
                    // reservation.
                    if let Some(served) = self.lookup(&key, waited).await {
                        return Ok(served);
                    }
                    metrics::record_cache_lookup(Lookup::Miss.as_str());
                    return self.fill(key, Arc::clone(&request), guard).await;
                }
            }
        }
    }

    async fn lookup(&self, key: &CacheKey, waited: bool) -> Option<Served> {
        let entry = self.store.get(key).await?;
        let lookup = if waited {
            Lookup::Coalesced
        } else {
            Lookup::Hit
        };
        metrics::record_cache_lookup(lookup.as_str());
        Some(Served {
            key: key.clone(),
            entry,
            lookup,
            store: None,
        })
    }

    /// Runs fetch and store on a detached task so a client disconnect cannot cancel it. The
    /// flight guard is dropped inside the task once the store has settled.
    async fn fill(
        &self,
        key: CacheKey,
        request: Arc<ProxyRequest>,
        guard: FlightGuard,
    ) -> Result<Served, PipelineError> {
        let store = Arc::clone(&self.store);
        let upstream = Arc::clone(&self.upstream);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let entry = Arc::new(upstream.fetch(&request).await?);
            let status = match store.put(&task_key, Arc::clone(&entry)).await {
                Ok(outcome) => StoreStatus::from(outcome),
                Err(err) => {
                    warn!(key = %task_key, error = %err, "failed to persist cache entry; serving anyway");
                    StoreStatus::PersistFailed
                }
            };
            metrics::record_cache_store(status.as_str());
            Ok::<_, UpstreamError>((entry, status))
        });

        match task.await {
            Ok(Ok((entry, status))) => Ok(Served {
                key,
                entry,
                lookup: Lookup::Miss,
                store: Some(status),
            }),
            Ok(Err(err)) => {
                warn!(key = %key, error = %err, "upstream fetch failed");
                Err(PipelineError::Upstream(err))
            }
            Err(err) => Err(PipelineError::TaskFailed(err.to_string())),
        }
    }
}
