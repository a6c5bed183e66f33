pub mod cli;
pub mod identity;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod proxy;
pub mod settings;
pub mod store;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::identity::{CommandResolver, DigestResolver, IdentityResolver};
use crate::process::ShellRunner;
use crate::proxy::pipeline::CachePipeline;
use crate::proxy::upstream::UpstreamClient;
use crate::settings::Settings;
use crate::store::CacheStore;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }
    let app = build_app(settings).await?;
    proxy::run(app).await
}

/// Builds the resolver, store and upstream client, and seeds the store.
pub async fn build_app(settings: Arc<Settings>) -> Result<proxy::AppContext> {
    let resolver = build_resolver(&settings);
    build_app_with_resolver(settings, resolver).await
}

pub async fn build_app_with_resolver(
    settings: Arc<Settings>,
    resolver: Arc<dyn IdentityResolver>,
) -> Result<proxy::AppContext> {
    let upstream = Arc::new(UpstreamClient::from_settings(&settings)?);
    let store = Arc::new(CacheStore::open(settings.store_mode()?).await?);
    store.seed().await?;
    info!(
        upstream = %upstream.target(),
        resolver = resolver.name(),
        persistent = store.is_persistent(),
        entries = store.len(),
        "cache ready"
    );
    let pipeline = Arc::new(CachePipeline::new(resolver, store, upstream));
    Ok(proxy::AppContext::new(settings, pipeline))
}

fn build_resolver(settings: &Settings) -> Arc<dyn IdentityResolver> {
    match &settings.hasher_command {
        Some(command) => {
            let runner = Arc::new(ShellRunner::new(settings.hasher_timeout()));
            Arc::new(CommandResolver::new(command.clone(), runner))
        }
        None => Arc::new(DigestResolver),
    }
}
