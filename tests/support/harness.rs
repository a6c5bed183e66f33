use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use stashproxy::{
    identity::IdentityResolver,
    proxy::{AppContext, listener::serve_listener},
    settings::Settings,
};

/// In-memory settings with test-friendly limits.
pub fn test_settings(upstream_url: &str) -> Settings {
    let mut settings = Settings::for_upstream(upstream_url);
    settings.client_timeout = 5;
    settings.upstream_connect_timeout = 2;
    settings.upstream_timeout = 5;
    settings.max_request_body_size = 64 * 1024;
    settings
}

pub fn disk_settings(upstream_url: &str, data_dir: &Path) -> Settings {
    let mut settings = test_settings(upstream_url);
    settings.memory_only = false;
    settings.data_dir = Some(data_dir.to_path_buf());
    settings
}

pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub app: AppContext,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn start(settings: Settings) -> Result<Self> {
        let app = stashproxy::build_app(Arc::new(settings)).await?;
        Self::serve(app).await
    }

    pub async fn start_with_resolver(
        settings: Settings,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Result<Self> {
        let app = stashproxy::build_app_with_resolver(Arc::new(settings), resolver).await?;
        Self::serve(app).await
    }

    async fn serve(app: AppContext) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let served = app.clone();
        let handle = tokio::spawn(async move {
            let _ = serve_listener(listener, served).await;
        });
        Ok(Self { addr, app, handle })
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
