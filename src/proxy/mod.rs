pub mod headers;
pub mod http;
pub mod inflight;
pub mod listener;
pub mod pipeline;
pub mod preseed;
pub mod request;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

use self::pipeline::CachePipeline;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub pipeline: Arc<CachePipeline>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, pipeline: Arc<CachePipeline>) -> Self {
        Self { settings, pipeline }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
