pub mod brands;
pub mod catalog;
pub mod dj;
pub mod llm;
pub mod mcp;
pub mod queue;
pub mod tts;
pub mod waker;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use brands::{Brand, RestBrandDirectory};
use catalog::{McpCatalogClient, PlayHistory, RotationCache};
use dj::DjPipeline;
use llm::LlmProvider;
use llm::openai::OpenAiProvider;
use mcp::McpClient;
use queue::{Broadcaster, QueueGateway};
use tts::{ElevenLabsSynthesizer, SpeechSynthesizer};
use waker::{Waker, WorkerLauncher};

/// Shared services a DJ worker needs. Launching clones the Arcs; the MCP
/// connection is made per run so a wedged socket never outlives its run.
struct DjWorkerLauncher {
    config: Config,
    cache: Arc<RotationCache>,
    history: Arc<PlayHistory>,
    queue: Arc<dyn Broadcaster>,
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn SpeechSynthesizer>,
}

impl WorkerLauncher for DjWorkerLauncher {
    fn launch(&self, brand: Brand) -> JoinHandle<()> {
        let config = self.config.clone();
        let cache = self.cache.clone();
        let history = self.history.clone();
        let queue = self.queue.clone();
        let llm = self.llm.clone();
        let tts = self.tts.clone();

        tokio::spawn(async move {
            let mcp = Arc::new(McpClient::new(config.api.mcp_url.clone()));
            if let Err(e) = mcp.connect().await {
                error!("'{}' cannot reach the tools server: {}", brand.slug, e);
                return;
            }
            // Best-effort inventory; a server without the expected tools
            // will surface as call errors later anyway.
            match mcp.list_tools().await {
                Ok(tools) => {
                    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
                    debug!("'{}' tools server advertises {:?}", brand.slug, names);
                }
                Err(e) => debug!("tools/list for '{}' failed: {}", brand.slug, e),
            }

            let catalog = Arc::new(McpCatalogClient::new(mcp.clone()));
            let pipeline = DjPipeline::new(config, catalog, cache, history, queue, llm, tts);
            let outcome = pipeline.run(&brand).await;
            mcp.disconnect().await;

            info!(
                "Worker for '{}' finished: success={}, subject=\"{}\", artist=\"{}\"",
                brand.slug, outcome.broadcast_success, outcome.subject, outcome.artist
            );
        })
    }
}

/// Wires the shared services together and parks on the waker loop until a
/// shutdown signal arrives.
pub(crate) async fn run(config: Config) -> Result<()> {
    info!("aircue {} starting", env!("CARGO_PKG_VERSION"));
    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("failed to create work dir {}", config.work_dir.display()))?;

    let directory = Arc::new(RestBrandDirectory::new(config.api.base_url.clone()));
    let launcher = Arc::new(DjWorkerLauncher {
        cache: Arc::new(RotationCache::new(
            config.catalog.refresh_after_hits,
            config.catalog.fetch_page_size,
        )),
        history: Arc::new(PlayHistory::new(config.catalog.song_cooldown)),
        queue: Arc::new(QueueGateway::new(config.api.base_url.clone())),
        llm: Arc::new(OpenAiProvider::new(
            config.llm.base_url.clone(),
            config.llm.api_key.clone(),
            config.llm.model.clone(),
            config.llm.temperature,
            config.llm.max_tokens,
        )),
        tts: Arc::new(ElevenLabsSynthesizer::new(
            config.tts.base_url.clone(),
            config.tts.api_key.clone(),
            config.tts.voice_id.clone(),
        )),
        config: config.clone(),
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal.cancel();
        }
    });

    let waker = Waker::new(config.scheduler, directory, launcher);
    waker.run(shutdown).await;
    info!("aircue stopped");
    Ok(())
}
