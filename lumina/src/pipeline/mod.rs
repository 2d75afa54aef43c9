//! The image pipeline: facade, capability wiring, and lifecycle.

pub(crate) mod coalescer;
pub(crate) mod context;
pub(crate) mod fetch_data;
pub(crate) mod fetch_image;
pub(crate) mod job;
pub(crate) mod queue;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::warn;

use crate::cache::data::DataCaching;
use crate::cache::memory::MemoryCache;
use crate::codecs::{DecoderRegistry, EmptyDecoderRegistry, ImageEncoding};
use crate::config::PipelineConfig;
use crate::decompression::{Decompressing, NoopDecompressor};
use crate::error::ImagePipelineError;
use crate::keys::MemoryCacheKey;
use crate::loading::{DataLoading, UrlSessionDataLoader};
use crate::pipeline::context::PipelineShared;
use crate::pipeline::job::JobId;
use crate::request::ImageRequest;
use crate::response::ImageContainer;
use crate::task::ImageTask;

/// The image loading pipeline.
///
/// Turns [`ImageRequest`]s into decoded images while coalescing equivalent
/// work, honouring priorities, and coordinating the memory cache, the
/// injected data cache, and resumable downloads. Requires a tokio runtime.
#[derive(Clone)]
pub struct ImagePipeline {
    shared: Arc<PipelineShared>,
}

impl ImagePipeline {
    /// Pipeline with default collaborators: a `reqwest` loader, no decoders,
    /// no data cache, and a no-op decompression advisor.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; the pipeline captures
    /// the runtime handle its workers run on.
    pub fn new(config: PipelineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: PipelineConfig) -> ImagePipelineBuilder {
        ImagePipelineBuilder {
            config,
            loader: None,
            decoders: None,
            encoder: None,
            decompressor: None,
            data_cache: None,
        }
    }

    /// Create a task for `request`. The task is suspended until first
    /// awaited or subscribed.
    pub fn load_image(&self, request: ImageRequest) -> ImageTask {
        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        ImageTask::new(id, request, Arc::downgrade(&self.shared))
    }

    /// Fail every in-flight task with `pipeline_invalidated`, tear down the
    /// job graph, and refuse subsequent loads.
    pub fn invalidate(&self) {
        self.shared.with_inner(|shared, inner| {
            if inner.invalidated {
                return;
            }
            inner.invalidated = true;
            warn!("image pipeline invalidated");
            let tasks: Vec<_> = inner.tasks.drain().map(|(_, task)| task).collect();
            for task in tasks {
                task.force_finish(Err(ImagePipelineError::PipelineInvalidated));
            }
            let jobs: Vec<JobId> = inner.jobs.keys().copied().collect();
            for job_id in jobs {
                job::dispose(shared, inner, job_id);
            }
            inner.queues.clear_all_pending();
        });
    }

    /// Decoded image cached for `request`, if any.
    pub fn cached_image(&self, request: &ImageRequest) -> Option<ImageContainer> {
        self.shared
            .memory_cache
            .get(&MemoryCacheKey::for_request(request))
    }

    /// Store a decoded image for `request` in the memory cache.
    pub fn store_cached_image(&self, request: &ImageRequest, container: ImageContainer) {
        self.shared
            .memory_cache
            .insert(MemoryCacheKey::for_request(request), container);
    }

    pub fn remove_cached_image(&self, request: &ImageRequest) {
        self.shared
            .memory_cache
            .remove(&MemoryCacheKey::for_request(request));
    }

    pub fn clear_memory_cache(&self) {
        self.shared.memory_cache.remove_all();
    }

    /// The memory cache itself, for inspection and platform wiring.
    pub fn memory_cache(&self) -> &MemoryCache {
        &self.shared.memory_cache
    }

    /// System memory-pressure hook: drops the whole memory cache.
    pub fn handle_memory_pressure(&self) {
        self.shared.memory_cache.remove_all();
    }

    /// App-backgrounded hook: trims the memory cache to a tenth of its cost
    /// limit.
    pub fn handle_enter_background(&self) {
        let limit = self.shared.memory_cache.cost_limit();
        self.shared.memory_cache.trim_to_cost(limit / 10);
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }
}

impl fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Assembles an [`ImagePipeline`] with injected collaborators.
pub struct ImagePipelineBuilder {
    config: PipelineConfig,
    loader: Option<Arc<dyn DataLoading>>,
    decoders: Option<Arc<dyn DecoderRegistry>>,
    encoder: Option<Arc<dyn ImageEncoding>>,
    decompressor: Option<Arc<dyn Decompressing>>,
    data_cache: Option<Arc<dyn DataCaching>>,
}

impl ImagePipelineBuilder {
    pub fn data_loader(mut self, loader: Arc<dyn DataLoading>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn decoders(mut self, decoders: Arc<dyn DecoderRegistry>) -> Self {
        self.decoders = Some(decoders);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn ImageEncoding>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn decompressor(mut self, decompressor: Arc<dyn Decompressing>) -> Self {
        self.decompressor = Some(decompressor);
        self
    }

    pub fn data_cache(mut self, data_cache: Arc<dyn DataCaching>) -> Self {
        self.data_cache = Some(data_cache);
        self
    }

    /// # Panics
    ///
    /// Panics when called outside a tokio runtime (see
    /// [`ImagePipeline::new`]).
    pub fn build(self) -> ImagePipeline {
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(UrlSessionDataLoader::new()));
        let decoders = self
            .decoders
            .unwrap_or_else(|| Arc::new(EmptyDecoderRegistry));
        let decompressor = self
            .decompressor
            .unwrap_or_else(|| Arc::new(NoopDecompressor));
        let shared = PipelineShared::new(
            self.config,
            loader,
            decoders,
            self.encoder,
            decompressor,
            self.data_cache,
        );
        ImagePipeline { shared }
    }
}

impl fmt::Debug for ImagePipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePipelineBuilder")
            .field("config", &self.config)
            .finish()
    }
}
