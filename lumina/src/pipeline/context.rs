//! The pipeline context: all job-graph, coalescer, and queue state behind a
//! single mutex.
//!
//! Every public entry point and every worker completion locks the context,
//! mutates, and unlocks without ever holding the lock across an await. Long
//! operations decompose into "lock, mutate, unlock, spawn, relock on
//! completion"; completions that arrive after their job was disposed find
//! nothing to mutate and fall through.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::data::DataCaching;
use crate::cache::memory::MemoryCache;
use crate::cache::resumable::ResumableDataStorage;
use crate::codecs::{DecoderRegistry, ImageEncoding};
use crate::config::PipelineConfig;
use crate::decompression::Decompressing;
use crate::keys::{DataLoadKey, ImageLoadKey};
use crate::loading::DataLoading;
use crate::pipeline::job::{JobId, JobNode};
use crate::pipeline::queue::{DataLoadRateLimiter, Stage, WorkId, WorkQueue};
use crate::request::Priority;
use crate::task::TaskCore;

/// Work payload executed at queue admission, under the context lock. The
/// payload spawns its own worker and returns immediately.
pub(crate) type WorkFn = Box<dyn FnOnce(&Arc<PipelineShared>, &mut PipelineInner) + Send>;

/// Immutable pipeline surface: configuration, injected capabilities, and the
/// independently locked caches, plus the serialised context itself.
pub(crate) struct PipelineShared {
    pub config: PipelineConfig,
    pub loader: Arc<dyn DataLoading>,
    pub decoders: Arc<dyn DecoderRegistry>,
    pub encoder: Option<Arc<dyn ImageEncoding>>,
    pub decompressor: Arc<dyn Decompressing>,
    pub data_cache: Option<Arc<dyn DataCaching>>,
    pub memory_cache: Arc<MemoryCache>,
    pub resumable: ResumableDataStorage,
    pub next_task_id: AtomicU64,
    /// Captured at construction so cleanup paths (task drops included) can
    /// spawn from any thread.
    pub runtime: tokio::runtime::Handle,
    inner: Mutex<PipelineInner>,
}

impl PipelineShared {
    pub(crate) fn new(
        config: PipelineConfig,
        loader: Arc<dyn DataLoading>,
        decoders: Arc<dyn DecoderRegistry>,
        encoder: Option<Arc<dyn ImageEncoding>>,
        decompressor: Arc<dyn Decompressing>,
        data_cache: Option<Arc<dyn DataCaching>>,
    ) -> Arc<Self> {
        let memory_cache = Arc::new(MemoryCache::new(config.memory_cache.clone()));
        let resumable = ResumableDataStorage::new(config.resumable_data_size_limit);
        let inner = Mutex::new(PipelineInner::new(&config));
        Arc::new(Self {
            config,
            loader,
            decoders,
            encoder,
            decompressor,
            data_cache,
            memory_cache,
            resumable,
            next_task_id: AtomicU64::new(0),
            runtime: tokio::runtime::Handle::current(),
            inner,
        })
    }

    /// Run `f` on the serialised pipeline context.
    pub(crate) fn with_inner<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&Arc<Self>, &mut PipelineInner) -> R,
    ) -> R {
        let mut guard = self.inner.lock();
        f(self, &mut guard)
    }
}

/// One admission queue per pipeline stage.
pub(crate) struct StageQueues {
    data_load: WorkQueue<WorkFn>,
    decode: WorkQueue<WorkFn>,
    process: WorkQueue<WorkFn>,
    decompress: WorkQueue<WorkFn>,
    encode: WorkQueue<WorkFn>,
    data_cache: WorkQueue<WorkFn>,
}

impl StageQueues {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            data_load: WorkQueue::new(config.max_concurrent_data_loads),
            decode: WorkQueue::new(config.max_concurrent_decodes),
            process: WorkQueue::new(config.max_concurrent_processes),
            decompress: WorkQueue::new(config.max_concurrent_decompressions),
            encode: WorkQueue::new(config.max_concurrent_encodes),
            data_cache: WorkQueue::new(config.max_concurrent_data_cache_ops),
        }
    }

    pub(crate) fn queue_mut(&mut self, stage: Stage) -> &mut WorkQueue<WorkFn> {
        match stage {
            Stage::DataLoad => &mut self.data_load,
            Stage::Decode => &mut self.decode,
            Stage::Process => &mut self.process,
            Stage::Decompress => &mut self.decompress,
            Stage::Encode => &mut self.encode,
            Stage::DataCache => &mut self.data_cache,
        }
    }

    pub(crate) fn clear_all_pending(&mut self) {
        for stage in [
            Stage::DataLoad,
            Stage::Decode,
            Stage::Process,
            Stage::Decompress,
            Stage::Encode,
            Stage::DataCache,
        ] {
            self.queue_mut(stage).clear_pending();
        }
    }
}

/// Mutable pipeline state: the job graph, coalescer maps, task registry,
/// and stage queues.
pub(crate) struct PipelineInner {
    pub jobs: HashMap<JobId, JobNode>,
    pub tasks: HashMap<u64, Arc<TaskCore>>,
    pub image_jobs: HashMap<ImageLoadKey, JobId>,
    pub data_jobs: HashMap<DataLoadKey, JobId>,
    pub queues: StageQueues,
    pub rate_limiter: DataLoadRateLimiter,
    pub invalidated: bool,
    next_job_id: u64,
    next_work_id: u64,
    next_order: u64,
}

impl PipelineInner {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            jobs: HashMap::new(),
            tasks: HashMap::new(),
            image_jobs: HashMap::new(),
            data_jobs: HashMap::new(),
            queues: StageQueues::new(config),
            rate_limiter: DataLoadRateLimiter::new(
                config.rate_limiter_rate,
                config.rate_limiter_burst,
            ),
            invalidated: false,
            next_job_id: 0,
            next_work_id: 0,
            next_order: 0,
        }
    }

    pub(crate) fn alloc_job_id(&mut self) -> JobId {
        self.next_job_id += 1;
        JobId(self.next_job_id)
    }

    pub(crate) fn alloc_work_id(&mut self) -> WorkId {
        self.next_work_id += 1;
        WorkId(self.next_work_id)
    }

    fn next_order(&mut self) -> u64 {
        self.next_order += 1;
        self.next_order
    }
}

/// Enqueue a work payload on a stage queue and sweep for admission. When an
/// owning job is given, the item becomes the job's queue subscription: it is
/// cancelled and reprioritised with the job.
pub(crate) fn submit_work(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    stage: Stage,
    owner: Option<JobId>,
    priority: Priority,
    work_id: WorkId,
    payload: WorkFn,
) {
    let order = inner.next_order();
    inner.queues.queue_mut(stage).enqueue(work_id, priority, order, payload);
    if let Some(job_id) = owner {
        if let Some(node) = inner.jobs.get_mut(&job_id) {
            node.queue_sub = Some((stage, work_id));
        }
    }
    pump_queue(shared, inner, stage);
}

/// Release a finished work item's slot and admit the next waiters.
pub(crate) fn finish_work(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    stage: Stage,
    work_id: WorkId,
    owner: Option<JobId>,
) {
    if let Some(job_id) = owner {
        if let Some(node) = inner.jobs.get_mut(&job_id) {
            if node.queue_sub == Some((stage, work_id)) {
                node.queue_sub = None;
            }
        }
    }
    inner.queues.queue_mut(stage).finish(work_id);
    pump_queue(shared, inner, stage);
}

/// Admit pending work on a stage, executing payloads immediately. On the
/// data-load queue, congestion control spaces admissions with a cooldown
/// timer.
pub(crate) fn pump_queue(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, stage: Stage) {
    let congestion = stage == Stage::DataLoad && shared.config.is_congestion_control_enabled;
    let admission = inner.queues.queue_mut(stage).admit(congestion);
    for (_, payload) in admission.started {
        payload(shared, inner);
    }
    if let Some(delay) = admission.cooldown {
        let runtime = shared.runtime.clone();
        let shared = Arc::clone(shared);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.with_inner(|shared, inner| {
                inner.queues.queue_mut(stage).end_cooldown();
                pump_queue(shared, inner, stage);
            });
        });
    }
}

/// Fire-and-forget write into the injected data cache, sequenced through the
/// data-cache queue. Failures are the cache's problem; the pipeline never
/// awaits them.
pub(crate) fn submit_cache_write(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    key: String,
    data: Bytes,
    priority: Priority,
) {
    let Some(cache) = shared.data_cache.clone() else {
        return;
    };
    let work_id = inner.alloc_work_id();
    let payload: WorkFn = Box::new(move |shared, _inner| {
        let runtime = shared.runtime.clone();
        let shared = Arc::clone(shared);
        runtime.spawn(async move {
            cache.put(key, data).await;
            shared.with_inner(|shared, inner| {
                finish_work(shared, inner, Stage::DataCache, work_id, None);
            });
        });
    });
    submit_work(shared, inner, Stage::DataCache, None, priority, work_id, payload);
}
