//! The image-fetch job: cache short-circuits, the staged
//! decode → process → decompress chain, progressive backpressure, and the
//! cache writes that follow a successful load.
//!
//! Stage work runs on the blocking pool through the stage queues; each
//! in-flight chain holds an operation token, and a stale token means the
//! chain was superseded (a terminal chunk arrived) or the job was disposed,
//! so the completion is discarded.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::codecs::{DecodingContext, EncodingContext, ImageDecoding};
use crate::error::ImagePipelineError;
use crate::keys::{self, ImageLoadKey, MemoryCacheKey};
use crate::loading::UrlResponseInfo;
use crate::pipeline::coalescer;
use crate::pipeline::context::{self, PipelineInner, PipelineShared, WorkFn};
use crate::pipeline::job::{self, JobEvent, JobId, JobKind, JobValue, SubscriberSink};
use crate::pipeline::queue::{Stage, WorkId};
use crate::processing::ProcessingContext;
use crate::request::ImageRequest;
use crate::response::{CacheOrigin, ImageContainer, ImageResponse, ImageType};

pub(crate) struct FetchImageState {
    request: ImageRequest,
    load_key: ImageLoadKey,
    memory_key: MemoryCacheKey,
    /// Decoder reused across the progressive chunks of this load.
    decoder: Option<Box<dyn ImageDecoding>>,
    /// Token of the in-flight stage chain; also the backpressure flag.
    op: Option<u64>,
    op_is_terminal: bool,
    next_op: u64,
    /// Set when already-processed bytes came from the data cache.
    skip_process: bool,
}

impl FetchImageState {
    pub(crate) fn new(
        request: ImageRequest,
        load_key: ImageLoadKey,
        memory_key: MemoryCacheKey,
    ) -> Self {
        Self {
            request,
            load_key,
            memory_key,
            decoder: None,
            op: None,
            op_is_terminal: false,
            next_op: 0,
            skip_process: false,
        }
    }

    pub(crate) fn load_key(&self) -> &ImageLoadKey {
        &self.load_key
    }
}

/// Everything a stage chain carries besides the container itself.
#[derive(Clone)]
struct ChunkContext {
    url_response: Option<UrlResponseInfo>,
    is_completed: bool,
    origin: CacheOrigin,
}

/// First-subscriber hook: memory cache, then data cache, then the download
/// dependency.
pub(crate) fn start(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, job_id: JobId) {
    let (request, memory_key) = {
        let Some(node) = inner.jobs.get(&job_id) else {
            return;
        };
        let JobKind::FetchImage(state) = &node.kind else {
            return;
        };
        (state.request.clone(), state.memory_key.clone())
    };

    if !request.options.skip_memory_cache_read {
        if let Some(container) = shared.memory_cache.get(&memory_key) {
            if !container.is_preview {
                debug!(job = job_id.0, "memory cache hit");
                let response = ImageResponse {
                    container,
                    url_response: None,
                    cache_origin: CacheOrigin::Memory,
                };
                job::send(
                    shared,
                    inner,
                    job_id,
                    JobEvent::Value(JobValue::Image(response), true),
                );
                return;
            }
            if shared.config.is_progressive_decoding_enabled {
                let response = ImageResponse {
                    container,
                    url_response: None,
                    cache_origin: CacheOrigin::Memory,
                };
                job::send(
                    shared,
                    inner,
                    job_id,
                    JobEvent::Value(JobValue::Image(response), false),
                );
            }
        }
    }

    if shared.data_cache.is_some()
        && !request.options.reload_ignoring_cached_data
        && !request.is_local_resource()
    {
        begin_data_cache_lookup(shared, inner, job_id, request);
        return;
    }

    continue_with_download(shared, inner, job_id);
}

/// Queued read of the data cache: processed-image bytes when the policy can
/// have stored them for this request, raw bytes otherwise.
fn begin_data_cache_lookup(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    request: ImageRequest,
) {
    let Some(cache) = shared.data_cache.clone() else {
        return;
    };
    let has_processors = !request.processors.is_empty();
    let processed = has_processors
        && shared
            .config
            .data_cache_policy
            .stores_encoded(has_processors);
    let key = if processed {
        keys::data_cache_image_key(&request)
    } else {
        keys::data_cache_original_key(&request)
    };
    let priority = inner
        .jobs
        .get(&job_id)
        .map(|node| node.priority)
        .unwrap_or_default();

    let work_id = inner.alloc_work_id();
    let payload: WorkFn = Box::new(move |shared, _inner| {
        let runtime = shared.runtime.clone();
        let shared = Arc::clone(shared);
        runtime.spawn(async move {
            let found = cache.get(&key).await;
            shared.with_inner(|shared, inner| {
                data_cache_lookup_finished(shared, inner, job_id, work_id, found, processed);
            });
        });
    });
    context::submit_work(
        shared,
        inner,
        Stage::DataCache,
        Some(job_id),
        priority,
        work_id,
        payload,
    );
}

fn data_cache_lookup_finished(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    work_id: WorkId,
    found: Option<Bytes>,
    processed: bool,
) {
    context::finish_work(shared, inner, Stage::DataCache, work_id, Some(job_id));
    {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let JobKind::FetchImage(state) = &mut node.kind else {
            return;
        };
        if found.is_some() {
            state.skip_process = processed;
        }
    }
    match found {
        Some(data) => {
            debug!(job = job_id.0, processed, "data cache hit");
            begin_decode(shared, inner, job_id, data, None, true, CacheOrigin::Disk);
        }
        None => continue_with_download(shared, inner, job_id),
    }
}

/// No cache could satisfy the request: either fail (cache-only requests) or
/// subscribe to the shared download job.
fn continue_with_download(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, job_id: JobId) {
    let (request, priority) = {
        let Some(node) = inner.jobs.get(&job_id) else {
            return;
        };
        let JobKind::FetchImage(state) = &node.kind else {
            return;
        };
        (state.request.clone(), node.priority)
    };

    if request.options.return_cache_data_dont_load {
        job::send(
            shared,
            inner,
            job_id,
            JobEvent::Error(ImagePipelineError::DataMissingInCache),
        );
        return;
    }

    let child = coalescer::fetch_data_job(shared, inner, &request);
    if let Some(key) = job::subscribe(shared, inner, child, SubscriberSink::Job(job_id), priority) {
        if let Some(node) = inner.jobs.get_mut(&job_id) {
            node.dependency = Some((child, key));
        }
    }
}

/// Events from the download dependency.
pub(crate) fn receive(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    event: JobEvent,
) {
    match event {
        JobEvent::Progress(progress) => {
            job::send(shared, inner, job_id, JobEvent::Progress(progress));
        }
        JobEvent::Error(error) => {
            job::send(shared, inner, job_id, JobEvent::Error(error));
        }
        JobEvent::Value(JobValue::Data(data, url_response), is_completed) => {
            let superseded_work = {
                let Some(node) = inner.jobs.get_mut(&job_id) else {
                    return;
                };
                let JobKind::FetchImage(state) = &mut node.kind else {
                    return;
                };
                if !is_completed {
                    // Previews are best-effort: drop the chunk when disabled
                    // or while a previous chunk is still in some stage.
                    if !shared.config.is_progressive_decoding_enabled || state.op.is_some() {
                        return;
                    }
                    None
                } else if state.op.is_some() && !state.op_is_terminal {
                    // The final chunk wins over in-flight preview work.
                    state.op = None;
                    node.queue_sub.take()
                } else {
                    None
                }
            };
            if let Some((stage, work_id)) = superseded_work {
                inner.queues.queue_mut(stage).cancel(work_id);
                context::pump_queue(shared, inner, stage);
            }
            begin_decode(
                shared,
                inner,
                job_id,
                data,
                url_response,
                is_completed,
                CacheOrigin::Network,
            );
        }
        JobEvent::Value(JobValue::Image(_), _) => {}
    }
}

enum DecodeOutcome {
    Image(ImageContainer),
    NeedMoreData,
    Failed(String),
}

/// Claim a decode slot and run the decoder on the blocking pool. The job's
/// decoder instance travels to the worker and back; a terminal chunk whose
/// predecessor still holds it just builds a fresh one (values carry the
/// whole accumulated buffer).
fn begin_decode(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    data: Bytes,
    url_response: Option<UrlResponseInfo>,
    is_completed: bool,
    origin: CacheOrigin,
) {
    let (token, decoder, request, priority) = {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let priority = node.priority;
        let JobKind::FetchImage(state) = &mut node.kind else {
            return;
        };
        let token = state.next_op;
        state.next_op += 1;
        state.op = Some(token);
        state.op_is_terminal = is_completed;
        (token, state.decoder.take(), state.request.clone(), priority)
    };

    let chunk = ChunkContext {
        url_response,
        is_completed,
        origin,
    };
    let work_id = inner.alloc_work_id();
    let payload: WorkFn = Box::new(move |shared, inner| {
        let decoding_context = DecodingContext {
            request: request.clone(),
            data: data.clone(),
            is_completed,
            url_response: chunk.url_response.clone(),
            cache_origin: chunk.origin,
        };
        let decoder = decoder.or_else(|| shared.decoders.decoder_for(&decoding_context));
        let Some(mut decoder) = decoder else {
            context::finish_work(shared, inner, Stage::Decode, work_id, Some(job_id));
            decode_refused(shared, inner, job_id, token, is_completed);
            return;
        };
        let worker_shared = Arc::clone(shared);
        worker_shared.clone().runtime.spawn_blocking(move || {
            let outcome = if is_completed {
                match decoder.decode(&data) {
                    Ok(mut container) => {
                        if container.image_type.is_none() {
                            container.image_type = ImageType::from_signature(&data);
                        }
                        if container.data.is_none() {
                            container.data = Some(data.clone());
                        }
                        DecodeOutcome::Image(container)
                    }
                    Err(error) => DecodeOutcome::Failed(error.to_string()),
                }
            } else {
                match decoder.decode_partial(&data) {
                    Some(container) => DecodeOutcome::Image(container),
                    None => DecodeOutcome::NeedMoreData,
                }
            };
            let decoder_id = decoder.identifier().to_string();
            worker_shared.with_inner(|shared, inner| {
                decode_finished(
                    shared, inner, job_id, work_id, token, decoder, decoder_id, outcome, chunk,
                );
            });
        });
    });
    context::submit_work(
        shared,
        inner,
        Stage::Decode,
        Some(job_id),
        priority,
        work_id,
        payload,
    );
}

/// The registry offered no decoder: fatal on the terminal chunk, a skipped
/// preview otherwise.
fn decode_refused(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    token: u64,
    is_completed: bool,
) {
    {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let JobKind::FetchImage(state) = &mut node.kind else {
            return;
        };
        if state.op != Some(token) {
            return;
        }
        state.op = None;
    }
    if is_completed {
        job::send(
            shared,
            inner,
            job_id,
            JobEvent::Error(ImagePipelineError::DecoderNotRegistered),
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_finished(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    work_id: WorkId,
    token: u64,
    decoder: Box<dyn ImageDecoding>,
    decoder_id: String,
    outcome: DecodeOutcome,
    chunk: ChunkContext,
) {
    context::finish_work(shared, inner, Stage::Decode, work_id, Some(job_id));
    let mut failure: Option<String> = None;
    let container = {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let JobKind::FetchImage(state) = &mut node.kind else {
            return;
        };
        if state.op != Some(token) {
            return;
        }
        state.decoder = Some(decoder);
        match outcome {
            DecodeOutcome::NeedMoreData => {
                state.op = None;
                None
            }
            DecodeOutcome::Failed(reason) => {
                state.op = None;
                if chunk.is_completed {
                    failure = Some(reason);
                }
                None
            }
            DecodeOutcome::Image(container) => Some(container),
        }
    };

    if let Some(reason) = failure {
        job::send(
            shared,
            inner,
            job_id,
            JobEvent::Error(ImagePipelineError::DecodingFailed {
                decoder: decoder_id,
                reason,
            }),
        );
        return;
    }
    if let Some(container) = container {
        begin_process(shared, inner, job_id, token, container, chunk);
    }
}

/// Apply the request's processor list in order inside one process-queue
/// slot. Skipped entirely for processor-less requests and for
/// already-processed bytes served from the data cache.
fn begin_process(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    token: u64,
    container: ImageContainer,
    chunk: ChunkContext,
) {
    let (request, priority, skip) = {
        let Some(node) = inner.jobs.get(&job_id) else {
            return;
        };
        let JobKind::FetchImage(state) = &node.kind else {
            return;
        };
        (
            state.request.clone(),
            node.priority,
            state.skip_process || state.request.processors.is_empty(),
        )
    };
    if skip {
        begin_decompress(shared, inner, job_id, token, container, chunk);
        return;
    }

    let processing_context = ProcessingContext {
        request: request.clone(),
        url_response: chunk.url_response.clone(),
        is_completed: chunk.is_completed,
    };
    let work_id = inner.alloc_work_id();
    let payload: WorkFn = Box::new(move |shared, _inner| {
        let worker_shared = Arc::clone(shared);
        worker_shared.clone().runtime.spawn_blocking(move || {
            let mut result: Result<ImageContainer, (String, String)> = Ok(container);
            for processor in &request.processors {
                result = match result {
                    Ok(current) => match processor.process(current, &processing_context) {
                        Ok(next) => Ok(next),
                        Err(error) => {
                            Err((processor.identifier().to_string(), error.to_string()))
                        }
                    },
                    Err(failed) => Err(failed),
                };
                if result.is_err() {
                    break;
                }
            }
            worker_shared.with_inner(|shared, inner| {
                process_finished(shared, inner, job_id, work_id, token, result, chunk);
            });
        });
    });
    context::submit_work(
        shared,
        inner,
        Stage::Process,
        Some(job_id),
        priority,
        work_id,
        payload,
    );
}

fn process_finished(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    work_id: WorkId,
    token: u64,
    result: Result<ImageContainer, (String, String)>,
    chunk: ChunkContext,
) {
    context::finish_work(shared, inner, Stage::Process, work_id, Some(job_id));
    let mut failure: Option<(String, String)> = None;
    let container = {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let JobKind::FetchImage(state) = &mut node.kind else {
            return;
        };
        if state.op != Some(token) {
            return;
        }
        match result {
            Ok(container) => Some(container),
            Err(failed) => {
                state.op = None;
                // A malformed preview never fails the load.
                if chunk.is_completed {
                    failure = Some(failed);
                }
                None
            }
        }
    };

    if let Some((processor, reason)) = failure {
        job::send(
            shared,
            inner,
            job_id,
            JobEvent::Error(ImagePipelineError::ProcessingFailed { processor, reason }),
        );
        return;
    }
    if let Some(container) = container {
        begin_decompress(shared, inner, job_id, token, container, chunk);
    }
}

/// Consult the decompression advisor and either rasterise on a background
/// slot or complete directly.
fn begin_decompress(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    token: u64,
    mut container: ImageContainer,
    chunk: ChunkContext,
) {
    let (request, priority) = {
        let Some(node) = inner.jobs.get(&job_id) else {
            return;
        };
        let JobKind::FetchImage(state) = &node.kind else {
            return;
        };
        (state.request.clone(), node.priority)
    };

    container.is_preview = !chunk.is_completed;
    let response = ImageResponse {
        container,
        url_response: chunk.url_response.clone(),
        cache_origin: chunk.origin,
    };

    let wanted = shared.config.is_decompression_enabled
        && !request.options.skip_decompression
        && shared.decompressor.should_decompress(&response, &request);
    if !wanted {
        complete_chunk(shared, inner, job_id, token, response, chunk.is_completed);
        return;
    }

    let is_completed = chunk.is_completed;
    let work_id = inner.alloc_work_id();
    let payload: WorkFn = Box::new(move |shared, _inner| {
        let worker_shared = Arc::clone(shared);
        worker_shared.clone().runtime.spawn_blocking(move || {
            let response = worker_shared.decompressor.decompress(response, &request);
            worker_shared.with_inner(|shared, inner| {
                decompress_finished(shared, inner, job_id, work_id, token, response, is_completed);
            });
        });
    });
    context::submit_work(
        shared,
        inner,
        Stage::Decompress,
        Some(job_id),
        priority,
        work_id,
        payload,
    );
}

fn decompress_finished(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    work_id: WorkId,
    token: u64,
    response: ImageResponse,
    is_completed: bool,
) {
    context::finish_work(shared, inner, Stage::Decompress, work_id, Some(job_id));
    complete_chunk(shared, inner, job_id, token, response, is_completed);
}

/// End of a stage chain: write caches and emit the (preview or terminal)
/// value.
fn complete_chunk(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    token: u64,
    response: ImageResponse,
    is_completed: bool,
) {
    let (request, memory_key) = {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let JobKind::FetchImage(state) = &mut node.kind else {
            return;
        };
        if state.op != Some(token) {
            return;
        }
        state.op = None;
        (state.request.clone(), state.memory_key.clone())
    };

    if !request.options.skip_memory_cache_write
        && (is_completed || shared.config.is_storing_previews_in_memory_cache)
    {
        shared
            .memory_cache
            .insert(memory_key, response.container.clone());
    }

    if is_completed {
        store_encoded_image(shared, inner, &request, &response);
        job::send(
            shared,
            inner,
            job_id,
            JobEvent::Value(JobValue::Image(response), true),
        );
    } else {
        job::send(
            shared,
            inner,
            job_id,
            JobEvent::Value(JobValue::Image(response), false),
        );
    }
}

/// Encoded-image persistence per the data-cache policy: encode on the
/// encode queue, then write through the data-cache queue. Both detached
/// from the job, which completes immediately.
fn store_encoded_image(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    request: &ImageRequest,
    response: &ImageResponse,
) {
    if shared.data_cache.is_none() {
        return;
    }
    let Some(encoder) = shared.encoder.clone() else {
        return;
    };
    let has_processors = !request.processors.is_empty();
    if !shared.config.data_cache_policy.stores_encoded(has_processors) {
        return;
    }
    if request.options.skip_disk_cache_writes
        || request.is_local_resource()
        || response.cache_origin != CacheOrigin::Network
    {
        return;
    }

    let key = keys::data_cache_image_key(request);
    let encoding_context = EncodingContext {
        request: request.clone(),
        url_response: response.url_response.clone(),
    };
    let container = response.container.clone();
    let priority = request.priority;
    let work_id = inner.alloc_work_id();
    let payload: WorkFn = Box::new(move |shared, _inner| {
        let worker_shared = Arc::clone(shared);
        worker_shared.clone().runtime.spawn_blocking(move || {
            let encoded = encoder.encode(&container, &encoding_context);
            worker_shared.with_inner(|shared, inner| {
                context::finish_work(shared, inner, Stage::Encode, work_id, None);
                if let Some(data) = encoded {
                    context::submit_cache_write(shared, inner, key, data, priority);
                }
            });
        });
    });
    context::submit_work(shared, inner, Stage::Encode, None, priority, work_id, payload);
}
