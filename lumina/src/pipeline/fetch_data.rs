//! The data-fetch job: one rate-limited, resumable download shared by every
//! request asking for the same bytes.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::resumable::ResumableData;
use crate::error::{DataLoadError, ImagePipelineError};
use crate::keys::{self, DataLoadKey};
use crate::loading::{DataChunk, DataRequest, DataStream, UrlResponseInfo};
use crate::pipeline::context::{self, PipelineInner, PipelineShared, WorkFn};
use crate::pipeline::job::{self, JobEvent, JobId, JobKind, JobValue};
use crate::pipeline::queue::{Stage, WorkId};
use crate::request::{ImageRequest, ImageRequestResource};
use crate::task::TaskProgress;

pub(crate) struct FetchDataState {
    request: ImageRequest,
    load_key: DataLoadKey,
    buffer: Vec<u8>,
    url_response: Option<UrlResponseInfo>,
    /// Total bytes expected including any resumed prefix.
    expected_length: Option<u64>,
    resumed_bytes: u64,
    /// Resumable state pulled at submission, applied on the first chunk.
    resumable: Option<ResumableData>,
    /// Task forwarding loader chunks into the pipeline context.
    pump: Option<JoinHandle<()>>,
}

impl FetchDataState {
    pub(crate) fn new(request: ImageRequest, load_key: DataLoadKey) -> Self {
        Self {
            request,
            load_key,
            buffer: Vec::new(),
            url_response: None,
            expected_length: None,
            resumed_bytes: 0,
            resumable: None,
            pump: None,
        }
    }

    pub(crate) fn load_key(&self) -> &DataLoadKey {
        &self.load_key
    }

    pub(crate) fn take_pump(&mut self) -> Option<JoinHandle<()>> {
        self.pump.take()
    }
}

/// First-subscriber hook: route local files straight to the filesystem and
/// everything else through the rate limiter and the data-load queue.
pub(crate) fn start(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, job_id: JobId) {
    let local_url = {
        let Some(node) = inner.jobs.get(&job_id) else {
            return;
        };
        let JobKind::FetchData(state) = &node.kind else {
            return;
        };
        if state.request.is_local_resource() && shared.config.is_local_resources_support_enabled {
            state.request.resource.url().cloned()
        } else {
            None
        }
    };

    if let Some(url) = local_url {
        let runtime = shared.runtime.clone();
        let shared = Arc::clone(shared);
        runtime.spawn(async move {
            let result = match url.to_file_path() {
                Ok(path) => tokio::fs::read(path)
                    .await
                    .map(Bytes::from)
                    .map_err(DataLoadError::Io),
                Err(()) => Err(DataLoadError::Stream(format!("not a file path: {url}"))),
            };
            shared.with_inner(|shared, inner| {
                local_read_finished(shared, inner, job_id, result);
            });
        });
        return;
    }

    submit(shared, inner, job_id);
}

/// Queue the download, deferring through the leaky bucket when it is dry.
fn submit(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, job_id: JobId) {
    let Some(node) = inner.jobs.get(&job_id) else {
        return;
    };
    let priority = node.priority;

    if shared.config.is_rate_limiter_enabled && !inner.rate_limiter.try_acquire() {
        let delay = inner.rate_limiter.retry_delay();
        debug!(job = job_id.0, ?delay, "data load deferred by rate limiter");
        let runtime = shared.runtime.clone();
        let shared = Arc::clone(shared);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.with_inner(|shared, inner| submit(shared, inner, job_id));
        });
        return;
    }

    let work_id = inner.alloc_work_id();
    let payload: WorkFn = Box::new(move |shared, inner| {
        begin_load(shared, inner, job_id, work_id);
    });
    context::submit_work(
        shared,
        inner,
        Stage::DataLoad,
        Some(job_id),
        priority,
        work_id,
        payload,
    );
}

/// Queue admission: open the byte stream (with resume headers when partial
/// bytes were retained) and spawn the pump that forwards chunks back into
/// the pipeline context.
fn begin_load(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, job_id: JobId, work_id: WorkId) {
    let stream = {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            context::finish_work(shared, inner, Stage::DataLoad, work_id, None);
            return;
        };
        let JobKind::FetchData(state) = &mut node.kind else {
            return;
        };
        let request = state.request.clone();
        match &request.resource {
            ImageRequestResource::Publisher(publisher) => publisher.open(),
            ImageRequestResource::Url(url) => {
                open_url_stream(shared, state, &request, DataRequest::new(url.clone()))
            }
            ImageRequestResource::UrlRequest(data_request) => {
                open_url_stream(shared, state, &request, data_request.clone())
            }
        }
    };

    let pump_shared = Arc::clone(shared);
    let pump = shared.runtime.spawn(async move {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    pump_shared.with_inner(|shared, inner| {
                        chunk_received(shared, inner, job_id, chunk);
                    });
                }
                Err(error) => {
                    pump_shared.with_inner(|shared, inner| {
                        load_failed(shared, inner, job_id, work_id, error);
                    });
                    return;
                }
            }
        }
        pump_shared.with_inner(|shared, inner| {
            load_finished(shared, inner, job_id, work_id);
        });
    });

    if let Some(node) = inner.jobs.get_mut(&job_id) {
        if let JobKind::FetchData(state) = &mut node.kind {
            state.pump = Some(pump);
        }
    }
}

fn open_url_stream(
    shared: &Arc<PipelineShared>,
    state: &mut FetchDataState,
    request: &ImageRequest,
    mut data_request: DataRequest,
) -> DataStream {
    data_request.cache_policy = request.cache_policy();

    if shared.config.is_resumable_data_enabled {
        if let Some(url) = request.resource.url() {
            if let Some(resumable) = shared.resumable.take(url.as_str()) {
                debug!(url = %url, retained = resumable.data.len(), "resuming download");
                data_request = data_request
                    .header("Range", format!("bytes={}-", resumable.data.len()))
                    .header("If-Range", resumable.validator.if_range_value().to_string());
                state.resumable = Some(resumable);
            }
        }
    }

    shared.loader.load(&data_request)
}

/// A chunk arrived from the loader. The first chunk settles the resume
/// handshake; every chunk extends the buffer, reports progress, and exposes
/// the partial buffer to progressive consumers.
fn chunk_received(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, job_id: JobId, chunk: DataChunk) {
    let (progress, partial) = {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let JobKind::FetchData(state) = &mut node.kind else {
            return;
        };

        if let Some(response) = chunk.response {
            if let Some(resumable) = state.resumable.take() {
                if response.accepted_range() {
                    state.buffer.extend_from_slice(&resumable.data);
                    state.resumed_bytes = resumable.data.len() as u64;
                    debug!(resumed = state.resumed_bytes, "server honoured range request");
                }
                // Anything but 206 invalidates the retained bytes.
            }
            state.expected_length = response
                .expected_content_length
                .map(|length| length + state.resumed_bytes);
            state.url_response = Some(response);
        }

        state.buffer.extend_from_slice(&chunk.data);
        let completed = state.buffer.len() as u64;
        let total = state.expected_length.unwrap_or(0);
        let partial = if total > 0 && completed < total {
            Some((
                Bytes::copy_from_slice(&state.buffer),
                state.url_response.clone(),
            ))
        } else {
            None
        };
        (TaskProgress { completed, total }, partial)
    };

    job::send(shared, inner, job_id, JobEvent::Progress(progress));
    if let Some((data, response)) = partial {
        job::send(
            shared,
            inner,
            job_id,
            JobEvent::Value(JobValue::Data(data, response), false),
        );
    }
}

/// End of stream without error: persist per policy and emit the terminal
/// value, or `data_is_empty` when nothing arrived.
fn load_finished(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, job_id: JobId, work_id: WorkId) {
    context::finish_work(shared, inner, Stage::DataLoad, work_id, Some(job_id));
    let taken = {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let JobKind::FetchData(state) = &mut node.kind else {
            return;
        };
        state.pump = None;
        if state.buffer.is_empty() {
            None
        } else {
            Some((
                Bytes::from(std::mem::take(&mut state.buffer)),
                state.url_response.clone(),
                state.request.clone(),
            ))
        }
    };

    let Some((data, url_response, request)) = taken else {
        job::send(shared, inner, job_id, JobEvent::Error(ImagePipelineError::DataIsEmpty));
        return;
    };

    store_original_data(shared, inner, &request, &data);
    job::send(
        shared,
        inner,
        job_id,
        JobEvent::Value(JobValue::Data(data, url_response), true),
    );
}

/// Loader failure: retain what we have for a future resume, then propagate.
fn load_failed(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    work_id: WorkId,
    error: DataLoadError,
) {
    context::finish_work(shared, inner, Stage::DataLoad, work_id, Some(job_id));
    {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let JobKind::FetchData(state) = &mut node.kind else {
            return;
        };
        state.pump = None;
        retain_resumable_on_dispose(shared, state);
    }
    warn!(job = job_id.0, %error, "data load failed");
    job::send(
        shared,
        inner,
        job_id,
        JobEvent::Error(ImagePipelineError::DataLoadingFailed(Arc::new(error))),
    );
}

fn local_read_finished(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    result: Result<Bytes, DataLoadError>,
) {
    if !inner.jobs.contains_key(&job_id) {
        return;
    }
    match result {
        Ok(data) if data.is_empty() => {
            job::send(shared, inner, job_id, JobEvent::Error(ImagePipelineError::DataIsEmpty));
        }
        Ok(data) => {
            job::send(
                shared,
                inner,
                job_id,
                JobEvent::Value(JobValue::Data(data, None), true),
            );
        }
        Err(error) => {
            job::send(
                shared,
                inner,
                job_id,
                JobEvent::Error(ImagePipelineError::DataLoadingFailed(Arc::new(error))),
            );
        }
    }
}

/// Keep partial bytes for a later range request. Called on failure and on
/// cancellation; requires a validator from the response, a non-empty
/// buffer, and the feature switched on.
pub(crate) fn retain_resumable_on_dispose(shared: &Arc<PipelineShared>, state: &mut FetchDataState) {
    if !shared.config.is_resumable_data_enabled || state.buffer.is_empty() {
        return;
    }
    let Some(url) = state.request.resource.url().cloned() else {
        return;
    };
    let Some(validator) = state
        .url_response
        .as_ref()
        .and_then(|response| response.validator.clone())
    else {
        return;
    };
    let data = Bytes::from(std::mem::take(&mut state.buffer));
    debug!(url = %url, retained = data.len(), "retaining bytes for resume");
    shared.resumable.put(
        url.to_string(),
        ResumableData {
            data,
            validator,
            expected_total: state.expected_length,
        },
    );
}

/// Raw-bytes persistence per the data-cache policy. The decision follows
/// the request that created the job; coalesced requesters share it.
fn store_original_data(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    request: &ImageRequest,
    data: &Bytes,
) {
    if shared.data_cache.is_none() {
        return;
    }
    let has_processors = !request.processors.is_empty();
    if !shared.config.data_cache_policy.stores_original(has_processors) {
        return;
    }
    if request.options.skip_disk_cache_writes || request.is_local_resource() {
        return;
    }
    let key = keys::data_cache_original_key(request);
    context::submit_cache_write(shared, inner, key, data.clone(), request.priority);
}
