//! The job pool: at most one live job per canonical key.
//!
//! Keys map to job ids, and liveness is checked against the job table on
//! every lookup; a disposed job clears its own entry (see
//! [`super::job::dispose`]), so stale ids can only ever miss. With
//! coalescing disabled every request gets a private job and nothing is
//! installed.

use std::sync::Arc;

use tracing::trace;

use crate::keys::{DataLoadKey, ImageLoadKey, MemoryCacheKey};
use crate::pipeline::context::{PipelineInner, PipelineShared};
use crate::pipeline::fetch_data::FetchDataState;
use crate::pipeline::fetch_image::FetchImageState;
use crate::pipeline::job::{JobId, JobKind, JobNode};
use crate::request::ImageRequest;

/// Return the live image-load job for `request`, creating one if needed.
pub(crate) fn fetch_image_job(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    request: &ImageRequest,
) -> JobId {
    let key = ImageLoadKey::for_request(request);
    if shared.config.is_task_coalescing_enabled {
        if let Some(&existing) = inner.image_jobs.get(&key) {
            if inner.jobs.contains_key(&existing) {
                trace!(job = existing.0, "coalesced image load");
                return existing;
            }
        }
    }
    let id = inner.alloc_job_id();
    let memory_key = MemoryCacheKey::for_request(request);
    let state = FetchImageState::new(request.clone(), key.clone(), memory_key);
    inner.jobs.insert(id, JobNode::new(JobKind::FetchImage(state)));
    if shared.config.is_task_coalescing_enabled {
        inner.image_jobs.insert(key, id);
    }
    id
}

/// Return the live data-load job for `request`, creating one if needed.
/// Requests that differ only in processors land on the same job here.
pub(crate) fn fetch_data_job(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    request: &ImageRequest,
) -> JobId {
    let key = DataLoadKey::for_request(request);
    if shared.config.is_task_coalescing_enabled {
        if let Some(&existing) = inner.data_jobs.get(&key) {
            if inner.jobs.contains_key(&existing) {
                trace!(job = existing.0, "coalesced data load");
                return existing;
            }
        }
    }
    let id = inner.alloc_job_id();
    let state = FetchDataState::new(request.clone(), key.clone());
    inner.jobs.insert(id, JobNode::new(JobKind::FetchData(state)));
    if shared.config.is_task_coalescing_enabled {
        inner.data_jobs.insert(key, id);
    }
    id
}
