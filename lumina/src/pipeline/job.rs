//! Jobs: reference-counted units of work with subscribers.
//!
//! A job lives in the context's job table and is addressed by id; removal
//! from the table *is* disposal, so late completions and late subscription
//! attempts observe a disposed job as "absent" and become no-ops. Each
//! subscriber contributes a priority; the job's effective priority is the
//! maximum contribution and follows the job into its queue slot and down
//! into its dependency.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::error::ImagePipelineError;
use crate::loading::UrlResponseInfo;
use crate::pipeline::context::{PipelineInner, PipelineShared, pump_queue};
use crate::pipeline::fetch_data::{self, FetchDataState};
use crate::pipeline::fetch_image::{self, FetchImageState};
use crate::pipeline::queue::{Stage, WorkId};
use crate::request::Priority;
use crate::response::ImageResponse;
use crate::task::{TaskCore, TaskProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct JobId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubscriptionKey(u64);

/// Payload carried by job value events.
#[derive(Debug, Clone)]
pub(crate) enum JobValue {
    /// Accumulated raw bytes, possibly partial.
    Data(Bytes, Option<UrlResponseInfo>),
    /// Decoded (and possibly preview) image.
    Image(ImageResponse),
}

/// One element of a job's event stream. The stream has the shape
/// `value(_, false)* (value(_, true) | error)?` interleaved with progress.
#[derive(Debug, Clone)]
pub(crate) enum JobEvent {
    Value(JobValue, bool),
    Progress(TaskProgress),
    Error(ImagePipelineError),
}

impl JobEvent {
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Value(_, true) | JobEvent::Error(_))
    }
}

/// Where a job's events go: a caller-facing task or a parent job.
#[derive(Clone)]
pub(crate) enum SubscriberSink {
    Task(Arc<TaskCore>),
    Job(JobId),
}

pub(crate) struct JobSubscriber {
    pub sink: SubscriberSink,
    pub priority: Priority,
}

pub(crate) enum JobKind {
    FetchData(FetchDataState),
    FetchImage(FetchImageState),
}

pub(crate) struct JobNode {
    pub subscribers: HashMap<SubscriptionKey, JobSubscriber>,
    pub priority: Priority,
    pub started: bool,
    /// The one subscription this job holds on a child job.
    pub dependency: Option<(JobId, SubscriptionKey)>,
    /// The job's slot (pending or executing) in a stage queue.
    pub queue_sub: Option<(Stage, WorkId)>,
    pub kind: JobKind,
    next_subscription_key: u64,
}

impl JobNode {
    pub(crate) fn new(kind: JobKind) -> Self {
        Self {
            subscribers: HashMap::new(),
            priority: Priority::VeryLow,
            started: false,
            dependency: None,
            queue_sub: None,
            kind,
            next_subscription_key: 0,
        }
    }
}

/// Attach a subscriber. Returns `None` when the job is already disposed.
/// The first subscriber starts the job; starting may complete it
/// synchronously (memory-cache hits), in which case the terminal event is
/// dispatched before this returns.
pub(crate) fn subscribe(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    sink: SubscriberSink,
    priority: Priority,
) -> Option<SubscriptionKey> {
    let key = {
        let node = inner.jobs.get_mut(&job_id)?;
        let key = SubscriptionKey(node.next_subscription_key);
        node.next_subscription_key += 1;
        node.subscribers.insert(key, JobSubscriber { sink, priority });
        key
    };
    update_priority(shared, inner, job_id);
    maybe_start(shared, inner, job_id);
    Some(key)
}

/// Detach a subscriber. The last detachment disposes the job, tearing down
/// its dependency chain and queue slot.
pub(crate) fn unsubscribe(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    key: SubscriptionKey,
) {
    let remaining = {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        node.subscribers.remove(&key);
        node.subscribers.len()
    };
    if remaining == 0 {
        dispose(shared, inner, job_id);
    } else {
        update_priority(shared, inner, job_id);
    }
}

/// Change one subscriber's priority contribution.
pub(crate) fn set_subscription_priority(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    key: SubscriptionKey,
    priority: Priority,
) {
    {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        let Some(subscriber) = node.subscribers.get_mut(&key) else {
            return;
        };
        if subscriber.priority == priority {
            return;
        }
        subscriber.priority = priority;
    }
    update_priority(shared, inner, job_id);
}

/// Recompute `effective = max(subscribers)` and push a change into the
/// queue slot and the dependency subscription.
pub(crate) fn update_priority(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
) {
    let Some(node) = inner.jobs.get_mut(&job_id) else {
        return;
    };
    let effective = node
        .subscribers
        .values()
        .map(|subscriber| subscriber.priority)
        .max()
        .unwrap_or(Priority::VeryLow);
    if effective == node.priority {
        return;
    }
    node.priority = effective;
    let dependency = node.dependency;
    let queue_sub = node.queue_sub;
    if let Some((stage, work_id)) = queue_sub {
        inner.queues.queue_mut(stage).reprioritize(work_id, effective);
    }
    if let Some((child, key)) = dependency {
        set_subscription_priority(shared, inner, child, key, effective);
    }
}

fn maybe_start(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, job_id: JobId) {
    let start = {
        let Some(node) = inner.jobs.get_mut(&job_id) else {
            return;
        };
        if node.started || node.subscribers.is_empty() {
            false
        } else {
            node.started = true;
            true
        }
    };
    if !start {
        return;
    }
    let is_image = matches!(
        inner.jobs.get(&job_id).map(|node| &node.kind),
        Some(JobKind::FetchImage(_))
    );
    if is_image {
        fetch_image::start(shared, inner, job_id);
    } else {
        fetch_data::start(shared, inner, job_id);
    }
}

/// Dispatch an event to the current subscriber snapshot. A completed value
/// or an error disposes the job after dispatch.
pub(crate) fn send(
    shared: &Arc<PipelineShared>,
    inner: &mut PipelineInner,
    job_id: JobId,
    event: JobEvent,
) {
    let Some(node) = inner.jobs.get(&job_id) else {
        return;
    };
    let terminal = event.is_terminal();
    let sinks: Vec<SubscriberSink> = node
        .subscribers
        .values()
        .map(|subscriber| subscriber.sink.clone())
        .collect();
    for sink in sinks {
        match sink {
            SubscriberSink::Task(task) => task.receive(inner, &event),
            SubscriberSink::Job(parent) => fetch_image::receive(shared, inner, parent, event.clone()),
        }
    }
    if terminal {
        dispose(shared, inner, job_id);
    }
}

/// Tear a job down: retain resumable bytes, drop its queue slot, abort its
/// byte pump, release its dependency, and clear its coalescer entry.
pub(crate) fn dispose(shared: &Arc<PipelineShared>, inner: &mut PipelineInner, job_id: JobId) {
    let Some(mut node) = inner.jobs.remove(&job_id) else {
        return;
    };
    trace!(job = job_id.0, "job disposed");

    if let JobKind::FetchData(state) = &mut node.kind {
        fetch_data::retain_resumable_on_dispose(shared, state);
    }

    if let Some((stage, work_id)) = node.queue_sub.take() {
        inner.queues.queue_mut(stage).cancel(work_id);
        let mut aborted = false;
        if let JobKind::FetchData(state) = &mut node.kind {
            if let Some(pump) = state.take_pump() {
                pump.abort();
                aborted = true;
            }
        }
        // An aborted pump never reports back, so free its slot here.
        if aborted {
            inner.queues.queue_mut(stage).finish(work_id);
        }
        pump_queue(shared, inner, stage);
    } else if let JobKind::FetchData(state) = &mut node.kind {
        if let Some(pump) = state.take_pump() {
            pump.abort();
        }
    }

    if let Some((child, key)) = node.dependency.take() {
        unsubscribe(shared, inner, child, key);
    }

    match &node.kind {
        JobKind::FetchImage(state) => {
            if inner.image_jobs.get(state.load_key()) == Some(&job_id) {
                inner.image_jobs.remove(state.load_key());
            }
        }
        JobKind::FetchData(state) => {
            if inner.data_jobs.get(state.load_key()) == Some(&job_id) {
                inner.data_jobs.remove(state.load_key());
            }
        }
    }
}
