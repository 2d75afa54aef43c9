//! Image tasks: the caller-facing handle over a pipeline load.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{ImagePipelineError, Result};
use crate::pipeline::context::{PipelineInner, PipelineShared};
use crate::pipeline::coalescer;
use crate::pipeline::job::{self, JobEvent, JobId, JobValue, SubscriberSink, SubscriptionKey};
use crate::request::{ImageRequest, Priority};
use crate::response::{ImageResponse, PlatformImage};

const STATE_SUSPENDED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CANCELLED: u8 = 2;
const STATE_COMPLETED: u8 = 3;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of a task: `suspended → running → cancelled | completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Suspended,
    Running,
    Cancelled,
    Completed,
}

/// Download progress: `total` is zero until the response announces a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskProgress {
    pub completed: u64,
    pub total: u64,
}

/// Events delivered to task subscribers, totally ordered per task. Exactly
/// one of `Finished` or `Cancelled` terminates each stream.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started,
    Progress(TaskProgress),
    /// Non-terminal decoded image (progressive decoding only).
    Preview(ImageResponse),
    Cancelled,
    Finished(Result<ImageResponse>),
}

impl TaskEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Finished(_) | TaskEvent::Cancelled)
    }
}

/// Shared task state. Observers read atomics; terminal transitions are
/// serialised with event subscription through `events_gate` so every
/// consumer sees exactly one terminal event.
pub(crate) struct TaskCore {
    id: u64,
    request: ImageRequest,
    pipeline: Weak<PipelineShared>,
    started: AtomicBool,
    state: AtomicU8,
    priority: AtomicU8,
    progress_completed: AtomicU64,
    progress_total: AtomicU64,
    events: broadcast::Sender<TaskEvent>,
    events_gate: Mutex<()>,
    terminal: OnceLock<Result<ImageResponse>>,
    done: Notify,
    subscription: Mutex<Option<(JobId, SubscriptionKey)>>,
}

impl TaskCore {
    fn new(id: u64, request: ImageRequest, pipeline: Weak<PipelineShared>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let priority = request.priority;
        Self {
            id,
            request,
            pipeline,
            started: AtomicBool::new(false),
            state: AtomicU8::new(STATE_SUSPENDED),
            priority: AtomicU8::new(priority.weight()),
            progress_completed: AtomicU64::new(0),
            progress_total: AtomicU64::new(0),
            events,
            events_gate: Mutex::new(()),
            terminal: OnceLock::new(),
            done: Notify::new(),
            subscription: Mutex::new(None),
        }
    }

    fn state_value(&self) -> TaskState {
        match self.state.load(Ordering::SeqCst) {
            STATE_SUSPENDED => TaskState::Suspended,
            STATE_RUNNING => TaskState::Running,
            STATE_CANCELLED => TaskState::Cancelled,
            _ => TaskState::Completed,
        }
    }

    /// One-shot terminal transition. Returns false when another terminal
    /// event won the race.
    fn try_terminate(&self, target: u8, result: Result<ImageResponse>, event: TaskEvent) -> bool {
        let _gate = self.events_gate.lock();
        let transitioned = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state == STATE_SUSPENDED || state == STATE_RUNNING).then_some(target)
            })
            .is_ok();
        if !transitioned {
            return false;
        }
        let _ = self.terminal.set(result);
        let _ = self.events.send(event);
        true
    }

    /// Subscribe to the job graph on first use. Runs on the pipeline
    /// context; a memory-cache hit completes the task before this returns.
    fn ensure_started(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(shared) = self.pipeline.upgrade() else {
            self.force_finish(Err(ImagePipelineError::PipelineInvalidated));
            return;
        };
        shared.with_inner(|shared, inner| {
            if inner.invalidated {
                self.force_finish(Err(ImagePipelineError::PipelineInvalidated));
                return;
            }
            if self
                .state
                .compare_exchange(
                    STATE_SUSPENDED,
                    STATE_RUNNING,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                // Cancelled before it ever started.
                return;
            }
            let _ = self.events.send(TaskEvent::Started);
            inner.tasks.insert(self.id, Arc::clone(self));
            let root = coalescer::fetch_image_job(shared, inner, &self.request);
            let sink = SubscriberSink::Task(Arc::clone(self));
            if let Some(key) = job::subscribe(shared, inner, root, sink, self.priority_value()) {
                *self.subscription.lock() = Some((root, key));
            }
        });
    }

    /// Terminal transition without pipeline bookkeeping, for invalidation
    /// and dead-pipeline paths.
    pub(crate) fn force_finish(&self, result: Result<ImageResponse>) {
        if self.try_terminate(STATE_COMPLETED, result.clone(), TaskEvent::Finished(result)) {
            self.done.notify_waiters();
        }
    }

    /// Job-event sink; runs on the pipeline context.
    pub(crate) fn receive(self: &Arc<Self>, inner: &mut PipelineInner, event: &JobEvent) {
        match event {
            JobEvent::Progress(progress) => {
                self.progress_completed
                    .store(progress.completed, Ordering::Relaxed);
                self.progress_total.store(progress.total, Ordering::Relaxed);
                let _ = self.events.send(TaskEvent::Progress(*progress));
            }
            JobEvent::Value(JobValue::Image(response), false) => {
                let _ = self.events.send(TaskEvent::Preview(response.clone()));
            }
            JobEvent::Value(JobValue::Image(response), true) => {
                self.finish_with(inner, Ok(response.clone()));
            }
            JobEvent::Value(JobValue::Data(..), _) => {}
            JobEvent::Error(error) => {
                self.finish_with(inner, Err(error.clone()));
            }
        }
    }

    fn finish_with(self: &Arc<Self>, inner: &mut PipelineInner, result: Result<ImageResponse>) {
        if !self.try_terminate(STATE_COMPLETED, result.clone(), TaskEvent::Finished(result)) {
            return;
        }
        inner.tasks.remove(&self.id);
        *self.subscription.lock() = None;
        self.done.notify_waiters();
    }

    fn cancel(self: &Arc<Self>) {
        if !self.try_terminate(
            STATE_CANCELLED,
            Err(ImagePipelineError::Cancelled),
            TaskEvent::Cancelled,
        ) {
            return;
        }
        self.done.notify_waiters();
        if let Some(shared) = self.pipeline.upgrade() {
            shared.with_inner(|shared, inner| {
                inner.tasks.remove(&self.id);
                let subscription = self.subscription.lock().take();
                if let Some((root, key)) = subscription {
                    job::unsubscribe(shared, inner, root, key);
                }
            });
        }
    }

    fn priority_value(&self) -> Priority {
        Priority::from_weight(self.priority.load(Ordering::Relaxed))
    }
}

/// Handle to one image load.
///
/// The task starts suspended and begins running on the first `events()`
/// subscription or await. Dropping a non-terminal task cancels it; a
/// completed task keeps its result until dropped.
pub struct ImageTask {
    core: Arc<TaskCore>,
}

impl ImageTask {
    pub(crate) fn new(id: u64, request: ImageRequest, pipeline: Weak<PipelineShared>) -> Self {
        Self {
            core: Arc::new(TaskCore::new(id, request, pipeline)),
        }
    }

    /// Monotonically assigned task identifier.
    pub fn task_id(&self) -> u64 {
        self.core.id
    }

    pub fn request(&self) -> &ImageRequest {
        &self.core.request
    }

    /// Wait for the terminal result. Idempotent: the result is retained for
    /// repeated awaits.
    pub async fn await_response(&self) -> Result<ImageResponse> {
        self.core.ensure_started();
        loop {
            if let Some(result) = self.core.terminal.get() {
                return result.clone();
            }
            let notified = self.core.done.notified();
            tokio::pin!(notified);
            // Register before re-checking so a completion landing in between
            // still wakes us.
            notified.as_mut().enable();
            if let Some(result) = self.core.terminal.get() {
                return result.clone();
            }
            notified.await;
        }
    }

    /// Wait for the final bitmap.
    pub async fn await_image(&self) -> Result<PlatformImage> {
        self.await_response().await.map(|response| response.container.image)
    }

    /// Subscribe to the task's event stream. The stream is finite: it ends
    /// right after `Finished` or `Cancelled`. A consumer subscribing after
    /// termination receives exactly the terminal event.
    pub fn events(&self) -> TaskEvents {
        let state = {
            let _gate = self.core.events_gate.lock();
            match self.core.terminal.get() {
                Some(result) => {
                    let event = if self.core.state_value() == TaskState::Cancelled {
                        TaskEvent::Cancelled
                    } else {
                        TaskEvent::Finished(result.clone())
                    };
                    EventsState::Replay(Some(event))
                }
                None => EventsState::Live(BroadcastStream::new(self.core.events.subscribe())),
            }
        };
        self.core.ensure_started();
        TaskEvents { state }
    }

    /// Update the task's priority; the job graph re-sorts queued work
    /// accordingly. No-op once terminal.
    pub fn set_priority(&self, priority: Priority) {
        if matches!(
            self.core.state_value(),
            TaskState::Cancelled | TaskState::Completed
        ) {
            return;
        }
        self.core.priority.store(priority.weight(), Ordering::Relaxed);
        let Some(shared) = self.core.pipeline.upgrade() else {
            return;
        };
        let subscription = *self.core.subscription.lock();
        if let Some((root, key)) = subscription {
            shared.with_inner(|shared, inner| {
                job::set_subscription_priority(shared, inner, root, key, priority);
            });
        }
    }

    /// Cancel the load. Idempotent; the task releases its subscription and
    /// emits a single `Cancelled` event.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn current_progress(&self) -> TaskProgress {
        TaskProgress {
            completed: self.core.progress_completed.load(Ordering::Relaxed),
            total: self.core.progress_total.load(Ordering::Relaxed),
        }
    }

    pub fn current_priority(&self) -> Priority {
        self.core.priority_value()
    }

    pub fn state(&self) -> TaskState {
        self.core.state_value()
    }
}

impl fmt::Debug for ImageTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageTask")
            .field("id", &self.core.id)
            .field("state", &self.core.state_value())
            .finish()
    }
}

impl Drop for ImageTask {
    fn drop(&mut self) {
        self.core.cancel();
    }
}

enum EventsState {
    Replay(Option<TaskEvent>),
    Live(BroadcastStream<TaskEvent>),
    Done,
}

/// Finite stream of task events; see [`ImageTask::events`].
pub struct TaskEvents {
    state: EventsState,
}

impl Stream for TaskEvents {
    type Item = TaskEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TaskEvent>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.state, EventsState::Done) {
                EventsState::Done => return Poll::Ready(None),
                EventsState::Replay(event) => return Poll::Ready(event),
                EventsState::Live(mut stream) => {
                    match Pin::new(&mut stream).poll_next(cx) {
                        Poll::Ready(Some(Ok(event))) => {
                            if !event.is_terminal() {
                                this.state = EventsState::Live(stream);
                            }
                            return Poll::Ready(Some(event));
                        }
                        // A lagged consumer skips ahead; terminal events are
                        // replayed via the task itself, never dropped.
                        Poll::Ready(Some(Err(_lagged))) => {
                            this.state = EventsState::Live(stream);
                            continue;
                        }
                        Poll::Ready(None) => return Poll::Ready(None),
                        Poll::Pending => {
                            this.state = EventsState::Live(stream);
                            return Poll::Pending;
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Debug for TaskEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            EventsState::Replay(_) => "replay",
            EventsState::Live(_) => "live",
            EventsState::Done => "done",
        };
        f.debug_struct("TaskEvents").field("state", &state).finish()
    }
}
