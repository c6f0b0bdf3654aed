//! Bounded asynchronous dispatch of telemetry payloads.
//!
//! The queue owns a small pool of tokio workers that pull [`DispatchTask`]s
//! and hand them to a [`Transport`]:
//!
//! 1. `core_workers` long-lived workers start with the queue.
//! 2. Submissions go into a bounded FIFO of `queue_capacity` tasks.
//! 3. When the FIFO is full and fewer than `max_workers` workers are alive,
//!    an overflow worker is spawned for the task. It keeps draining the
//!    FIFO and exits after `keep_alive` without work.
//! 4. When the FIFO is full and every worker is alive, the
//!    [`OverloadPolicy`] decides. The default, [`OverloadPolicy::CallerRuns`],
//!    sends the payload on the submitting task so nothing is silently lost.
//!
//! There is no retry and no persistence: every task gets exactly one send
//! attempt and is dropped afterwards.

use crate::error::{ConfigError, Result, TelemetryError};
use crate::masking::FieldMasker;
use crate::payload::{embed_body, TelemetryPayload};
use crate::transport::Transport;
use bytes::Bytes;
use futures_util::future::join_all;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Idle time after which an overflow worker exits.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Default time granted to workers to finish on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What to do with a submission when the queue is full and every worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverloadPolicy {
    /// Send the payload on the submitting task.
    #[default]
    CallerRuns,
    /// Evict the oldest queued task to make room.
    DropOldest,
    /// Wait up to the given duration for room, then fall back to caller-runs.
    BlockWithTimeout(Duration),
}

/// Pool sizing and lifecycle settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Workers started with the queue and kept until shutdown.
    pub core_workers: usize,
    /// Upper bound on live workers, overflow included.
    pub max_workers: usize,
    /// Bounded FIFO size.
    pub queue_capacity: usize,
    /// Idle time after which an overflow worker exits.
    pub keep_alive: Duration,
    /// Time granted to workers on shutdown before they are aborted.
    pub shutdown_grace: Duration,
    /// Behavior when saturated.
    pub overload_policy: OverloadPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            core_workers: 1,
            max_workers: 3,
            queue_capacity: 100,
            keep_alive: DEFAULT_KEEP_ALIVE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            overload_policy: OverloadPolicy::CallerRuns,
        }
    }
}

impl DispatchConfig {
    /// Check that the pool can make progress.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.core_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "core_workers",
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.max_workers < self.core_workers {
            return Err(ConfigError::Invalid {
                field: "max_workers",
                reason: format!(
                    "{} is below core_workers ({})",
                    self.max_workers, self.core_workers
                ),
            });
        }
        Ok(())
    }
}

/// One unit of work: a payload, possibly with bodies still to be masked.
pub struct DispatchTask {
    payload: TelemetryPayload,
    deferred: Option<DeferredBodies>,
}

struct DeferredBodies {
    masker: Arc<FieldMasker>,
    request: Bytes,
    response: Bytes,
}

impl DispatchTask {
    /// A task whose payload is complete.
    pub fn ready(payload: TelemetryPayload) -> Self {
        Self {
            payload,
            deferred: None,
        }
    }

    /// A task whose raw bodies are masked and embedded by the worker.
    pub fn deferred(
        payload: TelemetryPayload,
        masker: Arc<FieldMasker>,
        request: Bytes,
        response: Bytes,
    ) -> Self {
        Self {
            payload,
            deferred: Some(DeferredBodies {
                masker,
                request,
                response,
            }),
        }
    }

    /// The payload as assembled so far.
    pub fn payload(&self) -> &TelemetryPayload {
        &self.payload
    }

    /// Finish the payload, masking any deferred bodies.
    pub fn resolve(self) -> TelemetryPayload {
        let mut payload = self.payload;
        if let Some(bodies) = self.deferred {
            payload.data.request.body = embed_body(&bodies.masker, &bodies.request);
            payload.data.response.body = embed_body(&bodies.masker, &bodies.response);
        }
        payload
    }
}

impl std::fmt::Debug for DispatchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTask")
            .field("url", &self.payload.data.request.url)
            .field("deferred", &self.deferred.is_some())
            .finish()
    }
}

/// How a submission was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Placed in the FIFO.
    Queued,
    /// Handed to a newly spawned overflow worker.
    Spawned,
    /// Sent on the submitting task.
    CallerRan,
    /// Queued after evicting the oldest task.
    ReplacedOldest,
    /// Refused because the queue is shutting down.
    Rejected,
}

/// Point-in-time dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Tasks offered to [`DispatchQueue::submit`].
    pub submitted: u64,
    /// Tasks placed in the FIFO.
    pub queued: u64,
    /// Tasks sent on the submitting task.
    pub caller_runs: u64,
    /// Tasks evicted or discarded without a send attempt.
    pub dropped: u64,
    /// Tasks refused during shutdown.
    pub rejected: u64,
    /// Send attempts finished, successful or not.
    pub completed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    queued: AtomicU64,
    caller_runs: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            caller_runs: self.caller_runs.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<DispatchTask>,
    closed: bool,
}

enum Enqueue {
    Done,
    Full(DispatchTask),
    Closed,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Signalled when a task is queued or the queue closes.
    available: Notify,
    /// Signalled when a task leaves the FIFO.
    space: Notify,
    workers: AtomicUsize,
    counters: Counters,
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_enqueue(&self, task: DispatchTask) -> Enqueue {
        let mut state = self.lock();
        if state.closed {
            return Enqueue::Closed;
        }
        if state.tasks.len() >= self.config.queue_capacity {
            return Enqueue::Full(task);
        }
        state.tasks.push_back(task);
        drop(state);

        Counters::bump(&self.counters.queued);
        self.available.notify_one();
        Enqueue::Done
    }

    /// Reserve a worker slot if fewer than `max_workers` are alive.
    fn try_reserve_worker(&self) -> bool {
        self.workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.config.max_workers).then_some(live + 1)
            })
            .is_ok()
    }

    async fn next_task(&self, keep_alive: Option<Duration>) -> Option<DispatchTask> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(task) = state.tasks.pop_front() {
                    drop(state);
                    self.space.notify_one();
                    return Some(task);
                }
                if state.closed {
                    return None;
                }
            }

            match keep_alive {
                Some(idle) => {
                    if tokio::time::timeout(idle, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn execute(&self, task: DispatchTask) {
        let payload = task.resolve();
        self.transport.send(&payload).await;
        Counters::bump(&self.counters.completed);
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    first: Option<DispatchTask>,
    keep_alive: Option<Duration>,
) {
    if let Some(task) = first {
        shared.execute(task).await;
    }

    while let Some(task) = shared.next_task(keep_alive).await {
        shared.execute(task).await;
    }

    shared.workers.fetch_sub(1, Ordering::AcqRel);
}

/// Bounded worker pool delivering payloads through a [`Transport`].
pub struct DispatchQueue {
    shared: Arc<Shared>,
    runtime: Handle,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Start the queue and its core workers on the current tokio runtime.
    ///
    /// Fails when `config` has no core worker or when called outside a
    /// runtime.
    pub fn start(transport: Arc<dyn Transport>, config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| TelemetryError::NoRuntime)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            space: Notify::new(),
            workers: AtomicUsize::new(config.core_workers),
            counters: Counters::default(),
            transport,
            config,
        });

        let handles = (0..shared.config.core_workers)
            .map(|_| runtime.spawn(worker_loop(shared.clone(), None, None)))
            .collect();

        tracing::debug!(
            core_workers = shared.config.core_workers,
            max_workers = shared.config.max_workers,
            queue_capacity = shared.config.queue_capacity,
            "Telemetry dispatch queue started"
        );

        Ok(Self {
            shared,
            runtime,
            handles: Mutex::new(handles),
        })
    }

    /// Submit a task.
    ///
    /// Returns immediately unless the queue is saturated and the overload
    /// policy makes the caller wait or send the payload itself.
    pub async fn submit(&self, task: DispatchTask) -> Submission {
        let shared = &self.shared;
        Counters::bump(&shared.counters.submitted);

        let task = match shared.try_enqueue(task) {
            Enqueue::Done => return Submission::Queued,
            Enqueue::Closed => return self.reject(),
            Enqueue::Full(task) => task,
        };

        if shared.try_reserve_worker() {
            let keep_alive = Some(shared.config.keep_alive);
            let handle = self
                .runtime
                .spawn(worker_loop(shared.clone(), Some(task), keep_alive));
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
            tracing::debug!("Queue full, spawned overflow dispatch worker");
            return Submission::Spawned;
        }

        match shared.config.overload_policy {
            OverloadPolicy::CallerRuns => self.run_on_caller(task).await,
            OverloadPolicy::DropOldest => self.replace_oldest(task).await,
            OverloadPolicy::BlockWithTimeout(wait) => self.wait_for_space(task, wait).await,
        }
    }

    fn reject(&self) -> Submission {
        Counters::bump(&self.shared.counters.rejected);
        tracing::debug!("Dispatch queue is shutting down, payload rejected");
        Submission::Rejected
    }

    async fn run_on_caller(&self, task: DispatchTask) -> Submission {
        Counters::bump(&self.shared.counters.caller_runs);
        tracing::debug!("Dispatch queue saturated, sending on caller");
        self.shared.execute(task).await;
        Submission::CallerRan
    }

    async fn replace_oldest(&self, task: DispatchTask) -> Submission {
        let shared = &self.shared;
        {
            let mut state = shared.lock();
            if state.closed {
                drop(state);
                return self.reject();
            }
            if state.tasks.len() >= shared.config.queue_capacity
                && state.tasks.pop_front().is_some()
            {
                Counters::bump(&shared.counters.dropped);
                tracing::warn!("Dispatch queue saturated, dropped oldest payload");
            }
            if state.tasks.len() < shared.config.queue_capacity {
                state.tasks.push_back(task);
                drop(state);
                Counters::bump(&shared.counters.queued);
                shared.available.notify_one();
                return Submission::ReplacedOldest;
            }
        }

        // Zero capacity: nothing to evict, so the caller sends it.
        self.run_on_caller(task).await
    }

    async fn wait_for_space(&self, mut task: DispatchTask, wait: Duration) -> Submission {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let space = self.shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            task = match self.shared.try_enqueue(task) {
                Enqueue::Done => return Submission::Queued,
                Enqueue::Closed => return self.reject(),
                Enqueue::Full(task) => task,
            };

            if tokio::time::timeout_at(deadline, space).await.is_err() {
                break;
            }
        }

        tracing::debug!(
            wait_ms = wait.as_millis() as u64,
            "No room in dispatch queue after waiting"
        );
        self.run_on_caller(task).await
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        self.shared.counters.snapshot()
    }

    /// Tasks waiting in the FIFO.
    pub fn queue_len(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Live workers, core and overflow.
    pub fn live_workers(&self) -> usize {
        self.shared.workers.load(Ordering::Acquire)
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has started.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stop accepting tasks, let workers drain within the grace period,
    /// abort whatever is still running, then close the transport.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.available.notify_waiters();
        self.shared.space.notify_waiters();

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let grace = self.shared.config.shutdown_grace;

        tracing::debug!(workers = handles.len(), "Shutting down telemetry dispatch");

        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Dispatch workers did not finish in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        let abandoned = {
            let mut state = self.shared.lock();
            let count = state.tasks.len();
            state.tasks.clear();
            count
        };
        if abandoned > 0 {
            self.shared
                .counters
                .dropped
                .fetch_add(abandoned as u64, Ordering::Relaxed);
            tracing::warn!(abandoned, "Dropped queued payloads on shutdown");
        }

        self.shared.transport.close().await;
        tracing::debug!("Telemetry dispatch stopped");
    }
}

impl Drop for DispatchQueue {
    /// Close the queue so idle workers exit once the FIFO is drained.
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        self.shared.available.notify_waiters();
        self.shared.space.notify_waiters();
        tracing::debug!("Dispatch queue dropped without shutdown, releasing workers");
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}
