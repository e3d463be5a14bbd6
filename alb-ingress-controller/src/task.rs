//! Deduplicating work queue with a single worker per queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alb_ingress_controller_apis::ObjectKey;
use async_trait::async_trait;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;

use crate::{errors::ControllerError, utils::metric_name};

const TASK_QUEUE: &str = "task_queue";

/// A unit of work: either a changed object or a synthetic trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Task {
    Object(ObjectKey),
    /// Forces a reconciliation pass without a triggering object.
    Dummy(String),
}

impl Task {
    pub fn dummy(name: &str) -> Self {
        Task::Dummy(name.to_string())
    }

    /// Queue key, a task is pending at most once per key.
    pub fn key(&self) -> String {
        match self {
            Task::Object(o) => format!("{}:{}", o.kind, o),
            Task::Dummy(name) => name.clone(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Object(o) => write!(f, "{} {}", o.kind, o),
            Task::Dummy(name) => write!(f, "{}", name),
        }
    }
}

/// Handler bound to a [`TaskQueue`]. Must be idempotent, a key may be
/// synchronized more than once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn sync(&self, task: &Task) -> Result<(), ControllerError>;
}

/// Exponential backoff for failed tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failure before a task is dropped.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (starting at 1): base, 2*base, 4*base, ... capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Default)]
struct QueueState {
    /// Keys ready to be handed to the worker, in arrival order.
    queue: VecDeque<String>,
    /// Pending tasks by key; a key may be pending while it is processed.
    pending: HashMap<String, Task>,
    processing: HashSet<String>,
    /// Consecutive failures by key.
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

pub struct TaskQueue {
    name: &'static str,
    handler: Arc<dyn TaskHandler>,
    retry_policy: RetryPolicy,
    /// Enqueued on every tick while the queue is idle.
    periodic: Option<Task>,
    state: Mutex<QueueState>,
    notify: Notify,
    adds: Counter<u64>,
    retries: Counter<u64>,
    drops: Counter<u64>,
    sync_duration: Histogram<u64>,
}

impl TaskQueue {
    pub fn new(name: &'static str, handler: Arc<dyn TaskHandler>, retry_policy: RetryPolicy) -> Self {
        let meter: Meter = global::meter(TASK_QUEUE);
        let adds = meter
            .u64_counter(metric_name("workqueue_adds"))
            .with_description("Count of tasks added to a work queue")
            .build();
        let retries = meter
            .u64_counter(metric_name("workqueue_retries"))
            .with_description("Count of failed tasks scheduled for another attempt")
            .build();
        let drops = meter
            .u64_counter(metric_name("workqueue_drops"))
            .with_description("Count of failed tasks dropped after exhausting their retries")
            .build();
        let sync_duration = meter
            .u64_histogram(metric_name("workqueue_sync_duration_ms"))
            .with_description("Task handler duration in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            name,
            handler,
            retry_policy,
            periodic: None,
            state: Default::default(),
            notify: Notify::new(),
            adds,
            retries,
            drops,
            sync_duration,
        }
    }

    /// Enqueue `task` on every worker tick while nothing else is queued.
    pub fn with_periodic(mut self, task: Task) -> Self {
        self.periodic = Some(task);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue `task` unconditionally. If the key is already pending the
    /// pending entry is replaced, if it is being processed it will run once more.
    pub fn enqueue_task(&self, task: Task) -> bool {
        self.enqueue(task, false)
    }

    /// Enqueue `task` unless a task with the same key is already pending.
    pub fn enqueue_skippable_task(&self, task: Task) -> bool {
        self.enqueue(task, true)
    }

    fn enqueue(&self, task: Task, skippable: bool) -> bool {
        let key = task.key();
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                debug!("{} queue is shutting down, ignoring {}", self.name, task);
                return false;
            }
            if let Some(pending) = state.pending.get_mut(&key) {
                if skippable {
                    debug!("{} queue: {} is already pending, skipping", self.name, task);
                } else {
                    *pending = task;
                }
                return false;
            }
            state.pending.insert(key.clone(), task);
            if !state.processing.contains(&key) {
                state.queue.push_back(key);
            }
        }
        self.adds.add(1, &[KeyValue::new("queue", self.name)]);
        self.notify.notify_one();
        true
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Stop accepting tasks, abandon pending ones and make [`TaskQueue::run`]
    /// return. Returns `false` if the queue was already shut down.
    pub fn shutdown(&self) -> bool {
        let abandoned = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return false;
            }
            state.shutting_down = true;
            state.queue.clear();
            state.failures.clear();
            state.pending.drain().count()
        };
        info!(
            "shutting down {} queue, {} pending tasks abandoned",
            self.name, abandoned
        );
        self.notify.notify_one();
        true
    }

    fn dequeue(&self) -> Option<Task> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return None;
        }
        while let Some(key) = state.queue.pop_front() {
            if let Some(task) = state.pending.remove(&key) {
                state.processing.insert(key);
                return Some(task);
            }
        }
        None
    }

    fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if !state.shutting_down && state.pending.contains_key(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    fn enqueue_periodic(&self) {
        if let Some(task) = &self.periodic {
            let idle = {
                let state = self.state.lock();
                state.pending.is_empty() && state.processing.is_empty()
            };
            if idle {
                self.enqueue_skippable_task(task.clone());
            }
        }
    }

    /// Process tasks one at a time until `stop` fires or the queue is shut down.
    ///
    /// The worker wakes up whenever a task is enqueued and on every `interval` tick.
    pub async fn run(self: Arc<Self>, interval: Duration, stop: CancellationToken) {
        info!("starting {} queue worker", self.name);
        let interval = interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let ticked = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => true,
                _ = self.notify.notified() => false,
            };
            if ticked {
                self.enqueue_periodic();
            }
            while !stop.is_cancelled() {
                let Some(task) = self.dequeue() else {
                    break;
                };
                self.process(task, &stop).await;
            }
            if self.is_shutting_down() {
                break;
            }
        }
        info!("{} queue worker stopped", self.name);
    }

    async fn process(self: &Arc<Self>, task: Task, stop: &CancellationToken) {
        let key = task.key();
        let labels = [KeyValue::new("queue", self.name)];
        let start = Instant::now();
        let result = self.handler.sync(&task).await;
        self.sync_duration
            .record(start.elapsed().as_millis() as u64, &labels);
        match result {
            Ok(()) => {
                debug!("{} queue: synced {}", self.name, task);
                self.state.lock().failures.remove(&key);
            }
            Err(e) if stop.is_cancelled() || self.is_shutting_down() => {
                debug!("{} queue: abandoning {} on shutdown: {}", self.name, task, e);
                self.state.lock().failures.remove(&key);
            }
            Err(e) => self.retry_or_drop(task, &key, e, stop),
        }
        self.done(&key);
    }

    fn retry_or_drop(
        self: &Arc<Self>,
        task: Task,
        key: &str,
        error: ControllerError,
        stop: &CancellationToken,
    ) {
        let labels = [KeyValue::new("queue", self.name)];
        let attempt = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            *failures
        };
        if error.is_temporary() && attempt <= self.retry_policy.max_retries {
            let delay = self.retry_policy.backoff(attempt);
            warn!(
                "{} queue: failed to sync {} (retry {}/{} in {:?}): {}",
                self.name, task, attempt, self.retry_policy.max_retries, delay, error
            );
            self.retries.add(1, &labels);
            let queue = self.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => (),
                    _ = sleep(delay) => {
                        queue.enqueue_task(task);
                    }
                }
            });
        } else {
            error!(
                "{} queue: dropping {} after {} failed attempts: {}",
                self.name, task, attempt, error
            );
            self.state.lock().failures.remove(key);
            self.drops.add(1, &labels);
        }
    }
}
