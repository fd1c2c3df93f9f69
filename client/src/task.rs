//! cooperative scheduler for delayed and periodic maintenance work.
//!
//! A [TaskRunner] drains any number of [TaskQueue]s with a bounded set of workers. Tasks inside one
//! queue never run concurrently and run in deadline order. Distinct queues share the workers.
//!
//! Workers are tokio tasks spawned on demand. At most one idle worker (the coordinator) stays alive,
//! sleeping until the nearest deadline. Surplus idle workers exit.

use core::{pin::pin, time::Duration};

use std::{
    collections::{BTreeSet, HashMap},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, Weak},
};

use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};
use tracing::{error, trace};

type Job = Box<dyn FnMut() -> Option<Duration> + Send>;

/// Shared scheduler. Cheap to clone.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    wake: Notify,
    max_workers: usize,
}

#[derive(Default)]
struct State {
    queues: HashMap<u64, Queue>,
    // head task of every queue that is eligible to run, ordered by deadline.
    ready: BTreeSet<(Instant, u64, u64)>,
    next_id: u64,
    workers: usize,
    coordinator: bool,
}

struct Queue {
    name: String,
    pending: Vec<Task>,
    head: Option<(Instant, u64)>,
    active: Option<u64>,
    active_canceled: bool,
    idle: Arc<Notify>,
}

struct Task {
    id: u64,
    name: String,
    at: Instant,
    job: Job,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // keep the ready set in sync with the head of given queue.
    fn refresh(&mut self, queue_id: u64) {
        let Some(queue) = self.queues.get_mut(&queue_id) else {
            return;
        };

        if let Some((at, id)) = queue.head.take() {
            self.ready.remove(&(at, id, queue_id));
        }

        if queue.active.is_none() {
            if let Some(task) = queue.pending.first() {
                queue.head = Some((task.at, task.id));
                self.ready.insert((task.at, task.id, queue_id));
            }
        }
    }

    fn begin(&mut self, queue_id: u64) -> Option<Task> {
        let queue = self.queues.get_mut(&queue_id)?;
        let task = queue.pending.remove(0);
        queue.active = Some(task.id);
        queue.active_canceled = false;
        self.refresh(queue_id);
        Some(task)
    }
}

impl Queue {
    // insert keeping deadline order. equal deadlines keep their insertion order.
    fn insert(&mut self, task: Task) {
        let idx = self.pending.partition_point(|t| t.at <= task.at);
        self.pending.insert(idx, task);
    }
}

impl TaskRunner {
    /// Construct a runner with at most `max_workers` concurrently running tasks.
    ///
    /// # Panics:
    /// When pass 0 as worker count.
    pub fn new(max_workers: usize) -> Self {
        assert_ne!(max_workers, 0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                wake: Notify::new(),
                max_workers,
            }),
        }
    }

    /// Create a new queue. Tasks scheduled on the same queue are serialized.
    pub fn queue(&self, name: impl Into<String>) -> TaskQueue {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_id();
        state.queues.insert(
            id,
            Queue {
                name: name.into(),
                pending: Vec::new(),
                head: None,
                active: None,
                active_canceled: false,
                idle: Arc::new(Notify::new()),
            },
        );
        TaskQueue {
            runner: self.clone(),
            id,
        }
    }

    /// Number of tasks waiting across all queues.
    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.queues.values().map(|q| q.pending.len()).sum()
    }
}

impl Inner {
    // wake the coordinator so it re-evaluates its deadline, or start a worker when there is none.
    fn kick(self: &Arc<Self>, state: &mut State) {
        if state.coordinator {
            self.wake.notify_waiters();
        } else if state.workers < self.max_workers {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                // no runtime to drive tasks yet. the next kick from inside a runtime picks them up.
                return;
            };
            state.workers += 1;
            handle.spawn(worker(self.clone()));
        }
    }

    async fn await_task(self: &Arc<Self>) -> Option<(u64, Task)> {
        loop {
            let mut notified = pin!(self.wake.notified());
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock().unwrap();
                match state.ready.first().copied() {
                    Some((at, _, queue_id)) if at <= Instant::now() => {
                        if let Some(task) = state.begin(queue_id) {
                            // more runnable work is waiting. start another worker for it.
                            if !state.ready.is_empty() && !state.coordinator {
                                self.kick(&mut state);
                            }
                            return Some((queue_id, task));
                        }
                        continue;
                    }
                    Some((at, ..)) if !state.coordinator => {
                        state.coordinator = true;
                        at
                    }
                    _ => {
                        state.workers -= 1;
                        return None;
                    }
                }
            };

            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = notified => {}
            }

            self.state.lock().unwrap().coordinator = false;
        }
    }

    fn finish(self: &Arc<Self>, queue_id: u64, mut task: Task, delay: Option<Duration>) {
        let mut state = self.state.lock().unwrap();

        let Some(queue) = state.queues.get_mut(&queue_id) else {
            return;
        };

        queue.active = None;
        let canceled = core::mem::take(&mut queue.active_canceled);

        if let Some(delay) = delay {
            if !canceled {
                trace!("rescheduling task {} in {:?}", task.name, delay);
                task.at = Instant::now() + delay;
                queue.insert(task);
            }
        }

        queue.idle.notify_waiters();
        state.refresh(queue_id);

        if state.coordinator {
            self.wake.notify_waiters();
        }
    }
}

async fn worker(inner: Arc<Inner>) {
    while let Some((queue_id, mut task)) = inner.await_task().await {
        trace!("running task {}", task.name);

        let delay = match catch_unwind(AssertUnwindSafe(|| (task.job)())) {
            Ok(delay) => delay,
            Err(_) => {
                error!("task {} panicked", task.name);
                None
            }
        };

        inner.finish(queue_id, task, delay);
    }
}

/// A serial lane of tasks owned by one component.
#[derive(Clone)]
pub struct TaskQueue {
    runner: TaskRunner,
    id: u64,
}

impl TaskQueue {
    /// Schedule `job` to run after `delay`. The job returns `Some(d)` to run again after `d`
    /// or `None` when it is done.
    pub fn schedule<F>(&self, name: impl Into<String>, delay: Duration, job: F) -> TaskHandle
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let inner = &self.runner.inner;
        let mut state = inner.state.lock().unwrap();
        let id = state.next_id();

        let handle = TaskHandle {
            runner: Arc::downgrade(inner),
            queue: self.id,
            task: id,
        };

        let Some(queue) = state.queues.get_mut(&self.id) else {
            // queue was shut down.
            return handle;
        };

        let name = name.into();
        trace!("scheduling task {} on {} in {:?}", name, queue.name, delay);

        queue.insert(Task {
            id,
            name,
            at: Instant::now() + delay,
            job: Box::new(job),
        });

        state.refresh(self.id);
        inner.kick(&mut state);

        handle
    }

    /// Run `job` once as soon as a worker is free.
    pub fn execute<F>(&self, name: impl Into<String>, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut job = Some(job);
        self.schedule(name, Duration::ZERO, move || {
            if let Some(job) = job.take() {
                job();
            }
            None
        })
    }

    /// Drop every pending task. A running task finishes but is not rescheduled.
    pub fn cancel_all(&self) {
        let mut state = self.runner.inner.state.lock().unwrap();
        if let Some(queue) = state.queues.get_mut(&self.id) {
            queue.pending.clear();
            if queue.active.is_some() {
                queue.active_canceled = true;
            }
            state.refresh(self.id);
        }
    }

    /// Cancel pending tasks and wait for the running one, if any, to finish.
    /// The queue accepts no tasks afterwards.
    pub async fn shutdown(&self) {
        loop {
            let idle = {
                let mut state = self.runner.inner.state.lock().unwrap();
                let Some(queue) = state.queues.get_mut(&self.id) else {
                    return;
                };
                queue.pending.clear();
                match queue.active {
                    None => {
                        if let Some((at, id)) = queue.head.take() {
                            state.ready.remove(&(at, id, self.id));
                        }
                        state.queues.remove(&self.id);
                        return;
                    }
                    Some(_) => {
                        queue.active_canceled = true;
                        queue.idle.clone()
                    }
                }
            };

            let mut notified = pin!(idle.notified());
            notified.as_mut().enable();

            if !self.is_active() {
                continue;
            }

            notified.await;
        }
    }

    /// true when no task is pending or running.
    pub fn is_idle(&self) -> bool {
        let state = self.runner.inner.state.lock().unwrap();
        state
            .queues
            .get(&self.id)
            .is_none_or(|q| q.pending.is_empty() && q.active.is_none())
    }

    fn is_active(&self) -> bool {
        let state = self.runner.inner.state.lock().unwrap();
        state.queues.get(&self.id).is_some_and(|q| q.active.is_some())
    }
}

/// Handle of a scheduled task.
pub struct TaskHandle {
    runner: Weak<Inner>,
    queue: u64,
    task: u64,
}

impl TaskHandle {
    /// Cancel the task. A pending task never runs. A running task is not rescheduled.
    pub fn cancel(&self) {
        let Some(inner) = self.runner.upgrade() else {
            return;
        };

        let mut state = inner.state.lock().unwrap();
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return;
        };

        if let Some(idx) = queue.pending.iter().position(|t| t.id == self.task) {
            queue.pending.remove(idx);
            state.refresh(self.queue);
        } else if queue.active == Some(self.task) {
            queue.active_canceled = true;
        }
    }
}
