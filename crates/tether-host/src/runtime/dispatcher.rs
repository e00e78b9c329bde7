//! Dispatcher: per-context FIFO of tasks bound for the host thread.
//!
//! Any thread enqueues; only the host thread drains. The queue lock covers
//! bookkeeping only and is never held while a task runs, so a task may
//! enqueue more work or touch host-thread state freely.
//!
//! Keep-alive: `referenced` is reconciled after every enqueue and every
//! drain pass so that it equals `active && !queue.is_empty()`. The event
//! loop therefore stays alive exactly while work is outstanding.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, trace};

use super::context::ContextKey;
use super::error::{Error, HostError, Result};
use super::event_loop::AsyncHandle;
use super::host::Env;
use super::sync::{lock, Mutex};

/// Deferred work executed on the host thread with the context handle.
pub type Task = Box<dyn FnOnce(&Env) + Send + 'static>;

struct Queue {
    active: bool,
    referenced: bool,
    tasks: VecDeque<Task>,
}

pub struct Dispatcher {
    key: ContextKey,
    queue: Mutex<Queue>,
    wake: AsyncHandle,
}

impl Dispatcher {
    pub fn new(key: ContextKey, wake: AsyncHandle) -> Self {
        Self {
            key,
            queue: Mutex::new(Queue {
                active: true,
                referenced: false,
                tasks: VecDeque::new(),
            }),
            wake,
        }
    }

    /// Create the context's dispatcher, register it and arrange its teardown.
    ///
    /// Fails if the context already has a dispatcher or its event loop can
    /// no longer hand out wake handles.
    pub fn init(env: &Env) -> Result<Arc<Dispatcher>> {
        let registry = env.registry();
        if registry.contains(env.key()) {
            return Err(Error::initialization(
                "dispatcher",
                "already initialized for this context",
            ));
        }

        let wake = env.event_loop().async_handle()?;
        let dispatcher = Arc::new(Dispatcher::new(env.key(), wake));
        registry.register(Arc::clone(&dispatcher))?;
        env.set_dispatcher(Arc::clone(&dispatcher));
        env.add_cleanup_hook(|env| {
            env.registry().teardown(env.key());
        });

        debug!(context = %env.key(), "dispatcher initialized");
        Ok(dispatcher)
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    /// Append `task` and wake the host thread.
    ///
    /// An inactive dispatcher refuses the task, which is dropped after the
    /// queue lock is released.
    pub fn enqueue(&self, task: Task) -> Result<()> {
        let mut queue = lock(&self.queue);
        if !queue.active {
            drop(queue);
            drop(task);
            return Err(Error::NotInitialized("dispatcher"));
        }
        queue.tasks.push_back(task);
        self.reconcile(&mut queue);
        drop(queue);

        self.wake.send();
        Ok(())
    }

    /// Run queued tasks one at a time until the queue is empty.
    ///
    /// Tasks enqueued while draining (by other threads or by the tasks
    /// themselves) run in the same pass. Returns the number of tasks run.
    pub fn drain(&self, env: &Env) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut queue = lock(&self.queue);
                if queue.active {
                    queue.tasks.pop_front()
                } else {
                    None
                }
            };
            let Some(task) = next else { break };
            run_task(self.key, task, env);
            ran += 1;
        }

        let mut queue = lock(&self.queue);
        self.reconcile(&mut queue);
        drop(queue);

        if ran > 0 {
            trace!(context = %self.key, ran, "drained");
        }
        ran
    }

    /// Deactivate: discard pending tasks, release the keep-alive reference
    /// and close the wake handle. A task already popped completes normally.
    pub fn shutdown(&self) {
        let discarded = {
            let mut queue = lock(&self.queue);
            queue.active = false;
            let tasks = std::mem::take(&mut queue.tasks);
            self.reconcile(&mut queue);
            tasks
        };
        self.wake.close();

        // Dropping task closures may run arbitrary destructors.
        let count = discarded.len();
        drop(discarded);
        debug!(context = %self.key, discarded = count, "dispatcher shut down");
    }

    pub fn is_active(&self) -> bool {
        lock(&self.queue).active
    }

    pub fn is_referenced(&self) -> bool {
        lock(&self.queue).referenced
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).tasks.len()
    }

    fn reconcile(&self, queue: &mut Queue) {
        if self.wake.is_closing() {
            return;
        }
        let wanted = queue.active && !queue.tasks.is_empty();
        if wanted && !queue.referenced {
            self.wake.ref_();
            queue.referenced = true;
        } else if !wanted && queue.referenced {
            self.wake.unref();
            queue.referenced = false;
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = lock(&self.queue);
        f.debug_struct("Dispatcher")
            .field("key", &self.key)
            .field("active", &queue.active)
            .field("referenced", &queue.referenced)
            .field("pending", &queue.tasks.len())
            .finish()
    }
}

fn run_task(key: ContextKey, task: Task, env: &Env) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task(env))) {
        let err = HostError::from_panic(payload);
        error!(context = %key, message = err.message(), "dispatched task panicked");
    }
}
