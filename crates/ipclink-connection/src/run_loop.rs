use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::dispatcher::{Dispatcher, Task};

/// Upper bound on a single idle wait in [`RunLoop::run_until`], so
/// predicates fed by other threads are re-checked promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

thread_local! {
    static CURRENT: RefCell<Option<RunLoop>> = const { RefCell::new(None) };
}

/// A per-thread task queue.
///
/// Every thread has one, created on first use by [`RunLoop::current`].
/// [`RunLoop::spawn`] starts a dedicated thread that runs its loop until
/// [`RunLoop::stop`].
///
/// Tasks posted while a [`cycle`](Self::cycle) is running are deferred to
/// the next cycle. A cycle entered from inside a task picks up the deferred
/// tasks and keeps draining the same iteration, so work queued before a
/// nested loop still runs inside it.
#[derive(Clone)]
pub struct RunLoop {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    owner: OnceLock<ThreadId>,
    queue: Mutex<Queue>,
    wake: Condvar,
}

#[derive(Default)]
struct Queue {
    next: VecDeque<Task>,
    current: VecDeque<Task>,
    stopped: bool,
}

impl RunLoop {
    fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                owner: OnceLock::new(),
                queue: Mutex::new(Queue::default()),
                wake: Condvar::new(),
            }),
        }
    }

    /// The calling thread's run loop.
    pub fn current() -> RunLoop {
        CURRENT.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(|| {
                    let thread = thread::current();
                    let run_loop = RunLoop::new(thread.name().unwrap_or("unnamed"));
                    let _ = run_loop.shared.owner.set(thread.id());
                    run_loop
                })
                .clone()
        })
    }

    /// Start a named thread that runs a fresh loop until stopped.
    pub fn spawn(name: impl Into<String>) -> io::Result<RunLoop> {
        let run_loop = RunLoop::new(name);
        let thread_loop = run_loop.clone();
        let handle = thread::Builder::new()
            .name(run_loop.shared.name.clone())
            .spawn(move || {
                let _ = thread_loop.shared.owner.set(thread::current().id());
                CURRENT.with(|slot| *slot.borrow_mut() = Some(thread_loop.clone()));
                thread_loop.run();
                debug!(run_loop = %thread_loop.name(), "run loop stopped");
                CURRENT.with(|slot| slot.borrow_mut().take());
            })?;
        let _ = run_loop.shared.owner.set(handle.thread().id());
        Ok(run_loop)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a closure for the next cycle.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(task));
    }

    /// Run every task queued so far, plus anything a nested cycle adds to
    /// this iteration.
    pub fn cycle(&self) {
        {
            let mut queue = self.lock();
            let mut next = std::mem::take(&mut queue.next);
            queue.current.append(&mut next);
        }
        loop {
            let task = self.lock().current.pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Cycle until [`stop`](Self::stop) is called, sleeping while idle.
    pub fn run(&self) {
        loop {
            self.cycle();
            let mut queue = self.lock();
            while queue.next.is_empty() && !queue.stopped {
                queue = self
                    .shared
                    .wake
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if queue.stopped {
                queue.stopped = false;
                return;
            }
        }
    }

    /// Cycle until `done` returns true or `timeout` elapses.
    ///
    /// Returns the final value of `done`.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.cycle();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.wait_for_work((deadline - now).min(POLL_INTERVAL));
        }
    }

    /// Cycle for `duration`.
    pub fn run_for(&self, duration: Duration) {
        self.run_until(duration, || false);
    }

    /// Make [`run`](Self::run) return after its current cycle.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.shared.wake.notify_all();
    }

    pub fn ptr_eq(&self, other: &RunLoop) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn enqueue(&self, task: Task) {
        self.lock().next.push_back(task);
        self.shared.wake.notify_all();
    }

    fn wait_for_work(&self, timeout: Duration) {
        let queue = self.lock();
        if queue.next.is_empty() && !queue.stopped {
            let _ = self
                .shared
                .wake
                .wait_timeout(queue, timeout)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Dispatcher for RunLoop {
    fn dispatch(&self, task: Task) {
        self.enqueue(task);
    }

    fn is_current(&self) -> bool {
        self.shared.owner.get() == Some(&thread::current().id())
    }
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}
