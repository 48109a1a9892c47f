use std::fmt;
use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::dispatcher::{Dispatcher, Task};

/// A named serial queue backed by one thread.
///
/// The thread exits once the last handle is dropped and the queued tasks
/// have run.
pub struct WorkQueue {
    name: String,
    sender: Sender<Task>,
    thread: ThreadId,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> io::Result<Arc<Self>> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Task>();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            for task in receiver {
                task();
            }
        })?;
        Ok(Arc::new(Self {
            name,
            sender,
            thread: handle.thread().id(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a closure behind everything already posted.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(task));
    }

    fn enqueue(&self, task: Task) {
        if self.sender.send(task).is_err() {
            debug!(queue = %self.name, "work queue thread is gone, dropping task");
        }
    }
}

impl Dispatcher for WorkQueue {
    fn dispatch(&self, task: Task) {
        self.enqueue(task);
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
