use std::sync::Arc;

/// Unit of work posted to a [`Dispatcher`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// An execution context that runs posted tasks serially.
pub trait Dispatcher: Send + Sync {
    /// Queue `task` to run on this context.
    fn dispatch(&self, task: Task);

    /// Returns true when called from the thread this context runs on.
    fn is_current(&self) -> bool;
}

/// Run `task` now if `dispatcher` is current, otherwise post it.
pub fn run_or_dispatch(dispatcher: &Arc<dyn Dispatcher>, task: impl FnOnce() + Send + 'static) {
    if dispatcher.is_current() {
        task();
    } else {
        dispatcher.dispatch(Box::new(task));
    }
}
