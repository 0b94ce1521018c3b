use std::sync::mpsc;

/// A deferred side effect, executed later against the consumer's context.
pub type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Producer half of a [`TaskQueue`]. Cheap to clone; every worker that needs
/// to defer work holds one.
pub struct TaskSender<C> {
    tx: mpsc::Sender<Task<C>>,
}

/// Consumer half. Only the thread that owns `C` drains it.
pub struct TaskQueue<C> {
    rx: mpsc::Receiver<Task<C>>,
}

pub fn task_queue<C>() -> (TaskSender<C>, TaskQueue<C>) {
    let (tx, rx) = mpsc::channel();
    (TaskSender { tx }, TaskQueue { rx })
}

impl<C> Clone for TaskSender<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> TaskSender<C> {
    /// Queues `task`. Returns `false` once the consumer is gone, in which case
    /// the task is dropped without running.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.tx.send(Box::new(task)).is_ok()
    }
}

impl<C> TaskQueue<C> {
    /// Runs every task queued so far, in submission order, and returns how
    /// many ran. Tasks submitted while draining wait for the next call.
    pub fn drain(&self, ctx: &mut C) -> usize {
        let pending: Vec<Task<C>> = self.rx.try_iter().collect();
        let count = pending.len();
        for task in pending {
            task(ctx);
        }
        count
    }
}
