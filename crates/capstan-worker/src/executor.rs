//! Cooperative single-threaded task executor.
//!
//! One executor exists per workflow instance. All workflow code, handler
//! tasks, and interceptor layers run on it; nothing ever migrates to another
//! thread. Scheduling is fully cooperative: a task runs until it returns
//! `Pending` at a real suspension point, and the executor never preempts.
//!
//! Ordering rules, which replay correctness depends on:
//!
//! - The ready queue is FIFO. Wakes are processed in the order they happened.
//! - A task spawned while another task is being polled runs immediately after
//!   the spawning task suspends, ahead of previously queued work. Several
//!   spawns from one poll keep their spawn order.
//! - `run_until_stalled` returns only when every task is suspended.

use capstan_machine::resume::{ResumeSlot, ResumeToken, Woken, resume_pair};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

pub type TaskId = u64;

/// FIFO wake queue. Wakers may be cloned into arbitrary places by futures,
/// so this half is thread-safe even though tasks themselves never leave the
/// executor's thread.
#[derive(Default)]
struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
}

impl ReadyQueue {
    fn push_back(&self, id: TaskId) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(id);
        }
    }

    fn push_front(&self, id: TaskId) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_front(id);
        }
    }

    fn pop(&self) -> Option<TaskId> {
        self.queue.lock().ok().and_then(|mut queue| queue.pop_front())
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push_back(self.id);
    }
}

struct ExecutorState {
    tasks: HashMap<TaskId, LocalBoxFuture<'static, ()>>,
    next_id: TaskId,
    /// Set while a task is being polled; spawns are diverted to the buffer
    /// so they can be spliced to the queue front in spawn order.
    polling: bool,
    spawned_during_poll: Vec<TaskId>,
}

/// The per-instance executor handle. Cheap to clone.
#[derive(Clone)]
pub struct CoopExecutor {
    state: Rc<RefCell<ExecutorState>>,
    ready: Arc<ReadyQueue>,
}

impl Default for CoopExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CoopExecutor {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ExecutorState {
                tasks: HashMap::new(),
                next_id: 0,
                polling: false,
                spawned_during_poll: Vec::new(),
            })),
            ready: Arc::new(ReadyQueue::default()),
        }
    }

    /// Enqueue a task. Runs when the executor next drains, or right after
    /// the current task suspends when called from inside a poll.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> TaskId {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(id, future.boxed_local());
        if state.polling {
            state.spawned_during_poll.push(id);
        } else {
            self.ready.push_back(id);
        }
        id
    }

    /// Spawn a task whose output is delivered through a join handle.
    pub fn spawn_with_handle<T: 'static>(
        &self,
        future: impl Future<Output = T> + 'static,
        scope: CancelScope,
    ) -> TaskHandle<T> {
        let (slot, token): (ResumeSlot<T>, ResumeToken<T>) = resume_pair();
        self.spawn(async move {
            let output = future.await;
            slot.resolve(Woken::Resolved(output));
        });
        TaskHandle { token, scope }
    }

    /// Run ready tasks until every task is suspended.
    pub fn run_until_stalled(&self) {
        while let Some(id) = self.ready.pop() {
            let Some(mut future) = self.take_task(id) else {
                // Stale wake for a finished task.
                continue;
            };
            self.state.borrow_mut().polling = true;
            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                ready: self.ready.clone(),
            }));
            let mut cx = Context::from_waker(&waker);
            let poll = future.as_mut().poll(&mut cx);

            let mut state = self.state.borrow_mut();
            state.polling = false;
            let spawned = std::mem::take(&mut state.spawned_during_poll);
            if poll.is_pending() {
                state.tasks.insert(id, future);
            }
            drop(state);
            // Children run next, keeping their spawn order.
            for child in spawned.into_iter().rev() {
                self.ready.push_front(child);
            }
        }
    }

    fn take_task(&self, id: TaskId) -> Option<LocalBoxFuture<'static, ()>> {
        self.state.borrow_mut().tasks.remove(&id)
    }

    /// Number of live (running or suspended) tasks.
    pub fn task_count(&self) -> usize {
        self.state.borrow().tasks.len()
    }
}

/// Join handle for a spawned task.
///
/// `cancel` only requests cancellation through the task's scope; the task
/// still runs to completion and delivers its (usually cancelled) output.
pub struct TaskHandle<T> {
    token: ResumeToken<T>,
    scope: CancelScope,
}

impl<T> TaskHandle<T> {
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.token.is_resolved()
    }

    /// Wait for the task to finish and take its output.
    pub async fn join(self) -> T {
        match self.token.await {
            Woken::Resolved(value) => value,
            // Join slots are only ever resolved with a value.
            Woken::Cancelled | Woken::Evicted => unreachable!("join slot carries a value"),
        }
    }
}

struct ScopeInner {
    cancelled: bool,
    wakers: Vec<Waker>,
    children: Vec<Weak<RefCell<ScopeInner>>>,
}

/// Cooperative cancellation scope, shared by the futures running under it.
///
/// Scopes form a tree: cancelling a scope cancels its children. A shielded
/// scope has no parent link, so cancellation of the surrounding workflow
/// does not reach operations started under it.
#[derive(Clone)]
pub struct CancelScope {
    inner: Rc<RefCell<ScopeInner>>,
}

impl CancelScope {
    fn fresh() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ScopeInner {
                cancelled: false,
                wakers: Vec::new(),
                children: Vec::new(),
            })),
        }
    }

    pub fn new_root() -> Self {
        Self::fresh()
    }

    /// A scope cancelled together with `self`.
    pub fn child(&self) -> Self {
        let child = Self::fresh();
        let mut inner = self.inner.borrow_mut();
        if inner.cancelled {
            child.inner.borrow_mut().cancelled = true;
        } else {
            inner.children.push(Rc::downgrade(&child.inner));
        }
        child
    }

    /// A scope with no parent link, for cancellation shields.
    pub fn detached() -> Self {
        Self::fresh()
    }

    pub fn cancel(&self) {
        let (wakers, children) = {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            (
                std::mem::take(&mut inner.wakers),
                std::mem::take(&mut inner.children),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                (CancelScope { inner: child }).cancel();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }

    /// Register to be woken when the scope is cancelled. No-op once
    /// cancelled; callers check `is_cancelled` when polled.
    pub fn register(&self, waker: &Waker) {
        let mut inner = self.inner.borrow_mut();
        if inner.cancelled {
            return;
        }
        if !inner.wakers.iter().any(|known| known.will_wake(waker)) {
            inner.wakers.push(waker.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn tasks_run_in_spawn_order_to_first_suspension() {
        let executor = CoopExecutor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let log = log.clone();
            executor.spawn(async move {
                log.borrow_mut().push(name);
            });
        }
        executor.run_until_stalled();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert_eq!(executor.task_count(), 0);
    }

    #[test]
    fn child_spawned_during_poll_runs_before_queued_siblings() {
        let executor = CoopExecutor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = log.clone();
            let inner_executor = executor.clone();
            executor.spawn(async move {
                log.borrow_mut().push("parent");
                let log_one = log.clone();
                inner_executor.spawn(async move {
                    log_one.borrow_mut().push("child-1");
                });
                let log_two = log.clone();
                inner_executor.spawn(async move {
                    log_two.borrow_mut().push("child-2");
                });
            });
        }
        {
            let log = log.clone();
            executor.spawn(async move {
                log.borrow_mut().push("sibling");
            });
        }
        executor.run_until_stalled();
        assert_eq!(
            *log.borrow(),
            vec!["parent", "child-1", "child-2", "sibling"]
        );
    }

    #[test]
    fn run_until_stalled_leaves_suspended_tasks_parked() {
        let executor = CoopExecutor::new();
        let (slot, token) = resume_pair::<u32>();
        let seen = Rc::new(RefCell::new(None));
        {
            let seen = seen.clone();
            executor.spawn(async move {
                let value = token.await;
                *seen.borrow_mut() = Some(value);
            });
        }
        executor.run_until_stalled();
        assert!(seen.borrow().is_none());
        assert_eq!(executor.task_count(), 1);

        slot.resolve(Woken::Resolved(9));
        executor.run_until_stalled();
        assert_eq!(*seen.borrow(), Some(Woken::Resolved(9)));
        assert_eq!(executor.task_count(), 0);
    }

    #[test]
    fn join_handle_delivers_output() {
        let executor = CoopExecutor::new();
        let handle = executor.spawn_with_handle(async { 41 + 1 }, CancelScope::new_root());
        let result = Rc::new(RefCell::new(None));
        {
            let result = result.clone();
            executor.spawn(async move {
                *result.borrow_mut() = Some(handle.join().await);
            });
        }
        executor.run_until_stalled();
        assert_eq!(*result.borrow(), Some(42));
    }

    #[test]
    fn cancel_scope_propagates_to_children_but_not_detached() {
        let root = CancelScope::new_root();
        let child = root.child();
        let grandchild = child.child();
        let shielded = CancelScope::detached();
        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!shielded.is_cancelled());
        // A child created after cancellation is born cancelled.
        assert!(root.child().is_cancelled());
    }
}
