//! The multi-object wait primitive and the global scheduler lock.
//!
//! One coarse lock serializes every `is_signaled` poll, waiter-list mutation
//! and signal across all synchronization objects. Cross-object signaling
//! (one state change waking threads blocked on several objects) relies on
//! that atomicity; per-object locks would reintroduce missed-wakeup races
//! and lock-ordering cycles between objects that wait on each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::object::AutoObject;
use crate::result::{KResult, KernelError};
use crate::thread::KThread;
use crate::KernelCore;

/// The process-wide scheduler lock.
#[derive(Debug, Default)]
pub struct SchedulerLock {
    inner: Mutex<()>,
}

impl SchedulerLock {
    /// Acquire the lock.
    pub fn lock(&self) -> SchedulerGuard<'_> {
        SchedulerGuard {
            _inner: self.inner.lock(),
        }
    }
}

/// Proof that the scheduler lock is held. Signal and poll operations take
/// this guard by reference, which makes the locking protocol part of the
/// type signatures instead of a comment.
pub struct SchedulerGuard<'a> {
    _inner: MutexGuard<'a, ()>,
}

static NEXT_WAIT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Waiting,
    Signaled(usize),
    Cancelled,
}

/// One blocked multi-wait call. Registered on every object in the wait list;
/// the first signal wins and later signals are no-ops.
#[derive(Debug)]
pub struct WaitNode {
    id: u64,
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitNode {
    fn new() -> Arc<Self> {
        Arc::new(WaitNode {
            id: NEXT_WAIT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(WaitState::Waiting),
            cond: Condvar::new(),
        })
    }

    /// Id used to deregister this node from waiter lists.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Complete the wait with the signaling object's index. No-op if the
    /// wait already completed.
    pub fn notify(&self, _guard: &SchedulerGuard<'_>, index: usize) {
        let mut state = self.state.lock();
        if *state == WaitState::Waiting {
            *state = WaitState::Signaled(index);
            self.cond.notify_all();
        }
    }

    /// Complete the wait with a cancellation result. No-op if the wait
    /// already completed.
    pub fn cancel(&self, _guard: &SchedulerGuard<'_>) {
        let mut state = self.state.lock();
        if *state == WaitState::Waiting {
            *state = WaitState::Cancelled;
            self.cond.notify_all();
        }
    }

    /// Block until completed or `deadline` passes. Returns the state seen
    /// last; `Waiting` means the local deadline elapsed.
    fn block(&self, deadline: Option<Instant>) -> WaitState {
        let mut state = self.state.lock();
        loop {
            if *state != WaitState::Waiting {
                return *state;
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return *state;
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> WaitState {
        *self.state.lock()
    }
}

/// Waiter set owned by each synchronization object. Only touched with the
/// scheduler lock held; a node is a member of the set of every object its
/// wait call covers.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    entries: Mutex<Vec<(usize, Arc<WaitNode>)>>,
}

impl WaiterRegistry {
    /// Register a waiter together with the index it should complete with.
    pub fn register(&self, _guard: &SchedulerGuard<'_>, node: Arc<WaitNode>, index: usize) {
        self.entries.lock().push((index, node));
    }

    /// Remove a waiter by id. Removal by id, not pointer surgery.
    pub fn deregister(&self, _guard: &SchedulerGuard<'_>, id: u64) {
        self.entries.lock().retain(|(_, node)| node.id() != id);
    }

    /// Wake every current waiter with its registered index.
    pub fn notify_all(&self, guard: &SchedulerGuard<'_>) {
        for (index, node) in self.entries.lock().iter() {
            node.notify(guard, *index);
        }
    }

    /// Whether any waiter is registered.
    pub fn has_waiters(&self, _guard: &SchedulerGuard<'_>) -> bool {
        !self.entries.lock().is_empty()
    }
}

/// A waitable kernel object. The signaled state is a predicate polled under
/// the scheduler lock, not a stored flag on this interface.
pub trait SynchronizationObject: AutoObject {
    /// Whether a waiter may proceed without blocking.
    fn is_signaled(&self, guard: &SchedulerGuard<'_>) -> bool;

    /// This object's waiter set.
    fn waiters(&self) -> &WaiterRegistry;

    /// Wake all registered waiters. Called after a state change that makes
    /// the object signaled.
    fn notify_available(&self, guard: &SchedulerGuard<'_>) {
        self.waiters().notify_all(guard);
    }
}

/// Wait until one of `objects` is signaled.
///
/// Checks the array in order under the scheduler lock; the first signaled
/// object wins on ties. With `Some(Duration::ZERO)` this is a poll. Returns
/// the signaled index, [`KernelError::TimedOut`], or
/// [`KernelError::Cancelled`] if `thread` had its wait cancelled.
///
/// A success result is a hint, not a guarantee: a level-triggered object may
/// have been un-signaled again by the time the caller runs, so callers must
/// re-check and treat this as "try again".
pub fn wait_synchronization(
    kernel: &KernelCore,
    thread: Option<&KThread>,
    objects: &[&dyn SynchronizationObject],
    timeout: Option<Duration>,
) -> KResult<usize> {
    assert!(!objects.is_empty(), "empty wait list");

    let node = {
        let guard = kernel.lock_scheduler();

        // First signaled wins by array order.
        for (index, object) in objects.iter().enumerate() {
            if object.is_signaled(&guard) {
                return Ok(index);
            }
        }

        if timeout == Some(Duration::ZERO) {
            return Err(KernelError::TimedOut);
        }

        let node = WaitNode::new();
        for (index, object) in objects.iter().enumerate() {
            object.waiters().register(&guard, Arc::clone(&node), index);
        }
        if let Some(thread) = thread {
            thread.set_wait_node(&guard, Arc::clone(&node));
        }
        node
    };

    let deadline = timeout.map(|t| Instant::now() + t);
    node.block(deadline);

    // Re-acquire the lock to deregister; the completion state read below is
    // final because all notifications happen under the same lock.
    let guard = kernel.lock_scheduler();
    for object in objects {
        object.waiters().deregister(&guard, node.id());
    }
    if let Some(thread) = thread {
        thread.clear_wait_node(&guard);
    }
    let state = node.snapshot();
    drop(guard);

    match state {
        WaitState::Signaled(index) => Ok(index),
        WaitState::Cancelled => Err(KernelError::Cancelled),
        WaitState::Waiting => Err(KernelError::TimedOut),
    }
}
