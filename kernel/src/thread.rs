//! Emulated guest threads, reduced to what the IPC core needs: an identity
//! that issues requests, a TLS command-buffer address, wait cancellation,
//! and a signaled-on-exit synchronization object.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::class_token::ObjectKind;
use crate::object::{AutoObject, ObjRef, ObjectCore, PostDestroyArg, TypedObject};
use crate::process::KProcess;
use crate::resource_limit::LimitableResource;
use crate::result::KResult;
use crate::sync::{SchedulerGuard, SynchronizationObject, WaitNode, WaiterRegistry};
use crate::KernelCore;

/// A guest thread. Creation reserves one unit of thread quota from the
/// owning process; destruction returns it.
pub struct KThread {
    core: ObjectCore,
    owner: ObjRef<KProcess>,
    tls_address: AtomicU64,
    exited: AtomicBool,
    current_wait: Mutex<Option<Arc<WaitNode>>>,
    waiters: WaiterRegistry,
}

impl KThread {
    /// Create a thread owned by `owner`, failing with `LimitReached` if the
    /// process has no thread quota left.
    pub fn new(
        kernel: &KernelCore,
        owner: &ObjRef<KProcess>,
        name: impl Into<String>,
        tls_address: u64,
    ) -> KResult<ObjRef<KThread>> {
        owner
            .resource_limit()
            .reserve(LimitableResource::Threads, 1, None)?;

        let thread = ObjRef::new(KThread {
            core: ObjectCore::new(kernel.counters(), ObjectKind::Thread),
            owner: owner.clone(),
            tls_address: AtomicU64::new(tls_address),
            exited: AtomicBool::new(false),
            current_wait: Mutex::new(None),
            waiters: WaiterRegistry::default(),
        });
        thread.core.set_name(name);
        Ok(thread)
    }

    /// The owning process.
    pub fn owner(&self) -> &ObjRef<KProcess> {
        &self.owner
    }

    /// Guest address of this thread's IPC command buffer.
    pub fn tls_address(&self) -> u64 {
        self.tls_address.load(Ordering::Acquire)
    }

    /// Move the command buffer.
    pub fn set_tls_address(&self, address: u64) {
        self.tls_address.store(address, Ordering::Release);
    }

    /// Whether the thread has exited.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Mark the thread exited and wake anything waiting on it.
    pub fn exit(&self, kernel: &KernelCore) {
        let guard = kernel.lock_scheduler();
        self.exited.store(true, Ordering::Release);
        self.notify_available(&guard);
    }

    /// Cancel this thread's in-flight multi-object wait, if any. The wait
    /// completes with a `Cancelled` result.
    pub fn cancel_wait(&self, kernel: &KernelCore) {
        let guard = kernel.lock_scheduler();
        if let Some(node) = self.current_wait.lock().as_ref() {
            node.cancel(&guard);
        }
    }

    pub(crate) fn set_wait_node(&self, _guard: &SchedulerGuard<'_>, node: Arc<WaitNode>) {
        *self.current_wait.lock() = Some(node);
    }

    pub(crate) fn clear_wait_node(&self, _guard: &SchedulerGuard<'_>) {
        *self.current_wait.lock() = None;
    }
}

impl AutoObject for KThread {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn post_destroy_argument(&self) -> PostDestroyArg {
        PostDestroyArg::ReleaseResource {
            owner: self.owner.clone(),
            resource: LimitableResource::Threads,
            amount: 1,
        }
    }
}

impl TypedObject for KThread {
    const KIND: ObjectKind = ObjectKind::Thread;
}

impl SynchronizationObject for KThread {
    fn is_signaled(&self, _guard: &SchedulerGuard<'_>) -> bool {
        self.has_exited()
    }

    fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }
}
