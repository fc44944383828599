//! Emulated guest processes: handle table, resource limit, and a
//! signaled-on-termination synchronization object.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::class_token::ObjectKind;
use crate::handle_table::HandleTable;
use crate::object::{AutoObject, ObjRef, ObjectCore, TypedObject};
use crate::resource_limit::{KResourceLimit, LimitableResource};
use crate::sync::{SchedulerGuard, SynchronizationObject, WaiterRegistry};
use crate::KernelCore;

/// Default per-process quotas, mirroring the system-wide defaults.
pub const DEFAULT_LIMITS: [(LimitableResource, i64); 5] = [
    (LimitableResource::PhysicalMemory, 0x1_0000_0000),
    (LimitableResource::Threads, 800),
    (LimitableResource::Events, 900),
    (LimitableResource::TransferMemory, 200),
    (LimitableResource::Sessions, 1133),
];

/// A guest process. Owns the handle table that scopes every handle the
/// process can use, and the resource limit all of its kernel objects charge
/// their quota against.
pub struct KProcess {
    core: ObjectCore,
    resource_limit: ObjRef<KResourceLimit>,
    handle_table: HandleTable,
    terminated: AtomicBool,
    waiters: WaiterRegistry,
}

impl KProcess {
    /// Create a process with the default quotas.
    pub fn new(kernel: &KernelCore, name: impl Into<String>) -> ObjRef<KProcess> {
        let resource_limit = KResourceLimit::new(kernel.counters());
        for (resource, value) in DEFAULT_LIMITS {
            resource_limit
                .set_limit_value(resource, value)
                .expect("fresh limit has no usage");
        }
        Self::with_resource_limit(kernel, name, resource_limit)
    }

    /// Create a process charging against the given limit.
    pub fn with_resource_limit(
        kernel: &KernelCore,
        name: impl Into<String>,
        resource_limit: ObjRef<KResourceLimit>,
    ) -> ObjRef<KProcess> {
        let process = ObjRef::new(KProcess {
            core: ObjectCore::new(kernel.counters(), ObjectKind::Process),
            resource_limit,
            handle_table: HandleTable::new(),
            terminated: AtomicBool::new(false),
            waiters: WaiterRegistry::default(),
        });
        process.core.set_name(name);
        process
    }

    /// The quota tracker for this process.
    pub fn resource_limit(&self) -> &KResourceLimit {
        &self.resource_limit
    }

    /// The process-scoped handle table.
    pub fn handle_table(&self) -> &HandleTable {
        &self.handle_table
    }

    /// Whether the process has terminated.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Terminate: close every handle, signal waiters.
    pub fn terminate(&self, kernel: &KernelCore) {
        self.handle_table.clear();
        let guard = kernel.lock_scheduler();
        self.terminated.store(true, Ordering::Release);
        self.notify_available(&guard);
    }
}

impl AutoObject for KProcess {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_destroy(&self) {
        // Handles can keep objects alive that in turn reference this
        // process; dropping them here breaks those cycles.
        self.handle_table.clear();
    }
}

impl TypedObject for KProcess {
    const KIND: ObjectKind = ObjectKind::Process;
}

impl SynchronizationObject for KProcess {
    fn is_signaled(&self, _guard: &SchedulerGuard<'_>) -> bool {
        self.is_terminated()
    }

    fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }
}
