//! High-level-emulation kernel core: reference-counted kernel objects,
//! per-process resource quotas, a wait-for-multiple-objects primitive, and
//! the port/session machinery synchronous IPC rides on.
//!
//! The crate models the host-side half of an emulated kernel. Guest code
//! is represented by threads blocked in
//! [`KClientSession::send_sync_request`]; guest memory is reached only
//! through the [`GuestMemory`] trait. Everything waitable hangs off one
//! global scheduler lock, which is what makes multi-object wait and
//! cross-object signaling race-free.

pub mod class_token;
pub mod event;
pub mod handle_table;
pub mod memory;
pub mod object;
pub mod port;
pub mod process;
pub mod resource_limit;
pub mod result;
pub mod session;
pub mod shared_memory;
pub mod sync;
pub mod thread;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

pub use class_token::{ClassToken, ObjectKind};
pub use event::{KEvent, KReadableEvent, KWritableEvent};
pub use handle_table::{Handle, HandleTable, INVALID_HANDLE, MAX_HANDLES};
pub use memory::{ArrayMemory, GuestMemory};
pub use object::{AutoObject, ObjRef, ObjectCounters, TypedObject};
pub use port::{KClientPort, KPort, KServerPort};
pub use process::KProcess;
pub use resource_limit::{KResourceLimit, LimitableResource};
pub use result::{KResult, KernelError, ResultCode, MODULE_KERNEL, MODULE_SM};
pub use session::{KClientSession, KServerSession, KSession};
pub use shared_memory::{KSharedMemory, KTransferMemory};
pub use sync::{wait_synchronization, SchedulerGuard, SchedulerLock, SynchronizationObject};
pub use thread::KThread;

/// Longest accepted port name, excluding any terminator.
pub const MAX_PORT_NAME_LEN: usize = 11;

/// Ambient kernel state shared by every object: object counters, the
/// scheduler lock, the named-port directory and the system-wide resource
/// limit.
pub struct KernelCore {
    counters: Arc<ObjectCounters>,
    scheduler: Arc<SchedulerLock>,
    named_ports: Mutex<HashMap<String, ObjRef<KClientPort>>>,
    system_resource_limit: ObjRef<KResourceLimit>,
}

impl KernelCore {
    pub fn new() -> Self {
        let counters = Arc::new(ObjectCounters::default());
        let system_resource_limit = KResourceLimit::new(&counters);
        for (resource, limit) in process::DEFAULT_LIMITS {
            system_resource_limit
                .set_limit_value(resource, limit)
                .expect("fresh limit cannot be below usage");
        }
        KernelCore {
            counters,
            scheduler: Arc::new(SchedulerLock::default()),
            named_ports: Mutex::new(HashMap::new()),
            system_resource_limit,
        }
    }

    pub(crate) fn counters(&self) -> &Arc<ObjectCounters> {
        &self.counters
    }

    /// Acquire the global scheduler lock.
    pub fn lock_scheduler(&self) -> SchedulerGuard<'_> {
        self.scheduler.lock()
    }

    /// Shared handle to the scheduler lock, for objects that must signal
    /// from their own teardown.
    pub(crate) fn scheduler_handle(&self) -> Arc<SchedulerLock> {
        Arc::clone(&self.scheduler)
    }

    /// Kernel objects currently alive.
    pub fn live_objects(&self) -> usize {
        self.counters.live()
    }

    /// Kernel objects ever created.
    pub fn created_objects(&self) -> u64 {
        self.counters.created()
    }

    pub fn system_resource_limit(&self) -> &ObjRef<KResourceLimit> {
        &self.system_resource_limit
    }

    /// Publish a client port under `name` so clients can connect to it.
    /// The name must be non-empty printable ASCII of at most
    /// [`MAX_PORT_NAME_LEN`] bytes and not already taken.
    pub fn manage_named_port(&self, name: &str, port: ObjRef<KClientPort>) -> KResult<()> {
        validate_port_name(name)?;
        let mut ports = self.named_ports.lock();
        if ports.contains_key(name) {
            return Err(KernelError::InvalidState);
        }
        debug!(name, "named port registered");
        ports.insert(name.to_owned(), port);
        Ok(())
    }

    /// Connect to a named port, creating a session charged to `process`.
    pub fn connect_to_named_port(
        &self,
        process: &ObjRef<KProcess>,
        name: &str,
    ) -> KResult<ObjRef<KClientSession>> {
        validate_port_name(name)?;
        let port = self
            .named_ports
            .lock()
            .get(name)
            .cloned()
            .ok_or(KernelError::NotFound)?;
        port.create_session(self, process)
    }

    /// Look up a named port without connecting.
    pub fn find_named_port(&self, name: &str) -> Option<ObjRef<KClientPort>> {
        self.named_ports.lock().get(name).cloned()
    }
}

impl Default for KernelCore {
    fn default() -> Self {
        KernelCore::new()
    }
}

fn validate_port_name(name: &str) -> KResult<()> {
    if name.is_empty()
        || name.len() > MAX_PORT_NAME_LEN
        || !name.bytes().all(|b| (0x20..0x7f).contains(&b))
    {
        return Err(KernelError::InvalidName);
    }
    Ok(())
}
