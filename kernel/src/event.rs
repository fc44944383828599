//! Event pairs: a signalable readable half and a writable half that
//! signals/clears it, sharing state through the owning pair object.
//!
//! Both halves hold a kernel reference to the pair, so the pair (and its
//! quota charge) survives until both halves have been closed.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::class_token::ObjectKind;
use crate::object::{AutoObject, ObjRef, ObjectCore, PostDestroyArg, TypedObject};
use crate::process::KProcess;
use crate::resource_limit::LimitableResource;
use crate::result::KResult;
use crate::sync::{SchedulerGuard, SynchronizationObject, WaiterRegistry};
use crate::KernelCore;

/// The owning half-pair object. Holds the owner-process reference whose
/// event quota was charged at creation.
pub struct KEvent {
    core: ObjectCore,
    owner: Option<ObjRef<KProcess>>,
    readable: Mutex<Option<Arc<KReadableEvent>>>,
    writable: Mutex<Option<Arc<KWritableEvent>>>,
}

/// The waitable half. Level-triggered: stays signaled until explicitly
/// cleared.
pub struct KReadableEvent {
    core: ObjectCore,
    parent: Mutex<Option<ObjRef<KEvent>>>,
    signaled: AtomicBool,
    waiters: WaiterRegistry,
}

/// The signaling half.
pub struct KWritableEvent {
    core: ObjectCore,
    parent: Mutex<Option<ObjRef<KEvent>>>,
}

impl KEvent {
    /// Create an event pair. With an owner, one unit of event quota is
    /// reserved and returned when the pair is destroyed.
    pub fn new(
        kernel: &KernelCore,
        owner: Option<&ObjRef<KProcess>>,
    ) -> KResult<(
        ObjRef<KEvent>,
        ObjRef<KReadableEvent>,
        ObjRef<KWritableEvent>,
    )> {
        if let Some(owner) = owner {
            owner
                .resource_limit()
                .reserve(LimitableResource::Events, 1, None)?;
        }

        let event = ObjRef::new(KEvent {
            core: ObjectCore::new(kernel.counters(), ObjectKind::Event),
            owner: owner.cloned(),
            readable: Mutex::new(None),
            writable: Mutex::new(None),
        });

        let readable = ObjRef::new(KReadableEvent {
            core: ObjectCore::new(kernel.counters(), ObjectKind::ReadableEvent),
            parent: Mutex::new(Some(event.clone())),
            signaled: AtomicBool::new(false),
            waiters: WaiterRegistry::default(),
        });
        let writable = ObjRef::new(KWritableEvent {
            core: ObjectCore::new(kernel.counters(), ObjectKind::WritableEvent),
            parent: Mutex::new(Some(event.clone())),
        });

        *event.readable.lock() = Some(Arc::clone(readable.as_arc()));
        *event.writable.lock() = Some(Arc::clone(writable.as_arc()));

        Ok((event, readable, writable))
    }

    /// Signal the readable half.
    pub fn signal(&self, kernel: &KernelCore) {
        if let Some(readable) = self.readable.lock().as_ref() {
            readable.signal(kernel);
        }
    }

    /// Clear the readable half.
    pub fn clear(&self) {
        if let Some(readable) = self.readable.lock().as_ref() {
            readable.clear();
        }
    }

    /// Open a reference to the readable half. The pair must still be alive.
    pub fn readable(&self) -> ObjRef<KReadableEvent> {
        ObjRef::from_arc(self.readable.lock().as_ref().expect("event pair torn down"))
    }

    /// Open a reference to the writable half. The pair must still be alive.
    pub fn writable(&self) -> ObjRef<KWritableEvent> {
        ObjRef::from_arc(self.writable.lock().as_ref().expect("event pair torn down"))
    }
}

impl KReadableEvent {
    /// Set the signaled state and wake waiters.
    pub fn signal(&self, kernel: &KernelCore) {
        let guard = kernel.lock_scheduler();
        self.signaled.store(true, Ordering::Release);
        self.notify_available(&guard);
    }

    /// Clear the signaled state. Required by level-triggered consumers
    /// before re-waiting.
    pub fn clear(&self) {
        self.signaled.store(false, Ordering::Release);
    }
}

impl KWritableEvent {
    /// Signal the paired readable event.
    pub fn signal(&self, kernel: &KernelCore) {
        if let Some(parent) = self.parent.lock().as_ref() {
            parent.signal(kernel);
        }
    }

    /// Clear the paired readable event.
    pub fn clear(&self) {
        if let Some(parent) = self.parent.lock().as_ref() {
            parent.clear();
        }
    }
}

impl AutoObject for KEvent {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_destroy(&self) {
        self.readable.lock().take();
        self.writable.lock().take();
    }

    fn post_destroy_argument(&self) -> PostDestroyArg {
        match &self.owner {
            Some(owner) => PostDestroyArg::ReleaseResource {
                owner: owner.clone(),
                resource: LimitableResource::Events,
                amount: 1,
            },
            None => PostDestroyArg::None,
        }
    }
}

impl TypedObject for KEvent {
    const KIND: ObjectKind = ObjectKind::Event;
}

impl AutoObject for KReadableEvent {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_destroy(&self) {
        self.parent.lock().take();
    }
}

impl TypedObject for KReadableEvent {
    const KIND: ObjectKind = ObjectKind::ReadableEvent;
}

impl SynchronizationObject for KReadableEvent {
    fn is_signaled(&self, _guard: &SchedulerGuard<'_>) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }
}

impl AutoObject for KWritableEvent {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn on_destroy(&self) {
        self.parent.lock().take();
    }
}

impl TypedObject for KWritableEvent {
    const KIND: ObjectKind = ObjectKind::WritableEvent;
}
