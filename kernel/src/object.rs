//! The reference-counted object model shared by every kernel object.
//!
//! Objects are destroyed in two phases: `on_destroy` tears the object down
//! (releasing held references to siblings and children), then a
//! [`PostDestroyArg`] captured *before* teardown runs the finalize step that
//! returns quota to the owning process. No field of the object may be read
//! once teardown has begun; the finalize step only sees the captured
//! argument.

use std::any::Any;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::class_token::{ClassToken, ObjectKind};
use crate::process::KProcess;
use crate::resource_limit::LimitableResource;

/// Global object bookkeeping owned by the kernel: a live-object counter for
/// leak detection and the id allocator used to key waiter lists and tracking
/// maps.
#[derive(Debug, Default)]
pub struct ObjectCounters {
    live: AtomicUsize,
    created: AtomicU64,
    next_id: AtomicU64,
}

impl ObjectCounters {
    /// Number of objects currently alive (created and not yet destroyed).
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total number of objects ever created.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

/// Shared header carried by every kernel object: reference count, unique id,
/// class token, and optional name.
#[derive(Debug)]
pub struct ObjectCore {
    refs: AtomicU32,
    id: u64,
    kind: ObjectKind,
    name: Mutex<Option<String>>,
    counters: Arc<ObjectCounters>,
}

impl ObjectCore {
    /// Allocate a header with an implicit first reference.
    pub fn new(counters: &Arc<ObjectCounters>, kind: ObjectKind) -> Self {
        counters.live.fetch_add(1, Ordering::SeqCst);
        counters.created.fetch_add(1, Ordering::SeqCst);
        let id = counters.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        ObjectCore {
            refs: AtomicU32::new(1),
            id,
            kind,
            name: Mutex::new(None),
            counters: Arc::clone(counters),
        }
    }

    /// Unique id of this object, stable for its whole lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The object's kind discriminant.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The object's class token.
    pub fn token(&self) -> ClassToken {
        self.kind.token()
    }

    /// Current reference count. Test/diagnostic use.
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// The object's name, if one was assigned.
    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    /// Assign a name. Last assignment wins.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = Some(name.into());
    }
}

/// Finalize argument captured before teardown begins. Running it must not
/// touch the destroyed object.
pub enum PostDestroyArg {
    /// Nothing to finalize.
    None,
    /// Return quota to the owning process and drop the owner reference that
    /// the destroyed object was holding.
    ReleaseResource {
        /// Process the quota was reserved against.
        owner: ObjRef<KProcess>,
        /// Category to release.
        resource: LimitableResource,
        /// Amount to release.
        amount: i64,
    },
}

impl PostDestroyArg {
    fn run(self) {
        match self {
            PostDestroyArg::None => {}
            PostDestroyArg::ReleaseResource {
                owner,
                resource,
                amount,
            } => {
                owner.resource_limit().release(resource, amount);
                // Dropping `owner` closes the reference the object held.
            }
        }
    }
}

/// Base trait of every kernel object.
pub trait AutoObject: Any + Send + Sync + 'static {
    /// The shared object header.
    fn core(&self) -> &ObjectCore;

    /// Type-erased self, for token-checked downcasts.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Teardown: release references to children/siblings. Runs exactly once,
    /// when the last reference is closed.
    fn on_destroy(&self) {}

    /// Capture the finalize argument. Called immediately before
    /// [`AutoObject::on_destroy`].
    fn post_destroy_argument(&self) -> PostDestroyArg {
        PostDestroyArg::None
    }
}

/// Implemented by each concrete object type; binds it to its discriminant so
/// handle-table lookups can be type checked.
pub trait TypedObject: AutoObject + Sized {
    /// Kind tag of this type.
    const KIND: ObjectKind;
}

/// An owning kernel reference. Cloning opens an additional reference,
/// dropping closes one; closing the last reference runs the two-phase
/// destruction. The `Arc` underneath only manages memory.
pub struct ObjRef<T: AutoObject + ?Sized> {
    inner: Arc<T>,
}

impl<T: AutoObject + ?Sized> ObjRef<T> {
    /// Wrap a freshly constructed object, adopting its implicit first
    /// reference.
    pub fn new(value: T) -> Self
    where
        T: Sized,
    {
        debug_assert_eq!(value.core().ref_count(), 1);
        ObjRef {
            inner: Arc::new(value),
        }
    }

    /// Open an additional reference from a bare `Arc`. The object must still
    /// be alive; opening a destroyed object is a kernel bug.
    pub fn from_arc(arc: &Arc<T>) -> Self {
        let prev = arc.core().refs.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "opened a reference to a destroyed object");
        ObjRef {
            inner: Arc::clone(arc),
        }
    }

    /// Open an additional reference, alias of `clone` that reads better at
    /// call sites mirroring an explicit `Open()`.
    pub fn open(&self) -> Self {
        self.clone()
    }

    /// The underlying allocation, without opening a reference.
    pub fn as_arc(&self) -> &Arc<T> {
        &self.inner
    }

    /// Unique object id, used as a map/list key.
    pub fn object_id(&self) -> u64 {
        self.inner.core().id()
    }

    /// Whether two references point at the same object.
    pub fn same_object<U: AutoObject + ?Sized>(&self, other: &ObjRef<U>) -> bool {
        self.object_id() == other.object_id()
    }

    /// Move the inner `Arc` out without running `Drop`; the open reference
    /// travels with it.
    fn into_arc(self) -> Arc<T> {
        let this = mem::ManuallyDrop::new(self);
        unsafe { std::ptr::read(&this.inner) }
    }
}

impl<T: AutoObject> ObjRef<T> {
    /// Erase the concrete type, transferring this reference.
    pub fn upcast(self) -> ObjRef<dyn AutoObject> {
        let inner: Arc<dyn AutoObject> = self.into_arc();
        ObjRef { inner }
    }
}

impl<T: crate::sync::SynchronizationObject> ObjRef<T> {
    /// Erase down to the waitable interface, transferring this reference.
    pub fn upcast_sync(self) -> ObjRef<dyn crate::sync::SynchronizationObject> {
        let inner: Arc<dyn crate::sync::SynchronizationObject> = self.into_arc();
        ObjRef { inner }
    }
}

impl ObjRef<dyn AutoObject> {
    /// Token-checked downcast, transferring this reference on success.
    pub fn downcast<T: TypedObject>(self) -> Result<ObjRef<T>, ObjRef<dyn AutoObject>> {
        if !self.inner.core().token().derives_from(T::KIND.token()) {
            return Err(self);
        }
        let any = self.into_arc().into_any();
        let inner = any
            .downcast::<T>()
            .expect("class token and concrete type disagree");
        Ok(ObjRef { inner })
    }
}

impl<T: AutoObject + ?Sized> Clone for ObjRef<T> {
    fn clone(&self) -> Self {
        let prev = self.inner.core().refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        ObjRef {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: AutoObject + ?Sized> Drop for ObjRef<T> {
    fn drop(&mut self) {
        let prev = self.inner.core().refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == 1 {
            // Capture the finalize argument before teardown may invalidate
            // the fields it is derived from.
            let arg = self.inner.post_destroy_argument();
            self.inner.on_destroy();
            self.inner
                .core()
                .counters
                .live
                .fetch_sub(1, Ordering::SeqCst);
            arg.run();
        }
    }
}

impl<T: AutoObject + ?Sized> std::ops::Deref for ObjRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: AutoObject + ?Sized> std::fmt::Debug for ObjRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjRef")
            .field("id", &self.object_id())
            .field("kind", &self.inner.core().kind())
            .field("refs", &self.inner.core().ref_count())
            .finish()
    }
}
